//! CMEC-compatible output and metric bundles.
//!
//! These are the JSON envelopes a diagnostic leaves behind in its output
//! directory: `output.json` (what files were produced) and `diagnostic.json`
//! (the metric values), per the Earth System Metrics and Diagnostics
//! Standards.

pub mod metric;
pub mod output;

pub use metric::{METRIC_BUNDLE_FILENAME, MetricBundle, MetricDimensions};
pub use output::{OUTPUT_BUNDLE_FILENAME, OutputBundle, OutputFile};

use serde_json::Value;

/// Drop object keys whose value is `null`, recursively.
///
/// Bundle serialization omits null-valued keys on both the write and read
/// side, so a write/read round trip is lossless for everything else.
pub(crate) fn strip_nulls(value: &mut Value) {
  match value {
    Value::Object(map) => {
      map.retain(|_, v| !v.is_null());
      for v in map.values_mut() {
        strip_nulls(v);
      }
    }
    Value::Array(items) => {
      for v in items.iter_mut() {
        strip_nulls(v);
      }
    }
    _ => {}
  }
}
