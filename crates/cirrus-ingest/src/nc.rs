//! Minimal reader for the netCDF classic (CDF-1/CDF-2) header.
//!
//! Only the pieces ingestion needs: the magic number and the global
//! attribute list. Variable and data sections are never touched, so only
//! the first part of the file is read. netCDF-4 files are HDF5 containers
//! and are detected, not parsed; callers fall back to path-based parsing
//! for those.

use std::{
  collections::BTreeMap,
  fs::File,
  io::Read as _,
  path::Path,
};

use crate::{Error, Result};

/// Upper bound on the header bytes we read. Headers carrying only
/// dimensions and attributes are tiny; anything larger is suspect.
const MAX_HEADER_BYTES: usize = 1 << 20;

const NC_DIMENSION: u32 = 0x0A;
const NC_ATTRIBUTE: u32 = 0x0C;

const NC_BYTE: u32 = 1;
const NC_CHAR: u32 = 2;
const NC_SHORT: u32 = 3;
const NC_INT: u32 = 4;
const NC_FLOAT: u32 = 5;
const NC_DOUBLE: u32 = 6;

/// Whether the bytes start with the HDF5 signature (netCDF-4).
pub fn is_hdf5(bytes: &[u8]) -> bool {
  bytes.starts_with(b"\x89HDF")
}

/// Whether the bytes start with the classic netCDF magic.
pub fn is_classic(bytes: &[u8]) -> bool {
  bytes.len() >= 4
    && &bytes[..3] == b"CDF"
    && matches!(bytes[3], 1 | 2)
}

/// Read the global attributes of a classic netCDF file.
///
/// Numeric attribute values are rendered as strings (space-joined when the
/// attribute holds more than one element) so callers can treat every facet
/// uniformly.
pub fn read_global_attributes(
  path: &Path,
) -> Result<BTreeMap<String, String>> {
  let mut file = File::open(path)?;
  let mut bytes = Vec::with_capacity(8192);
  file
    .by_ref()
    .take(MAX_HEADER_BYTES as u64)
    .read_to_end(&mut bytes)?;

  if !is_classic(&bytes) {
    return Err(Error::NotClassicNetcdf(path.to_path_buf()));
  }

  let mut cursor = Cursor { path, data: &bytes, pos: 4 };

  // numrecs (or the STREAMING sentinel); unused here.
  cursor.read_u32()?;

  // dim_list: skipped, but must be walked to reach the attributes.
  let (dim_tag, dim_count) = cursor.read_list_header()?;
  if dim_tag == NC_DIMENSION {
    for _ in 0..dim_count {
      cursor.read_name()?;
      cursor.read_u32()?; // dimension length
    }
  }

  // gatt_list.
  let (att_tag, att_count) = cursor.read_list_header()?;
  let mut attributes = BTreeMap::new();
  if att_tag == NC_ATTRIBUTE {
    for _ in 0..att_count {
      let name = cursor.read_name()?;
      let value = cursor.read_attribute_value()?;
      attributes.insert(name, value);
    }
  }

  Ok(attributes)
}

struct Cursor<'a> {
  path: &'a Path,
  data: &'a [u8],
  pos:  usize,
}

impl Cursor<'_> {
  fn malformed(&self, reason: impl Into<String>) -> Error {
    Error::MalformedNetcdf {
      path:   self.path.to_path_buf(),
      reason: reason.into(),
    }
  }

  fn read_bytes(&mut self, n: usize) -> Result<&[u8]> {
    let end = self
      .pos
      .checked_add(n)
      .filter(|end| *end <= self.data.len())
      .ok_or_else(|| self.malformed("truncated header"))?;
    let slice = &self.data[self.pos..end];
    self.pos = end;
    Ok(slice)
  }

  fn read_u32(&mut self) -> Result<u32> {
    let bytes = self.read_bytes(4)?;
    Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
  }

  fn align4(&mut self) -> Result<()> {
    let rem = self.pos % 4;
    if rem != 0 {
      self.read_bytes(4 - rem)?;
    }
    Ok(())
  }

  /// A list header: `(tag, nelems)`, both zero for an absent list.
  fn read_list_header(&mut self) -> Result<(u32, u32)> {
    let tag = self.read_u32()?;
    let count = self.read_u32()?;
    if tag != 0 && tag != NC_DIMENSION && tag != NC_ATTRIBUTE {
      return Err(self.malformed(format!("unexpected list tag {tag:#x}")));
    }
    Ok((tag, count))
  }

  fn read_name(&mut self) -> Result<String> {
    let len = self.read_u32()? as usize;
    if len > self.data.len() {
      return Err(self.malformed("name length exceeds header"));
    }
    let bytes = self.read_bytes(len)?.to_vec();
    self.align4()?;
    String::from_utf8(bytes)
      .map_err(|_| self.malformed("name is not valid UTF-8"))
  }

  fn read_attribute_value(&mut self) -> Result<String> {
    let nc_type = self.read_u32()?;
    let count = self.read_u32()? as usize;

    let value = match nc_type {
      NC_CHAR => {
        let bytes = self.read_bytes(count)?.to_vec();
        String::from_utf8_lossy(&bytes)
          .trim_end_matches('\0')
          .to_string()
      }
      NC_BYTE => self.read_numbers(count, 1, |b| i8::from_be_bytes([b[0]]).to_string())?,
      NC_SHORT => self.read_numbers(count, 2, |b| {
        i16::from_be_bytes([b[0], b[1]]).to_string()
      })?,
      NC_INT => self.read_numbers(count, 4, |b| {
        i32::from_be_bytes([b[0], b[1], b[2], b[3]]).to_string()
      })?,
      NC_FLOAT => self.read_numbers(count, 4, |b| {
        f32::from_be_bytes([b[0], b[1], b[2], b[3]]).to_string()
      })?,
      NC_DOUBLE => self.read_numbers(count, 8, |b| {
        f64::from_be_bytes([b[0], b[1], b[2], b[3], b[4], b[5], b[6], b[7]])
          .to_string()
      })?,
      other => {
        return Err(
          self.malformed(format!("unsupported attribute type {other}")),
        );
      }
    };

    self.align4()?;
    Ok(value)
  }

  fn read_numbers(
    &mut self,
    count: usize,
    width: usize,
    decode: impl Fn(&[u8]) -> String,
  ) -> Result<String> {
    let mut parts = Vec::with_capacity(count);
    for _ in 0..count {
      let bytes = self.read_bytes(width)?;
      parts.push(decode(bytes));
    }
    Ok(parts.join(" "))
  }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
