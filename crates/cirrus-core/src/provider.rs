//! Diagnostic providers and the process-wide provider registry.
//!
//! Providers are resolved from configuration at startup through a static
//! builder table (no runtime code loading); the registry is immutable once
//! built.

use std::sync::Arc;

use crate::{Error, Result, diagnostic::Diagnostic};

/// A plugin registering one or more diagnostics under a slug and version.
pub struct DiagnosticProvider {
  slug:        String,
  version:     String,
  diagnostics: Vec<Arc<dyn Diagnostic>>,
}

impl DiagnosticProvider {
  pub fn new(
    slug: impl Into<String>,
    version: impl Into<String>,
  ) -> DiagnosticProvider {
    DiagnosticProvider {
      slug:        slug.into(),
      version:     version.into(),
      diagnostics: Vec::new(),
    }
  }

  pub fn register(mut self, diagnostic: Arc<dyn Diagnostic>) -> Self {
    self.diagnostics.push(diagnostic);
    self
  }

  pub fn slug(&self) -> &str {
    &self.slug
  }

  pub fn version(&self) -> &str {
    &self.version
  }

  pub fn diagnostics(&self) -> &[Arc<dyn Diagnostic>] {
    &self.diagnostics
  }

  pub fn get(&self, slug: &str) -> Option<Arc<dyn Diagnostic>> {
    self.diagnostics.iter().find(|d| d.slug() == slug).cloned()
  }
}

/// All providers registered for this process.
pub struct ProviderRegistry {
  providers: Vec<DiagnosticProvider>,
}

impl ProviderRegistry {
  pub fn new(providers: Vec<DiagnosticProvider>) -> ProviderRegistry {
    ProviderRegistry { providers }
  }

  pub fn providers(&self) -> &[DiagnosticProvider] {
    &self.providers
  }

  pub fn lookup(
    &self,
    provider_slug: &str,
    diagnostic_slug: &str,
  ) -> Result<Arc<dyn Diagnostic>> {
    self
      .providers
      .iter()
      .find(|p| p.slug() == provider_slug)
      .and_then(|p| p.get(diagnostic_slug))
      .ok_or_else(|| Error::UnknownDiagnostic {
        provider:   provider_slug.to_string(),
        diagnostic: diagnostic_slug.to_string(),
      })
  }

  /// Every `(provider, diagnostic)` slug pair in the registry.
  pub fn slugs(&self) -> Vec<(String, String)> {
    self
      .providers
      .iter()
      .flat_map(|p| {
        p.diagnostics()
          .iter()
          .map(|d| (p.slug().to_string(), d.slug().to_string()))
      })
      .collect()
  }
}
