// Copyright 2018-2025 the Deno authors. MIT license.

use serde::Deserialize;

use crate::modules::FormatTag;

/// Conditions every resolution uses, before user supplied conditions.
pub const DEFAULT_CONDITIONS: &[&str] = &["node", "import"];

/// Format used for `.js` files whose package scope has no `"type"` field.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageType {
  #[default]
  CommonJs,
  Module,
}

impl PackageType {
  pub fn format(self) -> FormatTag {
    match self {
      PackageType::CommonJs => FormatTag::CommonJs,
      PackageType::Module => FormatTag::EcmaScript,
    }
  }
}

/// What to do with names that two `export *` declarations provide with
/// different bindings when building a module namespace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AmbiguousStarExportPolicy {
  /// Fail linking with `AmbiguousStarExport`.
  #[default]
  Error,
  /// Leave the name out of the namespace.
  Omit,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct LoaderOptions {
  /// Extra export conditions, appended to [`DEFAULT_CONDITIONS`].
  pub conditions: Vec<String>,
  /// Allows `http:` and `https:` module URLs.
  pub network_imports: bool,
  pub default_package_type: PackageType,
  /// Requires `with { type: "json" }` on imports of JSON modules.
  pub require_json_attribute: bool,
  pub ambiguous_star_exports: AmbiguousStarExportPolicy,
}

impl LoaderOptions {
  pub fn resolution_conditions(&self) -> Vec<String> {
    let mut conditions = DEFAULT_CONDITIONS
      .iter()
      .map(|c| c.to_string())
      .collect::<Vec<_>>();
    for condition in &self.conditions {
      if !conditions.contains(condition) {
        conditions.push(condition.clone());
      }
    }
    conditions
  }

  pub fn allowed_schemes(&self) -> &'static [&'static str] {
    if self.network_imports {
      &["file", "data", "node", "https", "http"]
    } else {
      &["file", "data", "node"]
    }
  }
}
