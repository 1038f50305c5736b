// Copyright 2018-2025 the Deno authors. MIT license.

use std::any::Any;
use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::rc::Rc;

use serde::Deserialize;
use serde::Serialize;

use crate::specifier::ModuleIdentity;

mod evaluation;
mod evaluator;
mod graph;
mod job;
mod linker;
mod loaders;
mod map;
mod record;
#[cfg(test)]
mod testing;
#[cfg(test)]
mod tests;

pub use evaluator::EvaluationHandle;
pub use evaluator::Evaluator;
pub use evaluator::FormatCapabilities;
pub use evaluator::ParsedModule;
pub use graph::ModuleGraph;
pub use job::ModuleJob;
pub use job::ModuleJobState;
pub use loaders::FsResourceLoader;
pub use loaders::NoopResourceLoader;
pub use loaders::ResourceLoader;
pub use loaders::StaticResourceLoader;
pub use map::ModuleMap;
pub use map::ModuleMapEntry;
pub use record::ModuleEnvironment;
pub use record::ModuleNamespace;
pub use record::ModuleRecord;
pub use record::ModuleScope;
pub use record::ModuleStatus;

pub(crate) use evaluation::evaluate_module;
pub(crate) use linker::link_module;

/// Index of a record in the [`ModuleGraph`] arena.
pub type ModuleId = usize;

/// How a module's source is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FormatTag {
  EcmaScript,
  CommonJs,
  Json,
  Wasm,
  Builtin,
}

impl fmt::Display for FormatTag {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(match self {
      FormatTag::EcmaScript => "module",
      FormatTag::CommonJs => "commonjs",
      FormatTag::Json => "json",
      FormatTag::Wasm => "wasm",
      FormatTag::Builtin => "builtin",
    })
  }
}

/// Import attributes as written at the import site, e.g.
/// `with { type: "json" }`.
pub type ImportAttributes = BTreeMap<String, String>;

/// The "type" half of a module map key. The same identity imported with and
/// without `type: "json"` occupies two independent slots.
#[derive(Clone, Debug, Eq, Hash, PartialEq, Serialize, Deserialize)]
pub enum RequestedModuleType {
  /// No `type` attribute.
  None,
  /// `with { type: "json" }`
  Json,
  /// Any other `type` value. The resolver rejects these.
  Other(Cow<'static, str>),
}

impl RequestedModuleType {
  pub fn from_attributes(attributes: &ImportAttributes) -> Self {
    match attributes.get("type").map(|s| s.as_str()) {
      None => RequestedModuleType::None,
      Some("json") => RequestedModuleType::Json,
      Some(other) => RequestedModuleType::Other(Cow::Owned(other.to_string())),
    }
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      RequestedModuleType::None => None,
      RequestedModuleType::Json => Some("json"),
      RequestedModuleType::Other(ty) => Some(ty),
    }
  }
}

impl fmt::Display for RequestedModuleType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::None => write!(f, "none"),
      Self::Json => write!(f, "json"),
      Self::Other(ty) => write!(f, "{ty}"),
    }
  }
}

/// A `(specifier, attributes)` pair requested by a module.
#[derive(Clone, Debug, Eq, Hash, PartialEq, PartialOrd, Ord)]
pub struct ModuleRequest {
  pub specifier: String,
  pub attributes: ImportAttributes,
}

impl ModuleRequest {
  pub fn new(specifier: impl Into<String>) -> Self {
    Self {
      specifier: specifier.into(),
      attributes: Default::default(),
    }
  }

  pub fn with_attribute(
    mut self,
    key: impl Into<String>,
    value: impl Into<String>,
  ) -> Self {
    self.attributes.insert(key.into(), value.into());
    self
  }

  pub fn requested_module_type(&self) -> RequestedModuleType {
    RequestedModuleType::from_attributes(&self.attributes)
  }
}

#[derive(Debug, Clone)]
pub enum ModuleSourceCode {
  String(String),
  Bytes(Vec<u8>),
}

/// Raw source returned by a [`ResourceLoader`].
#[derive(Debug, Clone)]
pub struct ModuleSource {
  pub code: ModuleSourceCode,
  /// Set when the resource was found under a different identity than the
  /// one requested, e.g. after a redirect.
  pub found_identity: Option<ModuleIdentity>,
}

impl ModuleSource {
  pub fn new(code: ModuleSourceCode) -> Self {
    Self {
      code,
      found_identity: None,
    }
  }

  pub fn from_text(text: impl Into<String>) -> Self {
    Self::new(ModuleSourceCode::String(text.into()))
  }

  pub fn with_found_identity(mut self, identity: ModuleIdentity) -> Self {
    self.found_identity = Some(identity);
    self
  }

  /// Source text with a leading byte order mark removed.
  pub fn text(&self) -> Result<&str, std::str::Utf8Error> {
    let text = match &self.code {
      ModuleSourceCode::String(text) => text.as_str(),
      ModuleSourceCode::Bytes(bytes) => std::str::from_utf8(bytes)?,
    };
    Ok(strip_bom(text))
  }

  pub fn bytes(&self) -> &[u8] {
    match &self.code {
      ModuleSourceCode::String(text) => text.as_bytes(),
      ModuleSourceCode::Bytes(bytes) => bytes,
    }
  }
}

fn strip_bom(source: &str) -> &str {
  source.strip_prefix('\u{FEFF}').unwrap_or(source)
}

/// Name imported by an import entry or re-exported by an indirect export.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImportName {
  Named(String),
  /// `import * as ns` or `export * as ns`.
  Namespace,
}

impl ImportName {
  pub fn named(name: impl Into<String>) -> Self {
    ImportName::Named(name.into())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportEntry {
  /// Index into [`ModuleShell::requests`].
  pub request: usize,
  pub import_name: ImportName,
  pub local_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalExportEntry {
  pub export_name: String,
  pub local_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndirectExportEntry {
  pub export_name: String,
  pub request: usize,
  pub import_name: ImportName,
}

/// Static shape of a parsed module, produced without running any code.
#[derive(Default, Clone)]
pub struct ModuleShell {
  pub requests: Vec<ModuleRequest>,
  pub imports: Vec<ImportEntry>,
  pub local_exports: Vec<LocalExportEntry>,
  pub indirect_exports: Vec<IndirectExportEntry>,
  /// Requests of `export * from` declarations.
  pub star_exports: Vec<usize>,
  /// Local bindings that are not exported.
  pub locals: Vec<String>,
  pub has_top_level_await: bool,
  /// Engine specific compiled unit handed back to [`Evaluator::evaluate`].
  pub compiled: Option<Rc<dyn Any>>,
}

impl fmt::Debug for ModuleShell {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ModuleShell")
      .field("requests", &self.requests)
      .field("imports", &self.imports)
      .field("local_exports", &self.local_exports)
      .field("indirect_exports", &self.indirect_exports)
      .field("star_exports", &self.star_exports)
      .field("locals", &self.locals)
      .field("has_top_level_await", &self.has_top_level_await)
      .finish_non_exhaustive()
  }
}

impl ModuleShell {
  /// A shell without dependencies whose exports are all local bindings of
  /// the same name.
  pub fn synthetic<'a>(export_names: impl IntoIterator<Item = &'a str>) -> Self {
    Self {
      local_exports: export_names
        .into_iter()
        .map(|name| LocalExportEntry {
          export_name: name.to_string(),
          local_name: name.to_string(),
        })
        .collect(),
      ..Default::default()
    }
  }

  /// Adds `request` unless an equal request exists and returns its index.
  pub fn add_request(&mut self, request: ModuleRequest) -> usize {
    match self.requests.iter().position(|r| r == &request) {
      Some(index) => index,
      None => {
        self.requests.push(request);
        self.requests.len() - 1
      }
    }
  }
}

/// Value stored in a binding slot.
#[derive(Clone)]
pub enum ModuleValue {
  Data(serde_json::Value),
  Namespace(Rc<ModuleNamespace>),
  /// Opaque engine value.
  Host(Rc<dyn Any>),
}

impl ModuleValue {
  pub fn as_data(&self) -> Option<&serde_json::Value> {
    match self {
      ModuleValue::Data(value) => Some(value),
      _ => None,
    }
  }

  pub fn as_namespace(&self) -> Option<&Rc<ModuleNamespace>> {
    match self {
      ModuleValue::Namespace(ns) => Some(ns),
      _ => None,
    }
  }
}

impl From<serde_json::Value> for ModuleValue {
  fn from(value: serde_json::Value) -> Self {
    ModuleValue::Data(value)
  }
}

impl fmt::Debug for ModuleValue {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      ModuleValue::Data(value) => write!(f, "Data({value})"),
      ModuleValue::Namespace(ns) => write!(f, "Namespace({})", ns.identity()),
      ModuleValue::Host(_) => write!(f, "Host(..)"),
    }
  }
}

impl PartialEq for ModuleValue {
  fn eq(&self, other: &Self) -> bool {
    match (self, other) {
      (ModuleValue::Data(a), ModuleValue::Data(b)) => a == b,
      (ModuleValue::Namespace(a), ModuleValue::Namespace(b)) => {
        Rc::ptr_eq(a, b)
      }
      (ModuleValue::Host(a), ModuleValue::Host(b)) => Rc::ptr_eq(a, b),
      _ => false,
    }
  }
}

impl PartialEq<serde_json::Value> for ModuleValue {
  fn eq(&self, other: &serde_json::Value) -> bool {
    self.as_data() == Some(other)
  }
}
