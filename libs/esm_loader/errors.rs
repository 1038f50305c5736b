// Copyright 2018-2025 the Deno authors. MIT license.

use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use boxed_error::Boxed;
use deno_error::JsError;
use deno_error::JsErrorBox;
use deno_error::JsErrorClass;
use thiserror::Error;

use crate::modules::FormatTag;
use crate::modules::RequestedModuleType;
use crate::resolver::PackageJsonLoadError;
use crate::specifier::ModuleIdentity;

#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
  ERR_EXPORT_AMBIGUOUS,
  ERR_EXPORT_CIRCULAR,
  ERR_EXPORT_NOT_FOUND,
  ERR_EXPORT_FORMAT_MISMATCH,
  ERR_BINDING_NOT_INITIALIZED,
  ERR_EVALUATION_FAILED,
  ERR_IMPORT_ATTRIBUTE_MISSING,
  ERR_IMPORT_ATTRIBUTE_TYPE_INCOMPATIBLE,
  ERR_IMPORT_ATTRIBUTE_UNSUPPORTED,
  ERR_INVALID_JOB_TYPE,
  ERR_INVALID_MODULE_SPECIFIER,
  ERR_INVALID_PACKAGE_CONFIG,
  ERR_INVALID_PACKAGE_TARGET,
  ERR_INVALID_REFERRER,
  ERR_JOB_IN_FLIGHT,
  ERR_MODULE_FETCH_FAILED,
  ERR_MODULE_NOT_FOUND,
  ERR_MODULE_PARSE_FAILED,
  ERR_NETWORK_IMPORT_DISALLOWED,
  ERR_PACKAGE_IMPORT_NOT_DEFINED,
  ERR_PACKAGE_PATH_NOT_EXPORTED,
  ERR_UNKNOWN_BUILTIN_MODULE,
  ERR_UNKNOWN_FILE_EXTENSION,
  ERR_UNSUPPORTED_DIR_IMPORT,
  ERR_UNSUPPORTED_ESM_URL_SCHEME,
}

impl fmt::Display for ErrorCode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

impl ErrorCode {
  pub fn as_str(&self) -> &'static str {
    use ErrorCode::*;
    match self {
      ERR_EXPORT_AMBIGUOUS => "ERR_EXPORT_AMBIGUOUS",
      ERR_EXPORT_CIRCULAR => "ERR_EXPORT_CIRCULAR",
      ERR_EXPORT_NOT_FOUND => "ERR_EXPORT_NOT_FOUND",
      ERR_EXPORT_FORMAT_MISMATCH => "ERR_EXPORT_FORMAT_MISMATCH",
      ERR_BINDING_NOT_INITIALIZED => "ERR_BINDING_NOT_INITIALIZED",
      ERR_EVALUATION_FAILED => "ERR_EVALUATION_FAILED",
      ERR_IMPORT_ATTRIBUTE_MISSING => "ERR_IMPORT_ATTRIBUTE_MISSING",
      ERR_IMPORT_ATTRIBUTE_TYPE_INCOMPATIBLE => {
        "ERR_IMPORT_ATTRIBUTE_TYPE_INCOMPATIBLE"
      }
      ERR_IMPORT_ATTRIBUTE_UNSUPPORTED => "ERR_IMPORT_ATTRIBUTE_UNSUPPORTED",
      ERR_INVALID_JOB_TYPE => "ERR_INVALID_JOB_TYPE",
      ERR_INVALID_MODULE_SPECIFIER => "ERR_INVALID_MODULE_SPECIFIER",
      ERR_INVALID_PACKAGE_CONFIG => "ERR_INVALID_PACKAGE_CONFIG",
      ERR_INVALID_PACKAGE_TARGET => "ERR_INVALID_PACKAGE_TARGET",
      ERR_INVALID_REFERRER => "ERR_INVALID_REFERRER",
      ERR_JOB_IN_FLIGHT => "ERR_JOB_IN_FLIGHT",
      ERR_MODULE_FETCH_FAILED => "ERR_MODULE_FETCH_FAILED",
      ERR_MODULE_NOT_FOUND => "ERR_MODULE_NOT_FOUND",
      ERR_MODULE_PARSE_FAILED => "ERR_MODULE_PARSE_FAILED",
      ERR_NETWORK_IMPORT_DISALLOWED => "ERR_NETWORK_IMPORT_DISALLOWED",
      ERR_PACKAGE_IMPORT_NOT_DEFINED => "ERR_PACKAGE_IMPORT_NOT_DEFINED",
      ERR_PACKAGE_PATH_NOT_EXPORTED => "ERR_PACKAGE_PATH_NOT_EXPORTED",
      ERR_UNKNOWN_BUILTIN_MODULE => "ERR_UNKNOWN_BUILTIN_MODULE",
      ERR_UNKNOWN_FILE_EXTENSION => "ERR_UNKNOWN_FILE_EXTENSION",
      ERR_UNSUPPORTED_DIR_IMPORT => "ERR_UNSUPPORTED_DIR_IMPORT",
      ERR_UNSUPPORTED_ESM_URL_SCHEME => "ERR_UNSUPPORTED_ESM_URL_SCHEME",
    }
  }
}

impl From<ErrorCode> for deno_error::PropertyValue {
  fn from(code: ErrorCode) -> Self {
    deno_error::PropertyValue::from(code.as_str().to_string())
  }
}

fn display_referrer(maybe_referrer: &Option<ModuleIdentity>) -> String {
  match maybe_referrer {
    Some(referrer) => format!(" imported from '{}'", referrer),
    None => String::new(),
  }
}

fn display_subpath(subpath: &str) -> String {
  if subpath == "." {
    "No \"exports\" main".to_string()
  } else {
    format!("Package subpath '{}'", subpath)
  }
}

fn display_field(is_import: &bool) -> &'static str {
  if *is_import { "imports" } else { "exports" }
}

fn display_package_json(maybe_path: &Option<PathBuf>) -> String {
  match maybe_path {
    Some(path) => format!(" in package '{}'", path.display()),
    None => String::new(),
  }
}

fn display_format_conflict(
  identity: &ModuleIdentity,
  detected: &FormatTag,
  requested: &RequestedModuleType,
) -> String {
  match requested {
    RequestedModuleType::None => format!(
      "Module '{}' needs an import attribute of \"type: {}\"",
      identity, detected
    ),
    requested => format!(
      "Module '{}' is not of type \"{}\", its detected format is \"{}\"",
      identity, requested, detected
    ),
  }
}

#[derive(Debug, JsError, Boxed)]
#[class(inherit)]
pub struct ResolutionError(pub Box<ResolutionErrorKind>);

impl ResolutionError {
  pub fn code(&self) -> ErrorCode {
    self.as_kind().code()
  }
}

#[derive(Debug, Error, JsError)]
pub enum ResolutionErrorKind {
  #[property("code" = self.code())]
  #[class(type)]
  #[error(
    "Only URLs with a scheme in: {allowed} are supported by the default ESM loader. Received protocol '{scheme}:'"
  )]
  UnsupportedScheme { scheme: String, allowed: String },
  #[property("code" = self.code())]
  #[class(type)]
  #[error(
    "Cannot resolve '{specifier}' relative to '{referrer}' because the referrer is not a valid base"
  )]
  InvalidReferrer {
    specifier: String,
    referrer: ModuleIdentity,
  },
  #[property("code" = self.code())]
  #[class(type)]
  #[error("Cannot find package '{package_name}' imported from '{referrer}'")]
  PackageNotFound {
    package_name: String,
    referrer: ModuleIdentity,
  },
  #[property("code" = self.code())]
  #[class(type)]
  #[error(
    "{} is not defined by \"exports\" in '{}'{}",
    display_subpath(.subpath),
    .package_json_path.display(),
    display_referrer(.maybe_referrer),
  )]
  ExportsMapNoMatch {
    subpath: String,
    package_json_path: PathBuf,
    maybe_referrer: Option<ModuleIdentity>,
  },
  #[property("code" = self.code())]
  #[class(type)]
  #[error(
    "Invalid \"{}\" target '{}' defined for '{}' in the package config '{}'{}",
    display_field(.is_import),
    .target,
    .subpath,
    .package_json_path.display(),
    display_referrer(.maybe_referrer),
  )]
  InvalidPackageTarget {
    subpath: String,
    target: String,
    package_json_path: PathBuf,
    is_import: bool,
    maybe_referrer: Option<ModuleIdentity>,
  },
  #[property("code" = self.code())]
  #[class(type)]
  #[error("{}", display_format_conflict(.identity, .detected, .requested))]
  AmbiguousFormat {
    identity: ModuleIdentity,
    detected: FormatTag,
    requested: RequestedModuleType,
  },
  #[property("code" = self.code())]
  #[class(type)]
  #[error(
    "Invalid module '{specifier}' {reason}{}",
    display_referrer(.maybe_referrer)
  )]
  InvalidModuleSpecifier {
    specifier: String,
    reason: Cow<'static, str>,
    maybe_referrer: Option<ModuleIdentity>,
  },
  #[property("code" = self.code())]
  #[class(type)]
  #[error(
    "Package import specifier '{specifier}' is not defined{} imported from '{referrer}'",
    display_package_json(.package_json_path),
  )]
  PackageImportNotDefined {
    specifier: String,
    package_json_path: Option<PathBuf>,
    referrer: ModuleIdentity,
  },
  #[property("code" = self.code())]
  #[class(type)]
  #[error("Invalid package config '{}'. {reason}", .package_json_path.display())]
  InvalidPackageConfig {
    package_json_path: PathBuf,
    reason: Cow<'static, str>,
  },
  #[property("code" = self.code())]
  #[class(inherit)]
  #[error(transparent)]
  PackageJsonLoad(#[from] PackageJsonLoadError),
  #[property("code" = self.code())]
  #[class(type)]
  #[error("No such built-in module: '{specifier}'")]
  UnknownBuiltin { specifier: String },
  #[property("code" = self.code())]
  #[class(type)]
  #[error("Unknown file extension '{extension}' for '{identity}'")]
  UnknownFileExtension {
    extension: String,
    identity: ModuleIdentity,
  },
  #[property("code" = self.code())]
  #[class(type)]
  #[error(
    "Directory import '{identity}' is not supported resolving ES modules imported from '{referrer}'"
  )]
  UnsupportedDirImport {
    identity: ModuleIdentity,
    referrer: ModuleIdentity,
  },
  #[property("code" = self.code())]
  #[class(type)]
  #[error("Import attribute '{key}' with value '{value}' is not supported")]
  UnsupportedImportAttribute { key: String, value: String },
  #[property("code" = self.code())]
  #[class(type)]
  #[error(
    "import of '{specifier}' by '{referrer}' is not supported: {reason}"
  )]
  NetworkImportDisallowed {
    specifier: String,
    referrer: ModuleIdentity,
    reason: &'static str,
  },
}

impl ResolutionErrorKind {
  pub fn code(&self) -> ErrorCode {
    use ResolutionErrorKind::*;
    match self {
      UnsupportedScheme { .. } => ErrorCode::ERR_UNSUPPORTED_ESM_URL_SCHEME,
      InvalidReferrer { .. } => ErrorCode::ERR_INVALID_REFERRER,
      PackageNotFound { .. } => ErrorCode::ERR_MODULE_NOT_FOUND,
      ExportsMapNoMatch { .. } => ErrorCode::ERR_PACKAGE_PATH_NOT_EXPORTED,
      InvalidPackageTarget { .. } => ErrorCode::ERR_INVALID_PACKAGE_TARGET,
      AmbiguousFormat {
        requested: RequestedModuleType::None,
        ..
      } => ErrorCode::ERR_IMPORT_ATTRIBUTE_MISSING,
      AmbiguousFormat { .. } => {
        ErrorCode::ERR_IMPORT_ATTRIBUTE_TYPE_INCOMPATIBLE
      }
      InvalidModuleSpecifier { .. } => ErrorCode::ERR_INVALID_MODULE_SPECIFIER,
      PackageImportNotDefined { .. } => {
        ErrorCode::ERR_PACKAGE_IMPORT_NOT_DEFINED
      }
      InvalidPackageConfig { .. } | PackageJsonLoad(_) => {
        ErrorCode::ERR_INVALID_PACKAGE_CONFIG
      }
      UnknownBuiltin { .. } => ErrorCode::ERR_UNKNOWN_BUILTIN_MODULE,
      UnknownFileExtension { .. } => ErrorCode::ERR_UNKNOWN_FILE_EXTENSION,
      UnsupportedDirImport { .. } => ErrorCode::ERR_UNSUPPORTED_DIR_IMPORT,
      UnsupportedImportAttribute { .. } => {
        ErrorCode::ERR_IMPORT_ATTRIBUTE_UNSUPPORTED
      }
      NetworkImportDisallowed { .. } => {
        ErrorCode::ERR_NETWORK_IMPORT_DISALLOWED
      }
    }
  }
}

/// A resource loader failure, kept as-is and tagged with the identity that
/// was being fetched.
#[derive(Debug, Error, JsError)]
#[class(inherit)]
#[error("{source}")]
pub struct FetchError {
  pub identity: ModuleIdentity,
  #[source]
  #[inherit]
  pub source: JsErrorBox,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SourcePosition {
  pub line: usize,
  pub column: usize,
}

#[derive(Debug, Error, JsError)]
#[class(syntax)]
#[property("code" = self.code())]
#[error("{message}\n    at {identity}{}", display_position(.position))]
pub struct ParseError {
  pub identity: ModuleIdentity,
  pub message: String,
  pub position: Option<SourcePosition>,
}

fn display_position(maybe_position: &Option<SourcePosition>) -> String {
  match maybe_position {
    Some(p) => format!(":{}:{}", p.line, p.column),
    None => String::new(),
  }
}

impl ParseError {
  pub fn code(&self) -> ErrorCode {
    ErrorCode::ERR_MODULE_PARSE_FAILED
  }

  pub fn new(identity: ModuleIdentity, message: impl Into<String>) -> Self {
    Self {
      identity,
      message: message.into(),
      position: None,
    }
  }

  pub fn with_position(mut self, line: usize, column: usize) -> Self {
    self.position = Some(SourcePosition { line, column });
    self
  }
}

#[derive(Debug, Error, JsError)]
#[property("code" = self.code())]
pub enum LinkError {
  #[class(syntax)]
  #[error(
    "The requested module '{exporter}' does not provide an export named '{name}' (imported by '{importer}')"
  )]
  UnresolvableExport {
    importer: ModuleIdentity,
    exporter: ModuleIdentity,
    name: String,
  },
  #[class(syntax)]
  #[error(
    "The requested module '{exporter}' contains conflicting star exports for name '{name}' (imported by '{importer}')"
  )]
  AmbiguousStarExport {
    importer: ModuleIdentity,
    exporter: ModuleIdentity,
    name: String,
  },
  #[class(syntax)]
  #[error(
    "Named export '{name}' not found. The requested module '{exporter}' is a {format} module, which only provides a default export (imported by '{importer}')"
  )]
  FormatMismatch {
    importer: ModuleIdentity,
    exporter: ModuleIdentity,
    format: FormatTag,
    name: String,
  },
  #[class(syntax)]
  #[error(
    "Detected cycle while resolving name '{name}' in '{exporter}' (imported by '{importer}')"
  )]
  CircularReexport {
    importer: ModuleIdentity,
    exporter: ModuleIdentity,
    name: String,
  },
  #[class(reference)]
  #[error("Cannot access '{name}' before initialization")]
  BindingNotInitialized { module: ModuleIdentity, name: String },
}

impl LinkError {
  pub fn code(&self) -> ErrorCode {
    match self {
      Self::UnresolvableExport { .. } => ErrorCode::ERR_EXPORT_NOT_FOUND,
      Self::AmbiguousStarExport { .. } => ErrorCode::ERR_EXPORT_AMBIGUOUS,
      Self::FormatMismatch { .. } => ErrorCode::ERR_EXPORT_FORMAT_MISMATCH,
      Self::CircularReexport { .. } => ErrorCode::ERR_EXPORT_CIRCULAR,
      Self::BindingNotInitialized { .. } => {
        ErrorCode::ERR_BINDING_NOT_INITIALIZED
      }
    }
  }

  /// The link error carried by an error a binding read produced, such as
  /// reading an export before its module initialized it.
  pub fn from_js_error(err: &JsErrorBox) -> Option<&LinkError> {
    err.get_inner_ref()?.downcast_ref::<LinkError>()
  }
}

/// Whatever the module body threw, unchanged.
#[derive(Debug, Error, JsError)]
#[class(inherit)]
#[error("{source}")]
pub struct EvaluationError {
  pub identity: ModuleIdentity,
  #[source]
  #[inherit]
  pub source: JsErrorBox,
}

#[derive(Debug, Error, JsError)]
pub enum ModuleErrorKind {
  #[class(inherit)]
  #[error(transparent)]
  Resolution(#[from] ResolutionError),
  #[class(inherit)]
  #[error(transparent)]
  Fetch(#[from] FetchError),
  #[class(inherit)]
  #[error(transparent)]
  Parse(#[from] ParseError),
  #[class(inherit)]
  #[error(transparent)]
  Link(#[from] LinkError),
  #[class(inherit)]
  #[error(transparent)]
  Evaluation(#[from] EvaluationError),
  #[class(inherit)]
  #[error(transparent)]
  Map(#[from] ModuleMapError),
}

impl From<ResolutionErrorKind> for ModuleErrorKind {
  fn from(err: ResolutionErrorKind) -> Self {
    Self::Resolution(err.into_box())
  }
}

/// Shared handle to a module failure.
///
/// Cloning is cheap and keeps identity: every importer of an errored module
/// observes the very same error instance, which can be checked with
/// [`ModuleError::ptr_eq`].
#[derive(Debug, Clone)]
pub struct ModuleError(Arc<ModuleErrorKind>);

impl ModuleError {
  pub fn as_kind(&self) -> &ModuleErrorKind {
    &self.0
  }

  pub fn ptr_eq(&self, other: &ModuleError) -> bool {
    Arc::ptr_eq(&self.0, &other.0)
  }

  pub fn code(&self) -> ErrorCode {
    match self.as_kind() {
      ModuleErrorKind::Resolution(err) => err.code(),
      ModuleErrorKind::Fetch(_) => ErrorCode::ERR_MODULE_FETCH_FAILED,
      ModuleErrorKind::Parse(_) => ErrorCode::ERR_MODULE_PARSE_FAILED,
      ModuleErrorKind::Link(err) => err.code(),
      ModuleErrorKind::Evaluation(_) => ErrorCode::ERR_EVALUATION_FAILED,
      ModuleErrorKind::Map(err) => err.code(),
    }
  }

  pub fn as_resolution(&self) -> Option<&ResolutionErrorKind> {
    match self.as_kind() {
      ModuleErrorKind::Resolution(err) => Some(err.as_kind()),
      _ => None,
    }
  }

  /// Link failures, including a body reading an uninitialized binding.
  pub fn as_link(&self) -> Option<&LinkError> {
    match self.as_kind() {
      ModuleErrorKind::Link(err) => Some(err),
      ModuleErrorKind::Evaluation(err) => LinkError::from_js_error(&err.source),
      _ => None,
    }
  }

  pub fn as_evaluation(&self) -> Option<&EvaluationError> {
    match self.as_kind() {
      ModuleErrorKind::Evaluation(err) => Some(err),
      _ => None,
    }
  }
}

impl From<ModuleErrorKind> for ModuleError {
  fn from(kind: ModuleErrorKind) -> Self {
    Self(Arc::new(kind))
  }
}

macro_rules! impl_from_for_module_error {
  ($($ty:ty),*) => {
    $(
      impl From<$ty> for ModuleError {
        fn from(err: $ty) -> Self {
          Self(Arc::new(ModuleErrorKind::from(err)))
        }
      }
    )*
  };
}

impl_from_for_module_error!(
  ResolutionError,
  ResolutionErrorKind,
  FetchError,
  ParseError,
  LinkError,
  EvaluationError,
  ModuleMapError
);

impl fmt::Display for ModuleError {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    fmt::Display::fmt(&self.0, f)
  }
}

impl std::error::Error for ModuleError {
  fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
    std::error::Error::source(&*self.0)
  }
}

impl JsErrorClass for ModuleError {
  fn get_class(&self) -> Cow<'static, str> {
    self.0.get_class()
  }

  fn get_message(&self) -> Cow<'static, str> {
    self.0.get_message()
  }

  fn get_additional_properties(&self) -> deno_error::AdditionalProperties {
    self.0.get_additional_properties()
  }

  fn get_ref(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
    self
  }
}

#[derive(Debug, Error, JsError)]
#[class(type)]
#[property("code" = self.code())]
pub enum ModuleMapError {
  #[error(
    "Cannot register a job for '{identity}' ({requested_type}) under the key of '{key}' ({key_type})"
  )]
  InvalidJobType {
    identity: ModuleIdentity,
    requested_type: RequestedModuleType,
    key: ModuleIdentity,
    key_type: RequestedModuleType,
  },
  #[error("Module '{identity}' is still being loaded, linked or evaluated")]
  JobInFlight { identity: ModuleIdentity },
}

impl ModuleMapError {
  pub fn code(&self) -> ErrorCode {
    match self {
      Self::InvalidJobType { .. } => ErrorCode::ERR_INVALID_JOB_TYPE,
      Self::JobInFlight { .. } => ErrorCode::ERR_JOB_IN_FLIGHT,
    }
  }
}
