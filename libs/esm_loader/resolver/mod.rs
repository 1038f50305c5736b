// Copyright 2018-2025 the Deno authors. MIT license.

use std::path::Path;
use std::rc::Rc;

use data_url::DataUrl;
use url::Url;

use crate::builtins::BuiltinModules;
use crate::errors::ResolutionError;
use crate::errors::ResolutionErrorKind;
use crate::modules::FormatTag;
use crate::modules::ImportAttributes;
use crate::modules::ModuleRequest;
use crate::modules::RequestedModuleType;
use crate::options::LoaderOptions;
use crate::options::PackageType;
use crate::specifier::ModuleIdentity;
use crate::specifier::is_relative_or_absolute_path;
use crate::specifier::parse_url_specifier;
use crate::specifier::resolve_path_specifier;

mod exports;
mod package_json;

pub use exports::pattern_key_compare;
pub use package_json::PackageJsonLoadError;
pub use package_json::PackageManifest;
pub use package_json::PackageManifestRc;
pub use package_json::PackageMetadataReader;
pub use package_json::SysPackageMetadataReader;
pub use package_json::get_package_scope;

pub(crate) type ResolutionResult<T> = Result<T, ResolutionError>;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResolvedModule {
  pub identity: ModuleIdentity,
  pub format: FormatTag,
}

/// Maps `(specifier, referrer, conditions)` to a module identity and format.
///
/// The result only depends on the arguments, the builtin registry and the
/// package manifests returned by the metadata reader. Nothing is cached here;
/// the module map caches jobs keyed by the resolved identity.
pub struct Resolver {
  builtins: Rc<BuiltinModules>,
  package_reader: Rc<dyn PackageMetadataReader>,
  default_package_type: PackageType,
  require_json_attribute: bool,
  allowed_schemes: &'static [&'static str],
}

impl Resolver {
  pub fn new(
    options: &LoaderOptions,
    builtins: Rc<BuiltinModules>,
    package_reader: Rc<dyn PackageMetadataReader>,
  ) -> Self {
    Self {
      builtins,
      package_reader,
      default_package_type: options.default_package_type,
      require_json_attribute: options.require_json_attribute,
      allowed_schemes: options.allowed_schemes(),
    }
  }

  pub fn resolve(
    &self,
    specifier: &str,
    referrer: &ModuleIdentity,
    conditions: &[String],
  ) -> ResolutionResult<ResolvedModule> {
    self.resolve_with_attributes(
      specifier,
      &ImportAttributes::new(),
      referrer,
      conditions,
    )
  }

  pub fn resolve_request(
    &self,
    request: &ModuleRequest,
    referrer: &ModuleIdentity,
    conditions: &[String],
  ) -> ResolutionResult<ResolvedModule> {
    self.resolve_with_attributes(
      &request.specifier,
      &request.attributes,
      referrer,
      conditions,
    )
  }

  pub fn resolve_with_attributes(
    &self,
    specifier: &str,
    attributes: &ImportAttributes,
    referrer: &ModuleIdentity,
    conditions: &[String],
  ) -> ResolutionResult<ResolvedModule> {
    validate_attributes(attributes)?;
    let url = self.resolve_url(specifier, referrer, conditions)?;
    let url = self.finalize_resolution(url, referrer)?;
    let identity = ModuleIdentity::from_url(url);
    let format = self.detect_format(&identity)?;
    let requested = RequestedModuleType::from_attributes(attributes);
    self.check_requested_type(&identity, format, &requested)?;
    log::trace!(
      "Resolved '{}' from '{}' to '{}' ({})",
      specifier,
      referrer,
      identity,
      format
    );
    Ok(ResolvedModule { identity, format })
  }

  fn resolve_url(
    &self,
    specifier: &str,
    referrer: &ModuleIdentity,
    conditions: &[String],
  ) -> ResolutionResult<Url> {
    if referrer.is_remote() {
      return self.resolve_from_remote(specifier, referrer);
    }

    if is_relative_or_absolute_path(specifier) {
      if referrer.as_url().cannot_be_a_base() {
        return Err(
          ResolutionErrorKind::InvalidReferrer {
            specifier: specifier.to_string(),
            referrer: referrer.clone(),
          }
          .into_box(),
        );
      }
      return resolve_path_specifier(specifier, referrer.as_url())
        .map_err(|err| invalid_specifier(specifier, err, referrer));
    }

    if specifier.starts_with('#') {
      return self.package_imports_resolve(specifier, referrer, conditions);
    }

    match parse_url_specifier(specifier) {
      Ok(Some(url)) => Ok(url),
      Ok(None) => self.resolve_bare_specifier(specifier, referrer, conditions),
      Err(err) => Err(invalid_specifier(specifier, err, referrer)),
    }
  }

  /// Remote modules may only import other remote modules through relative,
  /// absolute or URL specifiers.
  fn resolve_from_remote(
    &self,
    specifier: &str,
    referrer: &ModuleIdentity,
  ) -> ResolutionResult<Url> {
    let disallowed = |reason: &'static str| {
      ResolutionErrorKind::NetworkImportDisallowed {
        specifier: specifier.to_string(),
        referrer: referrer.clone(),
        reason,
      }
      .into_box()
    };
    let url = if is_relative_or_absolute_path(specifier) {
      resolve_path_specifier(specifier, referrer.as_url())
        .map_err(|err| invalid_specifier(specifier, err, referrer))?
    } else {
      match parse_url_specifier(specifier) {
        Ok(Some(url)) => url,
        Ok(None) if self.builtins.contains(specifier) => {
          return Err(disallowed(
            "remote imports cannot import from a local location.",
          ));
        }
        Ok(None) => {
          return Err(disallowed(
            "only relative and absolute specifiers are supported.",
          ));
        }
        Err(err) => return Err(invalid_specifier(specifier, err, referrer)),
      }
    };
    if !matches!(url.scheme(), "http" | "https" | "data") {
      return Err(disallowed(
        "remote imports cannot import from a local location.",
      ));
    }
    Ok(url)
  }

  /// Resolves a bare specifier: a builtin name or a package.
  pub(crate) fn resolve_bare_specifier(
    &self,
    specifier: &str,
    referrer: &ModuleIdentity,
    conditions: &[String],
  ) -> ResolutionResult<Url> {
    if self.builtins.contains(specifier) {
      return builtin_url(specifier);
    }
    self.package_resolve(specifier, referrer, conditions)
  }

  fn package_resolve(
    &self,
    specifier: &str,
    referrer: &ModuleIdentity,
    conditions: &[String],
  ) -> ResolutionResult<Url> {
    let (package_name, package_subpath) =
      parse_package_name(specifier, referrer)?;
    let package_not_found = || {
      ResolutionErrorKind::PackageNotFound {
        package_name: package_name.to_string(),
        referrer: referrer.clone(),
      }
      .into_box()
    };
    let Ok(referrer_path) = referrer.as_url().to_file_path() else {
      return Err(package_not_found());
    };

    // a package may import itself by name through its own "exports"
    if let Some(scope) =
      get_package_scope(self.package_reader.as_ref(), &referrer_path)
        .map_err(ResolutionErrorKind::from)?
      && scope.name.as_deref() == Some(package_name)
      && scope.exports.is_some()
    {
      return self.package_exports_resolve(
        &scope,
        &package_subpath,
        referrer,
        conditions,
      );
    }

    for dir in referrer_path.ancestors().skip(1) {
      let package_dir = dir.join("node_modules").join(package_name);
      let Some(manifest) = self
        .package_reader
        .read_package_boundary(&package_dir)
        .map_err(ResolutionErrorKind::from)?
      else {
        continue;
      };
      if manifest.exports.is_some() {
        return self.package_exports_resolve(
          &manifest,
          &package_subpath,
          referrer,
          conditions,
        );
      }
      if package_subpath == "." {
        return self.legacy_main_resolve(&manifest, referrer);
      }
      let package_url = Url::from_directory_path(&package_dir)
        .map_err(|_| package_not_found())?;
      return package_url
        .join(&package_subpath)
        .map_err(|err| invalid_specifier(specifier, err, referrer));
    }

    Err(package_not_found())
  }

  /// Resolution for packages without `"exports"`, probing the `"main"`
  /// field and `index` files.
  fn legacy_main_resolve(
    &self,
    manifest: &PackageManifest,
    referrer: &ModuleIdentity,
  ) -> ResolutionResult<Url> {
    let package_dir = manifest.dir_path();
    let not_found = || {
      ResolutionErrorKind::PackageNotFound {
        package_name: package_dir.display().to_string(),
        referrer: referrer.clone(),
      }
      .into_box()
    };
    let package_url =
      Url::from_directory_path(package_dir).map_err(|_| not_found())?;
    let mut candidates = Vec::with_capacity(7);
    if let Some(main) = &manifest.main {
      candidates.push(format!("./{main}"));
      candidates.push(format!("./{main}.js"));
      candidates.push(format!("./{main}.json"));
      candidates.push(format!("./{main}/index.js"));
      candidates.push(format!("./{main}/index.json"));
    }
    candidates.push("./index.js".to_string());
    candidates.push("./index.json".to_string());

    for candidate in candidates {
      let Ok(url) = package_url.join(&candidate) else {
        continue;
      };
      let Ok(path) = url.to_file_path() else {
        continue;
      };
      if self.package_reader.file_exists(&path) {
        return Ok(url);
      }
    }
    Err(not_found())
  }

  fn finalize_resolution(
    &self,
    url: Url,
    referrer: &ModuleIdentity,
  ) -> ResolutionResult<Url> {
    let scheme = url.scheme();
    if !self.allowed_schemes.contains(&scheme) {
      return Err(
        ResolutionErrorKind::UnsupportedScheme {
          scheme: scheme.to_string(),
          allowed: self.allowed_schemes.join(", "),
        }
        .into_box(),
      );
    }
    match scheme {
      "node" => {
        if !self.builtins.contains(url.path()) {
          return Err(
            ResolutionErrorKind::UnknownBuiltin {
              specifier: url.to_string(),
            }
            .into_box(),
          );
        }
      }
      "file" => {
        if lazy_regex::regex_is_match!(r"(?i)%2f|%5c", url.path()) {
          return Err(
            ResolutionErrorKind::InvalidModuleSpecifier {
              specifier: url.path().to_string(),
              reason: "must not include encoded \"/\" or \"\\\" characters"
                .into(),
              maybe_referrer: Some(referrer.clone()),
            }
            .into_box(),
          );
        }
        let is_dir = url.path().ends_with('/')
          || url
            .to_file_path()
            .is_ok_and(|path| self.package_reader.is_dir(&path));
        if is_dir {
          return Err(
            ResolutionErrorKind::UnsupportedDirImport {
              identity: ModuleIdentity::from_url(url),
              referrer: referrer.clone(),
            }
            .into_box(),
          );
        }
      }
      _ => {}
    }
    Ok(url)
  }

  /// Detects the format of a resolved module from its scheme, extension or
  /// package scope.
  pub fn detect_format(
    &self,
    identity: &ModuleIdentity,
  ) -> ResolutionResult<FormatTag> {
    let url = identity.as_url();
    let unknown_extension = |extension: &str| {
      ResolutionErrorKind::UnknownFileExtension {
        extension: extension.to_string(),
        identity: identity.clone(),
      }
      .into_box()
    };
    match url.scheme() {
      "node" => Ok(FormatTag::Builtin),
      "data" => {
        let data_url = DataUrl::process(url.as_str())
          .map_err(|_| unknown_extension("data:"))?;
        let mime = data_url.mime_type();
        match (mime.type_.as_str(), mime.subtype.as_str()) {
          ("text" | "application", "javascript") => Ok(FormatTag::EcmaScript),
          ("application", "json") => Ok(FormatTag::Json),
          ("application", "wasm") => Ok(FormatTag::Wasm),
          (type_, subtype) => {
            Err(unknown_extension(&format!("{type_}/{subtype}")))
          }
        }
      }
      "http" | "https" => match extension_of(url.path()) {
        Some("cjs") => Ok(FormatTag::CommonJs),
        Some("json") => Ok(FormatTag::Json),
        Some("wasm") => Ok(FormatTag::Wasm),
        _ => Ok(FormatTag::EcmaScript),
      },
      _ => match extension_of(url.path()) {
        Some("mjs") => Ok(FormatTag::EcmaScript),
        Some("cjs") => Ok(FormatTag::CommonJs),
        Some("json") => Ok(FormatTag::Json),
        Some("wasm") => Ok(FormatTag::Wasm),
        Some("js") | None => self.package_type_format(url),
        Some(extension) => Err(unknown_extension(&format!(".{extension}"))),
      },
    }
  }

  fn package_type_format(&self, url: &Url) -> ResolutionResult<FormatTag> {
    let package_type = match url.to_file_path() {
      Ok(path) => self.package_type_of(&path)?,
      Err(_) => None,
    };
    Ok(package_type.unwrap_or(self.default_package_type).format())
  }

  fn package_type_of(
    &self,
    path: &Path,
  ) -> ResolutionResult<Option<PackageType>> {
    let scope = get_package_scope(self.package_reader.as_ref(), path)
      .map_err(ResolutionErrorKind::from)?;
    Ok(scope.and_then(|scope| scope.typ))
  }

  fn check_requested_type(
    &self,
    identity: &ModuleIdentity,
    format: FormatTag,
    requested: &RequestedModuleType,
  ) -> ResolutionResult<()> {
    let conflict = match (requested, format) {
      (RequestedModuleType::Json, FormatTag::Json) => false,
      (RequestedModuleType::Json, _) => true,
      (RequestedModuleType::None, FormatTag::Json) => {
        self.require_json_attribute
      }
      (RequestedModuleType::None, _) => false,
      // rejected by attribute validation
      (RequestedModuleType::Other(_), _) => true,
    };
    if conflict {
      return Err(
        ResolutionErrorKind::AmbiguousFormat {
          identity: identity.clone(),
          detected: format,
          requested: requested.clone(),
        }
        .into_box(),
      );
    }
    Ok(())
  }
}

fn validate_attributes(attributes: &ImportAttributes) -> ResolutionResult<()> {
  for (key, value) in attributes {
    if key != "type" || value != "json" {
      return Err(
        ResolutionErrorKind::UnsupportedImportAttribute {
          key: key.clone(),
          value: value.clone(),
        }
        .into_box(),
      );
    }
  }
  Ok(())
}

fn builtin_url(name: &str) -> ResolutionResult<Url> {
  Url::parse(&format!("node:{name}")).map_err(|_| {
    ResolutionErrorKind::UnknownBuiltin {
      specifier: name.to_string(),
    }
    .into_box()
  })
}

fn invalid_specifier(
  specifier: &str,
  err: url::ParseError,
  referrer: &ModuleIdentity,
) -> ResolutionError {
  ResolutionErrorKind::InvalidModuleSpecifier {
    specifier: specifier.to_string(),
    reason: format!("is not a valid URL: {err}").into(),
    maybe_referrer: Some(referrer.clone()),
  }
  .into_box()
}

fn extension_of(path: &str) -> Option<&str> {
  let file_name = path.rsplit('/').next()?;
  let (stem, extension) = file_name.rsplit_once('.')?;
  if stem.is_empty() {
    return None;
  }
  Some(extension)
}

/// Splits a bare specifier into its package name and `./`-prefixed subpath.
pub fn parse_package_name<'a>(
  specifier: &'a str,
  referrer: &ModuleIdentity,
) -> ResolutionResult<(&'a str, String)> {
  let mut separator_index = specifier.find('/');
  let mut valid_package_name = true;
  if specifier.starts_with('@') {
    match separator_index {
      Some(index) => {
        separator_index =
          specifier[index + 1..].find('/').map(|i| i + index + 1);
      }
      None => valid_package_name = false,
    }
  }

  let package_name = match separator_index {
    Some(index) => &specifier[..index],
    None => specifier,
  };

  if package_name.starts_with('.')
    || package_name.contains('%')
    || package_name.contains('\\')
  {
    valid_package_name = false;
  }

  if !valid_package_name {
    return Err(
      ResolutionErrorKind::InvalidModuleSpecifier {
        specifier: specifier.to_string(),
        reason: "is not a valid package name".into(),
        maybe_referrer: Some(referrer.clone()),
      }
      .into_box(),
    );
  }

  let package_subpath = match separator_index {
    Some(index) => format!(".{}", &specifier[index..]),
    None => ".".to_string(),
  };

  Ok((package_name, package_subpath))
}
