// Copyright 2018-2025 the Deno authors. MIT license.

//! `"exports"` and `"imports"` field resolution.

use serde_json::Map;
use serde_json::Value;
use url::Url;

use super::ResolutionResult;
use super::Resolver;
use super::package_json::PackageManifest;
use super::package_json::get_package_scope;
use crate::errors::ResolutionErrorKind;
use crate::specifier::ModuleIdentity;

/// Outcome of resolving a single package target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum PackageTargetResolution {
  Resolved(Url),
  /// The target was `null` (or an empty array): explicitly not exported.
  Excluded,
  /// No condition matched.
  Unmatched,
}

fn invalid_segment(value: &str) -> bool {
  lazy_regex::regex_is_match!(
    r"(?i)(^|\\|/)((\.|%2e)(\.|%2e)?|(n|%6e)(o|%6f)(d|%64)(e|%65)(_|%5f)(m|%6d)(o|%6f)(d|%64)(u|%75)(l|%6c)(e|%65)(s|%73))(\\|/|$)",
    value
  )
}

fn is_array_index(key: &str) -> bool {
  match key.parse::<u32>() {
    Ok(n) => n.to_string() == key && n < u32::MAX,
    Err(_) => false,
  }
}

/// Orders two pattern keys; `1` means `b` is the more specific key.
pub fn pattern_key_compare(a: &str, b: &str) -> i32 {
  let a_pattern_index = a.find('*');
  let b_pattern_index = b.find('*');
  let base_len_a = a_pattern_index.map_or(a.len(), |i| i + 1);
  let base_len_b = b_pattern_index.map_or(b.len(), |i| i + 1);
  if base_len_a > base_len_b {
    return -1;
  }
  if base_len_b > base_len_a {
    return 1;
  }
  if a_pattern_index.is_none() {
    return 1;
  }
  if b_pattern_index.is_none() {
    return -1;
  }
  if a.len() > b.len() {
    return -1;
  }
  if b.len() > a.len() {
    return 1;
  }
  0
}

/// Finds the most specific `*` pattern or trailing-slash folder key that
/// matches `request`, with the part of `request` it captures.
fn find_best_match<'a>(
  map: &'a Map<String, Value>,
  request: &str,
) -> Option<(&'a str, String)> {
  let mut best_match = "";
  let mut best_match_subpath = None;
  for key in map.keys() {
    match key.find('*') {
      Some(pattern_index) => {
        if !request.starts_with(&key[..pattern_index]) {
          continue;
        }
        let pattern_trailer = &key[pattern_index + 1..];
        if request.len() >= key.len()
          && request.ends_with(pattern_trailer)
          && pattern_key_compare(best_match, key) == 1
          && key.rfind('*') == Some(pattern_index)
        {
          best_match = key;
          best_match_subpath = Some(
            request[pattern_index..request.len() - pattern_trailer.len()]
              .to_string(),
          );
        }
      }
      None => {
        if key.ends_with('/')
          && request.starts_with(key.as_str())
          && pattern_key_compare(best_match, key) == 1
        {
          best_match = key;
          best_match_subpath = Some(request[key.len()..].to_string());
        }
      }
    }
  }
  best_match_subpath.map(|subpath| (best_match, subpath))
}

fn package_json_url(
  manifest: &PackageManifest,
) -> Result<Url, ResolutionErrorKind> {
  Url::from_file_path(&manifest.path).map_err(|_| {
    ResolutionErrorKind::InvalidPackageConfig {
      package_json_path: manifest.path.clone(),
      reason: "package.json path is not absolute".into(),
    }
  })
}

impl Resolver {
  fn is_conditional_exports_main_sugar(
    &self,
    exports: &Value,
    manifest: &PackageManifest,
  ) -> Result<bool, ResolutionErrorKind> {
    let object = match exports {
      Value::String(_) | Value::Array(_) => return Ok(true),
      Value::Object(object) => object,
      _ => return Ok(false),
    };
    let mut is_conditional_sugar = false;
    for (i, key) in object.keys().enumerate() {
      let cur_is_conditional_sugar = key.is_empty() || !key.starts_with('.');
      if i == 0 {
        is_conditional_sugar = cur_is_conditional_sugar;
      } else if is_conditional_sugar != cur_is_conditional_sugar {
        return Err(ResolutionErrorKind::InvalidPackageConfig {
          package_json_path: manifest.path.clone(),
          reason: "\"exports\" cannot contain some keys starting with '.' and some not. The exports object must either be an object of package subpath keys or an object of main entry condition name keys only.".into(),
        });
      }
    }
    Ok(is_conditional_sugar)
  }

  pub(crate) fn package_exports_resolve(
    &self,
    manifest: &PackageManifest,
    package_subpath: &str,
    referrer: &ModuleIdentity,
    conditions: &[String],
  ) -> ResolutionResult<Url> {
    let Some(exports) = &manifest.exports else {
      return Err(self.exports_not_found(package_subpath, manifest, referrer));
    };
    let sugar;
    let exports_map = if self
      .is_conditional_exports_main_sugar(exports, manifest)?
    {
      let mut map = Map::with_capacity(1);
      map.insert(".".to_string(), exports.clone());
      sugar = map;
      &sugar
    } else {
      match exports {
        Value::Object(map) => map,
        _ => {
          return Err(self.exports_not_found(
            package_subpath,
            manifest,
            referrer,
          ));
        }
      }
    };

    if let Some(target) = exports_map.get(package_subpath)
      && !package_subpath.contains('*')
      && !package_subpath.ends_with('/')
    {
      let resolved = self.resolve_package_target(
        manifest,
        target,
        "",
        package_subpath,
        referrer,
        false,
        false,
        conditions,
      )?;
      return match resolved {
        PackageTargetResolution::Resolved(url) => Ok(url),
        _ => Err(self.exports_not_found(package_subpath, manifest, referrer)),
      };
    }

    if let Some((best_match, best_match_subpath)) =
      find_best_match(exports_map, package_subpath)
    {
      let target = &exports_map[best_match];
      let pattern = best_match.contains('*');
      let resolved = self.resolve_package_target(
        manifest,
        target,
        &best_match_subpath,
        best_match,
        referrer,
        pattern,
        false,
        conditions,
      )?;
      if let PackageTargetResolution::Resolved(url) = resolved {
        if !pattern {
          log::debug!(
            "Use of deprecated folder mapping '{}' in the \"exports\" field of '{}'",
            best_match,
            manifest.path.display()
          );
        }
        return Ok(url);
      }
    }

    Err(self.exports_not_found(package_subpath, manifest, referrer))
  }

  pub(crate) fn package_imports_resolve(
    &self,
    name: &str,
    referrer: &ModuleIdentity,
    conditions: &[String],
  ) -> ResolutionResult<Url> {
    if name == "#" || name.starts_with("#/") {
      return Err(
        ResolutionErrorKind::InvalidModuleSpecifier {
          specifier: name.to_string(),
          reason: "is not a valid internal imports specifier name".into(),
          maybe_referrer: Some(referrer.clone()),
        }
        .into_box(),
      );
    }

    let mut package_json_path = None;
    if let Ok(referrer_path) = referrer.as_url().to_file_path()
      && let Some(scope) =
        get_package_scope(self.package_reader.as_ref(), &referrer_path)
          .map_err(ResolutionErrorKind::from)?
    {
      package_json_path = Some(scope.path.clone());
      if let Some(imports) = &scope.imports {
        if let Some(target) = imports.get(name)
          && !name.contains('*')
          && !name.ends_with('/')
        {
          let resolved = self.resolve_package_target(
            &scope, target, "", name, referrer, false, true, conditions,
          )?;
          if let PackageTargetResolution::Resolved(url) = resolved {
            return Ok(url);
          }
        } else if let Some((best_match, best_match_subpath)) =
          find_best_match(imports, name)
        {
          let target = &imports[best_match];
          let pattern = best_match.contains('*');
          let resolved = self.resolve_package_target(
            &scope,
            target,
            &best_match_subpath,
            best_match,
            referrer,
            pattern,
            true,
            conditions,
          )?;
          if let PackageTargetResolution::Resolved(url) = resolved {
            return Ok(url);
          }
        }
      }
    }

    Err(
      ResolutionErrorKind::PackageImportNotDefined {
        specifier: name.to_string(),
        package_json_path,
        referrer: referrer.clone(),
      }
      .into_box(),
    )
  }

  #[allow(clippy::too_many_arguments)]
  pub(crate) fn resolve_package_target(
    &self,
    manifest: &PackageManifest,
    target: &Value,
    subpath: &str,
    package_subpath: &str,
    referrer: &ModuleIdentity,
    pattern: bool,
    internal: bool,
    conditions: &[String],
  ) -> ResolutionResult<PackageTargetResolution> {
    match target {
      Value::String(target) => self.resolve_package_target_string(
        manifest,
        target,
        subpath,
        package_subpath,
        referrer,
        pattern,
        internal,
        conditions,
      ),
      Value::Array(targets) => {
        if targets.is_empty() {
          return Ok(PackageTargetResolution::Excluded);
        }
        let mut last_outcome = Ok(PackageTargetResolution::Unmatched);
        for target_item in targets {
          match self.resolve_package_target(
            manifest,
            target_item,
            subpath,
            package_subpath,
            referrer,
            pattern,
            internal,
            conditions,
          ) {
            Ok(PackageTargetResolution::Resolved(url)) => {
              return Ok(PackageTargetResolution::Resolved(url));
            }
            Ok(PackageTargetResolution::Unmatched) => continue,
            Ok(PackageTargetResolution::Excluded) => {
              last_outcome = Ok(PackageTargetResolution::Excluded);
            }
            Err(err) => {
              if matches!(
                err.as_kind(),
                ResolutionErrorKind::InvalidPackageTarget { .. }
              ) {
                last_outcome = Err(err);
                continue;
              }
              return Err(err);
            }
          }
        }
        last_outcome
      }
      Value::Object(object) => {
        if object.keys().any(|key| is_array_index(key)) {
          return Err(
            ResolutionErrorKind::InvalidPackageConfig {
              package_json_path: manifest.path.clone(),
              reason: "\"exports\" cannot contain numeric property keys."
                .into(),
            }
            .into_box(),
          );
        }
        for (key, conditional_target) in object {
          if key == "default" || conditions.iter().any(|c| c == key) {
            let resolved = self.resolve_package_target(
              manifest,
              conditional_target,
              subpath,
              package_subpath,
              referrer,
              pattern,
              internal,
              conditions,
            )?;
            if resolved == PackageTargetResolution::Unmatched {
              continue;
            }
            return Ok(resolved);
          }
        }
        Ok(PackageTargetResolution::Unmatched)
      }
      Value::Null => Ok(PackageTargetResolution::Excluded),
      other => Err(self.invalid_package_target(
        package_subpath,
        &other.to_string(),
        manifest,
        internal,
        referrer,
      )),
    }
  }

  #[allow(clippy::too_many_arguments)]
  fn resolve_package_target_string(
    &self,
    manifest: &PackageManifest,
    target: &str,
    subpath: &str,
    match_: &str,
    referrer: &ModuleIdentity,
    pattern: bool,
    internal: bool,
    conditions: &[String],
  ) -> ResolutionResult<PackageTargetResolution> {
    if !subpath.is_empty() && !pattern && !target.ends_with('/') {
      return Err(
        self.invalid_package_target(match_, target, manifest, internal, referrer),
      );
    }

    let package_json_url = package_json_url(manifest)?;
    if !target.starts_with("./") {
      if internal && !target.starts_with("../") && !target.starts_with('/') {
        match Url::parse(target) {
          Ok(url) => {
            if let Some(name) = url.scheme().eq("node").then(|| url.path())
              && self.builtins.contains(name)
            {
              return Ok(PackageTargetResolution::Resolved(url));
            }
          }
          Err(_) => {
            let export_target = if pattern {
              target.replace('*', subpath)
            } else {
              format!("{target}{subpath}")
            };
            let package_identity =
              ModuleIdentity::from_url(package_json_url.clone());
            let url = self.resolve_bare_specifier(
              &export_target,
              &package_identity,
              conditions,
            )?;
            return Ok(PackageTargetResolution::Resolved(url));
          }
        }
      }
      return Err(
        self.invalid_package_target(match_, target, manifest, internal, referrer),
      );
    }

    if invalid_segment(&target[2..]) {
      return Err(
        self.invalid_package_target(match_, target, manifest, internal, referrer),
      );
    }

    let resolved = package_json_url.join(target).map_err(|_| {
      self.invalid_package_target(match_, target, manifest, internal, referrer)
    })?;
    let package_path = package_json_url.join(".").map_err(|_| {
      self.invalid_package_target(match_, target, manifest, internal, referrer)
    })?;
    if !resolved.path().starts_with(package_path.path()) {
      return Err(
        self.invalid_package_target(match_, target, manifest, internal, referrer),
      );
    }

    if subpath.is_empty() {
      return Ok(PackageTargetResolution::Resolved(resolved));
    }

    if invalid_segment(subpath) {
      let field = if internal { "imports" } else { "exports" };
      return Err(
        ResolutionErrorKind::InvalidModuleSpecifier {
          specifier: format!("{match_}{subpath}"),
          reason: format!(
            "request is not a valid subpath for the \"{}\" resolution of {}",
            field,
            manifest.path.display()
          )
          .into(),
          maybe_referrer: Some(referrer.clone()),
        }
        .into_box(),
      );
    }

    let url = if pattern {
      Url::parse(&resolved.as_str().replace('*', subpath))
    } else {
      resolved.join(subpath)
    };
    url.map(PackageTargetResolution::Resolved).map_err(|err| {
      ResolutionErrorKind::InvalidModuleSpecifier {
        specifier: format!("{match_}{subpath}"),
        reason: err.to_string().into(),
        maybe_referrer: Some(referrer.clone()),
      }
      .into_box()
    })
  }

  fn invalid_package_target(
    &self,
    subpath: &str,
    target: &str,
    manifest: &PackageManifest,
    internal: bool,
    referrer: &ModuleIdentity,
  ) -> crate::errors::ResolutionError {
    ResolutionErrorKind::InvalidPackageTarget {
      subpath: subpath.to_string(),
      target: target.to_string(),
      package_json_path: manifest.path.clone(),
      is_import: internal,
      maybe_referrer: Some(referrer.clone()),
    }
    .into_box()
  }

  fn exports_not_found(
    &self,
    subpath: &str,
    manifest: &PackageManifest,
    referrer: &ModuleIdentity,
  ) -> crate::errors::ResolutionError {
    ResolutionErrorKind::ExportsMapNoMatch {
      subpath: subpath.to_string(),
      package_json_path: manifest.path.clone(),
      maybe_referrer: Some(referrer.clone()),
    }
    .into_box()
  }
}
