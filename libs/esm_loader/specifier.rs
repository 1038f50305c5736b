// Copyright 2018-2025 the Deno authors. MIT license.

use std::fmt;
use std::path::Path;

use url::ParseError;
use url::Url;

/// Canonical identity of a module.
///
/// Identities are produced by the resolver and compared byte for byte on
/// their serialized URL. Builtins use the `node:` scheme.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModuleIdentity(Url);

impl ModuleIdentity {
  pub fn from_url(url: Url) -> Self {
    Self(url)
  }

  pub fn parse(url_str: &str) -> Result<Self, ParseError> {
    Url::parse(url_str).map(Self)
  }

  pub fn from_file_path(path: &Path) -> Option<Self> {
    Url::from_file_path(path).ok().map(Self)
  }

  pub fn builtin(name: &str) -> Result<Self, ParseError> {
    Url::parse(&format!("node:{}", name)).map(Self)
  }

  pub fn as_url(&self) -> &Url {
    &self.0
  }

  pub fn into_url(self) -> Url {
    self.0
  }

  pub fn as_str(&self) -> &str {
    self.0.as_str()
  }

  pub fn scheme(&self) -> &str {
    self.0.scheme()
  }

  /// Returns the builtin name for `node:` identities.
  pub fn builtin_name(&self) -> Option<&str> {
    if self.0.scheme() == "node" {
      Some(self.0.path())
    } else {
      None
    }
  }

  pub fn is_remote(&self) -> bool {
    matches!(self.0.scheme(), "http" | "https")
  }
}

impl fmt::Display for ModuleIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.0.as_str())
  }
}

impl fmt::Debug for ModuleIdentity {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "ModuleIdentity({})", self.0.as_str())
  }
}

impl From<Url> for ModuleIdentity {
  fn from(url: Url) -> Self {
    Self(url)
  }
}

/// `./x`, `../x`, `.` and `..`.
pub fn is_relative_specifier(specifier: &str) -> bool {
  let bytes = specifier.as_bytes();
  if bytes.first() == Some(&b'.') {
    if bytes.len() == 1 || bytes[1] == b'/' {
      return true;
    }
    if bytes[1] == b'.' && (bytes.len() == 2 || bytes[2] == b'/') {
      return true;
    }
  }
  false
}

pub fn is_relative_or_absolute_path(specifier: &str) -> bool {
  if specifier.is_empty() {
    return false;
  }
  specifier.starts_with('/') || is_relative_specifier(specifier)
}

/// Joins a relative or absolute path specifier onto `base`, following the
/// URL parser. `.` and `..` are treated as directories.
pub fn resolve_path_specifier(
  specifier: &str,
  base: &Url,
) -> Result<Url, ParseError> {
  let specifier = match specifier {
    "." => "./",
    ".." => "../",
    other => other,
  };
  base.join(specifier)
}

/// Parses `specifier` as an absolute URL.
///
/// `Ok(None)` means the specifier is not a URL at all (a bare specifier);
/// other parse failures are reported.
pub fn parse_url_specifier(specifier: &str) -> Result<Option<Url>, ParseError> {
  match Url::parse(specifier) {
    Ok(url) => Ok(Some(url)),
    Err(ParseError::RelativeUrlWithoutBase) => Ok(None),
    Err(err) => Err(err),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_is_relative_specifier() {
    let tests = [
      (".", true),
      ("..", true),
      ("./a.mjs", true),
      ("../a.mjs", true),
      ("...", false),
      (".a", false),
      ("/a.mjs", false),
      ("a", false),
      ("", false),
    ];
    for (specifier, expected) in tests {
      assert_eq!(is_relative_specifier(specifier), expected, "{specifier}");
    }
  }

  #[test]
  fn test_resolve_path_specifier() {
    let tests = [
      (
        "./b.mjs",
        "file:///project/src/a.mjs",
        "file:///project/src/b.mjs",
      ),
      ("../b.mjs", "file:///project/src/a.mjs", "file:///project/b.mjs"),
      ("/b.mjs", "file:///project/src/a.mjs", "file:///b.mjs"),
      (".", "file:///project/src/a.mjs", "file:///project/src/"),
      ("..", "file:///project/src/a.mjs", "file:///project/"),
      (
        "./dep.js?x=1#h",
        "https://example.com/lib/mod.js",
        "https://example.com/lib/dep.js?x=1#h",
      ),
    ];
    for (specifier, base, expected) in tests {
      let base = Url::parse(base).unwrap();
      let resolved = resolve_path_specifier(specifier, &base).unwrap();
      assert_eq!(resolved.as_str(), expected);
    }
  }

  #[test]
  fn test_parse_url_specifier() {
    assert_eq!(parse_url_specifier("lodash").unwrap(), None);
    assert_eq!(
      parse_url_specifier("node:fs").unwrap().unwrap().as_str(),
      "node:fs"
    );
    assert!(parse_url_specifier("http://[::1").is_err());
  }

  #[test]
  fn test_module_identity() {
    let identity = ModuleIdentity::builtin("fs").unwrap();
    assert_eq!(identity.as_str(), "node:fs");
    assert_eq!(identity.builtin_name(), Some("fs"));
    assert!(!identity.is_remote());

    let a = ModuleIdentity::parse("file:///a.mjs").unwrap();
    let b = ModuleIdentity::from_url(Url::parse("file:///a.mjs").unwrap());
    assert_eq!(a, b);
    assert_eq!(b.builtin_name(), None);
    assert_eq!(format!("{a:?}"), "ModuleIdentity(file:///a.mjs)");
  }
}
