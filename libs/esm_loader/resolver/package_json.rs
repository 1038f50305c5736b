// Copyright 2018-2025 the Deno authors. MIT license.

use std::io::ErrorKind;
use std::path::Path;
use std::path::PathBuf;
use std::rc::Rc;

use deno_error::JsError;
use serde_json::Map;
use serde_json::Value;
use sys_traits::FsMetadata;
use sys_traits::FsRead;
use thiserror::Error;

use crate::options::PackageType;

#[derive(Debug, Error, JsError)]
pub enum PackageJsonLoadError {
  #[class(inherit)]
  #[error("Failed reading '{}'.", .path.display())]
  Io {
    path: PathBuf,
    #[source]
    #[inherit]
    source: std::io::Error,
  },
  #[class(inherit)]
  #[error("Invalid package config '{}'.", .path.display())]
  Deserialize {
    path: PathBuf,
    #[source]
    #[inherit]
    source: serde_json::Error,
  },
}

pub type PackageManifestRc = Rc<PackageManifest>;

/// The parts of a `package.json` that module resolution looks at.
#[derive(Debug, Clone, PartialEq)]
pub struct PackageManifest {
  /// Path of the `package.json` file itself.
  pub path: PathBuf,
  pub name: Option<String>,
  pub main: Option<String>,
  /// `None` for a missing or unrecognized `"type"`.
  pub typ: Option<PackageType>,
  /// `None` when the field is absent or `null`.
  pub exports: Option<Value>,
  pub imports: Option<Map<String, Value>>,
}

impl PackageManifest {
  pub fn load_from_string(
    path: PathBuf,
    source: &str,
  ) -> Result<PackageManifest, PackageJsonLoadError> {
    if source.trim().is_empty() {
      return Ok(PackageManifest {
        path,
        name: None,
        main: None,
        typ: None,
        exports: None,
        imports: None,
      });
    }

    let value: Value = serde_json::from_str(source).map_err(|err| {
      PackageJsonLoadError::Deserialize {
        path: path.clone(),
        source: err,
      }
    })?;
    Ok(Self::load_from_value(path, value))
  }

  pub fn load_from_value(path: PathBuf, value: Value) -> PackageManifest {
    let mut object = match value {
      Value::Object(object) => object,
      _ => Map::new(),
    };
    let string_field = |value: Option<Value>| match value {
      Some(Value::String(s)) => Some(s),
      _ => None,
    };
    let name = string_field(object.remove("name"));
    let main = string_field(object.remove("main"));
    // unknown types are ignored for forwards compatibility
    let typ = match object.get("type").and_then(|t| t.as_str()) {
      Some("module") => Some(PackageType::Module),
      Some("commonjs") => Some(PackageType::CommonJs),
      _ => None,
    };
    let exports = match object.remove("exports") {
      Some(Value::Null) | None => None,
      Some(exports) => Some(exports),
    };
    let imports = match object.remove("imports") {
      Some(Value::Object(imports)) => Some(imports),
      _ => None,
    };
    PackageManifest {
      path,
      name,
      main,
      typ,
      exports,
      imports,
    }
  }

  pub fn dir_path(&self) -> &Path {
    self.path.parent().unwrap_or(&self.path)
  }
}

/// Source of package manifests for bare specifier resolution.
pub trait PackageMetadataReader {
  /// Reads `<dir>/package.json`. `Ok(None)` when there is none.
  fn read_package_boundary(
    &self,
    dir: &Path,
  ) -> Result<Option<PackageManifestRc>, PackageJsonLoadError>;

  /// Used by legacy `"main"` resolution to probe candidate files.
  fn file_exists(&self, path: &Path) -> bool;

  /// Directories cannot be imported.
  fn is_dir(&self, path: &Path) -> bool;
}

/// Reads manifests through a [`sys_traits`] file system.
#[derive(Debug, Clone)]
pub struct SysPackageMetadataReader<TSys: FsRead + FsMetadata> {
  sys: TSys,
}

impl<TSys: FsRead + FsMetadata> SysPackageMetadataReader<TSys> {
  pub fn new(sys: TSys) -> Self {
    Self { sys }
  }
}

impl<TSys: FsRead + FsMetadata> PackageMetadataReader
  for SysPackageMetadataReader<TSys>
{
  fn read_package_boundary(
    &self,
    dir: &Path,
  ) -> Result<Option<PackageManifestRc>, PackageJsonLoadError> {
    let path = dir.join("package.json");
    match self.sys.fs_read_to_string_lossy(&path) {
      Ok(text) => {
        let manifest = PackageManifest::load_from_string(path, &text)?;
        Ok(Some(Rc::new(manifest)))
      }
      Err(err)
        if err.kind() == ErrorKind::NotFound
          || err.kind() == ErrorKind::NotADirectory =>
      {
        Ok(None)
      }
      Err(err) => Err(PackageJsonLoadError::Io { path, source: err }),
    }
  }

  fn file_exists(&self, path: &Path) -> bool {
    self.sys.fs_is_file_no_err(path)
  }

  fn is_dir(&self, path: &Path) -> bool {
    self.sys.fs_is_dir_no_err(path)
  }
}

/// Finds the package scope of `file_path`: the nearest ancestor directory
/// holding a `package.json`, without crossing out of a `node_modules`
/// directory.
pub fn get_package_scope(
  reader: &dyn PackageMetadataReader,
  file_path: &Path,
) -> Result<Option<PackageManifestRc>, PackageJsonLoadError> {
  let mut current = file_path;
  while let Some(parent) = current.parent() {
    if parent.file_name().is_some_and(|name| name == "node_modules") {
      break;
    }
    if let Some(manifest) = reader.read_package_boundary(parent)? {
      return Ok(Some(manifest));
    }
    current = parent;
  }
  Ok(None)
}
