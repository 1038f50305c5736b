// Copyright 2018-2025 the Deno authors. MIT license.

use std::cell::RefCell;
use std::collections::HashMap;

use data_url::DataUrl;
use deno_error::JsErrorBox;
use futures::future::FutureExt;
use futures::future::LocalBoxFuture;
use sys_traits::FsRead;

use super::ModuleSource;
use super::ModuleSourceCode;
use crate::specifier::ModuleIdentity;

pub type ModuleSourceFuture =
  LocalBoxFuture<'static, Result<ModuleSource, JsErrorBox>>;

/// Fetches the raw source of a module.
pub trait ResourceLoader {
  /// Loads the source for `identity`. Errors are opaque to the loader and
  /// surface as fetch errors of the requesting module.
  fn fetch(&self, identity: &ModuleIdentity) -> ModuleSourceFuture;
}

/// Placeholder loader for hosts that only use builtin modules.
pub struct NoopResourceLoader;

impl ResourceLoader for NoopResourceLoader {
  fn fetch(&self, identity: &ModuleIdentity) -> ModuleSourceFuture {
    let err = JsErrorBox::generic(format!(
      "Module loading is not supported; attempted to load: \"{identity}\""
    ));
    futures::future::err(err).boxed_local()
  }
}

/// Loads `file:` modules through a [`sys_traits`] file system and decodes
/// `data:` URLs.
#[derive(Debug, Clone)]
pub struct FsResourceLoader<TSys: FsRead> {
  sys: TSys,
}

impl<TSys: FsRead> FsResourceLoader<TSys> {
  pub fn new(sys: TSys) -> Self {
    Self { sys }
  }

  fn load(
    &self,
    identity: &ModuleIdentity,
  ) -> Result<ModuleSource, JsErrorBox> {
    let url = identity.as_url();
    match url.scheme() {
      "file" => {
        let path = url.to_file_path().map_err(|_| {
          JsErrorBox::type_error(format!("Invalid file path '{identity}'"))
        })?;
        let bytes = self.sys.fs_read(&path).map_err(|err| {
          JsErrorBox::new(
            "NotFound",
            format!("Cannot load module '{}': {}", path.display(), err),
          )
        })?;
        Ok(ModuleSource::new(ModuleSourceCode::Bytes(bytes.into_owned())))
      }
      "data" => {
        let data_url = DataUrl::process(url.as_str()).map_err(|err| {
          JsErrorBox::type_error(format!("Invalid data URL: {err:?}"))
        })?;
        let (bytes, _) = data_url.decode_to_vec().map_err(|err| {
          JsErrorBox::type_error(format!("Invalid data URL body: {err:?}"))
        })?;
        Ok(ModuleSource::new(ModuleSourceCode::Bytes(bytes)))
      }
      scheme => Err(JsErrorBox::type_error(format!(
        "Unsupported scheme '{scheme}' for module '{identity}'"
      ))),
    }
  }
}

impl<TSys: FsRead> ResourceLoader for FsResourceLoader<TSys> {
  fn fetch(&self, identity: &ModuleIdentity) -> ModuleSourceFuture {
    futures::future::ready(self.load(identity)).boxed_local()
  }
}

/// Serves sources registered up front, counting fetches per identity.
#[derive(Default)]
pub struct StaticResourceLoader {
  sources: HashMap<ModuleIdentity, String>,
  redirects: HashMap<ModuleIdentity, ModuleIdentity>,
  fetch_counts: RefCell<HashMap<ModuleIdentity, usize>>,
}

impl StaticResourceLoader {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn add(&mut self, identity: ModuleIdentity, source: impl Into<String>) {
    self.sources.insert(identity, source.into());
  }

  /// Makes fetches of `from` return the source of `to`, reporting `to` as
  /// the found identity.
  pub fn add_redirect(&mut self, from: ModuleIdentity, to: ModuleIdentity) {
    self.redirects.insert(from, to);
  }

  pub fn fetch_count(&self, identity: &ModuleIdentity) -> usize {
    self
      .fetch_counts
      .borrow()
      .get(identity)
      .copied()
      .unwrap_or_default()
  }
}

impl ResourceLoader for StaticResourceLoader {
  fn fetch(&self, identity: &ModuleIdentity) -> ModuleSourceFuture {
    *self
      .fetch_counts
      .borrow_mut()
      .entry(identity.clone())
      .or_default() += 1;
    let found = self.redirects.get(identity).unwrap_or(identity);
    let result = match self.sources.get(found) {
      Some(source) => {
        let source = ModuleSource::from_text(source.clone());
        Ok(if found != identity {
          source.with_found_identity(found.clone())
        } else {
          source
        })
      }
      None => Err(JsErrorBox::new(
        "NotFound",
        format!("Module not found \"{identity}\"."),
      )),
    };
    futures::future::ready(result).boxed_local()
  }
}
