// Copyright 2018-2025 the Deno authors. MIT license.

use std::rc::Rc;

use indexmap::IndexMap;

use crate::modules::ModuleValue;

/// A host provided module reachable as `node:<name>`.
#[derive(Debug)]
pub struct BuiltinModule {
  pub name: String,
  pub exports: IndexMap<String, ModuleValue>,
}

/// Registry of builtin modules, fixed when the loader is created.
#[derive(Debug, Default)]
pub struct BuiltinModules {
  modules: IndexMap<String, Rc<BuiltinModule>>,
}

impl BuiltinModules {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(
    &mut self,
    name: impl Into<String>,
    exports: impl IntoIterator<Item = (String, ModuleValue)>,
  ) -> &mut Self {
    let name = name.into();
    let module = BuiltinModule {
      name: name.clone(),
      exports: exports.into_iter().collect(),
    };
    self.modules.insert(name, Rc::new(module));
    self
  }

  pub fn contains(&self, name: &str) -> bool {
    self.modules.contains_key(name)
  }

  pub fn get(&self, name: &str) -> Option<&Rc<BuiltinModule>> {
    self.modules.get(name)
  }

  pub fn names(&self) -> impl Iterator<Item = &str> {
    self.modules.keys().map(|k| k.as_str())
  }
}
