// Copyright 2018-2025 the Deno authors. MIT license.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::HashSet;
use std::rc::Rc;

use super::ImportName;
use super::ModuleGraph;
use super::ModuleId;
use super::ModuleNamespace;
use super::ModuleStatus;
use super::evaluator::FormatCapabilities;
use super::record::Binding;
use crate::errors::FetchError;
use crate::errors::LinkError;
use crate::errors::ModuleError;
use crate::options::AmbiguousStarExportPolicy;

/// Name a resolved export is bound to inside its module.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BindingName {
  Local(String),
  Namespace,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum ExportResolution {
  Resolved {
    module: ModuleId,
    binding_name: BindingName,
  },
  NotFound,
  /// The lookup came back to a `(module, name)` pair already being
  /// resolved.
  Circular,
  Ambiguous,
}

struct Linker<'a> {
  graph: &'a ModuleGraph,
  policy: AmbiguousStarExportPolicy,
  root: ModuleId,
  /// Strongly connected component of `root` once it is linked.
  root_component: RefCell<Vec<ModuleId>>,
  /// Namespaces being filled; `export * as ns` may refer back to them.
  populating: RefCell<HashSet<ModuleId>>,
}

/// Links the graph reachable from `root`.
///
/// On failure every record that was being linked moves to `Errored` with
/// the same error; a failure to create the root namespace errors the
/// root's whole cycle. Records that are already linked are left alone, so
/// this is a no-op when called again for a linked graph.
pub(crate) fn link_module(
  graph: &ModuleGraph,
  root: ModuleId,
  policy: AmbiguousStarExportPolicy,
) -> Result<(), ModuleError> {
  let linker = Linker {
    graph,
    policy,
    root,
    root_component: Default::default(),
    populating: Default::default(),
  };
  let record = graph.record(root);
  if let Some(err) = record.error() {
    return Err(err);
  }

  let mut stack = Vec::new();
  if let Err(err) = linker.inner_module_linking(root, &mut stack, 0) {
    for id in stack {
      linker.graph.record(id).set_errored(err.clone());
    }
    return Err(err);
  }

  // the namespace handed out by `import()`
  if let Err(err) = linker.get_module_namespace(root, root) {
    record.set_errored(err.clone());
    for id in linker.root_component.take() {
      graph.record(id).set_errored(err.clone());
    }
    return Err(err);
  }
  Ok(())
}

impl Linker<'_> {
  fn inner_module_linking(
    &self,
    id: ModuleId,
    stack: &mut Vec<ModuleId>,
    mut index: usize,
  ) -> Result<usize, ModuleError> {
    let record = self.graph.record(id);
    if let Some(err) = record.error() {
      return Err(err);
    }
    if record.status() != ModuleStatus::Unlinked {
      return Ok(index);
    }

    {
      let mut state = record.state.borrow_mut();
      state.status = ModuleStatus::Linking;
      state.dfs_index = index;
      state.dfs_ancestor_index = index;
    }
    index += 1;
    stack.push(id);

    for required_id in record.loaded_modules() {
      index = self.inner_module_linking(required_id, stack, index)?;
      let (required_status, required_ancestor_index) = {
        let required = self.graph.record(required_id);
        let state = required.state.borrow();
        (state.status, state.dfs_ancestor_index)
      };
      if required_status == ModuleStatus::Linking {
        let mut state = record.state.borrow_mut();
        state.dfs_ancestor_index =
          state.dfs_ancestor_index.min(required_ancestor_index);
      }
    }

    self.initialize_environment(id)?;

    let (dfs_index, dfs_ancestor_index) = {
      let state = record.state.borrow();
      (state.dfs_index, state.dfs_ancestor_index)
    };
    if dfs_index == dfs_ancestor_index {
      let mut component = Vec::new();
      while let Some(member) = stack.pop() {
        self.graph.record(member).set_status(ModuleStatus::Linked);
        component.push(member);
        if member == id {
          break;
        }
      }
      if id == self.root {
        *self.root_component.borrow_mut() = component;
      }
      log::debug!("Linked '{}'", record.identity());
    }
    Ok(index)
  }

  fn initialize_environment(&self, id: ModuleId) -> Result<(), ModuleError> {
    let record = self.graph.record(id);
    let shell = record.shell();

    for export in &shell.indirect_exports {
      let ImportName::Named(import_name) = &export.import_name else {
        continue;
      };
      let exporter = self.requested_module(id, export.request)?;
      let resolution =
        self.resolve_export(exporter, import_name, &mut Vec::new())?;
      if !matches!(resolution, ExportResolution::Resolved { .. }) {
        return Err(
          self
            .resolution_error(id, exporter, import_name, resolution)
            .into(),
        );
      }
    }

    for import in &shell.imports {
      let exporter = self.requested_module(id, import.request)?;
      let binding = match &import.import_name {
        ImportName::Namespace => {
          Binding::Namespace(self.get_module_namespace(exporter, id)?)
        }
        ImportName::Named(name) => {
          match self.resolve_export(exporter, name, &mut Vec::new())? {
            ExportResolution::Resolved {
              module,
              binding_name: BindingName::Namespace,
            } => Binding::Namespace(self.get_module_namespace(module, id)?),
            ExportResolution::Resolved {
              module,
              binding_name: BindingName::Local(local),
            } => Binding::Local {
              env: self.graph.record(module).environment().clone(),
              name: local,
            },
            resolution => {
              return Err(
                self.resolution_error(id, exporter, name, resolution).into(),
              );
            }
          }
        }
      };
      record
        .environment()
        .bind_import(import.local_name.clone(), binding);
    }
    Ok(())
  }

  /// Record satisfying request `index` of `id`. Fails with the stored
  /// error of a record that never got its dependencies.
  fn requested_module(
    &self,
    id: ModuleId,
    index: usize,
  ) -> Result<ModuleId, ModuleError> {
    let record = self.graph.record(id);
    if let Some(err) = record.error() {
      return Err(err);
    }
    record.loaded_modules().get(index).copied().ok_or_else(|| {
      ModuleError::from(FetchError {
        identity: record.identity().clone(),
        source: deno_error::JsErrorBox::generic(
          "Module dependencies were not loaded",
        ),
      })
    })
  }

  fn resolution_error(
    &self,
    importer: ModuleId,
    exporter: ModuleId,
    name: &str,
    resolution: ExportResolution,
  ) -> LinkError {
    let importer = self.graph.record(importer).identity().clone();
    let exporter_record = self.graph.record(exporter);
    let exporter = exporter_record.identity().clone();
    let name = name.to_string();
    match resolution {
      ExportResolution::Circular => LinkError::CircularReexport {
        importer,
        exporter,
        name,
      },
      ExportResolution::Ambiguous => LinkError::AmbiguousStarExport {
        importer,
        exporter,
        name,
      },
      ExportResolution::NotFound | ExportResolution::Resolved { .. } => {
        let format = exporter_record.format();
        if !FormatCapabilities::of(format).named_exports && name != "default"
        {
          LinkError::FormatMismatch {
            importer,
            exporter,
            format,
            name,
          }
        } else {
          LinkError::UnresolvableExport {
            importer,
            exporter,
            name,
          }
        }
      }
    }
  }

  fn resolve_export(
    &self,
    id: ModuleId,
    export_name: &str,
    resolve_set: &mut Vec<(ModuleId, String)>,
  ) -> Result<ExportResolution, ModuleError> {
    if resolve_set
      .iter()
      .any(|(module, name)| *module == id && name == export_name)
    {
      return Ok(ExportResolution::Circular);
    }
    resolve_set.push((id, export_name.to_string()));

    let record = self.graph.record(id);
    if let Some(err) = record.error() {
      return Err(err);
    }
    let shell = record.shell();
    if let Some(export) = shell
      .local_exports
      .iter()
      .find(|e| e.export_name == export_name)
    {
      return Ok(ExportResolution::Resolved {
        module: id,
        binding_name: BindingName::Local(export.local_name.clone()),
      });
    }

    if let Some(export) = shell
      .indirect_exports
      .iter()
      .find(|e| e.export_name == export_name)
    {
      let imported = self.requested_module(id, export.request)?;
      return match &export.import_name {
        ImportName::Namespace => Ok(ExportResolution::Resolved {
          module: imported,
          binding_name: BindingName::Namespace,
        }),
        ImportName::Named(name) => {
          self.resolve_export(imported, name, resolve_set)
        }
      };
    }

    if export_name == "default" {
      return Ok(ExportResolution::NotFound);
    }

    let mut star_resolution = None;
    for request in &shell.star_exports {
      let imported = self.requested_module(id, *request)?;
      match self.resolve_export(imported, export_name, resolve_set)? {
        ExportResolution::Ambiguous => return Ok(ExportResolution::Ambiguous),
        ExportResolution::NotFound | ExportResolution::Circular => {}
        resolution @ ExportResolution::Resolved { .. } => {
          match &star_resolution {
            None => star_resolution = Some(resolution),
            Some(existing) if *existing != resolution => {
              return Ok(ExportResolution::Ambiguous);
            }
            Some(_) => {}
          }
        }
      }
    }
    Ok(star_resolution.unwrap_or(ExportResolution::NotFound))
  }

  fn get_exported_names(
    &self,
    id: ModuleId,
    export_star_set: &mut HashSet<ModuleId>,
  ) -> Result<Vec<String>, ModuleError> {
    if !export_star_set.insert(id) {
      // circular `export *`
      return Ok(Vec::new());
    }
    let record = self.graph.record(id);
    if let Some(err) = record.error() {
      return Err(err);
    }
    let shell = record.shell();
    let mut names = shell
      .local_exports
      .iter()
      .map(|e| e.export_name.clone())
      .chain(shell.indirect_exports.iter().map(|e| e.export_name.clone()))
      .collect::<Vec<_>>();
    for request in &shell.star_exports {
      let star_module = self.requested_module(id, *request)?;
      for name in self.get_exported_names(star_module, export_star_set)? {
        if name != "default" && !names.contains(&name) {
          names.push(name);
        }
      }
    }
    Ok(names)
  }

  /// Returns the namespace of `id`, filling it on first use.
  fn get_module_namespace(
    &self,
    id: ModuleId,
    requester: ModuleId,
  ) -> Result<Rc<ModuleNamespace>, ModuleError> {
    let record = self.graph.record(id);
    if let Some(err) = record.error() {
      return Err(err);
    }
    let namespace = record.namespace();
    if namespace.is_populated() || !self.populating.borrow_mut().insert(id) {
      return Ok(namespace);
    }
    let result = self.populate_namespace(id, requester, &namespace);
    self.populating.borrow_mut().remove(&id);
    result.map(|_| namespace)
  }

  fn populate_namespace(
    &self,
    id: ModuleId,
    requester: ModuleId,
    namespace: &ModuleNamespace,
  ) -> Result<(), ModuleError> {
    let record = self.graph.record(id);

    let names = self.get_exported_names(id, &mut HashSet::new())?;
    let mut exports = BTreeMap::new();
    for name in names {
      match self.resolve_export(id, &name, &mut Vec::new())? {
        ExportResolution::Resolved {
          module,
          binding_name,
        } => {
          let binding = match binding_name {
            BindingName::Local(local) => Binding::Local {
              env: self.graph.record(module).environment().clone(),
              name: local,
            },
            BindingName::Namespace => {
              Binding::Namespace(self.get_module_namespace(module, requester)?)
            }
          };
          exports.insert(name, binding);
        }
        ExportResolution::Ambiguous => match self.policy {
          AmbiguousStarExportPolicy::Error => {
            return Err(
              LinkError::AmbiguousStarExport {
                importer: self.graph.record(requester).identity().clone(),
                exporter: record.identity().clone(),
                name,
              }
              .into(),
            );
          }
          AmbiguousStarExportPolicy::Omit => {
            log::debug!(
              "Omitting ambiguous star export '{}' from the namespace of '{}'",
              name,
              record.identity()
            );
          }
        },
        ExportResolution::NotFound | ExportResolution::Circular => {}
      }
    }
    namespace.populate(exports);
    Ok(())
  }
}
