// Copyright 2018-2025 the Deno authors. MIT license.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;

use deno_error::JsErrorBox;
use deno_unsync::future::LocalFutureExt;
use deno_unsync::future::SharedLocal;
use futures::channel::oneshot;
use futures::future::FutureExt;
use futures::future::LocalBoxFuture;
use indexmap::IndexMap;

use super::FormatTag;
use super::ImportName;
use super::IndirectExportEntry;
use super::ModuleId;
use super::ModuleRequest;
use super::ModuleShell;
use super::ModuleValue;
use super::evaluator::ModuleBody;
use super::evaluator::ParsedModule;
use crate::errors::EvaluationError;
use crate::errors::LinkError;
use crate::errors::ModuleError;
use crate::specifier::ModuleIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleStatus {
  Unlinked,
  Linking,
  Linked,
  Evaluating,
  EvaluatingAsync,
  Evaluated,
  Errored,
}

/// A binding resolved by the linker. Reads go through to the exporting
/// module's environment, so every read observes the current value.
#[derive(Clone)]
pub(crate) enum Binding {
  Local {
    env: Rc<ModuleEnvironment>,
    name: String,
  },
  Namespace(Rc<ModuleNamespace>),
}

impl Binding {
  fn read(&self) -> Result<ModuleValue, JsErrorBox> {
    match self {
      Binding::Local { env, name } => env.get(name),
      Binding::Namespace(namespace) => {
        Ok(ModuleValue::Namespace(namespace.clone()))
      }
    }
  }
}

/// Storage for a module's own bindings plus the import bindings the
/// linker installed.
pub struct ModuleEnvironment {
  identity: ModuleIdentity,
  locals: IndexMap<String, usize>,
  slots: RefCell<Vec<Option<ModuleValue>>>,
  imports: RefCell<HashMap<String, Binding>>,
}

impl ModuleEnvironment {
  fn new(identity: ModuleIdentity, local_names: Vec<String>) -> Self {
    let mut locals = IndexMap::with_capacity(local_names.len());
    for name in local_names {
      let slot = locals.len();
      locals.entry(name).or_insert(slot);
    }
    let slots = vec![None; locals.len()];
    Self {
      identity,
      locals,
      slots: RefCell::new(slots),
      imports: Default::default(),
    }
  }

  pub fn identity(&self) -> &ModuleIdentity {
    &self.identity
  }

  pub(crate) fn get(&self, name: &str) -> Result<ModuleValue, JsErrorBox> {
    if let Some(slot) = self.locals.get(name) {
      return match &self.slots.borrow()[*slot] {
        Some(value) => Ok(value.clone()),
        None => Err(JsErrorBox::from_err(LinkError::BindingNotInitialized {
          module: self.identity.clone(),
          name: name.to_string(),
        })),
      };
    }
    let binding = self.imports.borrow().get(name).cloned();
    match binding {
      Some(binding) => binding.read(),
      None => Err(JsErrorBox::new(
        "ReferenceError",
        format!("{name} is not defined"),
      )),
    }
  }

  fn set(&self, name: &str, value: ModuleValue) -> Result<(), JsErrorBox> {
    if let Some(slot) = self.locals.get(name) {
      self.slots.borrow_mut()[*slot] = Some(value);
      return Ok(());
    }
    if self.imports.borrow().contains_key(name) {
      return Err(JsErrorBox::type_error(format!(
        "Assignment to constant variable '{name}'."
      )));
    }
    Err(JsErrorBox::new(
      "ReferenceError",
      format!("{name} is not defined"),
    ))
  }

  pub(crate) fn bind_import(&self, local_name: String, binding: Binding) {
    self.imports.borrow_mut().insert(local_name, binding);
  }
}

impl fmt::Debug for ModuleEnvironment {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ModuleEnvironment")
      .field("identity", &self.identity)
      .field("locals", &self.locals.keys().collect::<Vec<_>>())
      .finish_non_exhaustive()
  }
}

/// The view of a module environment handed to the [`super::Evaluator`]
/// while the module body runs.
#[derive(Clone)]
pub struct ModuleScope {
  env: Rc<ModuleEnvironment>,
}

impl ModuleScope {
  pub(crate) fn new(env: Rc<ModuleEnvironment>) -> Self {
    Self { env }
  }

  pub fn identity(&self) -> &ModuleIdentity {
    self.env.identity()
  }

  /// Reads a local or imported binding.
  pub fn get(&self, name: &str) -> Result<ModuleValue, JsErrorBox> {
    self.env.get(name)
  }

  /// Writes a local binding. Import bindings are read-only.
  pub fn set(
    &self,
    name: &str,
    value: impl Into<ModuleValue>,
  ) -> Result<(), JsErrorBox> {
    self.env.set(name, value.into())
  }

  pub fn has_binding(&self, name: &str) -> bool {
    self.env.locals.contains_key(name)
      || self.env.imports.borrow().contains_key(name)
  }
}

/// Exported names of a module mapped to their live bindings.
///
/// One instance exists per record. It is filled by the linker the first
/// time the namespace is requested and is read-only afterwards.
pub struct ModuleNamespace {
  identity: ModuleIdentity,
  exports: RefCell<BTreeMap<String, Binding>>,
  populated: Cell<bool>,
}

impl ModuleNamespace {
  fn new(identity: ModuleIdentity) -> Self {
    Self {
      identity,
      exports: Default::default(),
      populated: Cell::new(false),
    }
  }

  pub fn identity(&self) -> &ModuleIdentity {
    &self.identity
  }

  /// Current value of an export, `Ok(None)` when the name is not exported.
  pub fn get(&self, name: &str) -> Result<Option<ModuleValue>, JsErrorBox> {
    let binding = self.exports.borrow().get(name).cloned();
    binding.map(|binding| binding.read()).transpose()
  }

  pub fn has(&self, name: &str) -> bool {
    self.exports.borrow().contains_key(name)
  }

  /// Export names in code unit order.
  pub fn names(&self) -> Vec<String> {
    self.exports.borrow().keys().cloned().collect()
  }

  pub(crate) fn is_populated(&self) -> bool {
    self.populated.get()
  }

  pub(crate) fn populate(&self, exports: BTreeMap<String, Binding>) {
    *self.exports.borrow_mut() = exports;
    self.populated.set(true);
  }
}

impl fmt::Debug for ModuleNamespace {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ModuleNamespace")
      .field("identity", &self.identity)
      .field("names", &self.names())
      .finish()
  }
}

pub(crate) type CapabilityFuture =
  SharedLocal<LocalBoxFuture<'static, Result<(), ModuleError>>>;

/// Settles once the evaluation started from a cycle root finishes,
/// including asynchronous dependencies.
pub(crate) struct TopLevelCapability {
  sender: Option<oneshot::Sender<Result<(), ModuleError>>>,
  promise: CapabilityFuture,
}

impl TopLevelCapability {
  pub fn new(identity: ModuleIdentity) -> Self {
    let (sender, receiver) = oneshot::channel();
    let promise = async move {
      match receiver.await {
        Ok(result) => result,
        Err(_) => Err(ModuleError::from(EvaluationError {
          identity,
          source: JsErrorBox::generic("Module evaluation was abandoned"),
        })),
      }
    }
    .boxed_local()
    .shared_local();
    Self {
      sender: Some(sender),
      promise,
    }
  }

  pub fn promise(&self) -> CapabilityFuture {
    self.promise.clone()
  }

  pub fn settle(&mut self, result: Result<(), ModuleError>) {
    if let Some(sender) = self.sender.take() {
      let _ = sender.send(result);
    }
  }
}

/// Mutable part of a record, driven by the link and evaluation algorithms.
pub(crate) struct RecordState {
  pub status: ModuleStatus,
  pub error: Option<ModuleError>,
  /// Ids of the records satisfying each request, in request order.
  pub loaded_modules: Option<Vec<ModuleId>>,
  pub dfs_index: usize,
  pub dfs_ancestor_index: usize,
  pub cycle_root: Option<ModuleId>,
  pub async_evaluation: bool,
  pub async_evaluation_order: usize,
  pub pending_async_dependencies: usize,
  pub async_parent_modules: Vec<ModuleId>,
  pub top_level_capability: Option<TopLevelCapability>,
}

/// A parsed module in the graph arena.
pub struct ModuleRecord {
  id: ModuleId,
  parsed: ParsedModule,
  body: ModuleBody,
  environment: Rc<ModuleEnvironment>,
  namespace: Rc<ModuleNamespace>,
  pub(crate) state: RefCell<RecordState>,
}

impl ModuleRecord {
  pub(crate) fn new(
    id: ModuleId,
    identity: ModuleIdentity,
    format: FormatTag,
    shell: ModuleShell,
    body: ModuleBody,
    source: Option<super::ModuleSource>,
  ) -> Self {
    let shell = normalize_exports(shell);
    let mut local_names = shell.locals.clone();
    local_names
      .extend(shell.local_exports.iter().map(|e| e.local_name.clone()));
    local_names.retain(|name| {
      !shell.imports.iter().any(|import| &import.local_name == name)
    });
    let environment =
      Rc::new(ModuleEnvironment::new(identity.clone(), local_names));
    let namespace = Rc::new(ModuleNamespace::new(identity.clone()));
    Self {
      id,
      parsed: ParsedModule {
        identity,
        format,
        shell,
        source,
      },
      body,
      environment,
      namespace,
      state: RefCell::new(RecordState {
        status: ModuleStatus::Unlinked,
        error: None,
        loaded_modules: None,
        dfs_index: 0,
        dfs_ancestor_index: 0,
        cycle_root: None,
        async_evaluation: false,
        async_evaluation_order: 0,
        pending_async_dependencies: 0,
        async_parent_modules: Vec::new(),
        top_level_capability: None,
      }),
    }
  }

  pub fn id(&self) -> ModuleId {
    self.id
  }

  pub fn identity(&self) -> &ModuleIdentity {
    &self.parsed.identity
  }

  pub fn format(&self) -> FormatTag {
    self.parsed.format
  }

  pub fn requests(&self) -> &[ModuleRequest] {
    &self.parsed.shell.requests
  }

  pub fn shell(&self) -> &ModuleShell {
    &self.parsed.shell
  }

  pub fn has_top_level_await(&self) -> bool {
    self.parsed.shell.has_top_level_await
  }

  pub fn status(&self) -> ModuleStatus {
    self.state.borrow().status
  }

  /// The error this record failed with. Every observer gets the same
  /// instance.
  pub fn error(&self) -> Option<ModuleError> {
    self.state.borrow().error.clone()
  }

  pub fn environment(&self) -> &Rc<ModuleEnvironment> {
    &self.environment
  }

  /// The namespace object. It is empty until the linker fills it.
  pub fn namespace(&self) -> Rc<ModuleNamespace> {
    self.namespace.clone()
  }

  pub(crate) fn parsed(&self) -> &ParsedModule {
    &self.parsed
  }

  pub(crate) fn body(&self) -> &ModuleBody {
    &self.body
  }

  pub(crate) fn loaded_modules(&self) -> Vec<ModuleId> {
    self.state.borrow().loaded_modules.clone().unwrap_or_default()
  }

  pub(crate) fn has_loaded_modules(&self) -> bool {
    self.state.borrow().loaded_modules.is_some()
  }

  pub(crate) fn set_loaded_modules(&self, ids: Vec<ModuleId>) {
    self.state.borrow_mut().loaded_modules = Some(ids);
  }

  pub(crate) fn set_status(&self, status: ModuleStatus) {
    self.state.borrow_mut().status = status;
  }

  /// Moves the record to `Errored`. The first error wins.
  pub(crate) fn set_errored(&self, error: ModuleError) {
    let mut state = self.state.borrow_mut();
    state.status = ModuleStatus::Errored;
    if state.error.is_none() {
      state.error = Some(error);
    }
  }

  pub(crate) fn scope(&self) -> ModuleScope {
    ModuleScope::new(self.environment.clone())
  }

  pub(crate) fn initialize_binding(
    &self,
    name: &str,
    value: ModuleValue,
  ) -> Result<(), JsErrorBox> {
    self.environment.set(name, value)
  }
}

impl fmt::Debug for ModuleRecord {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ModuleRecord")
      .field("id", &self.id)
      .field("identity", self.identity())
      .field("format", &self.format())
      .field("status", &self.status())
      .finish_non_exhaustive()
  }
}

/// Re-exports of imported bindings (`import { a } from "x"; export { a }`)
/// become indirect exports so export resolution can follow them without
/// touching the environment.
fn normalize_exports(mut shell: ModuleShell) -> ModuleShell {
  let local_exports = std::mem::take(&mut shell.local_exports);
  for export in local_exports {
    let import = shell
      .imports
      .iter()
      .find(|import| import.local_name == export.local_name);
    match import {
      Some(import) if import.import_name != ImportName::Namespace => {
        shell.indirect_exports.push(IndirectExportEntry {
          export_name: export.export_name,
          request: import.request,
          import_name: import.import_name.clone(),
        });
      }
      _ => shell.local_exports.push(export),
    }
  }
  shell
}
