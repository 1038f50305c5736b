// Copyright 2018-2025 the Deno authors. MIT license.

use std::cell::Cell;
use std::cell::RefCell;
use std::collections::HashSet;
use std::fmt;
use std::rc::Rc;

use deno_unsync::future::LocalFutureExt;
use deno_unsync::future::SharedLocal;
use futures::StreamExt;
use futures::future::FutureExt;
use futures::future::LocalBoxFuture;
use futures::stream::FuturesUnordered;

use super::FormatTag;
use super::ModuleNamespace;
use super::ModuleRecord;
use super::ModuleStatus;
use super::RequestedModuleType;
use super::evaluate_module;
use super::evaluator::FormatCapabilities;
use super::evaluator::parse_module;
use super::link_module;
use crate::errors::FetchError;
use crate::errors::ModuleError;
use crate::loader::LoaderState;
use crate::specifier::ModuleIdentity;

type LoadFuture = SharedLocal<LocalBoxFuture<'static, Result<(), ModuleError>>>;
type RunFuture =
  SharedLocal<LocalBoxFuture<'static, Result<Rc<ModuleNamespace>, ModuleError>>>;

/// Observable progress of a [`ModuleJob`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleJobState {
  NotStarted,
  /// Fetching, parsing or resolving dependencies.
  Loading,
  /// Loaded; the rest follows the record status.
  Module(ModuleStatus),
  /// Failed before a record could be created.
  Failed,
}

/// Loads, links and evaluates one `(identity, requested type)` entry of the
/// module map. All work is single-flight: awaiting a job many times runs it
/// once.
pub struct ModuleJob {
  identity: ModuleIdentity,
  requested_type: RequestedModuleType,
  format: FormatTag,
  record: RefCell<Option<Rc<ModuleRecord>>>,
  load_error: RefCell<Option<ModuleError>>,
  dependencies: RefCell<Vec<Rc<ModuleJob>>>,
  load: RefCell<Option<LoadFuture>>,
  run: RefCell<Option<RunFuture>>,
  loading: Cell<bool>,
  running: Cell<bool>,
}

impl ModuleJob {
  pub fn new(
    identity: ModuleIdentity,
    requested_type: RequestedModuleType,
    format: FormatTag,
  ) -> Rc<Self> {
    Rc::new(Self {
      identity,
      requested_type,
      format,
      record: Default::default(),
      load_error: Default::default(),
      dependencies: Default::default(),
      load: Default::default(),
      run: Default::default(),
      loading: Cell::new(false),
      running: Cell::new(false),
    })
  }

  pub fn identity(&self) -> &ModuleIdentity {
    &self.identity
  }

  pub fn requested_type(&self) -> &RequestedModuleType {
    &self.requested_type
  }

  pub fn format(&self) -> FormatTag {
    self.format
  }

  /// Identity the module was found at, which differs from
  /// [`ModuleJob::identity`] after a redirect.
  pub fn found_identity(&self) -> ModuleIdentity {
    match self.record() {
      Some(record) => record.identity().clone(),
      None => self.identity.clone(),
    }
  }

  pub fn record(&self) -> Option<Rc<ModuleRecord>> {
    self.record.borrow().clone()
  }

  pub fn dependencies(&self) -> Vec<Rc<ModuleJob>> {
    self.dependencies.borrow().clone()
  }

  pub fn state(&self) -> ModuleJobState {
    if let Some(record) = self.record() {
      return ModuleJobState::Module(record.status());
    }
    if self.load_error.borrow().is_some() {
      ModuleJobState::Failed
    } else if self.loading.get() {
      ModuleJobState::Loading
    } else {
      ModuleJobState::NotStarted
    }
  }

  /// Whether the job is loading, linking or evaluating right now.
  pub fn is_in_flight(&self) -> bool {
    if self.loading.get() || self.running.get() {
      return true;
    }
    matches!(
      self.state(),
      ModuleJobState::Module(
        ModuleStatus::Linking
          | ModuleStatus::Evaluating
          | ModuleStatus::EvaluatingAsync
      )
    )
  }

  fn key(&self) -> (ModuleIdentity, RequestedModuleType) {
    (self.identity.clone(), self.requested_type.clone())
  }

  /// Fetches and parses this module and resolves its requests to jobs.
  fn load(self: &Rc<Self>, state: &Rc<LoaderState>) -> LoadFuture {
    if let Some(load) = self.load.borrow().as_ref() {
      return load.clone();
    }
    self.loading.set(true);
    let job = self.clone();
    let state = state.clone();
    let load = async move {
      let result = job.load_inner(&state).await;
      job.loading.set(false);
      if let Err(err) = &result {
        *job.load_error.borrow_mut() = Some(err.clone());
      }
      result
    }
    .boxed_local()
    .shared_local();
    *self.load.borrow_mut() = Some(load.clone());
    load
  }

  async fn load_inner(
    self: &Rc<Self>,
    state: &Rc<LoaderState>,
  ) -> Result<(), ModuleError> {
    let mut identity = self.identity.clone();
    let source = if FormatCapabilities::of(self.format).fetches_source {
      log::debug!("Fetching '{}'", self.identity);
      let source = state
        .resource_loader
        .fetch(&self.identity)
        .await
        .map_err(|source| FetchError {
          identity: self.identity.clone(),
          source,
        })?;
      // a redirected module lives at the found URL, which is also the base
      // for its own imports
      if let Some(found) = &source.found_identity
        && found != &self.identity
      {
        state.map.alias(
          found.clone(),
          self.requested_type.clone(),
          self.clone(),
        );
        identity = found.clone();
      }
      Some(source)
    } else {
      None
    };

    let outcome = parse_module(
      state.evaluator.as_ref(),
      &state.builtins,
      &identity,
      self.format,
      source,
    )?;
    let record = state.graph.add(identity.clone(), self.format, outcome);
    *self.record.borrow_mut() = Some(record.clone());

    let mut dependencies = Vec::with_capacity(record.requests().len());
    for request in record.requests() {
      let resolved = match state.resolver.resolve_request(
        request,
        &identity,
        &state.conditions,
      ) {
        Ok(resolved) => resolved,
        Err(err) => {
          let err = ModuleError::from(err);
          record.set_errored(err.clone());
          return Err(err);
        }
      };
      let requested_type = request.requested_module_type();
      let dependency = state
        .map
        .get_or_create(resolved.identity.clone(), requested_type.clone(), || {
          ModuleJob::new(resolved.identity, requested_type, resolved.format)
        })
        .map_err(|err| {
          let err = ModuleError::from(err);
          record.set_errored(err.clone());
          err
        })?;
      dependencies.push(dependency);
    }
    *self.dependencies.borrow_mut() = dependencies;
    Ok(())
  }

  /// Loads every job reachable from this one, fetching siblings
  /// concurrently, then records which record satisfies each request.
  async fn load_graph(
    self: &Rc<Self>,
    state: &Rc<LoaderState>,
  ) -> Result<(), ModuleError> {
    let mut visited = HashSet::new();
    let mut loaded = Vec::new();
    let mut pending = FuturesUnordered::new();
    visited.insert(self.key());
    pending.push(load_job(self.clone(), state));

    while let Some((job, result)) = pending.next().await {
      if result.is_ok() {
        for dependency in job.dependencies() {
          if visited.insert(dependency.key()) {
            pending.push(load_job(dependency, state));
          }
        }
      }
      loaded.push(job);
    }

    for job in loaded {
      let Some(record) = job.record() else {
        continue;
      };
      if record.has_loaded_modules() || record.error().is_some() {
        continue;
      }
      let mut ids = Vec::with_capacity(record.requests().len());
      for dependency in job.dependencies() {
        match dependency.record() {
          Some(dependency_record) => ids.push(dependency_record.id()),
          None => {
            if let Some(err) = dependency.load_error.borrow().clone() {
              record.set_errored(err);
            }
            break;
          }
        }
      }
      if record.error().is_none() {
        record.set_loaded_modules(ids);
      }
    }

    match self.load_error.borrow().clone() {
      Some(err) => Err(err),
      None => Ok(()),
    }
  }

  /// Loads, links and evaluates the module, returning its namespace.
  ///
  /// The work is spawned on the current thread and finishes even if the
  /// returned future is dropped.
  pub(crate) fn run(
    self: &Rc<Self>,
    state: &Rc<LoaderState>,
  ) -> LocalBoxFuture<'static, Result<Rc<ModuleNamespace>, ModuleError>> {
    if let Some(run) = self.run.borrow().as_ref() {
      return run.clone().boxed_local();
    }
    self.running.set(true);
    let job = self.clone();
    let state = state.clone();
    let run = async move {
      let result = job.run_inner(&state).await;
      job.running.set(false);
      result
    }
    .boxed_local()
    .shared_local();
    *self.run.borrow_mut() = Some(run.clone());

    let driver = run.clone();
    deno_unsync::spawn(async move {
      let _ = driver.await;
    });
    run.boxed_local()
  }

  async fn run_inner(
    self: &Rc<Self>,
    state: &Rc<LoaderState>,
  ) -> Result<Rc<ModuleNamespace>, ModuleError> {
    self.load_graph(state).await?;
    let Some(record) = self.record() else {
      // load_graph reports a load error for jobs without a record
      return Err(self.load_error.borrow().clone().unwrap_or_else(|| {
        ModuleError::from(FetchError {
          identity: self.identity.clone(),
          source: deno_error::JsErrorBox::generic("Module was not loaded"),
        })
      }));
    };
    link_module(&state.graph, record.id(), state.ambiguous_star_exports)?;
    evaluate_module(&state.graph, &state.evaluator, record.id()).await?;
    Ok(record.namespace())
  }
}

fn load_job(
  job: Rc<ModuleJob>,
  state: &Rc<LoaderState>,
) -> LocalBoxFuture<'static, (Rc<ModuleJob>, Result<(), ModuleError>)> {
  let load = job.load(state);
  async move {
    let result = load.await;
    (job, result)
  }
  .boxed_local()
}

impl fmt::Debug for ModuleJob {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ModuleJob")
      .field("identity", &self.identity)
      .field("requested_type", &self.requested_type)
      .field("format", &self.format)
      .field("state", &self.state())
      .finish()
  }
}
