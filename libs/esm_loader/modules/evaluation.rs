// Copyright 2018-2025 the Deno authors. MIT license.

use std::rc::Rc;

use deno_error::JsErrorBox;
use futures::future::FutureExt;
use futures::future::LocalBoxFuture;

use super::EvaluationHandle;
use super::Evaluator;
use super::ModuleGraph;
use super::ModuleId;
use super::ModuleStatus;
use super::evaluator::ModuleBody;
use super::record::TopLevelCapability;
use crate::errors::EvaluationError;
use crate::errors::ModuleError;

/// Shared by the evaluation of a graph and the tasks completing its
/// asynchronous modules.
#[derive(Clone)]
struct Evaluation {
  graph: Rc<ModuleGraph>,
  evaluator: Rc<dyn Evaluator>,
}

/// Evaluates the linked graph rooted at `id`.
///
/// Every record body runs at most once. The returned future settles when
/// the root's cycle and all of its asynchronous dependencies have finished.
pub(crate) fn evaluate_module(
  graph: &Rc<ModuleGraph>,
  evaluator: &Rc<dyn Evaluator>,
  id: ModuleId,
) -> LocalBoxFuture<'static, Result<(), ModuleError>> {
  let evaluation = Evaluation {
    graph: graph.clone(),
    evaluator: evaluator.clone(),
  };
  evaluation.evaluate(id)
}

impl Evaluation {
  fn evaluate(
    &self,
    id: ModuleId,
  ) -> LocalBoxFuture<'static, Result<(), ModuleError>> {
    let mut record = self.graph.record(id);
    if let Some(err) = record.error() {
      return futures::future::ready(Err(err)).boxed_local();
    }
    let cycle_root = record.state.borrow().cycle_root;
    if matches!(
      record.status(),
      ModuleStatus::EvaluatingAsync | ModuleStatus::Evaluated
    ) && let Some(cycle_root) = cycle_root
    {
      record = self.graph.record(cycle_root);
    }
    if let Some(err) = record.error() {
      return futures::future::ready(Err(err)).boxed_local();
    }
    let existing = record
      .state
      .borrow()
      .top_level_capability
      .as_ref()
      .map(|capability| capability.promise());
    if let Some(promise) = existing {
      return promise.boxed_local();
    }

    let root = record.id();
    let capability = TopLevelCapability::new(record.identity().clone());
    let promise = capability.promise();
    record.state.borrow_mut().top_level_capability = Some(capability);

    let mut stack = Vec::new();
    match self.inner_module_evaluation(root, &mut stack, 0) {
      Ok(_) => {
        let state = record.state.borrow();
        debug_assert!(matches!(
          state.status,
          ModuleStatus::EvaluatingAsync | ModuleStatus::Evaluated
        ));
        let settled = !state.async_evaluation;
        drop(state);
        if settled {
          self.settle_capability(root, Ok(()));
        }
      }
      Err(err) => {
        for member in stack {
          self.graph.record(member).set_errored(err.clone());
        }
        self.settle_capability(root, Err(err));
      }
    }
    promise.boxed_local()
  }

  fn inner_module_evaluation(
    &self,
    id: ModuleId,
    stack: &mut Vec<ModuleId>,
    mut index: usize,
  ) -> Result<usize, ModuleError> {
    let record = self.graph.record(id);
    if let Some(err) = record.error() {
      return Err(err);
    }
    match record.status() {
      ModuleStatus::EvaluatingAsync
      | ModuleStatus::Evaluated
      | ModuleStatus::Evaluating => return Ok(index),
      _ => {}
    }
    debug_assert_eq!(record.status(), ModuleStatus::Linked);

    {
      let mut state = record.state.borrow_mut();
      state.status = ModuleStatus::Evaluating;
      state.dfs_index = index;
      state.dfs_ancestor_index = index;
      state.pending_async_dependencies = 0;
    }
    index += 1;
    stack.push(id);

    for required_id in record.loaded_modules() {
      index = self.inner_module_evaluation(required_id, stack, index)?;
      let mut required = self.graph.record(required_id);
      if required.status() == ModuleStatus::Evaluating {
        let required_ancestor_index =
          required.state.borrow().dfs_ancestor_index;
        let mut state = record.state.borrow_mut();
        state.dfs_ancestor_index =
          state.dfs_ancestor_index.min(required_ancestor_index);
      } else {
        let cycle_root = required.state.borrow().cycle_root;
        if let Some(cycle_root) = cycle_root {
          required = self.graph.record(cycle_root);
        }
        if let Some(err) = required.error() {
          return Err(err);
        }
      }
      if required.state.borrow().async_evaluation {
        record.state.borrow_mut().pending_async_dependencies += 1;
        required
          .state
          .borrow_mut()
          .async_parent_modules
          .push(id);
      }
    }

    let pending = record.state.borrow().pending_async_dependencies;
    if pending > 0 || record.has_top_level_await() {
      {
        let mut state = record.state.borrow_mut();
        state.async_evaluation = true;
        state.async_evaluation_order =
          self.graph.next_async_evaluation_order();
      }
      if pending == 0 {
        self.execute_async_module(id);
      }
    } else {
      self.execute_module(id)?;
    }

    let (dfs_index, dfs_ancestor_index) = {
      let state = record.state.borrow();
      (state.dfs_index, state.dfs_ancestor_index)
    };
    if dfs_index == dfs_ancestor_index {
      while let Some(member) = stack.pop() {
        let member_record = self.graph.record(member);
        {
          let mut state = member_record.state.borrow_mut();
          state.status = if state.async_evaluation {
            ModuleStatus::EvaluatingAsync
          } else {
            ModuleStatus::Evaluated
          };
          state.cycle_root = Some(id);
        }
        if member == id {
          break;
        }
      }
    }
    Ok(index)
  }

  /// Runs a body that must complete synchronously.
  fn execute_module(&self, id: ModuleId) -> Result<(), ModuleError> {
    let record = self.graph.record(id);
    log::debug!("Evaluating '{}'", record.identity());
    let evaluation_error = |source: JsErrorBox| {
      ModuleError::from(EvaluationError {
        identity: record.identity().clone(),
        source,
      })
    };
    match self.run_body(id).map_err(evaluation_error)? {
      EvaluationHandle::Completed => Ok(()),
      EvaluationHandle::Pending(_) => Err(evaluation_error(
        JsErrorBox::generic(
          "Module without top-level await did not complete synchronously",
        ),
      )),
    }
  }

  fn run_body(&self, id: ModuleId) -> Result<EvaluationHandle, JsErrorBox> {
    let record = self.graph.record(id);
    match record.body() {
      ModuleBody::Synthetic(exports) => {
        for (name, value) in exports {
          record.initialize_binding(name, value.clone())?;
        }
        Ok(EvaluationHandle::Completed)
      }
      ModuleBody::Evaluator => {
        self.evaluator.evaluate(record.parsed(), record.scope())
      }
    }
  }

  /// Starts a body that may suspend. Its outcome is always delivered from
  /// a separate task, never synchronously.
  fn execute_async_module(&self, id: ModuleId) {
    let record = self.graph.record(id);
    log::debug!("Evaluating '{}' asynchronously", record.identity());
    let handle = self.run_body(id);
    let this = self.clone();
    deno_unsync::spawn(async move {
      let result = match handle {
        Ok(EvaluationHandle::Completed) => Ok(()),
        Ok(EvaluationHandle::Pending(future)) => future.await,
        Err(err) => Err(err),
      };
      match result {
        Ok(()) => this.async_module_execution_fulfilled(id),
        Err(source) => {
          let identity = this.graph.record(id).identity().clone();
          let err = ModuleError::from(EvaluationError { identity, source });
          this.async_module_execution_rejected(id, err);
        }
      }
    });
  }

  fn gather_available_ancestors(
    &self,
    id: ModuleId,
    exec_list: &mut Vec<ModuleId>,
  ) {
    let parents = {
      let record = self.graph.record(id);
      let state = record.state.borrow();
      state.async_parent_modules.clone()
    };
    for parent_id in parents {
      if exec_list.contains(&parent_id) {
        continue;
      }
      let parent = self.graph.record(parent_id);
      let cycle_root = parent.state.borrow().cycle_root;
      let cycle_root_errored = cycle_root
        .map(|root| self.graph.record(root).error().is_some())
        .unwrap_or(false);
      if cycle_root_errored || parent.error().is_some() {
        continue;
      }
      let pending = {
        let mut state = parent.state.borrow_mut();
        state.pending_async_dependencies =
          state.pending_async_dependencies.saturating_sub(1);
        state.pending_async_dependencies
      };
      if pending == 0 {
        exec_list.push(parent_id);
        if !parent.has_top_level_await() {
          self.gather_available_ancestors(parent_id, exec_list);
        }
      }
    }
  }

  fn async_module_execution_fulfilled(&self, id: ModuleId) {
    let record = self.graph.record(id);
    if record.status() == ModuleStatus::Errored {
      return;
    }
    debug_assert_eq!(record.status(), ModuleStatus::EvaluatingAsync);
    {
      let mut state = record.state.borrow_mut();
      state.async_evaluation = false;
      state.status = ModuleStatus::Evaluated;
    }
    log::debug!("Evaluated '{}'", record.identity());
    self.settle_capability(id, Ok(()));

    let mut exec_list = Vec::new();
    self.gather_available_ancestors(id, &mut exec_list);
    exec_list.sort_by_key(|member| {
      self.graph.record(*member).state.borrow().async_evaluation_order
    });

    for member in exec_list {
      let member_record = self.graph.record(member);
      if member_record.status() == ModuleStatus::Errored {
        continue;
      }
      if member_record.has_top_level_await() {
        self.execute_async_module(member);
        continue;
      }
      match self.execute_module(member) {
        Ok(()) => {
          {
            let mut state = member_record.state.borrow_mut();
            state.async_evaluation = false;
            state.status = ModuleStatus::Evaluated;
          }
          self.settle_capability(member, Ok(()));
        }
        Err(err) => self.async_module_execution_rejected(member, err),
      }
    }
  }

  fn async_module_execution_rejected(&self, id: ModuleId, err: ModuleError) {
    let record = self.graph.record(id);
    if record.status() == ModuleStatus::Errored {
      return;
    }
    record.set_errored(err.clone());
    log::debug!("Evaluation of '{}' failed: {}", record.identity(), err);
    let parents = record.state.borrow().async_parent_modules.clone();
    for parent in parents {
      self.async_module_execution_rejected(parent, err.clone());
    }
    self.settle_capability(id, Err(err));
  }

  fn settle_capability(&self, id: ModuleId, result: Result<(), ModuleError>) {
    let record = self.graph.record(id);
    let mut state = record.state.borrow_mut();
    if let Some(capability) = &mut state.top_level_capability {
      capability.settle(result);
    }
  }
}
