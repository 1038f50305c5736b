// Copyright 2018-2025 the Deno authors. MIT license.

use std::cell::Cell;
use std::cell::RefCell;
use std::rc::Rc;

use super::FormatTag;
use super::ModuleId;
use super::ModuleRecord;
use super::evaluator::ParseOutcome;
use crate::specifier::ModuleIdentity;

/// Arena of every record created by a loader. Records are never removed;
/// invalidating a module only drops its module map entry.
#[derive(Debug, Default)]
pub struct ModuleGraph {
  records: RefCell<Vec<Rc<ModuleRecord>>>,
  async_evaluation_count: Cell<usize>,
}

impl ModuleGraph {
  pub fn new() -> Self {
    Self::default()
  }

  pub(crate) fn add(
    &self,
    identity: ModuleIdentity,
    format: FormatTag,
    outcome: ParseOutcome,
  ) -> Rc<ModuleRecord> {
    let mut records = self.records.borrow_mut();
    let id = records.len();
    let record = Rc::new(ModuleRecord::new(
      id,
      identity,
      format,
      outcome.shell,
      outcome.body,
      outcome.source,
    ));
    records.push(record.clone());
    record
  }

  pub fn get(&self, id: ModuleId) -> Option<Rc<ModuleRecord>> {
    self.records.borrow().get(id).cloned()
  }

  /// Ids handed out by [`ModuleGraph::add`] are always valid.
  pub(crate) fn record(&self, id: ModuleId) -> Rc<ModuleRecord> {
    self.records.borrow()[id].clone()
  }

  pub fn len(&self) -> usize {
    self.records.borrow().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Records with the given identity, oldest first. There is more than one
  /// after re-importing an invalidated module or importing it with other
  /// attributes.
  pub fn find(&self, identity: &ModuleIdentity) -> Vec<Rc<ModuleRecord>> {
    self
      .records
      .borrow()
      .iter()
      .filter(|record| record.identity() == identity)
      .cloned()
      .collect()
  }

  /// Next value of the counter ordering asynchronous module executions.
  pub(crate) fn next_async_evaluation_order(&self) -> usize {
    let order = self.async_evaluation_count.get();
    self.async_evaluation_count.set(order + 1);
    order
  }
}
