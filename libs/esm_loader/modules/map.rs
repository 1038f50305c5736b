// Copyright 2018-2025 the Deno authors. MIT license.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::ModuleJob;
use super::RequestedModuleType;
use crate::errors::ModuleMapError;
use crate::specifier::ModuleIdentity;

type ModuleMapKey = (ModuleIdentity, RequestedModuleType);

/// Value accepted by [`ModuleMap::set`].
pub enum ModuleMapEntry {
  Job(Rc<ModuleJob>),
  /// Creates the job the first time the key is looked up.
  Deferred(Box<dyn FnOnce() -> Rc<ModuleJob>>),
}

/// Module jobs keyed by `(identity, requested type)`.
///
/// Lookups and inserts never suspend, so two imports of the same key always
/// share one job.
#[derive(Default)]
pub struct ModuleMap {
  entries: RefCell<HashMap<ModuleMapKey, ModuleMapEntry>>,
}

impl ModuleMap {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn has(
    &self,
    identity: &ModuleIdentity,
    requested_type: &RequestedModuleType,
  ) -> bool {
    self
      .entries
      .borrow()
      .contains_key(&(identity.clone(), requested_type.clone()))
  }

  /// Returns the job for the key, creating a deferred job if needed.
  pub fn get(
    &self,
    identity: &ModuleIdentity,
    requested_type: &RequestedModuleType,
  ) -> Result<Option<Rc<ModuleJob>>, ModuleMapError> {
    let key = (identity.clone(), requested_type.clone());
    let factory = {
      let mut entries = self.entries.borrow_mut();
      match entries.remove(&key) {
        None => return Ok(None),
        Some(ModuleMapEntry::Job(job)) => {
          entries.insert(key, ModuleMapEntry::Job(job.clone()));
          return Ok(Some(job));
        }
        Some(ModuleMapEntry::Deferred(factory)) => factory,
      }
    };
    let job = factory();
    check_job_type(&job, identity, requested_type)?;
    self
      .entries
      .borrow_mut()
      .insert(key, ModuleMapEntry::Job(job.clone()));
    Ok(Some(job))
  }

  /// Returns the job for the key or inserts the one built by `factory`.
  /// `factory` runs at most once per key.
  pub fn get_or_create(
    &self,
    identity: ModuleIdentity,
    requested_type: RequestedModuleType,
    factory: impl FnOnce() -> Rc<ModuleJob>,
  ) -> Result<Rc<ModuleJob>, ModuleMapError> {
    if let Some(job) = self.get(&identity, &requested_type)? {
      return Ok(job);
    }
    let job = factory();
    check_job_type(&job, &identity, &requested_type)?;
    log::debug!("Created module job for '{}' ({})", identity, requested_type);
    self
      .entries
      .borrow_mut()
      .insert((identity, requested_type), ModuleMapEntry::Job(job.clone()));
    Ok(job)
  }

  /// Registers an entry ahead of any import.
  pub fn set(
    &self,
    identity: ModuleIdentity,
    requested_type: RequestedModuleType,
    entry: ModuleMapEntry,
  ) -> Result<(), ModuleMapError> {
    if let ModuleMapEntry::Job(job) = &entry {
      check_job_type(job, &identity, &requested_type)?;
    }
    let key = (identity.clone(), requested_type.clone());
    if let Some(ModuleMapEntry::Job(existing)) = self.entries.borrow().get(&key)
      && existing.is_in_flight()
    {
      return Err(invalid_job_type(existing, &identity, &requested_type));
    }
    self.entries.borrow_mut().insert(key, entry);
    Ok(())
  }

  /// Registers `alias` as another key of `job`, unless it is taken.
  pub(crate) fn alias(
    &self,
    alias: ModuleIdentity,
    requested_type: RequestedModuleType,
    job: Rc<ModuleJob>,
  ) {
    let mut entries = self.entries.borrow_mut();
    let key = (alias, requested_type);
    if !entries.contains_key(&key) {
      log::debug!("Aliasing '{}' to '{}'", key.0, job.identity());
      entries.insert(key, ModuleMapEntry::Job(job));
    }
  }

  /// Removes every entry of `identity`, including redirect aliases of its
  /// jobs. Refuses while any of them is still in flight.
  pub fn invalidate(
    &self,
    identity: &ModuleIdentity,
  ) -> Result<(), ModuleMapError> {
    let mut entries = self.entries.borrow_mut();
    let matches = |key: &ModuleMapKey, entry: &ModuleMapEntry| {
      &key.0 == identity
        || matches!(
          entry,
          ModuleMapEntry::Job(job)
            if job.identity() == identity || &job.found_identity() == identity
        )
    };
    let in_flight = entries.iter().any(|(key, entry)| {
      matches(key, entry)
        && matches!(entry, ModuleMapEntry::Job(job) if job.is_in_flight())
    });
    if in_flight {
      return Err(ModuleMapError::JobInFlight {
        identity: identity.clone(),
      });
    }
    entries.retain(|key, entry| !matches(key, entry));
    log::debug!("Invalidated '{}'", identity);
    Ok(())
  }

  pub fn len(&self) -> usize {
    self.entries.borrow().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

fn invalid_job_type(
  job: &ModuleJob,
  key: &ModuleIdentity,
  key_type: &RequestedModuleType,
) -> ModuleMapError {
  ModuleMapError::InvalidJobType {
    identity: job.identity().clone(),
    requested_type: job.requested_type().clone(),
    key: key.clone(),
    key_type: key_type.clone(),
  }
}

/// A job may only be stored under its own key.
fn check_job_type(
  job: &ModuleJob,
  key: &ModuleIdentity,
  key_type: &RequestedModuleType,
) -> Result<(), ModuleMapError> {
  if job.identity() != key || job.requested_type() != key_type {
    return Err(invalid_job_type(job, key, key_type));
  }
  Ok(())
}
