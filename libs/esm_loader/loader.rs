// Copyright 2018-2025 the Deno authors. MIT license.

use std::rc::Rc;

use crate::builtins::BuiltinModules;
use crate::errors::ModuleError;
use crate::errors::ModuleMapError;
use crate::modules::Evaluator;
use crate::modules::ImportAttributes;
use crate::modules::ModuleGraph;
use crate::modules::ModuleJob;
use crate::modules::ModuleMap;
use crate::modules::ModuleNamespace;
use crate::modules::RequestedModuleType;
use crate::modules::ResourceLoader;
use crate::options::AmbiguousStarExportPolicy;
use crate::options::LoaderOptions;
use crate::resolver::PackageMetadataReader;
use crate::resolver::Resolver;
use crate::specifier::ModuleIdentity;

/// Everything a [`ModuleJob`] needs while loading, linking and evaluating.
pub(crate) struct LoaderState {
  pub resolver: Resolver,
  pub resource_loader: Rc<dyn ResourceLoader>,
  pub evaluator: Rc<dyn Evaluator>,
  pub builtins: Rc<BuiltinModules>,
  pub graph: Rc<ModuleGraph>,
  pub map: ModuleMap,
  pub conditions: Vec<String>,
  pub ambiguous_star_exports: AmbiguousStarExportPolicy,
}

/// Entry point for dynamic and top level imports.
///
/// All state lives on the current thread. Imports must be awaited inside a
/// current thread tokio runtime since module evaluation spawns local tasks.
pub struct EsmLoader {
  state: Rc<LoaderState>,
}

impl EsmLoader {
  pub fn new(
    options: LoaderOptions,
    resource_loader: Rc<dyn ResourceLoader>,
    evaluator: Rc<dyn Evaluator>,
    package_reader: Rc<dyn PackageMetadataReader>,
    builtins: BuiltinModules,
  ) -> Self {
    let builtins = Rc::new(builtins);
    let resolver = Resolver::new(&options, builtins.clone(), package_reader);
    Self {
      state: Rc::new(LoaderState {
        resolver,
        resource_loader,
        evaluator,
        builtins,
        graph: Default::default(),
        map: ModuleMap::new(),
        conditions: options.resolution_conditions(),
        ambiguous_star_exports: options.ambiguous_star_exports,
      }),
    }
  }

  pub fn resolver(&self) -> &Resolver {
    &self.state.resolver
  }

  pub fn module_map(&self) -> &ModuleMap {
    &self.state.map
  }

  pub fn graph(&self) -> &Rc<ModuleGraph> {
    &self.state.graph
  }

  /// Resolves `specifier` against `referrer`, then loads, links and
  /// evaluates the module graph and returns the module's namespace.
  ///
  /// Concurrent and repeated imports of the same module share one job, so
  /// the module body runs at most once.
  pub async fn import(
    &self,
    specifier: &str,
    referrer: &ModuleIdentity,
  ) -> Result<Rc<ModuleNamespace>, ModuleError> {
    self
      .import_with_attributes(specifier, &ImportAttributes::new(), referrer)
      .await
  }

  pub async fn import_with_attributes(
    &self,
    specifier: &str,
    attributes: &ImportAttributes,
    referrer: &ModuleIdentity,
  ) -> Result<Rc<ModuleNamespace>, ModuleError> {
    let job = self.job_for(specifier, attributes, referrer)?;
    log::debug!("Importing '{}' from '{}'", job.identity(), referrer);
    job.run(&self.state).await
  }

  /// Returns the job an import would use without starting it.
  pub fn job_for(
    &self,
    specifier: &str,
    attributes: &ImportAttributes,
    referrer: &ModuleIdentity,
  ) -> Result<Rc<ModuleJob>, ModuleError> {
    let resolved = self.state.resolver.resolve_with_attributes(
      specifier,
      attributes,
      referrer,
      &self.state.conditions,
    )?;
    let requested_type = RequestedModuleType::from_attributes(attributes);
    let job = self.state.map.get_or_create(
      resolved.identity.clone(),
      requested_type.clone(),
      || ModuleJob::new(resolved.identity, requested_type, resolved.format),
    )?;
    Ok(job)
  }

  /// Drops the cached jobs of `identity` so the next import loads it again.
  ///
  /// Records already in the graph stay alive for modules that imported them.
  pub fn invalidate(
    &self,
    identity: &ModuleIdentity,
  ) -> Result<(), ModuleMapError> {
    self.state.map.invalidate(identity)
  }
}
