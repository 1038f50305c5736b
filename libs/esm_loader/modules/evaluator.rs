// Copyright 2018-2025 the Deno authors. MIT license.

use deno_error::JsErrorBox;
use futures::future::LocalBoxFuture;
use indexmap::IndexMap;

use super::FormatTag;
use super::ModuleScope;
use super::ModuleShell;
use super::ModuleSource;
use super::ModuleValue;
use crate::builtins::BuiltinModules;
use crate::errors::ParseError;
use crate::specifier::ModuleIdentity;

/// Everything the evaluator gets back when it is asked to run a module.
#[derive(Debug, Clone)]
pub struct ParsedModule {
  pub identity: ModuleIdentity,
  pub format: FormatTag,
  pub shell: ModuleShell,
  /// Kept for formats whose shell is synthesized by the loader but whose
  /// body still runs in the evaluator (CommonJS).
  pub source: Option<ModuleSource>,
}

/// Outcome of starting a module body.
pub enum EvaluationHandle {
  Completed,
  /// The body suspended on a top-level `await`.
  Pending(LocalBoxFuture<'static, Result<(), JsErrorBox>>),
}

/// The engine that compiles and runs module bodies.
pub trait Evaluator {
  /// Extracts the static shape of an ECMAScript or Wasm module. Must not
  /// run any code.
  fn parse(
    &self,
    source: &ModuleSource,
    identity: &ModuleIdentity,
    format: FormatTag,
  ) -> Result<ModuleShell, ParseError>;

  /// Runs the body of `module`. Called at most once per record.
  ///
  /// Modules without top-level await must return
  /// [`EvaluationHandle::Completed`].
  fn evaluate(
    &self,
    module: &ParsedModule,
    scope: ModuleScope,
  ) -> Result<EvaluationHandle, JsErrorBox>;
}

/// Where the static shape of a module comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellSource {
  /// [`Evaluator::parse`].
  Evaluator,
  /// Parsed by the loader into a `default` export.
  Json,
  /// A single `default` export filled by the evaluator.
  DefaultOnly,
  /// The exports of a registered builtin.
  Builtin,
}

/// Per format behavior of the loader.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatCapabilities {
  pub fetches_source: bool,
  pub shell: ShellSource,
  /// `false` for formats only providing a `default` export to ESM
  /// importers. Named imports from them fail with a format mismatch.
  pub named_exports: bool,
}

impl FormatCapabilities {
  pub const fn of(format: FormatTag) -> Self {
    match format {
      FormatTag::EcmaScript | FormatTag::Wasm => Self {
        fetches_source: true,
        shell: ShellSource::Evaluator,
        named_exports: true,
      },
      FormatTag::CommonJs => Self {
        fetches_source: true,
        shell: ShellSource::DefaultOnly,
        named_exports: false,
      },
      FormatTag::Json => Self {
        fetches_source: true,
        shell: ShellSource::Json,
        named_exports: false,
      },
      FormatTag::Builtin => Self {
        fetches_source: false,
        shell: ShellSource::Builtin,
        named_exports: true,
      },
    }
  }
}

/// How a record's body runs.
#[derive(Debug, Clone)]
pub(crate) enum ModuleBody {
  Evaluator,
  /// Bindings initialized by the loader, no code runs.
  Synthetic(IndexMap<String, ModuleValue>),
}

#[derive(Debug)]
pub(crate) struct ParseOutcome {
  pub shell: ModuleShell,
  pub body: ModuleBody,
  pub source: Option<ModuleSource>,
}

pub(crate) fn parse_module(
  evaluator: &dyn Evaluator,
  builtins: &BuiltinModules,
  identity: &ModuleIdentity,
  format: FormatTag,
  source: Option<ModuleSource>,
) -> Result<ParseOutcome, ParseError> {
  let capabilities = FormatCapabilities::of(format);
  let require_source = |source: Option<ModuleSource>| {
    source.ok_or_else(|| ParseError::new(identity.clone(), "Missing source"))
  };
  match capabilities.shell {
    ShellSource::Evaluator => {
      let source = require_source(source)?;
      let shell = evaluator.parse(&source, identity, format)?;
      Ok(ParseOutcome {
        shell,
        body: ModuleBody::Evaluator,
        source: None,
      })
    }
    ShellSource::Json => {
      let source = require_source(source)?;
      let text = source.text().map_err(|err| {
        ParseError::new(identity.clone(), format!("Invalid UTF-8: {err}"))
      })?;
      let value: serde_json::Value =
        serde_json::from_str(text).map_err(|err| {
          ParseError::new(
            identity.clone(),
            format!("Unexpected token in JSON: {err}"),
          )
          .with_position(err.line(), err.column())
        })?;
      let mut exports = IndexMap::with_capacity(1);
      exports.insert("default".to_string(), ModuleValue::Data(value));
      Ok(ParseOutcome {
        shell: ModuleShell::synthetic(["default"]),
        body: ModuleBody::Synthetic(exports),
        source: None,
      })
    }
    ShellSource::DefaultOnly => Ok(ParseOutcome {
      shell: ModuleShell::synthetic(["default"]),
      body: ModuleBody::Evaluator,
      source: Some(require_source(source)?),
    }),
    ShellSource::Builtin => {
      let builtin = identity
        .builtin_name()
        .and_then(|name| builtins.get(name))
        .ok_or_else(|| {
          ParseError::new(identity.clone(), "No such built-in module")
        })?;
      Ok(ParseOutcome {
        shell: ModuleShell::synthetic(
          builtin.exports.keys().map(|name| name.as_str()),
        ),
        body: ModuleBody::Synthetic(builtin.exports.clone()),
        source: None,
      })
    }
  }
}
