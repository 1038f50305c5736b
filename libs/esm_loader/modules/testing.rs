// Copyright 2018-2025 the Deno authors. MIT license.

//! A line based module language for exercising the loader without a
//! JavaScript engine.
//!
//! ```text
//! import x from "./a.mjs"
//! import { a, b as c } from "./b.mjs" with { type: "json" }
//! import * as ns from "./c.mjs"
//! export let x = 1
//! export default ns.value
//! export { a, b as c } from "./d.mjs"
//! export * from "./e.mjs"
//! log "text"
//! await
//! sleep 10
//! throw boom
//! ```

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::time::Duration;

use deno_error::JsErrorBox;
use futures::future::FutureExt;
use lazy_regex::regex_captures;
use lazy_regex::regex_is_match;
use serde_json::Value;
use serde_json::json;

use super::EvaluationHandle;
use super::Evaluator;
use super::FormatTag;
use super::ImportEntry;
use super::ImportName;
use super::IndirectExportEntry;
use super::LocalExportEntry;
use super::ModuleRequest;
use super::ModuleScope;
use super::ModuleShell;
use super::ModuleSource;
use super::ModuleValue;
use super::ParsedModule;
use crate::errors::ParseError;
use crate::specifier::ModuleIdentity;

const DEFAULT_LOCAL: &str = "*default*";

#[derive(Debug, Clone)]
enum Expr {
  Value(Value),
  Binding(String),
  Member(String, String),
}

#[derive(Debug, Clone)]
enum Statement {
  Assign(String, Expr),
  Log(Expr),
  Throw(String),
  Await,
  Sleep(u64),
}

#[derive(Debug, Default)]
struct Script {
  statements: Vec<Statement>,
}

enum Step {
  Done,
  Suspend(usize),
}

#[derive(Default)]
pub struct ScriptEvaluator {
  log: Rc<RefCell<Vec<String>>>,
  evaluations: RefCell<HashMap<String, usize>>,
  scopes: RefCell<HashMap<String, ModuleScope>>,
}

impl ScriptEvaluator {
  pub fn log(&self) -> Vec<String> {
    self.log.borrow().clone()
  }

  pub fn evaluation_count(&self, url: &str) -> usize {
    self.evaluations.borrow().get(url).copied().unwrap_or_default()
  }

  /// Scope handed to the body of `url`, if it ran.
  pub fn scope(&self, url: &str) -> Option<ModuleScope> {
    self.scopes.borrow().get(url).cloned()
  }
}

impl Evaluator for ScriptEvaluator {
  fn parse(
    &self,
    source: &ModuleSource,
    identity: &ModuleIdentity,
    _format: FormatTag,
  ) -> Result<ModuleShell, ParseError> {
    let text = source.text().map_err(|err| {
      ParseError::new(identity.clone(), format!("Invalid UTF-8: {err}"))
    })?;
    let mut shell = ModuleShell::default();
    let mut script = Script::default();
    for (index, line) in text.lines().enumerate() {
      let line = line.trim().trim_end_matches(';');
      if line.is_empty() || line.starts_with("//") {
        continue;
      }
      parse_statement(line, &mut shell, &mut script).ok_or_else(|| {
        ParseError::new(
          identity.clone(),
          format!("Unexpected statement '{line}'"),
        )
        .with_position(index + 1, 1)
      })?;
    }
    shell.compiled = Some(Rc::new(script));
    Ok(shell)
  }

  fn evaluate(
    &self,
    module: &ParsedModule,
    scope: ModuleScope,
  ) -> Result<EvaluationHandle, JsErrorBox> {
    let url = module.identity.to_string();
    *self.evaluations.borrow_mut().entry(url.clone()).or_default() += 1;
    self.scopes.borrow_mut().insert(url, scope.clone());

    let script = match &module.shell.compiled {
      Some(compiled) => compiled
        .clone()
        .downcast::<Script>()
        .map_err(|_| JsErrorBox::generic("Unknown compiled module"))?,
      None => Rc::new(compile_commonjs(module)?),
    };

    match run(&script, 0, &scope, &self.log)? {
      Step::Done => Ok(EvaluationHandle::Completed),
      Step::Suspend(index) => {
        let log = self.log.clone();
        let future = async move {
          let mut index = index;
          loop {
            match &script.statements[index] {
              Statement::Sleep(ms) => {
                tokio::time::sleep(Duration::from_millis(*ms)).await
              }
              _ => tokio::task::yield_now().await,
            }
            match run(&script, index + 1, &scope, &log)? {
              Step::Done => return Ok(()),
              Step::Suspend(next) => index = next,
            }
          }
        };
        Ok(EvaluationHandle::Pending(future.boxed_local()))
      }
    }
  }
}

/// CommonJS bodies only support assignments to `module.exports`.
fn compile_commonjs(module: &ParsedModule) -> Result<Script, JsErrorBox> {
  let text = module
    .source
    .as_ref()
    .ok_or_else(|| JsErrorBox::generic("Missing source"))?
    .text()
    .map_err(|err| JsErrorBox::generic(err.to_string()))?;
  let mut script = Script::default();
  for line in text.lines().map(str::trim).filter(|line| !line.is_empty()) {
    if let Some((_, expr)) = regex_captures!(r"^module\.exports\s*=\s*(.+)$", line)
    {
      let expr = parse_expr(expr)
        .ok_or_else(|| JsErrorBox::generic(format!("Bad expression {expr}")))?;
      script.statements.push(Statement::Assign("default".into(), expr));
    } else if let Some((_, msg)) = regex_captures!(r"^throw\s+(.+)$", line) {
      script.statements.push(Statement::Throw(msg.to_string()));
    }
  }
  Ok(script)
}

fn run(
  script: &Script,
  start: usize,
  scope: &ModuleScope,
  log: &RefCell<Vec<String>>,
) -> Result<Step, JsErrorBox> {
  for (index, statement) in script.statements.iter().enumerate().skip(start) {
    match statement {
      Statement::Assign(name, expr) => scope.set(name, eval(expr, scope)?)?,
      Statement::Log(expr) => {
        let value = eval(expr, scope)?;
        log.borrow_mut().push(display(&value));
      }
      Statement::Throw(message) => {
        return Err(JsErrorBox::generic(message.clone()));
      }
      Statement::Await | Statement::Sleep(_) => {
        return Ok(Step::Suspend(index));
      }
    }
  }
  Ok(Step::Done)
}

fn eval(expr: &Expr, scope: &ModuleScope) -> Result<ModuleValue, JsErrorBox> {
  match expr {
    Expr::Value(value) => Ok(ModuleValue::Data(value.clone())),
    Expr::Binding(name) => scope.get(name),
    Expr::Member(object, member) => match scope.get(object)? {
      ModuleValue::Namespace(namespace) => Ok(
        namespace
          .get(member)?
          .unwrap_or(ModuleValue::Data(Value::Null)),
      ),
      ModuleValue::Data(value) => {
        Ok(ModuleValue::Data(value.get(member).cloned().unwrap_or_default()))
      }
      ModuleValue::Host(_) => Err(JsErrorBox::type_error(format!(
        "Cannot read '{member}' of host value"
      ))),
    },
  }
}

fn display(value: &ModuleValue) -> String {
  match value {
    ModuleValue::Data(Value::String(text)) => text.clone(),
    ModuleValue::Data(value) => value.to_string(),
    ModuleValue::Namespace(namespace) => {
      format!("[Module {}]", namespace.names().join(","))
    }
    ModuleValue::Host(_) => "[Host]".to_string(),
  }
}

fn parse_statement(
  line: &str,
  shell: &mut ModuleShell,
  script: &mut Script,
) -> Option<()> {
  if let Some((_, specifier, ty)) = regex_captures!(
    r#"^import\s+"([^"]+)"(?:\s+with\s*\{\s*type:\s*"(\w+)"\s*\})?$"#,
    line
  ) {
    shell.add_request(request(specifier, ty));
  } else if let Some((_, clause, specifier, ty)) = regex_captures!(
    r#"^import\s+(.+?)\s+from\s+"([^"]+)"(?:\s+with\s*\{\s*type:\s*"(\w+)"\s*\})?$"#,
    line
  ) {
    let index = shell.add_request(request(specifier, ty));
    let mut import = |import_name: ImportName, local_name: &str| {
      shell.imports.push(ImportEntry {
        request: index,
        import_name,
        local_name: local_name.to_string(),
      });
    };
    if let Some((_, local)) = regex_captures!(r"^\*\s+as\s+(\w+)$", clause) {
      import(ImportName::Namespace, local);
    } else if let Some((_, names)) = regex_captures!(r"^\{(.*)\}$", clause) {
      for (imported, local) in parse_names(names)? {
        import(ImportName::named(imported), local);
      }
    } else if regex_is_match!(r"^\w+$", clause) {
      import(ImportName::named("default"), clause);
    } else {
      return None;
    }
  } else if let Some((_, specifier)) =
    regex_captures!(r#"^export\s+\*\s+from\s+"([^"]+)"$"#, line)
  {
    let index = shell.add_request(ModuleRequest::new(specifier));
    shell.star_exports.push(index);
  } else if let Some((_, name, specifier)) =
    regex_captures!(r#"^export\s+\*\s+as\s+(\w+)\s+from\s+"([^"]+)"$"#, line)
  {
    let index = shell.add_request(ModuleRequest::new(specifier));
    shell.indirect_exports.push(IndirectExportEntry {
      export_name: name.to_string(),
      request: index,
      import_name: ImportName::Namespace,
    });
  } else if let Some((_, names, specifier)) =
    regex_captures!(r#"^export\s+\{(.*)\}\s+from\s+"([^"]+)"$"#, line)
  {
    let index = shell.add_request(ModuleRequest::new(specifier));
    for (imported, exported) in parse_names(names)? {
      shell.indirect_exports.push(IndirectExportEntry {
        export_name: exported.to_string(),
        request: index,
        import_name: ImportName::named(imported),
      });
    }
  } else if let Some((_, names)) = regex_captures!(r"^export\s+\{(.*)\}$", line)
  {
    for (local, exported) in parse_names(names)? {
      shell.local_exports.push(LocalExportEntry {
        export_name: exported.to_string(),
        local_name: local.to_string(),
      });
    }
  } else if let Some((_, expr)) = regex_captures!(r"^export\s+default\s+(.+)$", line)
  {
    shell.local_exports.push(LocalExportEntry {
      export_name: "default".to_string(),
      local_name: DEFAULT_LOCAL.to_string(),
    });
    script
      .statements
      .push(Statement::Assign(DEFAULT_LOCAL.to_string(), parse_expr(expr)?));
  } else if let Some((_, name, expr)) =
    regex_captures!(r"^export\s+let\s+(\w+)\s*=\s*(.+)$", line)
  {
    shell.local_exports.push(LocalExportEntry {
      export_name: name.to_string(),
      local_name: name.to_string(),
    });
    script
      .statements
      .push(Statement::Assign(name.to_string(), parse_expr(expr)?));
  } else if let Some((_, name, expr)) =
    regex_captures!(r"^let\s+(\w+)\s*=\s*(.+)$", line)
  {
    shell.locals.push(name.to_string());
    script
      .statements
      .push(Statement::Assign(name.to_string(), parse_expr(expr)?));
  } else if let Some((_, name, expr)) =
    regex_captures!(r"^(\w+)\s*=\s*(.+)$", line)
  {
    script
      .statements
      .push(Statement::Assign(name.to_string(), parse_expr(expr)?));
  } else if let Some((_, expr)) = regex_captures!(r"^log\s+(.+)$", line) {
    script.statements.push(Statement::Log(parse_expr(expr)?));
  } else if let Some((_, message)) = regex_captures!(r"^throw\s+(.+)$", line) {
    script.statements.push(Statement::Throw(message.to_string()));
  } else if line == "await" {
    shell.has_top_level_await = true;
    script.statements.push(Statement::Await);
  } else if let Some((_, ms)) = regex_captures!(r"^sleep\s+(\d+)$", line) {
    shell.has_top_level_await = true;
    script.statements.push(Statement::Sleep(ms.parse().ok()?));
  } else {
    return None;
  }
  Some(())
}

fn request(specifier: &str, ty: &str) -> ModuleRequest {
  let request = ModuleRequest::new(specifier);
  if ty.is_empty() {
    request
  } else {
    request.with_attribute("type", ty)
  }
}

/// Parses `a, b as c` into `[(a, a), (b, c)]`.
fn parse_names(names: &str) -> Option<Vec<(&str, &str)>> {
  names
    .split(',')
    .map(str::trim)
    .filter(|name| !name.is_empty())
    .map(|name| {
      let (_, from, to) = regex_captures!(r"^(\w+)(?:\s+as\s+(\w+))?$", name)?;
      Some((from, if to.is_empty() { from } else { to }))
    })
    .collect()
}

fn parse_expr(expr: &str) -> Option<Expr> {
  let expr = expr.trim();
  if let Ok(value) = serde_json::from_str::<Value>(expr) {
    return Some(Expr::Value(value));
  }
  if let Some((_, object, member)) = regex_captures!(r"^(\w+)\.(\w+)$", expr) {
    return Some(Expr::Member(object.to_string(), member.to_string()));
  }
  if expr == "undefined" {
    return Some(Expr::Value(json!(null)));
  }
  if regex_is_match!(r"^\w+$", expr) {
    return Some(Expr::Binding(expr.to_string()));
  }
  None
}
