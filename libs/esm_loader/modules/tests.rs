// Copyright 2018-2025 the Deno authors. MIT license.

use std::rc::Rc;

use deno_error::JsErrorClass;
use pretty_assertions::assert_eq;
use serde_json::json;
use sys_traits::impls::InMemorySys;

use super::ImportAttributes;
use super::ModuleJobState;
use super::ModuleStatus;
use super::RequestedModuleType;
use super::StaticResourceLoader;
use super::testing::ScriptEvaluator;
use crate::builtins::BuiltinModules;
use crate::errors::ErrorCode;
use crate::errors::LinkError;
use crate::errors::ModuleError;
use crate::loader::EsmLoader;
use crate::options::AmbiguousStarExportPolicy;
use crate::options::LoaderOptions;
use crate::resolver::SysPackageMetadataReader;
use crate::specifier::ModuleIdentity;

struct Harness {
  loader: EsmLoader,
  evaluator: Rc<ScriptEvaluator>,
  resources: Rc<StaticResourceLoader>,
  referrer: ModuleIdentity,
}

impl Harness {
  fn new(modules: &[(&str, &str)]) -> Self {
    Self::with_options(modules, &[], LoaderOptions::default())
  }

  fn with_options(
    modules: &[(&str, &str)],
    redirects: &[(&str, &str)],
    options: LoaderOptions,
  ) -> Self {
    let mut resources = StaticResourceLoader::new();
    for (name, source) in modules {
      resources.add(url(name), *source);
    }
    for (from, to) in redirects {
      resources.add_redirect(url(from), url(to));
    }
    let resources = Rc::new(resources);
    let evaluator = Rc::new(ScriptEvaluator::default());
    let mut builtins = BuiltinModules::new();
    builtins.register(
      "fs",
      [("readFile".to_string(), json!("readFile").into())],
    );
    let loader = EsmLoader::new(
      options,
      resources.clone(),
      evaluator.clone(),
      Rc::new(SysPackageMetadataReader::new(InMemorySys::default())),
      builtins,
    );
    Self {
      loader,
      evaluator,
      resources,
      referrer: url("index.mjs"),
    }
  }

  async fn import(
    &self,
    specifier: &str,
  ) -> Result<Rc<super::ModuleNamespace>, ModuleError> {
    self.loader.import(specifier, &self.referrer).await
  }

  fn log(&self) -> Vec<String> {
    self.evaluator.log()
  }

  fn evaluations(&self, name: &str) -> usize {
    self.evaluator.evaluation_count(url(name).as_str())
  }
}

fn url(name: &str) -> ModuleIdentity {
  ModuleIdentity::parse(&format!("file:///app/{name}")).unwrap()
}

#[tokio::test]
async fn concurrent_imports_evaluate_once() {
  let harness = Harness::new(&[
    ("a.mjs", "import { value } from \"./dep.mjs\"\nexport let a = value"),
    ("dep.mjs", "sleep 5\nlog \"dep\"\nexport let value = 1"),
  ]);
  let results = futures::future::join_all(
    (0..100).map(|_| harness.import("./a.mjs")),
  )
  .await;
  let first = results[0].as_ref().unwrap();
  for result in &results {
    assert!(Rc::ptr_eq(first, result.as_ref().unwrap()));
  }
  assert_eq!(first.get("a").unwrap().unwrap(), json!(1));
  assert_eq!(harness.evaluations("a.mjs"), 1);
  assert_eq!(harness.evaluations("dep.mjs"), 1);
  assert_eq!(harness.resources.fetch_count(&url("dep.mjs")), 1);
  assert_eq!(harness.log(), vec!["dep"]);
}

#[tokio::test]
async fn concurrent_imports_of_different_entry_points_share_dependencies() {
  let harness = Harness::new(&[
    ("a.mjs", "import \"./shared.mjs\"\nlog \"a\""),
    ("b.mjs", "import \"./shared.mjs\"\nlog \"b\""),
    ("shared.mjs", "await\nlog \"shared\""),
  ]);
  let (a, b) =
    futures::join!(harness.import("./a.mjs"), harness.import("./b.mjs"));
  a.unwrap();
  b.unwrap();
  assert_eq!(harness.evaluations("shared.mjs"), 1);
  assert_eq!(harness.log(), vec!["shared", "a", "b"]);
}

#[tokio::test]
async fn dependencies_evaluate_before_dependents() {
  let harness = Harness::new(&[
    ("a.mjs", "import \"./b.mjs\"\nlog \"A\""),
    ("b.mjs", "import \"./c.mjs\"\nlog \"B\""),
    ("c.mjs", "log \"C\""),
  ]);
  harness.import("./a.mjs").await.unwrap();
  assert_eq!(harness.log(), vec!["C", "B", "A"]);
}

#[tokio::test]
async fn diamond_dependencies_evaluate_once_in_request_order() {
  let harness = Harness::new(&[
    ("a.mjs", "import \"./b.mjs\"\nimport \"./c.mjs\"\nlog \"a\""),
    ("b.mjs", "import \"./d.mjs\"\nlog \"b\""),
    ("c.mjs", "import \"./d.mjs\"\nlog \"c\""),
    ("d.mjs", "log \"d\""),
  ]);
  harness.import("./a.mjs").await.unwrap();
  assert_eq!(harness.log(), vec!["d", "b", "c", "a"]);
  assert_eq!(harness.evaluations("d.mjs"), 1);
}

#[tokio::test]
async fn cycles_terminate() {
  let harness = Harness::new(&[
    ("a.mjs", "import { b } from \"./b.mjs\"\nexport let a = \"A\"\nlog b"),
    ("b.mjs", "import { a } from \"./a.mjs\"\nexport let b = \"B\"\nlog b"),
  ]);
  let namespace = harness.import("./a.mjs").await.unwrap();
  assert_eq!(harness.log(), vec!["B", "B"]);
  assert_eq!(namespace.get("a").unwrap().unwrap(), json!("A"));

  let namespace = harness.import("./b.mjs").await.unwrap();
  assert_eq!(namespace.names(), vec!["b"]);
  assert_eq!(harness.evaluations("b.mjs"), 1);
}

#[tokio::test]
async fn three_module_cycle_evaluates_leaf_first() {
  let harness = Harness::new(&[
    ("a.mjs", "import \"./b.mjs\"\nlog \"A\""),
    ("b.mjs", "import \"./c.mjs\"\nlog \"B\""),
    ("c.mjs", "import \"./a.mjs\"\nlog \"C\""),
  ]);
  harness.import("./a.mjs").await.unwrap();
  assert_eq!(harness.log(), vec!["C", "B", "A"]);
  let job = harness
    .loader
    .job_for("./c.mjs", &ImportAttributes::new(), &harness.referrer)
    .unwrap();
  assert_eq!(job.state(), ModuleJobState::Module(ModuleStatus::Evaluated));
}

#[tokio::test]
async fn reading_a_cyclic_binding_before_initialization_throws() {
  let harness = Harness::new(&[
    ("a.mjs", "import \"./b.mjs\"\nexport let a = 1"),
    ("b.mjs", "import { a } from \"./a.mjs\"\nlog a"),
  ]);
  let err = harness.import("./a.mjs").await.unwrap_err();
  assert_eq!(err.code(), ErrorCode::ERR_EVALUATION_FAILED);
  let source = &err.as_evaluation().unwrap().source;
  assert_eq!(source.get_class(), "ReferenceError");
  assert_eq!(
    source.get_message(),
    "Cannot access 'a' before initialization"
  );
  assert!(matches!(
    err.as_link(),
    Some(LinkError::BindingNotInitialized { name, .. }) if name == "a"
  ));
  assert_eq!(harness.evaluations("a.mjs"), 0);

  let b = harness.evaluator.scope(url("b.mjs").as_str()).unwrap();
  let read = b.get("a").unwrap_err();
  assert!(matches!(
    LinkError::from_js_error(&read),
    Some(LinkError::BindingNotInitialized { module, .. })
      if module == &url("a.mjs")
  ));
}

#[tokio::test]
async fn importers_observe_updates_made_by_the_exporter() {
  let harness = Harness::new(&[
    ("b.mjs", "export let x = 1
x = 2"),
    ("a.mjs", "import { x } from \"./b.mjs\"\nlog x\nexport let seen = x"),
  ]);
  let a = harness.import("./a.mjs").await.unwrap();
  assert_eq!(harness.log(), vec!["2"]);
  assert_eq!(a.get("seen").unwrap().unwrap(), json!(2));
  let b = harness.import("./b.mjs").await.unwrap();
  assert_eq!(b.get("x").unwrap().unwrap(), json!(2));
}

#[tokio::test]
async fn imported_bindings_are_live() {
  let harness = Harness::new(&[
    ("lib.mjs", "export let count = 1"),
    (
      "main.mjs",
      "import { count } from \"./lib.mjs\"\nimport * as lib from \"./lib.mjs\"\nexport { count }\nexport let seen = lib.count",
    ),
  ]);
  let main = harness.import("./main.mjs").await.unwrap();
  assert_eq!(main.get("count").unwrap().unwrap(), json!(1));

  let lib_scope = harness.evaluator.scope(url("lib.mjs").as_str()).unwrap();
  lib_scope.set("count", json!(2)).unwrap();

  let main_scope = harness.evaluator.scope(url("main.mjs").as_str()).unwrap();
  assert_eq!(main_scope.get("count").unwrap(), json!(2));
  assert_eq!(main.get("count").unwrap().unwrap(), json!(2));
  assert_eq!(main.get("seen").unwrap().unwrap(), json!(1));
  let lib = harness.import("./lib.mjs").await.unwrap();
  assert_eq!(lib.get("count").unwrap().unwrap(), json!(2));

  let err = main_scope.set("count", json!(3)).unwrap_err();
  assert_eq!(err.get_class(), "TypeError");
}

#[tokio::test]
async fn evaluation_errors_are_sticky() {
  let harness = Harness::new(&[
    ("broken.mjs", "log \"broken\"\nthrow boom"),
    ("parent.mjs", "import \"./broken.mjs\"\nlog \"parent\""),
  ]);
  let first = harness.import("./broken.mjs").await.unwrap_err();
  assert_eq!(first.code(), ErrorCode::ERR_EVALUATION_FAILED);
  assert_eq!(first.as_evaluation().unwrap().source.get_message(), "boom");

  let second = harness.import("./broken.mjs").await.unwrap_err();
  assert!(first.ptr_eq(&second));
  let parent = harness.import("./parent.mjs").await.unwrap_err();
  assert!(first.ptr_eq(&parent));

  assert_eq!(harness.evaluations("broken.mjs"), 1);
  assert_eq!(harness.log(), vec!["broken"]);
  let job = harness
    .loader
    .job_for("./parent.mjs", &ImportAttributes::new(), &harness.referrer)
    .unwrap();
  assert_eq!(job.state(), ModuleJobState::Module(ModuleStatus::Errored));
}

#[tokio::test]
async fn unresolvable_exports_fail_before_evaluation() {
  let harness = Harness::new(&[
    ("lib.mjs", "log \"lib\"\nexport let present = 1"),
    ("main.mjs", "import { missing } from \"./lib.mjs\"\nlog \"main\""),
  ]);
  let err = harness.import("./main.mjs").await.unwrap_err();
  assert_eq!(err.code(), ErrorCode::ERR_EXPORT_NOT_FOUND);
  assert_eq!(
    err.to_string(),
    "The requested module 'file:///app/lib.mjs' does not provide an export \
     named 'missing' (imported by 'file:///app/main.mjs')"
  );
  assert!(harness.log().is_empty());
  assert_eq!(harness.evaluations("lib.mjs"), 0);

  let again = harness.import("./main.mjs").await.unwrap_err();
  assert!(err.ptr_eq(&again));

  // the exporter itself linked fine
  harness.import("./lib.mjs").await.unwrap();
  assert_eq!(harness.log(), vec!["lib"]);
}

#[tokio::test]
async fn top_level_await_delays_dependents() {
  let harness = Harness::new(&[
    ("a.mjs", "import \"./b.mjs\"\nimport \"./c.mjs\"\nlog \"a\""),
    ("b.mjs", "log \"b:start\"\nsleep 5\nlog \"b:end\""),
    ("c.mjs", "log \"c\""),
  ]);
  harness.import("./a.mjs").await.unwrap();
  assert_eq!(harness.log(), vec!["b:start", "c", "b:end", "a"]);
}

#[tokio::test]
async fn async_rejections_reach_every_dependent() {
  let harness = Harness::new(&[
    ("a.mjs", "import \"./b.mjs\"\nlog \"a\""),
    ("b.mjs", "await\nthrow late failure"),
  ]);
  let err = harness.import("./a.mjs").await.unwrap_err();
  assert_eq!(err.code(), ErrorCode::ERR_EVALUATION_FAILED);
  assert_eq!(
    err.as_evaluation().unwrap().identity.as_str(),
    "file:///app/b.mjs"
  );
  let b = harness.import("./b.mjs").await.unwrap_err();
  assert!(err.ptr_eq(&b));
  assert!(harness.log().is_empty());
}

#[tokio::test]
async fn json_and_commonjs_only_provide_default_exports() {
  let harness = Harness::new(&[
    ("data.json", "{ \"name\": \"pkg\" }"),
    ("lib.cjs", "module.exports = 42"),
    (
      "main.mjs",
      "import data from \"./data.json\" with { type: \"json\" }\nimport value from \"./lib.cjs\"\nlog data.name\nlog value",
    ),
    (
      "named_json.mjs",
      "import { name } from \"./data.json\" with { type: \"json\" }",
    ),
    ("named_cjs.mjs", "import { value } from \"./lib.cjs\""),
  ]);
  harness.import("./main.mjs").await.unwrap();
  assert_eq!(harness.log(), vec!["pkg", "42"]);

  let err = harness.import("./named_json.mjs").await.unwrap_err();
  assert_eq!(err.code(), ErrorCode::ERR_EXPORT_FORMAT_MISMATCH);
  let err = harness.import("./named_cjs.mjs").await.unwrap_err();
  assert_eq!(err.code(), ErrorCode::ERR_EXPORT_FORMAT_MISMATCH);

  let attributes =
    ImportAttributes::from([("type".to_string(), "json".to_string())]);
  let data = harness
    .loader
    .import_with_attributes("./data.json", &attributes, &harness.referrer)
    .await
    .unwrap();
  assert_eq!(data.get("default").unwrap().unwrap(), json!({ "name": "pkg" }));
  assert!(
    harness
      .loader
      .module_map()
      .has(&url("data.json"), &RequestedModuleType::Json)
  );
}

#[tokio::test]
async fn ambiguous_star_exports() {
  let modules = [
    ("x.mjs", "export let name = 1"),
    ("y.mjs", "export let name = 2\nexport let only = 3"),
    ("star.mjs", "export * from \"./x.mjs\"\nexport * from \"./y.mjs\""),
    ("named.mjs", "import { name } from \"./star.mjs\""),
  ];
  let harness = Harness::new(&modules);
  let err = harness.import("./star.mjs").await.unwrap_err();
  assert_eq!(err.code(), ErrorCode::ERR_EXPORT_AMBIGUOUS);

  let harness = Harness::with_options(
    &modules,
    &[],
    LoaderOptions {
      ambiguous_star_exports: AmbiguousStarExportPolicy::Omit,
      ..Default::default()
    },
  );
  let namespace = harness.import("./star.mjs").await.unwrap();
  assert_eq!(namespace.names(), vec!["only"]);
  let err = harness.import("./named.mjs").await.unwrap_err();
  assert_eq!(err.code(), ErrorCode::ERR_EXPORT_AMBIGUOUS);
}

#[tokio::test]
async fn ambiguous_namespace_errors_the_whole_cycle() {
  let harness = Harness::new(&[
    ("x.mjs", "export let name = 1"),
    ("y.mjs", "export let name = 2"),
    (
      "main.mjs",
      "import \"./helper.mjs\"\nexport * from \"./x.mjs\"\nexport * from \"./y.mjs\"",
    ),
    ("helper.mjs", "import \"./main.mjs\"\nlog \"helper\""),
  ]);
  let err = harness.import("./main.mjs").await.unwrap_err();
  assert_eq!(err.code(), ErrorCode::ERR_EXPORT_AMBIGUOUS);

  let helper = harness
    .loader
    .job_for("./helper.mjs", &ImportAttributes::new(), &harness.referrer)
    .unwrap();
  assert_eq!(helper.state(), ModuleJobState::Module(ModuleStatus::Errored));
  let again = harness.import("./helper.mjs").await.unwrap_err();
  assert!(err.ptr_eq(&again));
  assert!(harness.log().is_empty());

  // outside the cycle
  harness.import("./x.mjs").await.unwrap();
}

#[tokio::test]
async fn circular_reexports_fail_to_link() {
  let harness = Harness::new(&[
    ("a.mjs", "export { x } from \"./b.mjs\""),
    ("b.mjs", "export { x } from \"./a.mjs\""),
  ]);
  let err = harness.import("./a.mjs").await.unwrap_err();
  assert_eq!(err.code(), ErrorCode::ERR_EXPORT_CIRCULAR);
}

#[tokio::test]
async fn star_exports_into_failed_modules_report_the_load_error() {
  let harness = Harness::new(&[
    ("a.mjs", "import \"./b.mjs\"\nexport * from \"./d.mjs\""),
    ("b.mjs", "import { x } from \"./a.mjs\"\nlog x"),
    ("d.mjs", "export { x } from \"./missing.mjs\""),
  ]);
  let err = harness.import("./a.mjs").await.unwrap_err();
  assert_eq!(err.code(), ErrorCode::ERR_MODULE_FETCH_FAILED);
  let missing = harness.import("./missing.mjs").await.unwrap_err();
  assert!(err.ptr_eq(&missing));
  let b = harness.import("./b.mjs").await.unwrap_err();
  assert!(err.ptr_eq(&b));
  let d = harness.import("./d.mjs").await.unwrap_err();
  assert!(err.ptr_eq(&d));
  assert!(harness.log().is_empty());
}

#[tokio::test]
async fn namespace_reexports() {
  let harness = Harness::new(&[
    ("lib.mjs", "export let value = 1\nexport default \"lib\""),
    ("re.mjs", "export * as lib from \"./lib.mjs\"\nexport * from \"./lib.mjs\""),
    ("main.mjs", "import { lib, value } from \"./re.mjs\"\nlog lib.default\nlog value"),
  ]);
  harness.import("./main.mjs").await.unwrap();
  assert_eq!(harness.log(), vec!["lib", "1"]);
  let re = harness.import("./re.mjs").await.unwrap();
  assert_eq!(re.names(), vec!["lib", "value"]);
}

#[tokio::test]
async fn invalidation_refuses_in_flight_jobs() {
  let harness = Harness::new(&[("slow.mjs", "sleep 5\nlog \"slow\"")]);
  let (result, refused) = futures::join!(harness.import("./slow.mjs"), async {
    harness.loader.invalidate(&url("slow.mjs"))
  });
  result.unwrap();
  assert_eq!(refused.unwrap_err().code(), ErrorCode::ERR_JOB_IN_FLIGHT);

  harness.loader.invalidate(&url("slow.mjs")).unwrap();
  assert!(harness.loader.module_map().is_empty());
  harness.import("./slow.mjs").await.unwrap();
  assert_eq!(harness.evaluations("slow.mjs"), 2);
  assert_eq!(harness.loader.graph().find(&url("slow.mjs")).len(), 2);
  assert_eq!(harness.resources.fetch_count(&url("slow.mjs")), 2);
  assert_eq!(harness.log(), vec!["slow", "slow"]);
}

#[tokio::test]
async fn redirects_are_cached_under_both_identities() {
  let harness = Harness::with_options(
    &[("new.mjs", "log \"new\"\nexport let value = 1")],
    &[("old.mjs", "new.mjs")],
    LoaderOptions::default(),
  );
  let old = harness.import("./old.mjs").await.unwrap();
  assert!(
    harness
      .loader
      .module_map()
      .has(&url("new.mjs"), &RequestedModuleType::None)
  );
  let new = harness.import("./new.mjs").await.unwrap();
  assert!(Rc::ptr_eq(&old, &new));
  assert_eq!(harness.resources.fetch_count(&url("new.mjs")), 0);
  assert_eq!(harness.log(), vec!["new"]);
}

#[tokio::test]
async fn redirected_modules_resolve_imports_from_the_found_url() {
  let harness = Harness::with_options(
    &[
      (
        "new/mod.mjs",
        "import { v } from \"./dep.mjs\"\nexport let value = v",
      ),
      ("new/dep.mjs", "export let v = 7"),
    ],
    &[("old/mod.mjs", "new/mod.mjs")],
    LoaderOptions::default(),
  );
  let namespace = harness.import("./old/mod.mjs").await.unwrap();
  assert_eq!(namespace.identity(), &url("new/mod.mjs"));
  assert_eq!(namespace.get("value").unwrap().unwrap(), json!(7));
  assert_eq!(harness.resources.fetch_count(&url("old/dep.mjs")), 0);
  assert_eq!(harness.loader.graph().find(&url("new/mod.mjs")).len(), 1);
  assert!(harness.loader.graph().find(&url("old/mod.mjs")).is_empty());

  harness.loader.invalidate(&url("new/mod.mjs")).unwrap();
  let module_map = harness.loader.module_map();
  assert!(!module_map.has(&url("old/mod.mjs"), &RequestedModuleType::None));
  assert!(!module_map.has(&url("new/mod.mjs"), &RequestedModuleType::None));
  assert!(module_map.has(&url("new/dep.mjs"), &RequestedModuleType::None));
}

#[tokio::test]
async fn load_failures_are_cached() {
  let harness = Harness::new(&[
    ("main.mjs", "import \"./missing.mjs\"\nlog \"main\""),
    ("bad.mjs", "this is not a statement"),
    ("uses_bad.mjs", "import \"./bad.mjs\""),
    ("text.mjs", "import \"./notes.txt\""),
  ]);
  let err = harness.import("./main.mjs").await.unwrap_err();
  assert_eq!(err.code(), ErrorCode::ERR_MODULE_FETCH_FAILED);
  let direct = harness.import("./missing.mjs").await.unwrap_err();
  assert!(err.ptr_eq(&direct));
  assert_eq!(harness.resources.fetch_count(&url("missing.mjs")), 1);
  assert!(harness.log().is_empty());

  let err = harness.import("./uses_bad.mjs").await.unwrap_err();
  assert_eq!(err.code(), ErrorCode::ERR_MODULE_PARSE_FAILED);

  let err = harness.import("./text.mjs").await.unwrap_err();
  assert_eq!(err.code(), ErrorCode::ERR_UNKNOWN_FILE_EXTENSION);
  let again = harness.import("./text.mjs").await.unwrap_err();
  assert!(err.ptr_eq(&again));
}

#[tokio::test]
async fn builtin_modules() {
  let harness = Harness::new(&[
    (
      "main.mjs",
      "import { readFile } from \"node:fs\"\nimport * as fs from \"fs\"\nlog readFile\nlog fs.readFile",
    ),
    ("unknown.mjs", "import \"node:os\""),
  ]);
  harness.import("./main.mjs").await.unwrap();
  assert_eq!(harness.log(), vec!["readFile", "readFile"]);
  let fs = harness.import("node:fs").await.unwrap();
  assert_eq!(fs.names(), vec!["readFile"]);
  assert_eq!(harness.resources.fetch_count(&url("fs")), 0);

  let err = harness.import("./unknown.mjs").await.unwrap_err();
  assert_eq!(err.code(), ErrorCode::ERR_UNKNOWN_BUILTIN_MODULE);
}

#[tokio::test]
async fn graphs_are_deterministic() {
  let modules = [
    ("a.mjs", "import \"./b.mjs\"\nimport \"./c.mjs\"\nlog \"a\""),
    ("b.mjs", "import \"./c.mjs\"\nsleep 2\nlog \"b\""),
    ("c.mjs", "import \"./a.mjs\"\nlog \"c\""),
  ];
  let first = Harness::new(&modules);
  first.import("./a.mjs").await.unwrap();
  let second = Harness::new(&modules);
  second.import("./a.mjs").await.unwrap();
  assert_eq!(first.log(), second.log());
  assert_eq!(first.log(), vec!["c", "b", "a"]);
}
