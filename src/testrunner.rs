//! Tag-filtered test runner behind `POST /~/runtest`

use crate::error::AssertionError;
use crate::module::{ModuleLoader, MODULE_EXTENSION};
use crate::repo::RepoProvider;
use crate::tenant::Tenant;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

type TaskFn = Arc<dyn Fn(TestContext) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Assertions available to test tasks
#[derive(Debug, Clone, Copy, Default)]
pub struct Assert;

impl Assert {
    pub fn equal<T: PartialEq + Debug>(&self, actual: T, expected: T) -> Result<(), AssertionError> {
        if actual == expected {
            Ok(())
        } else {
            Err(AssertionError(format!(
                "expected {:?} to equal {:?}",
                actual, expected
            )))
        }
    }

    pub fn not_equal<T: PartialEq + Debug>(
        &self,
        actual: T,
        expected: T,
    ) -> Result<(), AssertionError> {
        if actual != expected {
            Ok(())
        } else {
            Err(AssertionError(format!(
                "expected {:?} to not equal {:?}",
                actual, expected
            )))
        }
    }

    pub fn is_true(&self, value: bool, message: &str) -> Result<(), AssertionError> {
        if value {
            Ok(())
        } else {
            Err(AssertionError(message.to_string()))
        }
    }

    pub fn fail(&self, message: &str) -> Result<(), AssertionError> {
        Err(AssertionError(message.to_string()))
    }
}

/// What each task receives
#[derive(Debug, Clone)]
pub struct TestContext {
    /// `params` from the run request, shared by every suite
    pub params: Value,
    pub assert: Assert,
}

struct Task {
    name: String,
    description: String,
    tags: Vec<String>,
    run: TaskFn,
}

impl Task {
    fn new<F, Fut>(name: &str, description: &str, tags: &[&str], f: F) -> Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            run: Arc::new(move |ctx| -> BoxFuture<'static, anyhow::Result<()>> {
                Box::pin(f(ctx))
            }),
        }
    }
}

/// Why a test case failed
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestFailure {
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestCaseSummary {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<TestFailure>,
    /// Wall-clock milliseconds, 3 decimals
    pub time: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestSuiteSummary {
    pub name: String,
    pub description: String,
    pub tests: usize,
    pub failures: usize,
    pub time: f64,
    pub testcases: Vec<TestCaseSummary>,
}

impl TestSuiteSummary {
    fn empty(name: &str, description: &str) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            tests: 0,
            failures: 0,
            time: 0.0,
            testcases: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestRunSummary {
    pub name: String,
    pub description: String,
    pub tests: usize,
    pub failures: usize,
    pub time: f64,
    #[serde(rename = "testSuites")]
    pub test_suites: Vec<TestSuiteSummary>,
}

/// Body of `POST /~/runtest`
#[derive(Debug, Clone, Deserialize)]
pub struct TestRunRequest {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "testSuites")]
    pub test_suites: Vec<TestSuiteRequest>,
    #[serde(default)]
    pub params: Value,
}

/// A suite to run. `name` is the module path of the suite.
#[derive(Debug, Clone, Deserialize)]
pub struct TestSuiteRequest {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// Collects tasks registered by a suite and runs those selected by tag.
///
/// A task with no tags always runs; otherwise it runs when any of its tags
/// was requested.
#[derive(Default)]
pub struct TestRunner {
    tags: Vec<String>,
    before_all: Vec<Task>,
    after_all: Vec<Task>,
    before_each: Vec<Task>,
    after_each: Vec<Task>,
    cases: Vec<Task>,
}

impl TestRunner {
    pub fn new(tags: Vec<String>) -> Self {
        Self {
            tags,
            ..Default::default()
        }
    }

    pub fn before_all<F, Fut>(&mut self, name: &str, description: &str, tags: &[&str], f: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.before_all.push(Task::new(name, description, tags, f));
        self
    }

    pub fn after_all<F, Fut>(&mut self, name: &str, description: &str, tags: &[&str], f: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.after_all.push(Task::new(name, description, tags, f));
        self
    }

    pub fn before_each<F, Fut>(&mut self, name: &str, description: &str, tags: &[&str], f: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.before_each.push(Task::new(name, description, tags, f));
        self
    }

    pub fn after_each<F, Fut>(&mut self, name: &str, description: &str, tags: &[&str], f: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.after_each.push(Task::new(name, description, tags, f));
        self
    }

    pub fn test_case<F, Fut>(&mut self, name: &str, description: &str, tags: &[&str], f: F) -> &mut Self
    where
        F: Fn(TestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.cases.push(Task::new(name, description, tags, f));
        self
    }

    fn selected(&self, task: &Task) -> bool {
        task.tags.is_empty() || task.tags.iter().any(|tag| self.tags.contains(tag))
    }

    async fn run_hooks(&self, hooks: &[Task], ctx: &TestContext) -> anyhow::Result<()> {
        for hook in hooks.iter().filter(|h| self.selected(h)) {
            if let Err(failure) = run_task(hook, ctx.clone()).await {
                anyhow::bail!("hook '{}' failed: {}", hook.name, failure.message);
            }
        }
        Ok(())
    }

    /// Run the selected cases. A failing hook aborts the suite with an error;
    /// a failing case is recorded and the suite continues.
    pub async fn run(
        &self,
        name: &str,
        description: &str,
        ctx: &TestContext,
    ) -> anyhow::Result<TestSuiteSummary> {
        let mut summary = TestSuiteSummary::empty(name, description);

        self.run_hooks(&self.before_all, ctx).await?;

        for case in self.cases.iter().filter(|c| self.selected(c)) {
            self.run_hooks(&self.before_each, ctx).await?;

            let started = Instant::now();
            let failure = run_task(case, ctx.clone()).await.err();
            let time = round_millis(started.elapsed().as_secs_f64() * 1000.0);

            summary.tests += 1;
            if failure.is_some() {
                summary.failures += 1;
            }
            summary.time = round_millis(summary.time + time);
            summary.testcases.push(TestCaseSummary {
                name: case.name.clone(),
                description: case.description.clone(),
                failure,
                time,
            });

            self.run_hooks(&self.after_each, ctx).await?;
        }

        self.run_hooks(&self.after_all, ctx).await?;
        Ok(summary)
    }
}

/// Run one task, converting errors and panics into a failure record
async fn run_task(task: &Task, ctx: TestContext) -> Result<(), TestFailure> {
    match AssertUnwindSafe((task.run)(ctx)).catch_unwind().await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            let kind = if e.downcast_ref::<AssertionError>().is_some() {
                "AssertionError"
            } else {
                "Error"
            };
            Err(TestFailure {
                kind: kind.to_string(),
                message: e.to_string(),
            })
        }
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "test task panicked".to_string());
            Err(TestFailure {
                kind: "Panic".to_string(),
                message,
            })
        }
    }
}

fn round_millis(ms: f64) -> f64 {
    (ms * 1000.0).round() / 1000.0
}

fn suite_module_path(name: &str) -> String {
    if name.ends_with(MODULE_EXTENSION) {
        name.to_string()
    } else {
        format!("{}{}", name, MODULE_EXTENSION)
    }
}

/// Run every requested suite for `tenant`.
///
/// A suite whose module cannot be imported, has no test suite export, or
/// whose hooks fail counts as one failure with an empty summary.
pub async fn run_tests(
    loader: &ModuleLoader,
    tenant: &Tenant,
    platform_repo: &dyn RepoProvider,
    request: TestRunRequest,
) -> TestRunSummary {
    let mut summary = TestRunSummary {
        name: request.name,
        description: request.description,
        tests: 0,
        failures: 0,
        time: 0.0,
        test_suites: Vec::new(),
    };
    let ctx = TestContext {
        params: request.params,
        assert: Assert,
    };

    for suite in request.test_suites {
        let module_path = suite_module_path(&suite.name);
        let outcome = match loader.import(tenant, platform_repo, &module_path).await {
            Ok(module) => match module.suite() {
                Some(register) => {
                    let mut runner = TestRunner::new(suite.tags.clone());
                    register(&mut runner);
                    runner.run(&suite.name, &suite.description, &ctx).await
                }
                None => Err(anyhow::anyhow!("module '{}' exports no test suite", module_path)),
            },
            Err(e) => Err(e.into()),
        };

        match outcome {
            Ok(suite_summary) => {
                debug!(
                    hostname = %tenant.hostname,
                    suite = %suite.name,
                    tests = suite_summary.tests,
                    failures = suite_summary.failures,
                    "Test suite finished"
                );
                summary.tests += suite_summary.tests;
                summary.failures += suite_summary.failures;
                summary.time = round_millis(summary.time + suite_summary.time);
                summary.test_suites.push(suite_summary);
            }
            Err(e) => {
                warn!(hostname = %tenant.hostname, suite = %suite.name, error = %e, "Test suite failed to run");
                summary.failures += 1;
                summary
                    .test_suites
                    .push(TestSuiteSummary::empty(&suite.name, &suite.description));
            }
        }
    }

    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn ctx() -> TestContext {
        TestContext {
            params: serde_json::json!({"base": 2}),
            assert: Assert,
        }
    }

    #[test]
    fn test_assert_messages() {
        assert!(Assert.equal(1, 1).is_ok());
        assert_eq!(
            Assert.equal("a", "b").unwrap_err().to_string(),
            "expected \"a\" to equal \"b\""
        );
        assert!(Assert.not_equal(1, 2).is_ok());
        assert!(Assert.is_true(false, "nope").is_err());
        assert_eq!(Assert.fail("boom").unwrap_err().0, "boom");
    }

    #[tokio::test]
    async fn test_run_records_failures_without_aborting() {
        let mut runner = TestRunner::new(vec!["math".to_string()]);
        runner
            .test_case("adds", "2 + 2", &["math"], |ctx| async move {
                let base = ctx.params["base"].as_i64().unwrap_or_default();
                ctx.assert.equal(base + 2, 4)?;
                Ok(())
            })
            .test_case("wrong", "fails an assertion", &[], |ctx| async move {
                ctx.assert.equal(1, 2)?;
                Ok(())
            })
            .test_case("errors", "returns an error", &["math"], |_| async move {
                anyhow::bail!("database unavailable")
            })
            .test_case("panics", "panics", &[], |_| async move {
                let fixtures: Vec<u32> = Vec::new();
                assert!(!fixtures.is_empty(), "exploded");
                Ok(())
            })
            .test_case("skipped", "other tag", &["slow"], |_| async move { Ok(()) });

        let summary = runner.run("math suite", "arithmetic", &ctx()).await.unwrap();

        assert_eq!(summary.tests, 4);
        assert_eq!(summary.failures, 3);
        assert_eq!(summary.testcases.len(), 4);
        assert!(summary.testcases[0].failure.is_none());
        assert_eq!(summary.testcases[1].failure.as_ref().unwrap().kind, "AssertionError");
        assert_eq!(summary.testcases[2].failure.as_ref().unwrap().kind, "Error");
        assert_eq!(
            summary.testcases[2].failure.as_ref().unwrap().message,
            "database unavailable"
        );
        let panicked = summary.testcases[3].failure.as_ref().unwrap();
        assert_eq!(panicked.kind, "Panic");
        assert_eq!(panicked.message, "exploded");
    }

    #[tokio::test]
    async fn test_hooks_run_around_selected_cases() {
        let counter = Arc::new(AtomicUsize::new(0));
        let (before, after, all) = (counter.clone(), counter.clone(), counter.clone());

        let mut runner = TestRunner::new(vec![]);
        runner
            .before_all("setup", "", &[], move |_| {
                let all = all.clone();
                async move {
                    all.fetch_add(100, Ordering::SeqCst);
                    Ok(())
                }
            })
            .before_each("reset", "", &[], move |_| {
                let before = before.clone();
                async move {
                    before.fetch_add(10, Ordering::SeqCst);
                    Ok(())
                }
            })
            .after_each("cleanup", "", &["tagged"], move |_| {
                let after = after.clone();
                async move {
                    after.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
            })
            .test_case("one", "", &[], |_| async { Ok(()) })
            .test_case("two", "", &[], |_| async { Ok(()) });

        let summary = runner.run("hooks", "", &ctx()).await.unwrap();
        assert_eq!(summary.tests, 2);
        // after_each is tagged and no tags were requested
        assert_eq!(counter.load(Ordering::SeqCst), 120);
    }

    #[tokio::test]
    async fn test_failing_hook_aborts_suite() {
        let mut runner = TestRunner::new(vec![]);
        runner
            .before_all("setup", "", &[], |_| async { anyhow::bail!("no fixtures") })
            .test_case("never", "", &[], |_| async { Ok(()) });

        let err = runner.run("broken", "", &ctx()).await.unwrap_err();
        assert!(err.to_string().contains("no fixtures"));
    }

    #[test]
    fn test_summary_serialization_shape() {
        let summary = TestRunSummary {
            name: "run".to_string(),
            description: String::new(),
            tests: 1,
            failures: 1,
            time: 1.5,
            test_suites: vec![TestSuiteSummary {
                name: "/app/tests/math".to_string(),
                description: String::new(),
                tests: 1,
                failures: 1,
                time: 1.5,
                testcases: vec![TestCaseSummary {
                    name: "adds".to_string(),
                    description: String::new(),
                    failure: Some(TestFailure {
                        kind: "AssertionError".to_string(),
                        message: "bad".to_string(),
                    }),
                    time: 1.5,
                }],
            }],
        };

        let json = serde_json::to_value(&summary).unwrap();
        assert_eq!(json["testSuites"][0]["testcases"][0]["failure"]["type"], "AssertionError");
        assert_eq!(json["testSuites"][0]["time"], 1.5);
    }

    #[test]
    fn test_run_request_defaults() {
        let request: TestRunRequest = serde_json::from_str(
            r#"{"name": "nightly", "testSuites": [{"name": "/app/tests/math", "tags": ["math"]}]}"#,
        )
        .unwrap();
        assert_eq!(request.test_suites.len(), 1);
        assert_eq!(request.test_suites[0].tags, vec!["math"]);
        assert!(request.params.is_null());
        assert_eq!(suite_module_path("/app/tests/math"), "/app/tests/math.ts");
        assert_eq!(suite_module_path("/app/tests/math.ts"), "/app/tests/math.ts");
    }

    #[test]
    fn test_round_millis() {
        assert_eq!(round_millis(1.23456), 1.235);
        assert_eq!(round_millis(0.0), 0.0);
    }
}
