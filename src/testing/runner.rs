//! Test runner implementation
//!
//! Executes a test tree depth-first, one test at a time, and reports every
//! step to subscribed observers. Cancellation is cooperative: the flag is
//! only checked between siblings, so an in-flight test always finishes.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use futures_util::FutureExt;
use tokio::sync::mpsc;

use crate::common::{Error, Result, Settings};

use super::context::{TestApi, TestRecord, NOT_IMPLEMENTED_MESSAGE};
use super::events::{NodeSnapshot, RunEvent};
use super::status::Status;
use super::tree::{BoxFuture, Group, HookKind, Node, Test, TestTree};

/// Lifecycle of a runner
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Running,
    Completed,
    Canceled,
    /// A hook failed and the run was abandoned
    Aborted,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RunState::Idle => "idle",
            RunState::Running => "running",
            RunState::Completed => "completed",
            RunState::Canceled => "canceled",
            RunState::Aborted => "aborted",
        })
    }
}

/// Handle that requests cancellation of a run
#[derive(Debug, Clone)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    /// Stop before the next sibling starts
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Outcome of a finished run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub state: RunState,
    /// Finished tests in execution order
    pub tests: Vec<NodeSnapshot>,
}

impl RunReport {
    /// Result of the test at `path`; `None` if it never ran
    pub fn get(&self, path: &str) -> Option<&NodeSnapshot> {
        self.tests.iter().find(|test| test.path == path)
    }

    /// Status of the test at `path`; `None` if it never ran
    pub fn status(&self, path: &str) -> Option<Status> {
        self.get(path)
            .and_then(|test| test.record.as_ref())
            .map(|record| record.status)
    }

    /// Number of tests that finished with `status`
    pub fn count(&self, status: Status) -> usize {
        self.tests
            .iter()
            .filter(|test| test.record.as_ref().map(|r| r.status) == Some(status))
            .count()
    }
}

/// Executes test trees with fixed settings
pub struct Runner {
    settings: Arc<Settings>,
    canceled: CancelHandle,
    state: Mutex<RunState>,
    listeners: Mutex<Vec<mpsc::UnboundedSender<RunEvent>>>,
}

impl Runner {
    /// Create a runner. The settings are passed to every executed test.
    pub fn new(settings: Settings) -> Self {
        Self::with_shared_settings(Arc::new(settings))
    }

    pub fn with_shared_settings(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            canceled: CancelHandle(Arc::new(AtomicBool::new(false))),
            state: Mutex::new(RunState::Idle),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Subscribe to run events
    ///
    /// The channel closes when the runner is dropped.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<RunEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .push(tx);
        rx
    }

    /// Handle for cancelling the current run from elsewhere
    pub fn cancel_handle(&self) -> CancelHandle {
        self.canceled.clone()
    }

    /// Request cancellation of the current run
    pub fn cancel(&self) {
        self.canceled.cancel();
    }

    pub fn is_canceled(&self) -> bool {
        self.canceled.is_canceled()
    }

    pub fn state(&self) -> RunState {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn set_state(&self, state: RunState) {
        *self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) = state;
    }

    /// Move to `Running`, rejecting a second concurrent run
    fn begin(&self) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *state == RunState::Running {
            return Err(Error::invalid_state("start a run", &state.to_string()));
        }
        *state = RunState::Running;
        Ok(())
    }

    fn emit(&self, event: RunEvent) {
        let mut listeners = self
            .listeners
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        listeners.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Run the node at `path` (the whole tree for `""`)
    ///
    /// A test addressed directly also runs its group's `before` and `after`
    /// hooks. A failing hook aborts the run and is returned as the error.
    pub async fn run(&self, tree: &TestTree, path: &str) -> Result<RunReport> {
        let located = tree
            .locate(path)
            .ok_or_else(|| Error::PathNotFound(path.to_string()))?;
        self.begin()?;

        let is_root = located.parent.is_none();
        tracing::info!(
            "Running {} ({} tests)",
            if is_root { "all tests" } else { located.node.name() },
            located.node.test_count()
        );

        if is_root {
            self.emit(RunEvent::Start);
        }

        let mut tests = Vec::new();
        let outcome = self
            .run_node(located.node, located.parent, true, &mut tests)
            .await;

        // A cancel requested before the run started applies to this run
        let canceled = self.canceled.0.swap(false, Ordering::SeqCst);
        let state = match &outcome {
            Err(_) => RunState::Aborted,
            Ok(()) if canceled => RunState::Canceled,
            Ok(()) => RunState::Completed,
        };
        self.set_state(state);

        if let Err(e) = outcome {
            tracing::error!("Run aborted: {}", e);
            return Err(e);
        }

        if is_root {
            self.emit(RunEvent::End);
        }

        Ok(RunReport { state, tests })
    }

    fn run_node<'a>(
        &'a self,
        node: &'a Node,
        scope: Option<&'a Group>,
        target: bool,
        tests: &'a mut Vec<NodeSnapshot>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            match node {
                Node::Group(group) => self.run_group(group, tests).await,
                Node::Test(test) => self.run_test(test, scope, target, tests).await,
            }
        })
    }

    async fn run_group(&self, group: &Group, tests: &mut Vec<NodeSnapshot>) -> Result<()> {
        tracing::debug!(path = %group.path, "Entering group '{}'", group.name);
        self.emit(RunEvent::GroupStart(NodeSnapshot::group(group)));

        run_hook(Some(group), HookKind::Before).await?;

        for child in &group.children {
            self.run_node(child, Some(group), false, tests).await?;
            if self.is_canceled() {
                tracing::info!(path = %group.path, "Run canceled, skipping remaining tests in '{}'", group.name);
                break;
            }
        }

        run_hook(Some(group), HookKind::After).await?;

        self.emit(RunEvent::GroupEnd(NodeSnapshot::group(group)));
        tracing::debug!(path = %group.path, "Leaving group '{}'", group.name);
        Ok(())
    }

    async fn run_test(
        &self,
        test: &Test,
        scope: Option<&Group>,
        target: bool,
        tests: &mut Vec<NodeSnapshot>,
    ) -> Result<()> {
        let api = TestApi::new(TestRecord::new(Utc::now()));
        self.emit(RunEvent::TestStart(NodeSnapshot::test(test, api.snapshot())));

        if target {
            run_hook(scope, HookKind::Before).await?;
        }
        run_hook(scope, HookKind::BeforeEach).await?;

        let outcome = match &test.body {
            Some(body) => Some(self.invoke(body, &api).await),
            None => {
                api.warn(NOT_IMPLEMENTED_MESSAGE);
                api.set_status(Status::NotImplemented);
                None
            }
        };
        api.finalize(outcome);

        let after_each = run_hook(scope, HookKind::AfterEach).await;
        let after = if target {
            run_hook(scope, HookKind::After).await
        } else {
            Ok(())
        };

        let snapshot = NodeSnapshot::test(test, api.snapshot());
        if let Some(record) = &snapshot.record {
            match &record.error {
                Some(error) => tracing::info!(path = %test.path, "'{}' failed: {}", test.name, error.message),
                None => tracing::debug!(path = %test.path, "'{}' {}", test.name, record.status),
            }
        }
        tests.push(snapshot.clone());
        self.emit(RunEvent::TestEnd(snapshot));

        after_each?;
        after
    }

    /// Call a test body, turning errors and panics into a failure message
    async fn invoke(&self, body: &super::tree::TestFn, api: &TestApi) -> std::result::Result<(), String> {
        let settings = Arc::clone(&self.settings);
        let future = std::panic::catch_unwind(AssertUnwindSafe(|| body(settings, api.clone())))
            .map_err(|panic| Error::TestPanicked(panic_message(panic.as_ref())).to_string())?;

        match AssertUnwindSafe(future).catch_unwind().await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(e.to_string()),
            Err(panic) => Err(Error::TestPanicked(panic_message(panic.as_ref())).to_string()),
        }
    }
}

/// Run a hook of the enclosing group, if it has one
async fn run_hook(scope: Option<&Group>, kind: HookKind) -> Result<()> {
    let Some(group) = scope else {
        return Ok(());
    };
    let Some(hook) = group.hooks.get(kind) else {
        return Ok(());
    };
    tracing::debug!(path = %group.path, "Running {} hook of '{}'", kind, group.name);
    hook()
        .await
        .map_err(|e| Error::hook_failed(kind, &group.name, &e.to_string()))
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_panic_message() {
        let payload: Box<dyn std::any::Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload.as_ref()), "boom");
        let payload: Box<dyn std::any::Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(payload.as_ref()), "bang");
        let payload: Box<dyn std::any::Any + Send> = Box::new(42);
        assert_eq!(panic_message(payload.as_ref()), "unknown panic payload");
    }

    #[tokio::test]
    async fn test_unknown_path_is_rejected() {
        let tree = TestTree::build(|root| {
            root.pending("only");
        });
        let runner = Runner::new(Settings::default());
        let err = runner.run(&tree, "3").await.unwrap_err();
        assert!(matches!(err, Error::PathNotFound(ref p) if p == "3"));
        assert_eq!(runner.state(), RunState::Idle);
    }

    #[tokio::test]
    async fn test_runner_is_reusable() {
        let tree = TestTree::build(|root| {
            root.test("ok", |_, _| async { Ok(()) });
        });
        let runner = Runner::new(Settings::default());
        let first = runner.run(&tree, "").await.unwrap();
        assert_eq!(first.state, RunState::Completed);
        let second = runner.run(&tree, "0").await.unwrap();
        assert_eq!(second.status("0"), Some(Status::Succeeded));
    }

    #[tokio::test]
    async fn test_cancel_before_run_is_honored() {
        let tree = TestTree::build(|root| {
            root.test("first", |_, _| async { Ok(()) });
            root.test("second", |_, _| async { Ok(()) });
        });
        let runner = Runner::new(Settings::default());
        runner.cancel();

        let report = runner.run(&tree, "").await.unwrap();
        assert_eq!(report.state, RunState::Canceled);
        assert_eq!(report.status("0"), Some(Status::Succeeded));
        assert_eq!(report.status("1"), None);
        assert!(!runner.is_canceled());

        let report = runner.run(&tree, "").await.unwrap();
        assert_eq!(report.state, RunState::Completed);
        assert_eq!(report.status("1"), Some(Status::Succeeded));
    }

    #[tokio::test]
    async fn test_cancel_flag_cleared_after_aborted_run() {
        let tree = TestTree::build(|root| {
            root.group("Authorization", |group| {
                group.before(|| async { Err(Error::Config("no token endpoint".into())) });
                group.test("never runs", |_, _| async { Ok(()) });
            });
            root.test("after", |_, _| async { Ok(()) });
        });
        let runner = Runner::new(Settings::default());
        runner.cancel();
        assert!(runner.run(&tree, "").await.is_err());
        assert_eq!(runner.state(), RunState::Aborted);
        assert!(!runner.is_canceled());

        let report = runner.run(&tree, "1").await.unwrap();
        assert_eq!(report.state, RunState::Completed);
    }
}
