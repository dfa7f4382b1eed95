//! Shared wiring for integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use taskpilot::adapters::assistant::ScriptedAssistant;
use taskpilot::adapters::sqlite::{apply_pending, open_memory_pool, SqliteTaskStore};
use taskpilot::domain::models::{Task, TaskStatus};
use taskpilot::domain::ports::{AssistantClient, Clock, SystemClock, TaskStore, TestGate};
use taskpilot::services::{
    CriteriaAnalyzer, EventFanOut, ExecutorConfig, TaskControl, TaskExecutor, UserInputQueue,
    WorkspaceManager,
};

pub struct TestEngine {
    pub store: Arc<dyn TaskStore>,
    pub assistant: Arc<ScriptedAssistant>,
    pub queue: Arc<UserInputQueue>,
    pub fanout: Arc<EventFanOut>,
    pub executor: Arc<TaskExecutor>,
    pub control: Arc<TaskControl>,
}

/// Engine over an in-memory database, a scripted assistant, and fast loop
/// timings.
pub async fn test_engine() -> TestEngine {
    test_engine_with_gate(None).await
}

pub async fn test_engine_with_gate(gate: Option<Arc<dyn TestGate>>) -> TestEngine {
    let pool = open_memory_pool().await.expect("in-memory pool");
    apply_pending(&pool).await.expect("schema migrations");

    let store: Arc<dyn TaskStore> = Arc::new(SqliteTaskStore::new(pool));
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let assistant = Arc::new(ScriptedAssistant::new());
    let assistant_port: Arc<dyn AssistantClient> = assistant.clone();
    let queue = Arc::new(UserInputQueue::new(store.clone(), clock));
    let fanout = Arc::new(EventFanOut::default());
    let criteria = Arc::new(CriteriaAnalyzer::new(assistant_port.clone()));

    let config = ExecutorConfig {
        stop_grace: Duration::from_secs(2),
        kill_grace: Duration::from_secs(2),
        storage_retry_window: Duration::from_secs(2),
        inter_turn_delay: Duration::from_millis(10),
        suspend_poll_interval: Duration::from_millis(25),
    };
    let mut executor = TaskExecutor::new(
        store.clone(),
        assistant_port,
        queue.clone(),
        fanout.clone(),
        criteria.clone(),
        config,
    );
    if let Some(gate) = gate {
        executor = executor.with_test_gate(gate);
    }
    let executor = Arc::new(executor);
    let workspace = Arc::new(WorkspaceManager::new(".isolated"));
    let control = Arc::new(TaskControl::new(
        store.clone(),
        workspace,
        executor.clone(),
        queue.clone(),
        fanout.clone(),
        criteria,
    ));

    TestEngine {
        store,
        assistant,
        queue,
        fanout,
        executor,
        control,
    }
}

/// Poll until the task satisfies `pred` or the timeout expires.
pub async fn wait_for_task(
    engine: &TestEngine,
    name: &str,
    pred: impl Fn(&Task) -> bool,
    timeout: Duration,
) -> Task {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let task = engine
            .control
            .get(name)
            .await
            .expect("task should exist while waiting");
        if pred(&task) {
            return task;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "task '{name}' never satisfied predicate; status={} error={:?}",
                task.status.as_str(),
                task.error_message
            );
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

pub async fn wait_for_terminal(engine: &TestEngine, name: &str) -> Task {
    wait_for_task(engine, name, |t| t.is_terminal(), Duration::from_secs(5)).await
}

pub async fn wait_for_status(engine: &TestEngine, name: &str, status: TaskStatus) -> Task {
    wait_for_task(engine, name, |t| t.status == status, Duration::from_secs(5)).await
}
