
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use fleet_agent::error::AgentError;
use fleet_agent::scheduler::{QueueStatus, Task, TaskStatus};
use fleet_agent::store::TaskStore;
use test_harness::{
    assert_eventually, expect_status, remote_task, wait_for, wait_for_status, RecordingReporter,
    ReportCall, TestAgent,
};

#[tokio::test]
async fn test_submit_sets_local_defaults() {
    let agent = TestAgent::new(0);
    let task = Task {
        status: TaskStatus::Running,
        ..Task::new("", "echo hi")
    };

    let submitted = agent.scheduler.submit(task).await.unwrap();

    assert!(uuid::Uuid::parse_str(&submitted.id).is_ok());
    assert_eq!(submitted.status, TaskStatus::Pending);
    assert!(submitted.created_at.is_some());

    let stored = agent.scheduler.get_task(&submitted.id).unwrap();
    assert_eq!(stored, submitted);
    assert_eq!(agent.scheduler.queue_status().pending, 1);
}

#[tokio::test]
async fn test_submit_keeps_caller_id_and_created_at() {
    let agent = TestAgent::new(0);
    let created = chrono::Utc::now() - chrono::Duration::hours(1);
    let task = Task {
        created_at: Some(created),
        ..Task::new("mine", "echo hi")
    };

    let submitted = agent.scheduler.submit(task).await.unwrap();

    assert_eq!(submitted.id, "mine");
    assert_eq!(submitted.created_at, Some(created));
}

#[tokio::test]
async fn test_submit_remote_task_untouched() {
    let agent = TestAgent::new(0);
    let task = Task {
        created_at: None,
        ..remote_task("srv-1", "echo hi")
    };

    let submitted = agent.scheduler.submit(task.clone()).await.unwrap();

    assert_eq!(submitted, task);
    assert_eq!(submitted.status, TaskStatus::Assigned);
    assert!(submitted.created_at.is_none());
    assert_eq!(agent.store.get("srv-1").unwrap(), task);
}

#[tokio::test]
async fn test_submit_rejects_empty_command() {
    let agent = TestAgent::new(0);
    let err = agent
        .scheduler
        .submit(Task::new("t1", "   "))
        .await
        .unwrap_err();

    assert!(matches!(err, AgentError::InvalidTask(_)));
    assert!(matches!(
        agent.scheduler.get_task("t1"),
        Err(AgentError::TaskNotFound(_))
    ));
}

#[tokio::test]
async fn test_get_unknown_task() {
    let agent = TestAgent::new(0);
    assert!(matches!(
        agent.scheduler.get_task("missing"),
        Err(AgentError::TaskNotFound(_))
    ));
}

#[tokio::test]
async fn test_queue_status_reports_capacity() {
    let agent = TestAgent::new(3);
    assert_eq!(
        agent.scheduler.queue_status(),
        QueueStatus {
            pending: 0,
            running: 0,
            capacity: 3
        }
    );
}

#[tokio::test]
async fn test_cancel_queued_task_with_no_workers() {
    let agent = TestAgent::new(0);
    agent.scheduler.start().await.unwrap();
    agent
        .scheduler
        .submit(Task::new("t1", "echo never"))
        .await
        .unwrap();

    assert!(agent.scheduler.cancel_task("t1").await.unwrap());

    let task = agent.scheduler.get_task("t1").unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(agent.scheduler.queue_status().pending, 0);

    // Nothing left to cancel.
    assert!(!agent.scheduler.cancel_task("t1").await.unwrap());
    agent.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_cancel_unknown_task() {
    let agent = TestAgent::new(1);
    assert!(!agent.scheduler.cancel_task("missing").await.unwrap());
}

#[tokio::test]
async fn test_executes_submitted_task() {
    let agent = TestAgent::new(2);
    agent.scheduler.start().await.unwrap();

    agent
        .scheduler
        .submit(Task::new("t1", "echo hello"))
        .await
        .unwrap();

    let task = expect_status(&agent.store, "t1", TaskStatus::Completed).await;
    assert_eq!(task.stdout, "hello\n");
    assert_eq!(task.exit_code, 0);
    assert!(task.started_at.is_some());
    assert!(task.ended_at >= task.started_at);
    agent.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_failed_task_without_retries() {
    let agent = TestAgent::new(1);
    agent.scheduler.start().await.unwrap();

    agent
        .scheduler
        .submit(Task::new("t1", "exit 3"))
        .await
        .unwrap();

    let task = expect_status(&agent.store, "t1", TaskStatus::Failed).await;
    assert_eq!(task.exit_code, 3);
    assert_eq!(task.error, "exit status 3");
    assert_eq!(task.retry_count, 0);
    agent.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_runs_in_priority_order() {
    let agent = TestAgent::new(1);
    let log = agent.scratch("order.log");

    for (id, priority) in [("c", 3), ("a", 1), ("b", 2)] {
        let task = Task {
            priority,
            ..Task::new(id, format!("echo {id} >> {log}"))
        };
        agent.scheduler.submit(task).await.unwrap();
    }
    agent.scheduler.start().await.unwrap();

    for id in ["a", "b", "c"] {
        expect_status(&agent.store, id, TaskStatus::Completed).await;
    }
    let order = std::fs::read_to_string(&log).unwrap();
    assert_eq!(order, "a\nb\nc\n");
    agent.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_concurrency_never_exceeds_workers() {
    let agent = TestAgent::new(2);
    agent.scheduler.start().await.unwrap();

    for i in 0..5 {
        agent
            .scheduler
            .submit(Task::new(format!("t{i}"), "sleep 0.3"))
            .await
            .unwrap();
    }

    let max_running = Arc::new(AtomicUsize::new(0));
    let done = wait_for(
        || async {
            let running = agent.scheduler.queue_status().running;
            max_running.fetch_max(running, Ordering::SeqCst);
            (0..5).all(|i| {
                agent
                    .store
                    .get(&format!("t{i}"))
                    .map(|t| t.status == TaskStatus::Completed)
                    .unwrap_or(false)
            })
        },
        Duration::from_secs(10),
        Duration::from_millis(10),
    )
    .await;

    assert!(done, "not all tasks completed");
    let max = max_running.load(Ordering::SeqCst);
    assert!(max <= 2, "saw {max} tasks running at once");
    assert!(max >= 1);
    agent.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_retry_until_exhausted() {
    let agent = TestAgent::new(1);
    let runs = agent.scratch("runs.log");
    agent.scheduler.start().await.unwrap();

    let task = Task {
        max_retries: 2,
        retry_delay: 1,
        ..Task::new("flaky", format!("echo run >> {runs}; exit 1"))
    };
    agent.scheduler.submit(task).await.unwrap();

    let task = expect_status(&agent.store, "flaky", TaskStatus::Failed).await;
    assert_eq!(task.retry_count, 2);
    assert_eq!(task.error, "exit status 1");

    let count = std::fs::read_to_string(&runs).unwrap().lines().count();
    assert_eq!(count, 3);
    agent.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_retry_then_succeed() {
    let agent = TestAgent::new(1);
    let marker = agent.scratch("attempted");
    agent.scheduler.start().await.unwrap();

    let task = Task {
        max_retries: 3,
        retry_delay: 1,
        ..Task::new(
            "second-time",
            format!("test -f {marker} || {{ touch {marker}; exit 1; }}"),
        )
    };
    agent.scheduler.submit(task).await.unwrap();

    // Between attempts the record is pending again with results cleared.
    assert!(
        wait_for(
            || async {
                agent
                    .store
                    .get("second-time")
                    .map(|t| t.status == TaskStatus::Pending && t.retry_count == 1)
                    .unwrap_or(false)
            },
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await
    );
    let waiting = agent.store.get("second-time").unwrap();
    assert!(waiting.error.is_empty());
    assert!(waiting.ended_at.is_none());

    let task = expect_status(&agent.store, "second-time", TaskStatus::Completed).await;
    assert_eq!(task.retry_count, 1);
    assert!(task.error.is_empty());
    agent.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_cancel_during_retry_wait() {
    let agent = TestAgent::new(1);
    agent.scheduler.start().await.unwrap();

    let task = Task {
        max_retries: 3,
        retry_delay: 2,
        ..Task::new("t1", "exit 1")
    };
    agent.scheduler.submit(task).await.unwrap();

    assert!(
        wait_for(
            || async {
                agent
                    .store
                    .get("t1")
                    .map(|t| t.retry_count == 1)
                    .unwrap_or(false)
            },
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await
    );
    assert!(agent.scheduler.cancel_task("t1").await.unwrap());

    // The retry timer fires but must not resurrect the task.
    tokio::time::sleep(Duration::from_secs(3)).await;
    let task = agent.store.get("t1").unwrap();
    assert_eq!(task.status, TaskStatus::Cancelled);
    assert_eq!(task.retry_count, 1);
    agent.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_cancel_running_task_is_not_retried() {
    let agent = TestAgent::new(1);
    agent.scheduler.start().await.unwrap();

    let task = Task {
        max_retries: 3,
        retry_delay: 1,
        ..Task::new("long", "sleep 30")
    };
    agent.scheduler.submit(task).await.unwrap();
    expect_status(&agent.store, "long", TaskStatus::Running).await;

    // The record turns running just before the process is registered.
    assert!(
        wait_for(
            || async { agent.scheduler.cancel_task("long").await.unwrap() },
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .await
    );

    let task = expect_status(&agent.store, "long", TaskStatus::Cancelled).await;
    assert_eq!(task.retry_count, 0);
    assert_eq!(task.error, "cancelled");
    agent.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_dependency_gates_execution() {
    let agent = TestAgent::new(2);
    agent.scheduler.start().await.unwrap();

    let child = Task {
        depends_on: vec!["parent".to_string()],
        ..Task::new("child", "echo child")
    };
    agent.scheduler.submit(child).await.unwrap();

    // The parent does not exist yet, so the child waits in the queue.
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(agent.store.get("child").unwrap().status, TaskStatus::Pending);
    assert_eq!(agent.scheduler.queue_status().pending, 1);

    agent
        .scheduler
        .submit(Task::new("parent", "sleep 0.2"))
        .await
        .unwrap();

    let parent = expect_status(&agent.store, "parent", TaskStatus::Completed).await;
    let child = expect_status(&agent.store, "child", TaskStatus::Completed).await;
    assert!(child.started_at >= parent.ended_at);
    agent.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_failed_dependency_fails_dependent() {
    let agent = TestAgent::new(1);
    agent.scheduler.start().await.unwrap();

    agent
        .scheduler
        .submit(Task::new("parent", "exit 2"))
        .await
        .unwrap();
    expect_status(&agent.store, "parent", TaskStatus::Failed).await;

    let child = Task {
        depends_on: vec!["parent".to_string()],
        ..Task::new("child", "echo unreachable")
    };
    agent.scheduler.submit(child).await.unwrap();

    let child = expect_status(&agent.store, "child", TaskStatus::Failed).await;
    assert_eq!(child.error, "dependency parent did not complete");
    assert!(child.stdout.is_empty());
    agent.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_waits_for_running_tasks() {
    let agent = TestAgent::new(1);
    agent.scheduler.start().await.unwrap();

    agent
        .scheduler
        .submit(Task::new("t1", "sleep 0.5; echo done"))
        .await
        .unwrap();
    expect_status(&agent.store, "t1", TaskStatus::Running).await;

    agent.scheduler.shutdown().await;
    assert!(agent.store.is_closed());

    let reopened = TaskStore::open(&agent.db_path).unwrap();
    let task = reopened.get("t1").unwrap();
    assert_eq!(task.status, TaskStatus::Completed);
    assert_eq!(task.stdout, "done\n");
}

#[tokio::test]
async fn test_no_dispatch_after_shutdown() {
    let agent = TestAgent::new(1);
    agent.scheduler.start().await.unwrap();
    agent.scheduler.shutdown().await;

    // The store is closed, so submission fails instead of queueing silently.
    let err = agent
        .scheduler
        .submit(Task::new("late", "echo late"))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::StoreClosed));
    assert!(!wait_for_status(
        &agent.store,
        "late",
        TaskStatus::Completed,
        Duration::from_millis(200)
    )
    .await);
}

#[tokio::test]
async fn test_retry_without_delay_uses_configured_default() {
    // The harness config sets a 1s default retry delay.
    let agent = TestAgent::new(1);
    agent.scheduler.start().await.unwrap();

    let task = Task {
        max_retries: 1,
        retry_delay: 0,
        ..Task::new("no-delay", "exit 1")
    };
    agent.scheduler.submit(task).await.unwrap();

    assert!(
        wait_for(
            || async {
                agent
                    .store
                    .get("no-delay")
                    .map(|t| t.status == TaskStatus::Failed && t.retry_count == 1)
                    .unwrap_or(false)
            },
            Duration::from_secs(5),
            Duration::from_millis(20),
        )
        .await,
        "retry did not follow the configured default delay"
    );

    agent.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_resubmit_replaces_queued_attempt() {
    let reporter = RecordingReporter::new();
    let agent = TestAgent::with_reporter(1, reporter.clone());
    agent.scheduler.start().await.unwrap();

    // Keep the only worker busy while the attempt is re-issued.
    agent
        .scheduler
        .submit(Task::new("blocker", "sleep 0.5"))
        .await
        .unwrap();
    expect_status(&agent.store, "blocker", TaskStatus::Running).await;

    let first = Task {
        attempt_id: "a1".to_string(),
        ..remote_task("r1", "echo hi")
    };
    let second = Task {
        attempt_id: "a2".to_string(),
        ..remote_task("r1", "echo hi")
    };
    agent.scheduler.submit(first).await.unwrap();
    agent.scheduler.submit(second).await.unwrap();

    let queued: Vec<_> = agent
        .scheduler
        .queued_tasks()
        .into_iter()
        .map(|t| (t.id, t.attempt_id))
        .collect();
    assert_eq!(queued, vec![("r1".to_string(), "a2".to_string())]);

    let done = expect_status(&agent.store, "r1", TaskStatus::Completed).await;
    assert_eq!(done.attempt_id, "a2");
    assert_eventually(
        || async { agent.store.get("r1").unwrap().synced },
        Duration::from_secs(5),
        "completion never reported",
    )
    .await;

    let calls = reporter.calls();
    assert!(!calls.is_empty());
    for call in calls {
        let attempt = match call {
            ReportCall::Start { attempt_id, .. }
            | ReportCall::Renew { attempt_id, .. }
            | ReportCall::Complete { attempt_id, .. } => attempt_id,
        };
        assert_eq!(attempt, "a2");
    }

    agent.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_resubmit_while_running_refused() {
    let agent = TestAgent::new(1);
    agent.scheduler.start().await.unwrap();

    agent
        .scheduler
        .submit(Task::new("long", "sleep 30"))
        .await
        .unwrap();
    expect_status(&agent.store, "long", TaskStatus::Running).await;

    let err = agent
        .scheduler
        .submit(Task::new("long", "echo replaced"))
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::AlreadyRunning(id) if id == "long"));
    assert_eq!(agent.store.get("long").unwrap().command, "sleep 30");

    assert!(agent.scheduler.cancel_task("long").await.unwrap());
    expect_status(&agent.store, "long", TaskStatus::Cancelled).await;
    agent.scheduler.shutdown().await;
}
