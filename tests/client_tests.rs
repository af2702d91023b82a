
use std::sync::Arc;
use std::time::Duration;

use fleet_agent::config::ServerConfig;
use fleet_agent::error::AgentError;
use fleet_agent::remote::{ServerClient, TaskPoller, TaskReporter};
use fleet_agent::scheduler::{Task, TaskStatus, TaskType};
use mockito::{Matcher, Server};
use serde_json::json;
use test_harness::{remote_task, TestAgent};

fn client_for(server: &Server) -> ServerClient {
    ServerClient::new(&ServerConfig {
        url: format!("{}/", server.url()),
        agent_id: "agent-1".to_string(),
        machine_id: "gpu-01".to_string(),
        token: "t".to_string(),
        timeout_secs: 5,
    })
    .unwrap()
}

fn claimed_task(id: &str) -> serde_json::Value {
    json!({
        "id": id,
        "name": "train",
        "type": "python",
        "command": "python",
        "args": ["train.py"],
        "workdir": "",
        "env": null,
        "timeout": 600,
        "priority": 2,
        "max_retries": 0,
        "status": "assigned",
        "depends_on": null,
        "assigned_agent_id": "agent-1",
        "attempt_id": format!("att-{id}"),
        "lease_expires_at": "2099-01-01T00:00:00Z",
        "created_at": "2026-03-01T12:00:00.5Z",
        "assigned_at": "2026-03-01T12:00:01Z",
        "started_at": "0001-01-01T00:00:00Z",
        "ended_at": "0001-01-01T00:00:00Z"
    })
}

#[tokio::test]
async fn test_claim_parses_tasks() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v1/agent/tasks/claim")
        .match_header("authorization", "Bearer t")
        .match_body(Matcher::PartialJson(json!({
            "agent_id": "agent-1",
            "machine_id": "gpu-01",
            "limit": 4
        })))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(
            json!({
                "code": 0,
                "message": "ok",
                "data": { "tasks": [claimed_task("srv-1")] }
            })
            .to_string(),
        )
        .create_async()
        .await;

    let tasks = client_for(&server).claim_tasks(4).await.unwrap();
    mock.assert_async().await;

    assert_eq!(tasks.len(), 1);
    let task = &tasks[0];
    assert_eq!(task.id, "srv-1");
    assert_eq!(task.task_type, TaskType::Python);
    assert_eq!(task.status, TaskStatus::Assigned);
    assert_eq!(task.args, vec!["train.py"]);
    assert!(task.env.is_empty());
    assert!(task.depends_on.is_empty());
    assert!(task.started_at.is_none());
    assert!(task.ended_at.is_none());
    assert!(task.created_at.is_some());
    assert!(task.is_remote());
}

#[tokio::test]
async fn test_claim_with_null_data_is_empty() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/v1/agent/tasks/claim")
        .with_body(r#"{"code":0,"message":"ok","data":null}"#)
        .create_async()
        .await;

    let tasks = client_for(&server).claim_tasks(10).await.unwrap();
    assert!(tasks.is_empty());
}

#[tokio::test]
async fn test_report_start_posts_attempt() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v1/agent/tasks/srv-1/start")
        .match_header("authorization", "Bearer t")
        .match_body(Matcher::PartialJson(json!({
            "agent_id": "agent-1",
            "attempt_id": "att-1"
        })))
        .with_body(r#"{"code":0,"message":"ok"}"#)
        .create_async()
        .await;

    client_for(&server)
        .report_start("srv-1", "att-1")
        .await
        .unwrap();
    mock.assert_async().await;
}

#[tokio::test]
async fn test_renew_and_complete_bodies() {
    let mut server = Server::new_async().await;
    let renew = server
        .mock("POST", "/api/v1/agent/tasks/srv-1/lease/renew")
        .match_body(Matcher::PartialJson(json!({
            "attempt_id": "attempt-srv-1",
            "extend_sec": 300
        })))
        .with_body(r#"{"code":0}"#)
        .create_async()
        .await;
    let complete = server
        .mock("POST", "/api/v1/agent/tasks/srv-1/complete")
        .match_body(Matcher::PartialJson(json!({
            "attempt_id": "attempt-srv-1",
            "exit_code": 2,
            "stdout": "out",
            "stderr": "err",
            "error": "exit status 2"
        })))
        .with_body(r#"{"code":0}"#)
        .create_async()
        .await;

    let client = client_for(&server);
    client.renew_lease("srv-1", "attempt-srv-1").await.unwrap();

    let task = Task {
        status: TaskStatus::Failed,
        exit_code: 2,
        stdout: "out".to_string(),
        stderr: "err".to_string(),
        error: "exit status 2".to_string(),
        ..remote_task("srv-1", "false")
    };
    client.report_complete(&task).await.unwrap();

    renew.assert_async().await;
    complete.assert_async().await;
}

#[tokio::test]
async fn test_lease_codes_map_to_lease_invalid() {
    for code in [30001, 30003] {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("POST", "/api/v1/agent/tasks/srv-1/lease/renew")
            .with_body(json!({ "code": code, "message": "lease gone" }).to_string())
            .create_async()
            .await;

        let err = client_for(&server)
            .renew_lease("srv-1", "att-1")
            .await
            .unwrap_err();
        assert!(err.is_lease_invalid(), "code {code}: {err}");
        assert!(
            matches!(&err, AgentError::LeaseInvalid { task_id, message } if task_id == "srv-1" && message == "lease gone")
        );
    }
}

#[tokio::test]
async fn test_unknown_task_code() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/v1/agent/tasks/gone/start")
        .with_body(r#"{"code":30004,"message":"task not found"}"#)
        .create_async()
        .await;

    let err = client_for(&server)
        .report_start("gone", "att-1")
        .await
        .unwrap_err();
    assert!(matches!(err, AgentError::TaskNotFound(id) if id == "gone"));
}

#[tokio::test]
async fn test_other_codes_are_server_errors() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/v1/agent/tasks/claim")
        .with_body(r#"{"code":10001,"message":"bad request"}"#)
        .create_async()
        .await;

    let err = client_for(&server).claim_tasks(1).await.unwrap_err();
    assert!(!err.is_lease_invalid());
    assert!(matches!(err, AgentError::Server { code: 10001, message } if message == "bad request"));
}

#[tokio::test]
async fn test_non_json_error_uses_http_status() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/v1/agent/tasks/claim")
        .with_status(500)
        .with_body("upstream unavailable")
        .create_async()
        .await;

    let err = client_for(&server).claim_tasks(1).await.unwrap_err();
    assert!(matches!(err, AgentError::Server { code: 500, .. }), "{err}");
}

#[tokio::test]
async fn test_token_omitted_when_empty() {
    let mut server = Server::new_async().await;
    let mock = server
        .mock("POST", "/api/v1/agent/tasks/claim")
        .match_header("authorization", Matcher::Missing)
        .with_body(r#"{"code":0,"data":{"tasks":[]}}"#)
        .create_async()
        .await;

    let client = ServerClient::new(&ServerConfig {
        url: server.url(),
        agent_id: "agent-1".to_string(),
        ..ServerConfig::default()
    })
    .unwrap();
    assert!(client.claim_tasks(1).await.unwrap().is_empty());
    mock.assert_async().await;
}

#[tokio::test]
async fn test_poller_submits_claimed_tasks_once() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/v1/agent/tasks/claim")
        .with_body(
            json!({
                "code": 0,
                "data": { "tasks": [claimed_task("srv-1"), claimed_task("srv-2")] }
            })
            .to_string(),
        )
        .expect_at_least(2)
        .create_async()
        .await;

    // No workers, so claimed tasks stay queued.
    let agent = TestAgent::new(0);
    let poller = TaskPoller::new(
        Arc::new(client_for(&server)),
        agent.scheduler.clone(),
        Duration::from_secs(60),
        10,
    );

    assert_eq!(poller.poll_once().await.unwrap(), 2);
    assert_eq!(agent.scheduler.queue_status().pending, 2);
    let stored = agent.store.get("srv-1").unwrap();
    assert_eq!(stored.attempt_id, "att-srv-1");
    assert_eq!(stored.status, TaskStatus::Assigned);

    // Re-delivery of the same attempts is ignored.
    assert_eq!(poller.poll_once().await.unwrap(), 0);
    assert_eq!(agent.scheduler.queue_status().pending, 2);
}

#[tokio::test]
async fn test_poller_surfaces_claim_errors() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/v1/agent/tasks/claim")
        .with_status(503)
        .with_body("down")
        .create_async()
        .await;

    let agent = TestAgent::new(0);
    let poller = TaskPoller::new(
        Arc::new(client_for(&server)),
        agent.scheduler.clone(),
        Duration::from_secs(60),
        10,
    );

    assert!(poller.poll_once().await.is_err());
    assert_eq!(agent.scheduler.queue_status().pending, 0);
}

#[tokio::test]
async fn test_poller_never_reruns_finished_attempt() {
    let mut server = Server::new_async().await;
    let _mock = server
        .mock("POST", "/api/v1/agent/tasks/claim")
        .with_body(
            json!({
                "code": 0,
                "data": { "tasks": [claimed_task("srv-1"), claimed_task("srv-2")] }
            })
            .to_string(),
        )
        .create_async()
        .await;

    let agent = TestAgent::new(0);
    // srv-1 already ran under this attempt; its result is waiting for the syncer.
    let finished = Task {
        status: TaskStatus::Completed,
        attempt_id: "att-srv-1".to_string(),
        stdout: "done\n".to_string(),
        ended_at: Some(chrono::Utc::now()),
        ..Task::new("srv-1", "python")
    };
    agent.store.save(&finished).unwrap();

    let poller = TaskPoller::new(
        Arc::new(client_for(&server)),
        agent.scheduler.clone(),
        Duration::from_secs(60),
        10,
    );

    assert_eq!(poller.poll_once().await.unwrap(), 1);
    let queued: Vec<_> = agent
        .scheduler
        .queued_tasks()
        .into_iter()
        .map(|t| t.id)
        .collect();
    assert_eq!(queued, vec!["srv-2"]);
    assert_eq!(agent.store.get("srv-1").unwrap(), finished);
}
