use serde_json::json;
use taskdeck_console::{ApiClient, ApiError, PollKind, PollingClient};
use taskdeck_core::{CreateTaskRequest, TaskId, TaskPriority, TaskStatus, UpdateSource};
use taskdeck_engine::{AuthContext, SnapshotBatch, Update};
use url::Url;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer, auth: AuthContext) -> ApiClient {
    let base = Url::parse(&server.uri()).expect("mock server url");
    ApiClient::new(base, auth).expect("api client")
}

fn task_json(id: u64, status: &str, revision: u64) -> serde_json::Value {
    json!({
        "id": id,
        "name": format!("job-{id}"),
        "priority": "HIGH",
        "status": status,
        "threadsNeeded": 2,
        "command": "sleep 30",
        "revision": revision
    })
}

#[tokio::test]
async fn task_list_sends_bearer_and_drops_malformed_rows() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tasks"))
        .and(header("Authorization", "Bearer tok-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            task_json(1, "RUNNING", 4),
            {"name": "no id here", "status": "RUNNING"},
            {"id": "3", "status": "PAUSED", "updatedAt": "2024-05-01T10:00:00"}
        ])))
        .expect(1)
        .mount(&server)
        .await;

    let api = client(&server, AuthContext::with_token("tok-1"));
    let report = api.fetch_tasks().await.expect("task list");

    assert_eq!(report.items.len(), 2);
    assert_eq!(report.errors.len(), 1);
    let first = &report.items[0];
    assert_eq!(first.id, TaskId::new("1"));
    assert_eq!(first.status, TaskStatus::Running);
    assert_eq!(first.priority, TaskPriority::High);
    assert_eq!(first.source, UpdateSource::Poll);
    assert_eq!(first.revision.0, 4);
    let second = &report.items[1];
    assert_eq!(second.id, TaskId::new("3"));
    assert!(second.revision.0 > 0);
}

#[tokio::test]
async fn missing_token_sends_no_request() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .expect(0)
        .mount(&server)
        .await;

    let api = client(&server, AuthContext::new());
    let err = api.fetch_tasks().await.expect_err("no token");
    assert!(matches!(err, ApiError::Unauthenticated));
}

#[tokio::test]
async fn status_change_is_a_put_with_query_and_yields_local_record() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/tasks/7/status"))
        .and(query_param("status", "PAUSED"))
        .respond_with(ResponseTemplate::new(200).set_body_json(task_json(7, "PAUSED", 12)))
        .expect(1)
        .mount(&server)
        .await;

    let api = client(&server, AuthContext::with_token("tok"));
    let record = api
        .update_status(&TaskId::new("7"), TaskStatus::Paused)
        .await
        .expect("status change");

    assert_eq!(record.status, TaskStatus::Paused);
    assert_eq!(record.source, UpdateSource::LocalCommand);
    assert_eq!(record.revision.0, 12);
}

#[tokio::test]
async fn rejected_command_reports_status_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/tasks/7/status"))
        .respond_with(ResponseTemplate::new(409).set_body_string("task already completed\n"))
        .mount(&server)
        .await;

    let api = client(&server, AuthContext::with_token("tok"));
    let err = api
        .update_status(&TaskId::new("7"), TaskStatus::Running)
        .await
        .expect_err("conflict");

    match err {
        ApiError::Status { status, body } => {
            assert_eq!(status, 409);
            assert_eq!(body, "task already completed");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn create_posts_camel_case_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/tasks"))
        .and(body_json(json!({
            "name": "etl",
            "priority": "CRITICAL",
            "threadsNeeded": 4,
            "command": "run.sh"
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 42,
            "name": "etl",
            "priority": "CRITICAL",
            "status": "PENDING",
            "threadsNeeded": 4,
            "command": "run.sh"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let api = client(&server, AuthContext::with_token("tok"));
    let request = CreateTaskRequest {
        name: "etl".to_string(),
        priority: TaskPriority::Critical,
        threads_needed: 4,
        command: "run.sh".to_string(),
    };
    let record = api.create_task(&request).await.expect("created");

    assert_eq!(record.id, TaskId::new("42"));
    assert_eq!(record.status, TaskStatus::Pending);
    assert_eq!(record.source, UpdateSource::LocalCommand);
}

#[tokio::test]
async fn delete_targets_the_task_path() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/tasks/9"))
        .and(header("Authorization", "Bearer tok"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let api = client(&server, AuthContext::with_token("tok"));
    api.delete_task(&TaskId::new("9")).await.expect("deleted");
}

#[tokio::test]
async fn system_metrics_take_newest_of_a_list() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/metrics"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"activeTasks": 1, "cpuUsage": 10.0, "threadPoolSize": 8, "queueSize": 0, "timestamp": "2024-05-01T10:00:00"},
            {"activeTasks": 3, "cpuUsage": 20.0, "threadPoolSize": 8, "queueSize": 2, "timestamp": "2024-05-01T10:00:05"}
        ])))
        .mount(&server)
        .await;

    let api = client(&server, AuthContext::with_token("tok"));
    let metrics = api
        .fetch_system_metrics()
        .await
        .expect("metrics")
        .expect("non-empty");
    assert_eq!(metrics.active_tasks, 3);
}

#[tokio::test]
async fn poll_wraps_process_metrics_in_a_snapshot() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/process-metrics"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"taskId": 1, "processName": "worker", "pid": 311, "cpuUsage": 12.5, "memoryUsage": 64.0},
            {"taskId": 2, "processName": "broken", "cpuUsage": -1.0, "memoryUsage": 1.0}
        ])))
        .mount(&server)
        .await;

    let poller = PollingClient::new(client(&server, AuthContext::with_token("tok")));
    let update = poller.poll(PollKind::ProcessMetrics).await.expect("poll");

    match update {
        Update::Snapshot {
            batch: SnapshotBatch::ProcessMetrics(samples),
            ..
        } => {
            assert_eq!(samples.len(), 1);
            assert_eq!(samples[0].task_id, TaskId::new("1"));
            assert_eq!(samples[0].process_name, "worker");
        }
        other => panic!("unexpected update: {other:?}"),
    }
}
