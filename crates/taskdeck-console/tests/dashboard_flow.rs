use chrono::Utc;
use serde_json::json;
use std::time::Duration;
use taskdeck_console::{
    ApiClient, CommandOutcome, Dashboard, DashboardEvent, PollIntervals, TaskCommand,
};
use taskdeck_core::{Revision, TaskId, TaskPriority, TaskRecord, TaskStatus, UpdateSource};
use taskdeck_engine::{AuthContext, Control, ReconcilerConfig, Update};
use tokio::time::timeout;
use url::Url;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WAIT: Duration = Duration::from_secs(5);

fn quiet_intervals(tasks: Duration) -> PollIntervals {
    PollIntervals {
        tasks,
        process_metrics: Duration::from_secs(3600),
        metrics: Duration::from_secs(3600),
    }
}

async fn task_list_requests(server: &MockServer) -> usize {
    server
        .received_requests()
        .await
        .expect("request recording enabled")
        .iter()
        .filter(|request| request.url.path() == "/api/tasks")
        .count()
}

async fn next_handled(dash: &mut Dashboard) {
    let event = timeout(WAIT, dash.next_event())
        .await
        .expect("event in time")
        .expect("event channel open");
    dash.handle_event(event);
}

fn dashboard(server: &MockServer) -> Dashboard {
    let base = Url::parse(&server.uri()).expect("mock server url");
    let api = ApiClient::new(base, AuthContext::with_token("tok")).expect("api client");
    Dashboard::new(api, ReconcilerConfig::default())
}

fn pushed(id: &str, status: TaskStatus, revision: u64) -> DashboardEvent {
    DashboardEvent::Update(Update::Delta {
        record: TaskRecord {
            id: TaskId::new(id),
            name: format!("job {id}"),
            priority: TaskPriority::Medium,
            status,
            threads_needed: 1,
            command: "sleep 60".to_string(),
            description: None,
            revision: Revision(revision),
            source: UpdateSource::Push,
        },
        source: UpdateSource::Push,
        observed_at: Utc::now(),
    })
}

/// Feeds events into the dashboard until a command outcome arrives.
async fn drain_until_outcome(dash: &mut Dashboard) -> CommandOutcome {
    timeout(WAIT, async {
        loop {
            let event = dash.next_event().await.expect("event channel open");
            if let DashboardEvent::Command(outcome) = &event {
                let outcome = outcome.clone();
                dash.handle_event(event);
                return outcome;
            }
            dash.handle_event(event);
        }
    })
    .await
    .expect("command finished in time")
}

#[tokio::test]
async fn pause_control_applies_the_api_response() {
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/api/tasks/7/status"))
        .and(query_param("status", "PAUSED"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": 7,
            "name": "job 7",
            "status": "PAUSED",
            "revision": 4
        })))
        .expect(1)
        .mount(&server)
        .await;

    let mut dash = dashboard(&server);
    dash.handle_event(pushed("7", TaskStatus::Running, 3));
    dash.control_selected(Control::Pause);
    assert_eq!(dash.status_note(), Some("set 7 PAUSED..."));

    let outcome = drain_until_outcome(&mut dash).await;
    assert_eq!(
        outcome,
        CommandOutcome::Applied {
            command: "set 7 PAUSED".to_string(),
            task_id: TaskId::new("7"),
        }
    );
    let node = dash.selected_node().expect("node");
    assert_eq!(node.status, TaskStatus::Paused);
    assert_eq!(node.source, UpdateSource::LocalCommand);
    assert!(node.has_control(Control::Resume));
    assert_eq!(dash.status_note(), Some("set 7 PAUSED: ok"));

    // A late push echo of the old state does not undo the command.
    dash.handle_event(pushed("7", TaskStatus::Running, 3));
    assert_eq!(dash.selected_node().map(|node| node.status), Some(TaskStatus::Paused));
}

#[tokio::test]
async fn failed_command_leaves_the_task_untouched() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/tasks/3"))
        .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
        .mount(&server)
        .await;

    let mut dash = dashboard(&server);
    dash.handle_event(pushed("3", TaskStatus::Failed, 2));
    dash.control_selected(Control::Delete);

    match drain_until_outcome(&mut dash).await {
        CommandOutcome::Failed { command, error } => {
            assert_eq!(command, "delete 3");
            assert!(error.contains("500"), "error was {error}");
        }
        other => panic!("unexpected outcome: {other:?}"),
    }
    assert_eq!(dash.view().len(), 1);
    assert!(dash
        .status_note()
        .is_some_and(|note| note.starts_with("delete 3 failed")));
}

#[tokio::test]
async fn confirmed_delete_detaches_the_node() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/tasks/3"))
        .respond_with(ResponseTemplate::new(204))
        .expect(1)
        .mount(&server)
        .await;

    let mut dash = dashboard(&server);
    dash.handle_event(pushed("3", TaskStatus::Completed, 2));
    dash.dispatch(TaskCommand::Delete(TaskId::new("3")));

    let outcome = drain_until_outcome(&mut dash).await;
    assert!(matches!(outcome, CommandOutcome::Applied { .. }));
    assert!(dash.view().is_empty());
    assert!(!dash.store().contains(&TaskId::new("3")));

    // The removed terminal task stays gone when an old copy is pushed again.
    dash.handle_event(pushed("3", TaskStatus::Completed, 2));
    assert!(dash.view().is_empty());
}

#[tokio::test]
async fn pollers_fill_the_view_and_stop_on_shutdown() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "name": "a", "status": "RUNNING", "revision": 1},
            {"id": 2, "name": "b", "status": "PENDING", "revision": 1}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/process-metrics"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"taskId": 1, "processName": "a", "cpuUsage": 3.5, "memoryUsage": 20.0}
        ])))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/metrics"))
        .respond_with(ResponseTemplate::new(200).set_body_string("null"))
        .mount(&server)
        .await;

    let mut dash = dashboard(&server);
    dash.start_polling(PollIntervals {
        tasks: Duration::from_millis(20),
        process_metrics: Duration::from_millis(20),
        metrics: Duration::from_millis(20),
    });
    assert_eq!(dash.background_tasks(), 3);

    timeout(WAIT, async {
        while dash.view().len() < 2 || dash.view().metric_rows().is_empty() {
            let event = dash.next_event().await.expect("event channel open");
            dash.handle_event(event);
        }
    })
    .await
    .expect("polls arrived in time");

    assert!(dash.store().contains(&TaskId::new("1")));
    assert_eq!(dash.view().metric_rows()[0].key, "metric-1");

    dash.shutdown().await;
    assert_eq!(dash.background_tasks(), 0);
}

#[tokio::test]
async fn failed_task_poll_keeps_last_good_state_and_retries() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "name": "a", "status": "RUNNING", "revision": 1}
        ])))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/tasks"))
        .respond_with(ResponseTemplate::new(500).set_body_string("scheduler down"))
        .up_to_n_times(1)
        .with_priority(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "name": "a", "status": "RUNNING", "revision": 1},
            {"id": 2, "name": "b", "status": "PENDING", "revision": 1}
        ])))
        .with_priority(3)
        .mount(&server)
        .await;

    let mut dash = dashboard(&server);
    dash.start_polling(quiet_intervals(Duration::from_millis(30)));

    // Failed polls emit nothing, so the next update is the post-failure snapshot.
    next_handled(&mut dash).await;
    assert_eq!(dash.store().len(), 1);
    assert!(dash.store().contains(&TaskId::new("1")));

    next_handled(&mut dash).await;
    assert_eq!(dash.store().len(), 2);
    assert!(dash.store().contains(&TaskId::new("1")));
    assert!(task_list_requests(&server).await >= 3);

    dash.shutdown().await;
}

#[tokio::test]
async fn refresh_during_in_flight_poll_is_not_queued() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tasks"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!([]))
                .set_delay(Duration::from_millis(400)),
        )
        .mount(&server)
        .await;

    let mut dash = dashboard(&server);
    dash.handle_event(pushed("1", TaskStatus::Running, 1));
    dash.start_polling(quiet_intervals(Duration::from_secs(3600)));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(dash.refresh());

    let _ = timeout(Duration::from_millis(1000), async {
        loop {
            let Some(event) = dash.next_event().await else {
                break;
            };
            dash.handle_event(event);
        }
    })
    .await;

    assert_eq!(task_list_requests(&server).await, 1);
    // One empty snapshot is a single miss; the task survives it.
    assert!(dash.store().contains(&TaskId::new("1")));

    dash.shutdown().await;
}

#[tokio::test]
async fn refresh_polls_an_idle_kind_at_once() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/tasks"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([
            {"id": 1, "name": "a", "status": "RUNNING", "revision": 1}
        ])))
        .mount(&server)
        .await;

    let mut dash = dashboard(&server);
    assert!(!dash.refresh());
    dash.start_polling(quiet_intervals(Duration::from_secs(3600)));
    next_handled(&mut dash).await;
    assert!(dash.store().contains(&TaskId::new("1")));

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(dash.refresh());
    timeout(WAIT, async {
        while task_list_requests(&server).await < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("refresh reached the task poller");

    dash.shutdown().await;
}
