use std::sync::Arc;
use std::time::Duration;

use jobpilot::adapters::SimulatedApi;
use jobpilot::core::{
    ApiError, AttachMode, JobKind, JobStatus, JobTracker, PollSettings, StatusResponse,
    TrackerEvent, TrackerSlots,
};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const TICK: Duration = Duration::from_millis(10);
const WAIT: Duration = Duration::from_secs(2);

fn tracker(api: &SimulatedApi) -> JobTracker {
    JobTracker::new(Arc::new(api.clone()), PollSettings::uniform(TICK))
}

async fn events_until_terminal(rx: &mut mpsc::Receiver<TrackerEvent>) -> Vec<TrackerEvent> {
    let mut events = Vec::new();
    loop {
        let event = timeout(WAIT, rx.recv())
            .await
            .expect("timeout waiting for tracker event")
            .expect("tracker channel closed");
        let done = event.is_terminal();
        events.push(event);
        if done {
            return events;
        }
    }
}

#[tokio::test]
async fn test_job_completes_and_polling_stops() {
    let api = SimulatedApi::new();
    api.script_job(
        "gen-1",
        vec![
            StatusResponse::with_status(JobStatus::Processing),
            StatusResponse::with_status(JobStatus::Processing).logs("50%"),
            StatusResponse::succeeded(json!({"url": "img/42.png"})),
        ],
    );
    let (tx, mut rx) = mpsc::channel(32);

    let handle = tracker(&api).start("gen-1", JobKind::Generation, tx);
    let events = events_until_terminal(&mut rx).await;

    match &events[0] {
        TrackerEvent::Attached { mode, status, .. } => {
            assert_eq!(*mode, AttachMode::Starting);
            assert_eq!(*status, JobStatus::Starting);
        }
        other => panic!("expected Attached first, got {other:?}"),
    }
    match events.last() {
        Some(TrackerEvent::Completed { job_id, result }) => {
            assert_eq!(job_id, "gen-1");
            assert_eq!(result, &json!({"url": "img/42.png"}));
        }
        other => panic!("expected Completed last, got {other:?}"),
    }

    let job = timeout(WAIT, handle.wait()).await.expect("timeout waiting for job");
    assert_eq!(job.status, JobStatus::Succeeded);
    assert!(job.result.is_some());
    assert!(job.error.is_none());

    sleep(TICK * 5).await;
    assert_eq!(api.poll_count("gen-1"), 3);
    assert!(!handle.is_active());
}

#[tokio::test]
async fn test_first_poll_is_immediate() {
    let api = SimulatedApi::new();
    api.script_job("u1", vec![StatusResponse::succeeded(json!("out/u1.png"))]);
    let (tx, _rx) = mpsc::channel(32);

    let tracker = JobTracker::new(
        Arc::new(api.clone()),
        PollSettings::uniform(Duration::from_secs(60)),
    );
    let handle = tracker.start("u1", JobKind::Upscale, tx);

    let job = timeout(Duration::from_secs(1), handle.wait())
        .await
        .expect("first poll should not wait for the interval");
    assert_eq!(job.status, JobStatus::Succeeded);
}

#[tokio::test]
async fn test_training_uses_its_own_interval() {
    let api = SimulatedApi::new();
    api.script_job(
        "tr-1",
        vec![
            StatusResponse::with_status(JobStatus::Training),
            StatusResponse::succeeded(json!("version-1")),
        ],
    );
    let (tx, _rx) = mpsc::channel(32);

    let settings = PollSettings {
        interval: TICK,
        training_interval: Duration::from_secs(60),
    };
    let handle = JobTracker::new(Arc::new(api.clone()), settings).start(
        "tr-1",
        JobKind::Training,
        tx,
    );

    sleep(TICK * 10).await;
    assert_eq!(api.poll_count("tr-1"), 1);
    handle.cancel();
}

#[tokio::test]
async fn test_remote_failure_keeps_error_verbatim() {
    let api = SimulatedApi::new();
    api.script_job(
        "gen-2",
        vec![
            StatusResponse::with_status(JobStatus::Queued),
            StatusResponse::failed("NSFW content detected"),
        ],
    );
    let (tx, mut rx) = mpsc::channel(32);

    let handle = tracker(&api).start("gen-2", JobKind::Generation, tx);
    let events = events_until_terminal(&mut rx).await;

    match events.last() {
        Some(TrackerEvent::Failed { status, error, .. }) => {
            assert_eq!(*status, JobStatus::Failed);
            assert_eq!(error, "NSFW content detected");
        }
        other => panic!("expected Failed, got {other:?}"),
    }
    let job = handle.snapshot();
    assert!(job.result.is_none());
    assert_eq!(job.error.as_deref(), Some("NSFW content detected"));
}

#[tokio::test]
async fn test_canceled_without_message_gets_synthetic_error() {
    let api = SimulatedApi::new();
    api.script_job("up-3", vec![StatusResponse::with_status(JobStatus::Canceled)]);
    let (tx, mut rx) = mpsc::channel(32);

    tracker(&api).start("up-3", JobKind::Upscale, tx);
    let events = events_until_terminal(&mut rx).await;

    match events.last() {
        Some(TrackerEvent::Failed { status, error, .. }) => {
            assert_eq!(*status, JobStatus::Canceled);
            assert_eq!(error, "remote job canceled");
        }
        other => panic!("expected Failed, got {other:?}"),
    }
}

#[tokio::test]
async fn test_transport_failure_fails_job_and_stops() {
    let api = SimulatedApi::new();
    api.fail_poll("gen-4", ApiError::Transport("connection refused".into()));
    let (tx, mut rx) = mpsc::channel(32);

    let handle = tracker(&api).start("gen-4", JobKind::Generation, tx);
    let events = events_until_terminal(&mut rx).await;

    match events.last() {
        Some(TrackerEvent::Failed { status, error, .. }) => {
            assert_eq!(*status, JobStatus::Failed);
            assert!(error.contains("connection refused"), "error was: {error}");
        }
        other => panic!("expected Failed, got {other:?}"),
    }

    sleep(TICK * 5).await;
    assert_eq!(api.poll_count("gen-4"), 1);
    assert_eq!(handle.snapshot().status, JobStatus::Failed);
}

#[tokio::test]
async fn test_logs_are_replaced_not_appended() {
    let api = SimulatedApi::new();
    api.script_job(
        "tr-5",
        vec![
            StatusResponse::with_status(JobStatus::Training).logs("epoch 1/3"),
            StatusResponse::with_status(JobStatus::Training).logs("epoch 2/3"),
            StatusResponse::succeeded(json!("version-5")).logs("done"),
        ],
    );
    let (tx, mut rx) = mpsc::channel(32);

    let handle = tracker(&api).start("tr-5", JobKind::Training, tx);
    let events = events_until_terminal(&mut rx).await;

    let logs: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TrackerEvent::StatusChanged { logs, .. } => logs.clone(),
            _ => None,
        })
        .collect();
    assert_eq!(logs, vec!["epoch 1/3", "epoch 2/3", "done"]);
    assert_eq!(handle.snapshot().logs.as_deref(), Some("done"));
}

#[tokio::test]
async fn test_status_never_moves_backwards() {
    let api = SimulatedApi::new();
    api.script_job(
        "gen-6",
        vec![
            StatusResponse::with_status(JobStatus::Processing),
            StatusResponse::with_status(JobStatus::Starting),
            StatusResponse::succeeded(json!({"url": "img/6.png"})),
        ],
    );
    let (tx, mut rx) = mpsc::channel(32);

    tracker(&api).start("gen-6", JobKind::Generation, tx);
    let events = events_until_terminal(&mut rx).await;

    let statuses: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TrackerEvent::StatusChanged { status, .. } => Some(*status),
            _ => None,
        })
        .collect();
    assert_eq!(statuses, vec![JobStatus::Processing, JobStatus::Succeeded]);
}

#[tokio::test]
async fn test_cancel_stops_polling_and_is_idempotent() {
    let api = SimulatedApi::new();
    api.script_job("tr-7", vec![StatusResponse::with_status(JobStatus::Training)]);
    let (tx, _rx) = mpsc::channel(32);

    let handle = tracker(&api).start("tr-7", JobKind::Training, tx);

    timeout(WAIT, async {
        while api.poll_count("tr-7") < 2 {
            sleep(TICK).await;
        }
    })
    .await
    .expect("timeout waiting for polls");

    handle.cancel();
    handle.cancel();
    assert!(handle.is_cancelled());

    let job = timeout(WAIT, handle.wait()).await.expect("wait after cancel");
    assert_eq!(job.status, JobStatus::Training);

    sleep(TICK * 2).await;
    let polls = api.poll_count("tr-7");
    sleep(TICK * 5).await;
    assert_eq!(api.poll_count("tr-7"), polls);
}

#[tokio::test]
async fn test_cancel_after_terminal_is_harmless() {
    let api = SimulatedApi::new();
    api.script_job("u8", vec![StatusResponse::succeeded(json!("out/u8.png"))]);
    let (tx, _rx) = mpsc::channel(32);

    let handle = tracker(&api).start("u8", JobKind::Upscale, tx);
    timeout(WAIT, handle.wait()).await.expect("timeout waiting for job");

    handle.cancel();
    handle.cancel();

    sleep(TICK * 5).await;
    assert_eq!(api.poll_count("u8"), 1);
    assert_eq!(handle.snapshot().status, JobStatus::Succeeded);
}

#[tokio::test]
async fn test_dropping_receiver_stops_tracker() {
    let api = SimulatedApi::new();
    api.script_job("gen-9", vec![StatusResponse::with_status(JobStatus::Processing)]);
    let (tx, mut rx) = mpsc::channel(32);

    let handle = tracker(&api).start("gen-9", JobKind::Generation, tx);
    let first = timeout(WAIT, rx.recv()).await.expect("timeout").expect("closed");
    assert!(matches!(first, TrackerEvent::Attached { .. }));
    drop(rx);

    timeout(WAIT, async {
        while !handle.is_cancelled() {
            sleep(TICK).await;
        }
    })
    .await
    .expect("tracker should notice the dropped receiver");

    let polls = api.poll_count("gen-9");
    sleep(TICK * 5).await;
    assert_eq!(api.poll_count("gen-9"), polls);
}

#[tokio::test]
async fn test_new_training_abandons_previous_tracker() {
    let api = SimulatedApi::new();
    api.queue_start(JobKind::Training, "tr-a");
    api.queue_start(JobKind::Training, "tr-b");
    api.script_job("tr-a", vec![StatusResponse::with_status(JobStatus::Training)]);
    api.script_job("tr-b", vec![StatusResponse::with_status(JobStatus::Training)]);
    let (tx, _rx) = mpsc::channel(32);

    let tracker = tracker(&api);
    let slots = TrackerSlots::new();

    let first = slots
        .launch(&tracker, JobKind::Training, &json!({"product": "lamp"}), tx.clone())
        .await
        .unwrap();
    let second = slots
        .launch(&tracker, JobKind::Training, &json!({"product": "chair"}), tx)
        .await
        .unwrap();

    assert!(first.is_cancelled());
    assert!(!second.is_cancelled());
    assert_eq!(
        slots.current(JobKind::Training).map(|h| h.job_id().to_string()),
        Some("tr-b".to_string())
    );

    sleep(TICK * 3).await;
    let polls_a = api.poll_count("tr-a");
    sleep(TICK * 5).await;
    assert_eq!(api.poll_count("tr-a"), polls_a);
    assert!(api.poll_count("tr-b") > 1);

    slots.cancel_all();
    assert!(second.is_cancelled());
}

#[tokio::test]
async fn test_failed_start_keeps_previous_tracker() {
    let api = SimulatedApi::new();
    api.queue_start(JobKind::Training, "tr-keep");
    api.fail_start(
        JobKind::Training,
        ApiError::Http {
            status: 500,
            body: "busy".into(),
        },
    );
    api.script_job("tr-keep", vec![StatusResponse::with_status(JobStatus::Training)]);
    let (tx, _rx) = mpsc::channel(32);

    let tracker = tracker(&api);
    let slots = TrackerSlots::new();

    let first = slots
        .launch(&tracker, JobKind::Training, &json!({}), tx.clone())
        .await
        .unwrap();
    let err = slots
        .launch(&tracker, JobKind::Training, &json!({}), tx)
        .await
        .unwrap_err();

    assert!(matches!(err, ApiError::Http { status: 500, .. }));
    assert!(!first.is_cancelled());
    assert_eq!(slots.active_count(), 1);
    first.cancel();
}

#[tokio::test]
async fn test_occupying_again_with_same_tracker_keeps_it() {
    let api = SimulatedApi::new();
    api.script_job("tr-same", vec![StatusResponse::with_status(JobStatus::Training)]);
    let (tx, _rx) = mpsc::channel(32);
    let slots = TrackerSlots::new();

    let handle = tracker(&api).start("tr-same", JobKind::Training, tx.clone());
    assert!(slots.occupy(handle.clone()).is_none());
    assert!(slots.occupy(handle.clone()).is_none());

    assert!(!handle.is_cancelled());
    assert_eq!(slots.active_count(), 1);

    // A second tracker of the same job is a different tracker.
    let other = tracker(&api).start("tr-same", JobKind::Training, tx);
    let abandoned = slots.occupy(other.clone()).expect("previous tracker");
    assert!(abandoned.same_tracker(&handle));
    assert!(handle.is_cancelled());
    assert!(!other.is_cancelled());

    slots.cancel_all();
}
