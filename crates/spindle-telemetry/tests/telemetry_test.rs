//! Telemetry service tests against the simulated controller.

use std::time::Duration;

use serde_json::{json, Value};
use spindle_commands::{ProtocolSession, SimulatedController, StreamingJob, StreamingQueue};
use spindle_core::config::{SessionConfig, StreamingConfig};
use spindle_core::{Command, EventBus, RealtimeCommand};
use spindle_telemetry::{
    apply, PayloadKind, StateBroadcaster, StateMap, TelemetryService, JOB_TOPIC, STATUS_TOPIC,
};

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

fn simulated() -> (ProtocolSession, EventBus) {
    let (controller, events) = SimulatedController::new();
    let bus = EventBus::new();
    let session = ProtocolSession::connect(controller, events, bus.clone(), &SessionConfig::default());
    (session, bus)
}

#[tokio::test]
async fn test_status_polls_publish_full_then_diff() {
    let (session, bus) = simulated();
    let broadcaster = StateBroadcaster::new();
    let service = TelemetryService::new(broadcaster.clone()).spawn(&bus);
    let mut rx = broadcaster.subscribe();

    session.realtime(RealtimeCommand::StatusQuery).await.unwrap();
    settle().await;
    let first = rx.try_recv().unwrap();
    assert_eq!(first.topic, STATUS_TOPIC);
    assert_eq!(first.kind, PayloadKind::Full);
    assert_eq!(first.payload["controllerState"], json!({ "state": "Idle" }));

    session.send(Command::gcode("G0 X12.5")).await.unwrap();
    session.realtime(RealtimeCommand::StatusQuery).await.unwrap();
    settle().await;
    let second = rx.try_recv().unwrap();
    assert_eq!(second.kind, PayloadKind::Diff);
    assert_eq!(Value::Object(second.payload), json!({ "machinePosition": { "x": 12.5 } }));

    session.realtime(RealtimeCommand::StatusQuery).await.unwrap();
    settle().await;
    assert!(rx.try_recv().is_none());

    service.abort();
}

#[tokio::test]
async fn test_job_topic_mirrors_streaming_job() {
    let (session, bus) = simulated();
    let broadcaster = StateBroadcaster::new();
    let service = TelemetryService::new(broadcaster.clone()).spawn(&bus);
    let mut rx = broadcaster.subscribe();

    let queue = StreamingQueue::new(session, &StreamingConfig::default());
    let lines = vec!["G21".to_string(), "G1 X1 F100".to_string(), "; done".to_string()];
    queue.start(StreamingJob::new("part.nc", lines)).unwrap();
    queue.wait().await.unwrap();
    settle().await;

    let mut mirror = StateMap::new();
    while let Some(message) = rx.try_recv() {
        if message.topic != JOB_TOPIC {
            continue;
        }
        match message.kind {
            PayloadKind::Full => mirror = message.payload,
            PayloadKind::Diff => apply(&mut mirror, &message.payload),
        }
    }

    assert_eq!(Some(mirror.clone()), broadcaster.current(JOB_TOPIC));
    assert_eq!(mirror["filename"], json!("part.nc"));
    assert_eq!(mirror["reason"], json!("completed"));
    assert_eq!(mirror["state"], json!("idle"));
    assert_eq!(mirror["acknowledged"], json!(2));
    assert_eq!(mirror["skipped"], json!(1));
    assert_eq!(mirror["percent"], json!(100.0));

    service.abort();
}
