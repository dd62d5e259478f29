//! Bridges engine events to broadcaster topics.

use serde_json::{json, Value};
use spindle_core::{EngineEvent, EventBus, JobProgress};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::broadcaster::{StateBroadcaster, TopicMessage};
use crate::diff::StateMap;
use crate::normalizer::TelemetryNormalizer;

/// Normalized machine state.
pub const STATUS_TOPIC: &str = "status";
/// Job state and progress counters.
pub const JOB_TOPIC: &str = "job";
/// The active alarm, empty when none.
pub const ALARM_TOPIC: &str = "alarm";

/// Folds engine events into per-topic states.
pub struct TelemetryService {
    broadcaster: StateBroadcaster,
    normalizer: TelemetryNormalizer,
    job: StateMap,
}

impl TelemetryService {
    pub fn new(broadcaster: StateBroadcaster) -> Self {
        Self {
            broadcaster,
            normalizer: TelemetryNormalizer::new(),
            job: StateMap::new(),
        }
    }

    pub fn broadcaster(&self) -> &StateBroadcaster {
        &self.broadcaster
    }

    /// Update topics from one event. Returns the message broadcast, if any.
    pub fn handle_event(&mut self, event: &EngineEvent) -> Option<TopicMessage> {
        match event {
            EngineEvent::StatusReport { report } => {
                let snapshot = self.normalizer.normalize(report);
                self.broadcaster.publish(STATUS_TOPIC, snapshot.to_map())
            }
            EngineEvent::JobStateChanged { filename, from, to } => {
                if !from.is_active() && to.is_active() {
                    self.job.clear();
                }
                self.job.insert("filename".into(), json!(filename));
                self.job.insert("state".into(), json!(to));
                self.publish_job()
            }
            EngineEvent::JobProgress { progress } => {
                self.job.extend(progress_map(progress));
                self.publish_job()
            }
            EngineEvent::JobFinished {
                filename,
                reason,
                error,
            } => {
                self.job.insert("filename".into(), json!(filename));
                self.job.insert("reason".into(), json!(reason));
                match error {
                    Some(error) => self.job.insert("error".into(), json!(error)),
                    None => self.job.remove("error"),
                };
                self.publish_job()
            }
            EngineEvent::AlarmRaised { code, description } => {
                let mut alarm = StateMap::new();
                alarm.insert("code".into(), json!(code));
                alarm.insert("description".into(), json!(description));
                self.broadcaster.publish(ALARM_TOPIC, alarm)
            }
            EngineEvent::ControllerReset { .. } => {
                self.normalizer.reset();
                self.broadcaster.current(ALARM_TOPIC)?;
                self.broadcaster.publish(ALARM_TOPIC, StateMap::new())
            }
            _ => None,
        }
    }

    fn publish_job(&self) -> Option<TopicMessage> {
        self.broadcaster.publish(JOB_TOPIC, self.job.clone())
    }

    /// Run on `bus` until it closes.
    pub fn spawn(mut self, bus: &EventBus) -> JoinHandle<()> {
        let mut rx = bus.subscribe();
        tokio::spawn(async move {
            info!(category = "telemetry", "Telemetry service started");
            while let Some((event, _)) = rx.recv().await {
                if let Some(message) = self.handle_event(&event) {
                    debug!(
                        category = "telemetry",
                        topic = %message.topic,
                        keys = message.payload.len(),
                        "Telemetry published"
                    );
                }
            }
            info!(category = "telemetry", "Telemetry service stopped");
        })
    }
}

fn progress_map(progress: &JobProgress) -> StateMap {
    let mut map = match serde_json::to_value(progress) {
        Ok(Value::Object(map)) => map,
        _ => StateMap::new(),
    };
    let percent = (progress.fraction() * 1000.0).round() / 10.0;
    map.insert("percent".into(), json!(percent));
    map
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broadcaster::PayloadKind;
    use spindle_core::{JobEndReason, JobState, RawStatusReport};

    fn status(line: &str) -> EngineEvent {
        EngineEvent::StatusReport {
            report: RawStatusReport::parse(line).unwrap(),
        }
    }

    #[test]
    fn test_status_reports_become_diffs() {
        let mut service = TelemetryService::new(StateBroadcaster::new());
        let first = service
            .handle_event(&status("<Idle|MPos:0.000,0.000,0.000|FS:0,0>"))
            .unwrap();
        assert_eq!(first.kind, PayloadKind::Full);

        let second = service
            .handle_event(&status("<Run|MPos:5.000,0.000,0.000|FS:500,0>"))
            .unwrap();
        assert_eq!(second.kind, PayloadKind::Diff);
        assert_eq!(
            Value::Object(second.payload),
            json!({
                "controllerState": { "state": "Run" },
                "machinePosition": { "x": 5.0 },
                "feed": 500.0
            })
        );

        assert!(service
            .handle_event(&status("<Run|MPos:5.000,0.000,0.000|FS:500,0>"))
            .is_none());
    }

    #[test]
    fn test_job_topic_follows_lifecycle() {
        let mut service = TelemetryService::new(StateBroadcaster::new());
        service.handle_event(&EngineEvent::JobStateChanged {
            filename: "part.nc".into(),
            from: JobState::Idle,
            to: JobState::Running,
        });
        service.handle_event(&EngineEvent::JobProgress {
            progress: JobProgress {
                filename: "part.nc".into(),
                state: JobState::Running,
                cursor: 2,
                sent: 2,
                acknowledged: 1,
                skipped: 0,
                total: 4,
            },
        });
        let finished = service
            .handle_event(&EngineEvent::JobFinished {
                filename: "part.nc".into(),
                reason: JobEndReason::Error,
                error: Some("error:20".into()),
            })
            .unwrap();
        assert_eq!(
            Value::Object(finished.payload),
            json!({ "reason": "error", "error": "error:20" })
        );

        let job = service.broadcaster().current(JOB_TOPIC).unwrap();
        assert_eq!(job["percent"], json!(25.0));
        assert_eq!(job["state"], json!("running"));

        let restarted = service
            .handle_event(&EngineEvent::JobStateChanged {
                filename: "part.nc".into(),
                from: JobState::Failed,
                to: JobState::Running,
            })
            .unwrap();
        assert_eq!(restarted.payload["reason"], Value::Null);
        assert_eq!(restarted.payload["error"], Value::Null);
    }

    #[test]
    fn test_alarm_cleared_on_reset() {
        let mut service = TelemetryService::new(StateBroadcaster::new());
        assert!(service
            .handle_event(&EngineEvent::ControllerReset {
                banner: "Grbl 1.1h ['$' for help]".into(),
                dropped: 0,
            })
            .is_none());

        service.handle_event(&EngineEvent::AlarmRaised {
            code: 1,
            description: "Hard limit".into(),
        });
        let cleared = service
            .handle_event(&EngineEvent::ControllerReset {
                banner: "Grbl 1.1h ['$' for help]".into(),
                dropped: 0,
            })
            .unwrap();
        assert_eq!(
            Value::Object(cleared.payload),
            json!({ "code": null, "description": null })
        );
    }
}
