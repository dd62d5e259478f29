//! Streaming queue tests.
//!
//! Tests job lifecycle, flow-control accounting, pause/resume/stop and the
//! line middleware seam.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use spindle_commands::{
    LineContext, LineDirective, LineMiddleware, MemoryTransport, ProtocolSession, QueueError,
    SimulatedController, StreamingJob, StreamingQueue,
};
use spindle_core::config::{SessionConfig, StreamingConfig};
use spindle_core::{
    Ack, Command, EngineError, EngineEvent, EventBus, JobEndReason, JobInfo, JobState, LineOrigin,
    TransportError,
};

fn streaming(capacity: usize) -> StreamingConfig {
    StreamingConfig {
        buffer_capacity: capacity,
        stop_settle_timeout_ms: 200,
    }
}

/// Queue over a simulated controller that answers every line at once.
fn simulated_queue(capacity: usize) -> (StreamingQueue, Arc<SimulatedController>, EventBus) {
    let (controller, events) = SimulatedController::new();
    let bus = EventBus::new();
    let session =
        ProtocolSession::connect(controller.clone(), events, bus.clone(), &SessionConfig::default());
    (StreamingQueue::new(session, &streaming(capacity)), controller, bus)
}

/// Queue over a link the test answers by hand.
fn manual_queue(capacity: usize) -> (StreamingQueue, Arc<MemoryTransport>, EventBus) {
    let (transport, events) = MemoryTransport::new();
    let bus = EventBus::new();
    let session =
        ProtocolSession::connect(transport.clone(), events, bus.clone(), &SessionConfig::default());
    (StreamingQueue::new(session, &streaming(capacity)), transport, bus)
}

fn program(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("G1 X{} F500", i)).collect()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(30)).await;
}

#[tokio::test]
async fn test_job_completes_and_returns_to_idle() {
    let (queue, controller, bus) = simulated_queue(127);
    let mut rx = bus.job_events();

    let mut lines = program(5);
    lines.insert(2, "; comment only".to_string());
    lines.push("G0 X0 (home)".to_string());
    queue.start(StreamingJob::new("part.nc", lines)).unwrap();

    let outcome = queue.wait().await.unwrap();
    assert_eq!(outcome.reason, JobEndReason::Completed);
    assert_eq!(outcome.error, None);
    assert_eq!(outcome.progress.total, 7);
    assert_eq!(outcome.progress.sent, 6);
    assert_eq!(outcome.progress.acknowledged, 6);
    assert_eq!(outcome.progress.skipped, 1);
    assert_eq!(queue.state(), JobState::Idle);

    let written = controller.link().written_lines();
    assert_eq!(written.len(), 6);
    assert_eq!(written[5], "G0 X0");

    let mut transitions = Vec::new();
    while let Some((event, _)) = rx.try_recv() {
        if let EngineEvent::JobStateChanged { from, to, .. } = event {
            transitions.push((from, to));
        }
    }
    assert_eq!(
        transitions,
        vec![
            (JobState::Idle, JobState::Running),
            (JobState::Running, JobState::Completing),
            (JobState::Completing, JobState::Idle),
        ]
    );
}

#[tokio::test]
async fn test_start_rejects_second_job() {
    let (queue, _transport, _bus) = manual_queue(127);
    queue.start(StreamingJob::new("a.nc", program(3))).unwrap();
    assert_eq!(
        queue.start(StreamingJob::new("b.nc", program(3))),
        Err(QueueError::AlreadyRunning)
    );
}

#[tokio::test]
async fn test_pending_bytes_never_exceed_capacity() {
    let capacity = 40;
    let (queue, transport, _bus) = manual_queue(capacity);
    let lines = program(30);
    queue.start(StreamingJob::new("long.nc", lines.clone())).unwrap();

    let mut acked = 0;
    while acked < lines.len() {
        transport.wait_for_frames(acked + 1).await;
        settle().await;
        let stats = queue.flow_stats();
        assert!(stats.pending <= capacity, "pending {} > {}", stats.pending, capacity);
        let in_buffer: usize = transport.written_lines()[acked..]
            .iter()
            .map(|l| l.len() + 1)
            .sum();
        assert!(in_buffer <= capacity);
        transport.push_line("ok");
        acked += 1;
    }

    let outcome = queue.wait().await.unwrap();
    assert_eq!(outcome.reason, JobEndReason::Completed);
    assert!(queue.flow_stats().peak <= capacity);
    assert_eq!(queue.flow_stats().pending, 0);
}

#[tokio::test]
async fn test_error_ack_fails_job_and_discards_rest() {
    let (queue, transport, _bus) = manual_queue(127);
    queue
        .start(StreamingJob::new("bad.nc", program(100)))
        .unwrap();

    transport.wait_for_frames(2).await;
    transport.push_line("ok");
    transport.push_line("error:20");

    let outcome = queue.wait().await.unwrap();
    assert_eq!(outcome.reason, JobEndReason::Error);
    assert_eq!(outcome.error, Some(EngineError::controller(20)));
    assert_eq!(queue.state(), JobState::Failed);
    assert!(transport.written_lines().len() < 100);
}

#[tokio::test]
async fn test_pause_holds_new_lines_until_resume() {
    let (queue, transport, _bus) = manual_queue(24);
    queue.start(StreamingJob::new("p.nc", program(10))).unwrap();

    transport.wait_for_frames(2).await;
    queue.pause().unwrap();
    assert_eq!(queue.state(), JobState::Paused);
    assert!(matches!(
        queue.pause(),
        Err(QueueError::InvalidTransition { .. })
    ));

    // The third line was already accepted before the pause and goes out once
    // the first two are acknowledged.
    transport.push_line("ok");
    transport.push_line("ok");
    settle().await;
    assert_eq!(transport.frame_count(), 3);
    transport.push_line("ok");
    settle().await;
    assert_eq!(transport.frame_count(), 3);
    assert_eq!(queue.progress().acknowledged, 3);

    queue.resume().unwrap();
    assert_eq!(queue.state(), JobState::Running);
    let mut acked = 3;
    while acked < 10 {
        transport.wait_for_frames(acked + 1).await;
        transport.push_line("ok");
        acked += 1;
    }
    let outcome = queue.wait().await.unwrap();
    assert_eq!(outcome.reason, JobEndReason::Completed);
    assert_eq!(outcome.progress.acknowledged, 10);
}

#[tokio::test]
async fn test_stop_halts_and_settles() {
    let (queue, controller, _bus) = simulated_queue(127);
    let (slow_queue, transport, _slow_bus) = manual_queue(127);

    // Simulated controller: the soft reset banner flushes the in-flight lines.
    queue.start(StreamingJob::new("a.nc", program(2000))).unwrap();
    let outcome = queue.stop().await.unwrap();
    assert_eq!(outcome.reason, JobEndReason::Stopped);
    assert_eq!(queue.state(), JobState::Stopped);
    assert!(controller.link().realtime_bytes().ends_with(&[b'!', 0x18]));

    // A stopped queue accepts a new job.
    queue.start(StreamingJob::new("b.nc", program(2))).unwrap();
    assert_eq!(queue.wait().await.unwrap().reason, JobEndReason::Completed);

    // Silent controller: the settle timeout abandons what is still in flight.
    slow_queue
        .start(StreamingJob::new("c.nc", program(5)))
        .unwrap();
    transport.wait_for_frames(5).await;
    let outcome = slow_queue.stop().await.unwrap();
    assert_eq!(outcome.reason, JobEndReason::Stopped);
    assert_eq!(outcome.progress.acknowledged, 0);
    assert_eq!(transport.realtime_bytes(), vec![b'!', 0x18]);
}

#[tokio::test]
async fn test_control_without_job() {
    let (queue, _transport, _bus) = manual_queue(127);
    assert_eq!(queue.pause(), Err(QueueError::NoActiveJob));
    assert_eq!(queue.stop().await.map(|_| ()), Err(QueueError::NoActiveJob));
    assert!(queue.wait().await.is_none());
}

#[tokio::test]
async fn test_line_longer_than_buffer_fails_job() {
    let (queue, transport, _bus) = manual_queue(8);
    queue
        .start(StreamingJob::new("wide.nc", vec!["G1 X1000 Y1000 F3000".into()]))
        .unwrap();
    let outcome = queue.wait().await.unwrap();
    assert_eq!(outcome.reason, JobEndReason::Error);
    assert!(matches!(outcome.error, Some(EngineError::Protocol(_))));
    assert_eq!(transport.frame_count(), 0);
}

#[tokio::test]
async fn test_console_command_goes_through_flow_control() {
    let (queue, controller, bus) = simulated_queue(127);
    let mut rx = bus.job_events();

    let ack = queue.send_command(Command::gcode("G21")).await.unwrap();
    assert!(ack.is_ok());
    assert_eq!(controller.link().written_lines(), vec!["G21"]);

    let (event, _) = rx.recv().await.unwrap();
    match event {
        EngineEvent::LineSent { origin, text, line_number } => {
            assert_eq!(origin, LineOrigin::Console);
            assert_eq!(text, "G21");
            assert_eq!(line_number, None);
        }
        other => panic!("unexpected: {other:?}"),
    }
}

/// Middleware that records hook calls, skips `M8` and injects after `M6`.
#[derive(Default)]
struct Recording {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl LineMiddleware for Recording {
    async fn before_job(&self, _job: &JobInfo, text: String) -> Result<String, EngineError> {
        self.calls.lock().push("before_job".into());
        Ok(format!("G21\n{}", text))
    }

    async fn before_line(&self, line: &str, _ctx: &LineContext) -> Result<LineDirective, EngineError> {
        Ok(match line {
            "M8" => LineDirective::skip(),
            "M6" => LineDirective::keep().with_inject_after(["G4 P1"]),
            "ABORT" => {
                return Err(EngineError::PluginHandler {
                    plugin: "test".into(),
                    message: "abort requested".into(),
                })
            }
            _ => LineDirective::keep(),
        })
    }

    async fn after_line(&self, line: &str, _ack: &Ack, ctx: &LineContext) {
        self.calls
            .lock()
            .push(format!("after:{}:{}", ctx.line_number, line));
    }

    async fn after_job(&self, _job: &JobInfo, reason: JobEndReason) {
        self.calls.lock().push(format!("after_job:{}", reason.as_str()));
    }
}

#[tokio::test]
async fn test_middleware_skip_and_rewrite() {
    let (queue, controller, bus) = simulated_queue(127);
    let recording = Arc::new(Recording::default());
    let queue = queue.with_middleware(recording.clone());
    let mut rx = bus.job_events();

    queue
        .start(StreamingJob::new("m.nc", vec!["G0 X1".into(), "M8".into()]))
        .unwrap();
    let outcome = queue.wait().await.unwrap();
    assert_eq!(outcome.reason, JobEndReason::Completed);
    assert_eq!(controller.link().written_lines(), vec!["G21", "G0 X1"]);

    let mut skipped = Vec::new();
    while let Some((event, _)) = rx.try_recv() {
        if let EngineEvent::LineSkipped { line_number, rendered } = event {
            skipped.push((line_number, rendered));
        }
    }
    assert_eq!(skipped, vec![(3, "; M8 (skipped)".to_string())]);

    let calls = recording.calls.lock().clone();
    assert_eq!(
        calls,
        vec![
            "before_job",
            "after:1:G21",
            "after:2:G0 X1",
            "after_job:completed"
        ]
    );
}

#[tokio::test]
async fn test_injected_line_acked_before_next_line() {
    let (queue, transport, _bus) = manual_queue(127);
    let queue = queue.with_middleware(Arc::new(Recording::default()));

    queue
        .start(StreamingJob::new("i.nc", vec!["M6".into(), "G0 X2".into()]))
        .unwrap();

    // G21 (from before_job), M6 and the injected dwell go out.
    transport.wait_for_frames(3).await;
    assert_eq!(transport.written_lines(), vec!["G21", "M6", "G4 P1"]);

    transport.push_line("ok");
    transport.push_line("ok");
    settle().await;
    assert_eq!(transport.frame_count(), 3);

    transport.push_line("ok");
    transport.wait_for_frames(4).await;
    assert_eq!(transport.written_lines()[3], "G0 X2");
    transport.push_line("ok");
    assert_eq!(queue.wait().await.unwrap().reason, JobEndReason::Completed);
}

#[tokio::test]
async fn test_fatal_middleware_error_fails_job_once() {
    let (queue, _controller, _bus) = simulated_queue(127);
    let recording = Arc::new(Recording::default());
    let queue = queue.with_middleware(recording.clone());

    queue
        .start(StreamingJob::new("x.nc", vec!["G0 X1".into(), "ABORT".into(), "G0 X2".into()]))
        .unwrap();
    let outcome = queue.wait().await.unwrap();
    assert_eq!(outcome.reason, JobEndReason::Error);
    assert!(matches!(
        outcome.error,
        Some(EngineError::PluginHandler { .. })
    ));

    let calls = recording.calls.lock().clone();
    let ends: Vec<_> = calls.iter().filter(|c| c.starts_with("after_job")).collect();
    assert_eq!(ends, vec!["after_job:error"]);
}

/// Middleware whose after-line hook is slow and records every response.
struct AckLog {
    delay: Duration,
    calls: Mutex<Vec<String>>,
}

impl AckLog {
    fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl LineMiddleware for AckLog {
    async fn after_line(&self, line: &str, ack: &Ack, _ctx: &LineContext) {
        tokio::time::sleep(self.delay).await;
        self.calls.lock().push(format!("{} -> {:?}", line, ack.response));
    }

    async fn after_job(&self, _job: &JobInfo, reason: JobEndReason) {
        self.calls.lock().push(format!("after_job:{}", reason.as_str()));
    }
}

#[tokio::test]
async fn test_rejected_line_reaches_after_line_hook() {
    let (queue, transport, _bus) = manual_queue(127);
    let log = AckLog::new(Duration::ZERO);
    let queue = queue.with_middleware(log.clone());

    queue
        .start(StreamingJob::new("g5.nc", vec!["G1 X1 F100".into(), "G5".into()]))
        .unwrap();
    transport.wait_for_frames(2).await;
    transport.push_line("ok");
    transport.push_line("error:20");

    let outcome = queue.wait().await.unwrap();
    assert_eq!(outcome.reason, JobEndReason::Error);
    assert_eq!(
        log.calls.lock().clone(),
        vec!["G1 X1 F100 -> Ok", "G5 -> Error(20)", "after_job:error"]
    );
}

#[tokio::test]
async fn test_slow_after_line_hook_does_not_hold_stream() {
    let (queue, controller, _bus) = simulated_queue(127);
    let log = AckLog::new(Duration::from_millis(100));
    let queue = queue.with_middleware(log.clone());

    queue.start(StreamingJob::new("slow.nc", program(10))).unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;

    // Every line is out and acknowledged while the hooks are still running.
    assert_eq!(controller.link().written_lines().len(), 10);
    assert_eq!(queue.progress().acknowledged, 10);
    assert!(log.calls.lock().len() < 10);

    let outcome = queue.wait().await.unwrap();
    assert_eq!(outcome.reason, JobEndReason::Completed);
    let calls = log.calls.lock().clone();
    assert_eq!(calls.len(), 11);
    for (i, call) in calls[..10].iter().enumerate() {
        assert_eq!(call, &format!("G1 X{} F500 -> Ok", i));
    }
    assert_eq!(calls[10], "after_job:completed");
}

#[tokio::test]
async fn test_link_closed_while_paused_fails_job() {
    let (queue, transport, _bus) = manual_queue(24);
    queue.start(StreamingJob::new("p.nc", program(10))).unwrap();

    transport.wait_for_frames(2).await;
    queue.pause().unwrap();
    transport.push_line("ok");
    transport.push_line("ok");
    transport.wait_for_frames(3).await;
    transport.push_line("ok");
    settle().await;
    assert_eq!(queue.progress().acknowledged, 3);
    assert_eq!(queue.state(), JobState::Paused);

    transport.close("unplugged");
    let outcome = tokio::time::timeout(Duration::from_secs(1), queue.wait())
        .await
        .expect("paused job ignored the closed link")
        .unwrap();
    assert_eq!(outcome.reason, JobEndReason::Error);
    assert_eq!(
        outcome.error,
        Some(EngineError::Transport(TransportError::Closed("unplugged".into())))
    );
    assert_eq!(queue.state(), JobState::Failed);
}
