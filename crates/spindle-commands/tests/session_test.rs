//! Protocol session tests.
//!
//! Tests ack matching, back-pressure, real-time bypass and connection events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use spindle_commands::{MemoryTransport, ProtocolSession, SessionError, Transport};
use spindle_core::config::SessionConfig;
use spindle_core::{
    AckResponse, AlarmCatalog, Command, EngineEvent, EventBus, EventBusReceiver, RealtimeCommand,
    TransportError,
};
use tokio::sync::Semaphore;

/// Helper to create a connected session over an in-memory link.
fn connect(limit: usize) -> (ProtocolSession, Arc<MemoryTransport>, EventBus) {
    let (transport, events) = MemoryTransport::new();
    let bus = EventBus::new();
    let config = SessionConfig {
        outstanding_limit: limit,
        ..SessionConfig::default()
    };
    let session = ProtocolSession::connect(transport.clone(), events, bus.clone(), &config);
    (session, transport, bus)
}

/// Wait for the first event matching `pred`.
async fn expect_event(
    rx: &mut EventBusReceiver,
    pred: impl Fn(&EngineEvent) -> bool,
) -> EngineEvent {
    tokio::time::timeout(Duration::from_secs(2), async {
        loop {
            let (event, _) = rx.recv().await.expect("bus closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("event not published")
}

#[tokio::test]
async fn test_acks_resolve_writes_in_order() {
    let (session, transport, _bus) = connect(64);

    let mut pending = Vec::new();
    for i in 0..40 {
        pending.push(
            session
                .write(Command::gcode(format!("G1 X{}", i)))
                .await
                .unwrap(),
        );
    }

    let feeder = {
        let transport = transport.clone();
        tokio::spawn(async move {
            for i in 0..40u16 {
                let delay = rand::thread_rng().gen_range(0..3);
                tokio::time::sleep(Duration::from_millis(delay)).await;
                transport.push_line(&format!("error:{}", i + 1));
            }
        })
    };

    for (i, ack) in pending.into_iter().enumerate() {
        let ack = ack.wait().await.unwrap();
        assert_eq!(ack.text, format!("G1 X{}", i));
        assert_eq!(ack.response, AckResponse::Error(i as u16 + 1));
    }
    feeder.await.unwrap();
    assert_eq!(session.in_flight_count(), 0);
}

#[tokio::test]
async fn test_back_pressure_holds_extra_write() {
    let (session, transport, _bus) = connect(3);

    let writer = {
        let session = session.clone();
        tokio::spawn(async move {
            for i in 0..4 {
                session
                    .write(Command::gcode(format!("G0 X{}", i)))
                    .await
                    .unwrap();
            }
        })
    };

    transport.wait_for_frames(3).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(transport.frame_count(), 3);
    assert!(!writer.is_finished());

    transport.push_line("ok");
    writer.await.unwrap();
    assert_eq!(transport.frame_count(), 4);
    assert_eq!(transport.written_lines()[3], "G0 X3");
}

#[tokio::test]
async fn test_realtime_bypasses_back_pressure() {
    let (session, transport, _bus) = connect(1);

    let _pending = session.write(Command::gcode("G0 X1")).await.unwrap();
    tokio::time::timeout(
        Duration::from_millis(100),
        session.realtime(RealtimeCommand::JogCancel),
    )
    .await
    .expect("realtime write blocked")
    .unwrap();

    assert_eq!(transport.realtime_bytes(), vec![0x85]);
    assert_eq!(session.in_flight_count(), 1);
}

#[tokio::test]
async fn test_unsolicited_ack_is_protocol_error() {
    let (session, transport, bus) = connect(4);
    let mut rx = bus.subscribe();

    transport.push_line("ok");
    let event = expect_event(&mut rx, |e| matches!(e, EngineEvent::ProtocolError { .. })).await;
    match event {
        EngineEvent::ProtocolError { line, .. } => assert_eq!(line, "ok"),
        other => panic!("unexpected: {other:?}"),
    }

    // The session keeps working.
    let pending = session.write(Command::gcode("G0 X1")).await.unwrap();
    transport.push_line("ok");
    assert!(pending.wait().await.unwrap().is_ok());
}

#[tokio::test]
async fn test_welcome_banner_flushes_in_flight() {
    let (session, transport, bus) = connect(2);
    let mut rx = bus.subscribe();

    let first = session.write(Command::gcode("G0 X1")).await.unwrap();
    let second = session.write(Command::gcode("G0 X2")).await.unwrap();
    transport.push_line("Grbl 1.1h ['$' for help]");

    assert_eq!(first.wait().await, Err(SessionError::ControllerReset));
    assert_eq!(second.wait().await, Err(SessionError::ControllerReset));
    let event = expect_event(&mut rx, |e| matches!(e, EngineEvent::ControllerReset { .. })).await;
    assert!(matches!(event, EngineEvent::ControllerReset { dropped: 2, .. }));

    // Slots were returned.
    let third = session.write(Command::gcode("G0 X3")).await.unwrap();
    let fourth = session.write(Command::gcode("G0 X4")).await.unwrap();
    transport.push_line("ok");
    transport.push_line("ok");
    assert!(third.wait().await.is_ok());
    assert!(fourth.wait().await.is_ok());
}

#[tokio::test]
async fn test_close_fails_in_flight_with_transport_error() {
    let (session, transport, bus) = connect(4);
    let mut rx = bus.subscribe();

    let pending = session.write(Command::gcode("G0 X1")).await.unwrap();
    transport.close("cable pulled");

    assert_eq!(
        pending.wait().await,
        Err(SessionError::Transport(TransportError::Closed(
            "cable pulled".into()
        )))
    );
    expect_event(&mut rx, |e| matches!(e, EngineEvent::ConnectionClosed { .. })).await;
    assert!(!session.is_open());
}

#[tokio::test]
async fn test_alarm_described_from_catalog_then_fallback() {
    let (session, transport, bus) = connect(4);
    let mut rx = bus.subscribe();

    let mut catalog = AlarmCatalog::new();
    catalog.insert(1, "Custom hard limit text");
    session.set_alarm_lookup(Arc::new(catalog));

    transport.push_line("ALARM:1");
    transport.push_line("ALARM:99");

    let first = expect_event(&mut rx, |e| matches!(e, EngineEvent::AlarmRaised { .. })).await;
    let second = expect_event(&mut rx, |e| matches!(e, EngineEvent::AlarmRaised { .. })).await;
    match (first, second) {
        (
            EngineEvent::AlarmRaised {
                code: 1,
                description: known,
            },
            EngineEvent::AlarmRaised {
                code: 99,
                description: unknown,
            },
        ) => {
            assert_eq!(known, "Custom hard limit text");
            assert_eq!(unknown, "Unknown alarm");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[tokio::test]
async fn test_status_report_and_messages_published() {
    let (_session, transport, bus) = connect(4);
    let mut rx = bus.session_events();

    transport.push_bytes(b"<Idle|MPos:1.000,2.000,3.000|FS:0,0>\r\n[MSG:Caution: Unlocked]\r\nwhat\r\n");

    let (status, _) = rx.recv().await.unwrap();
    match status {
        EngineEvent::StatusReport { report } => {
            assert_eq!(report.field("MPos"), Some("1.000,2.000,3.000"))
        }
        other => panic!("unexpected: {other:?}"),
    }
    let (message, _) = rx.recv().await.unwrap();
    assert!(matches!(message, EngineEvent::SystemMessage { .. }));
    let (unmatched, _) = rx.recv().await.unwrap();
    assert!(matches!(unmatched, EngineEvent::Unmatched { .. }));
}

/// Link whose writes wait until the test opens the gate.
struct GatedTransport {
    gate: Semaphore,
}

#[async_trait]
impl Transport for GatedTransport {
    async fn write(&self, _bytes: &[u8]) -> Result<(), TransportError> {
        let _pass = self.gate.acquire().await.map_err(|_| TransportError::NotOpen)?;
        Ok(())
    }

    fn is_open(&self) -> bool {
        true
    }
}

#[tokio::test]
async fn test_dropped_writers_release_their_slots() {
    let transport = Arc::new(GatedTransport {
        gate: Semaphore::new(0),
    });
    let config = SessionConfig {
        outstanding_limit: 2,
        ..SessionConfig::default()
    };
    let session = ProtocolSession::new(transport.clone(), EventBus::new(), &config);

    // Stuck inside the transport write while holding the write lock.
    let stuck = {
        let session = session.clone();
        tokio::spawn(async move { session.write(Command::gcode("G0 X1")).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(session.in_flight_count(), 1);

    // Holds a slot while waiting for the write lock, then gives up.
    let waiting = tokio::time::timeout(
        Duration::from_millis(20),
        session.write(Command::gcode("G0 X2")),
    )
    .await;
    assert!(waiting.is_err());

    stuck.abort();
    assert!(matches!(stuck.await, Err(e) if e.is_cancelled()));
    assert_eq!(session.in_flight_count(), 0);

    // Both slots are usable again.
    transport.gate.add_permits(8);
    for i in 0..2 {
        tokio::time::timeout(
            Duration::from_millis(100),
            session.write(Command::gcode(format!("G0 Y{}", i))),
        )
        .await
        .expect("slot lost")
        .unwrap();
    }
    assert_eq!(session.in_flight_count(), 2);
}
