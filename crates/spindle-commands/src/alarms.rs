//! Alarm catalog request (`$EA`).

use std::time::Duration;

use spindle_core::{AlarmCatalog, Command, EngineEvent};
use tracing::{info, warn};

use crate::error::SessionError;
use crate::session::ProtocolSession;

/// grblHAL command that lists alarm codes as `[ALARMCODE:n||text]` lines.
pub const ALARM_CATALOG_COMMAND: &str = "$EA";

/// Ask the controller for its alarm catalog.
///
/// Collects `[ALARMCODE:..]` lines until the command is acknowledged. A
/// controller that rejects `$EA` yields an empty catalog; no answer within
/// `timeout` is an error.
pub async fn load_alarm_catalog(
    session: &ProtocolSession,
    timeout: Duration,
) -> Result<AlarmCatalog, SessionError> {
    let mut events = session.bus().subscribe();
    let pending = session.write(Command::system(ALARM_CATALOG_COMMAND)).await?;

    let collect = async {
        let mut catalog = AlarmCatalog::new();
        let ack = pending.wait();
        tokio::pin!(ack);
        loop {
            tokio::select! {
                result = &mut ack => {
                    // Lines that preceded the ack are already on the bus.
                    while let Some((event, _)) = events.try_recv() {
                        collect_line(&mut catalog, &event);
                    }
                    return result.map(|ack| (ack, catalog));
                }
                received = events.recv() => match received {
                    Some((event, _)) => collect_line(&mut catalog, &event),
                    None => return Err(SessionError::Closed),
                },
            }
        }
    };

    let (ack, catalog) = tokio::time::timeout(timeout, collect)
        .await
        .map_err(|_| SessionError::Timeout(ALARM_CATALOG_COMMAND.to_string()))??;

    if ack.is_ok() {
        info!(category = "alarms", count = catalog.len(), "Alarm catalog loaded");
        Ok(catalog)
    } else {
        warn!(category = "alarms", response = ?ack.response, "Controller has no alarm catalog");
        Ok(AlarmCatalog::new())
    }
}

fn collect_line(catalog: &mut AlarmCatalog, event: &EngineEvent) {
    if let EngineEvent::SystemMessage { message } = event {
        catalog.extend_from_lines([message.as_str()]);
    }
}
