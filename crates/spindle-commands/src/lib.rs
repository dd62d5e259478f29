//! Machine-control streaming for grbl-family controllers.
//!
//! Provides:
//! - The transport seam and an in-memory link
//! - The protocol session (ack tracking, back-pressure, real-time bytes)
//! - Character-counting flow control and the streaming queue
//! - The jog watchdog and jog controller
//! - Alarm catalog loading
//! - A simulated controller

pub mod alarms;
pub mod error;
pub mod flow;
pub mod jog;
pub mod middleware;
pub mod protocol;
pub mod queue;
pub mod session;
pub mod simulator;
pub mod transport;
pub mod watchdog;

// Re-exports
pub use alarms::load_alarm_catalog;

pub use error::{QueueError, SessionError};

pub use flow::{FlowController, FlowStats};

pub use jog::JogController;

pub use middleware::{LineAction, LineContext, LineDirective, LineMiddleware, PassThrough};

pub use protocol::{classify, ControllerLine, LineBuffer};

pub use queue::{JobOutcome, QueueSender, StreamingJob, StreamingQueue};

pub use session::{AckResult, PendingAck, ProtocolSession, SettleHook};

pub use simulator::{SimulatedController, SimulatorPorts};

pub use transport::{MemoryTransport, PortEnumerator, PortInfo, Transport, TransportEvent, TransportEvents};

pub use watchdog::{JogWatchdog, TimeoutCallback, WatchdogSession};
