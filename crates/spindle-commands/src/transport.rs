//! Serial transport seam.
//!
//! The engine never talks to a serial driver directly. A [`PortEnumerator`]
//! opens a [`Transport`] for writing plus a channel of [`TransportEvent`]s for
//! everything the link delivers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use spindle_core::TransportError;
use tokio::sync::{mpsc, Notify};

/// Something the link delivered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Raw bytes from the controller
    Data(Vec<u8>),
    /// The link went away
    Closed(String),
}

/// Receiving half of an open link.
pub type TransportEvents = mpsc::UnboundedReceiver<TransportEvent>;

/// Writing half of an open link.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Write bytes to the controller.
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError>;

    /// Check if the link is open.
    fn is_open(&self) -> bool;
}

/// A serial port as reported by the enumerator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInfo {
    /// Port path, e.g. `/dev/ttyUSB0`
    pub path: String,
    /// Manufacturer string, if known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub manufacturer: Option<String>,
}

/// Port discovery and opening.
#[async_trait]
pub trait PortEnumerator: Send + Sync {
    /// List available ports.
    async fn list_ports(&self) -> Result<Vec<PortInfo>, TransportError>;

    /// Open a port.
    async fn open(
        &self,
        port: &str,
        baud: u32,
    ) -> Result<(Arc<dyn Transport>, TransportEvents), TransportError>;
}

/// In-memory link.
///
/// Records every write as one frame and lets the caller push controller
/// output into the event channel.
pub struct MemoryTransport {
    open: AtomicBool,
    frames: Mutex<Vec<Vec<u8>>>,
    written: Notify,
    events: mpsc::UnboundedSender<TransportEvent>,
}

impl MemoryTransport {
    /// Create an open in-memory link.
    pub fn new() -> (Arc<Self>, TransportEvents) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            open: AtomicBool::new(true),
            frames: Mutex::new(Vec::new()),
            written: Notify::new(),
            events: tx,
        });
        (transport, rx)
    }

    /// Deliver raw bytes as if the controller sent them.
    pub fn push_bytes(&self, bytes: &[u8]) {
        let _ = self.events.send(TransportEvent::Data(bytes.to_vec()));
    }

    /// Deliver one controller line.
    pub fn push_line(&self, line: &str) {
        self.push_bytes(format!("{}\r\n", line).as_bytes());
    }

    /// Close the link.
    pub fn close(&self, reason: impl Into<String>) {
        if self.open.swap(false, Ordering::SeqCst) {
            let _ = self.events.send(TransportEvent::Closed(reason.into()));
        }
    }

    /// All frames written so far.
    pub fn frames(&self) -> Vec<Vec<u8>> {
        self.frames.lock().clone()
    }

    /// Number of frames written so far.
    pub fn frame_count(&self) -> usize {
        self.frames.lock().len()
    }

    /// Written line frames without their terminators.
    pub fn written_lines(&self) -> Vec<String> {
        self.frames
            .lock()
            .iter()
            .filter(|frame| frame.ends_with(b"\n"))
            .map(|frame| {
                String::from_utf8_lossy(frame)
                    .trim_end_matches(['\r', '\n'])
                    .to_string()
            })
            .collect()
    }

    /// Written single-byte real-time frames.
    pub fn realtime_bytes(&self) -> Vec<u8> {
        self.frames
            .lock()
            .iter()
            .filter(|frame| frame.len() == 1 && frame[0] != b'\n')
            .map(|frame| frame[0])
            .collect()
    }

    /// Wait until at least `count` frames have been written.
    pub async fn wait_for_frames(&self, count: usize) {
        loop {
            let notified = self.written.notified();
            if self.frame_count() >= count {
                return;
            }
            notified.await;
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn write(&self, bytes: &[u8]) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        self.frames.lock().push(bytes.to_vec());
        self.written.notify_waiters();
        Ok(())
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}
