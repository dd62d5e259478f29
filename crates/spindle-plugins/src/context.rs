//! Per-plugin capability handle.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use spindle_commands::QueueSender;
use spindle_core::{Ack, Command, EngineEvent, EventBus};
use tracing::{info, warn};

use crate::error::{PluginError, Result};
use crate::registry::{EventHandler, HandlerRegistry, HandlerResult};

/// Event bus source for plugin events.
pub const SOURCE: &str = "plugin";

/// Options for [`PluginContext::send_gcode`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendOptions {
    /// Text shown in consoles instead of the raw line
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_command: Option<String>,
    /// Extra command metadata
    #[serde(default)]
    pub meta: HashMap<String, Value>,
}

impl SendOptions {
    pub fn display(command: impl Into<String>) -> Self {
        Self {
            display_command: Some(command.into()),
            ..Self::default()
        }
    }
}

pub type ToolMenuFn = Arc<dyn Fn() -> BoxFuture<'static, HandlerResult<()>> + Send + Sync>;

/// A tool menu action contributed by a plugin.
#[derive(Clone)]
pub struct ToolMenuEntry {
    pub plugin_id: String,
    pub label: String,
    pub(crate) handler: ToolMenuFn,
}

/// State shared by the host and every plugin context.
pub(crate) struct HostShared {
    pub(crate) registry: Arc<HandlerRegistry>,
    pub(crate) sender: QueueSender,
    pub(crate) bus: EventBus,
    pub(crate) settings: DashMap<String, Value>,
    pub(crate) tool_menus: DashMap<String, ToolMenuEntry>,
}

/// Handle given to a plugin on load.
///
/// Every capability is scoped to the owning plugin and stops working once
/// the plugin is unloaded.
#[derive(Clone)]
pub struct PluginContext {
    plugin_id: String,
    alive: Arc<AtomicBool>,
    shared: Arc<HostShared>,
}

impl PluginContext {
    pub(crate) fn new(plugin_id: String, alive: Arc<AtomicBool>, shared: Arc<HostShared>) -> Self {
        Self {
            plugin_id,
            alive,
            shared,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Check if the owning plugin is still loaded.
    pub fn is_loaded(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    fn ensure_loaded(&self) -> Result<()> {
        if self.is_loaded() {
            Ok(())
        } else {
            Err(PluginError::Unloaded(self.plugin_id.clone()))
        }
    }

    /// Register a handler for the hook named by its variant.
    pub fn register_event_handler(&self, handler: EventHandler) -> Result<()> {
        let hook = handler.kind();
        if !self.shared.registry.register(&self.plugin_id, handler) {
            return Err(PluginError::Unloaded(self.plugin_id.clone()));
        }
        info!(category = "plugin", plugin = %self.plugin_id, hook = %hook, "Handler registered");
        Ok(())
    }

    /// Send a line through the streaming queue and wait for its ack.
    ///
    /// The line is flow controlled like any job line. While a job runs it is
    /// reported as injected.
    pub async fn send_gcode(&self, text: impl Into<String>, options: SendOptions) -> Result<Ack> {
        self.ensure_loaded()?;
        let mut command = Command::gcode(text)
            .with_meta("plugin", json!(self.plugin_id))
            .with_meta_map(options.meta);
        if let Some(display) = options.display_command {
            command = command.with_meta("displayCommand", json!(display));
        }
        Ok(self.shared.sender.send(command).await?)
    }

    /// Write a log line attributed to the plugin.
    pub fn log(&self, message: impl AsRef<str>) {
        info!(category = "plugin", plugin = %self.plugin_id, "{}", message.as_ref());
    }

    /// Publish a message for connected clients.
    pub fn emit_to_client(&self, event: impl Into<String>, payload: Value) -> bool {
        if !self.is_loaded() {
            return false;
        }
        self.shared.bus.publish(
            SOURCE,
            EngineEvent::PluginMessage {
                plugin_id: self.plugin_id.clone(),
                event: event.into(),
                payload,
            },
        )
    }

    /// Replace the plugin's settings.
    pub fn set_settings(&self, settings: Value) {
        if self.is_loaded() {
            self.shared.settings.insert(self.plugin_id.clone(), settings);
        }
    }

    pub fn settings(&self) -> Option<Value> {
        self.shared
            .settings
            .get(&self.plugin_id)
            .map(|entry| entry.value().clone())
    }

    /// Add a tool menu action. A label already used by another plugin is
    /// taken over.
    pub fn register_tool_menu<F, Fut>(&self, label: impl Into<String>, action: F) -> Result<()>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<()>> + Send + 'static,
    {
        self.ensure_loaded()?;
        let label = label.into();
        let entry = ToolMenuEntry {
            plugin_id: self.plugin_id.clone(),
            label: label.clone(),
            handler: Arc::new(move || action().boxed()),
        };
        if let Some(previous) = self.shared.tool_menus.insert(label.clone(), entry) {
            if previous.plugin_id != self.plugin_id {
                warn!(
                    category = "plugin",
                    plugin = %self.plugin_id,
                    previous = %previous.plugin_id,
                    label = %label,
                    "Tool menu entry replaced"
                );
            }
        }
        Ok(())
    }
}
