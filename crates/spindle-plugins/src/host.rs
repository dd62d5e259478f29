//! Plugin host: lifecycle, settings, tool menus and client messages.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use serde_json::Value;
use spindle_commands::QueueSender;
use spindle_core::EventBus;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::context::{HostShared, PluginContext};
use crate::error::{HandlerError, PluginError, Result};
use crate::pipeline::{guarded, PluginPipeline};
use crate::plugin::Plugin;
use crate::registry::HandlerRegistry;

/// Summary of a loaded plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
}

/// A tool menu entry as shown to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ToolMenuItem {
    pub plugin_id: String,
    pub label: String,
}

/// Owns loaded plugins and everything they registered.
pub struct PluginHost {
    shared: Arc<HostShared>,
    pipeline: Arc<PluginPipeline>,
    plugins: RwLock<HashMap<String, Arc<dyn Plugin>>>,
}

impl PluginHost {
    /// Create a host whose plugins send through `sender` and emit on `bus`.
    pub fn new(sender: QueueSender, bus: EventBus) -> Self {
        let registry = Arc::new(HandlerRegistry::new());
        let shared = Arc::new(HostShared {
            registry: registry.clone(),
            sender,
            bus,
            settings: DashMap::new(),
            tool_menus: DashMap::new(),
        });
        Self {
            shared,
            pipeline: Arc::new(PluginPipeline::new(registry)),
            plugins: RwLock::new(HashMap::new()),
        }
    }

    /// Middleware to install on the streaming queue.
    pub fn pipeline(&self) -> Arc<PluginPipeline> {
        self.pipeline.clone()
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.shared.registry
    }

    /// Load a plugin. A plugin whose `on_load` fails leaves nothing behind.
    pub async fn load(&self, plugin: Arc<dyn Plugin>) -> Result<()> {
        let id = plugin.id().to_string();
        let mut plugins = self.plugins.write().await;
        if plugins.contains_key(&id) {
            return Err(PluginError::AlreadyLoaded(id));
        }

        let alive = self.shared.registry.admit(&id);
        let ctx = PluginContext::new(id.clone(), alive, self.shared.clone());
        let loading = plugin.clone();
        let result = guarded(async move { loading.on_load(ctx).await.map_err(HandlerError::from) }).await;
        if let Err(e) = result {
            self.forget(&id);
            warn!(category = "plugin", plugin = %id, error = %e, "Plugin failed to load");
            return Err(PluginError::LoadFailed {
                plugin: id,
                message: e.message,
            });
        }

        info!(category = "plugin", plugin = %id, name = plugin.name(), "Plugin loaded");
        plugins.insert(id, plugin);
        Ok(())
    }

    /// Unload a plugin. Its handlers, tool menus and settings are removed
    /// before `on_unload` runs.
    pub async fn unload(&self, id: &str) -> Result<()> {
        let plugin = self
            .plugins
            .write()
            .await
            .remove(id)
            .ok_or_else(|| PluginError::NotFound(id.to_string()))?;
        let removed = self.forget(id);
        plugin.on_unload().await;
        info!(category = "plugin", plugin = %id, handlers = removed, "Plugin unloaded");
        Ok(())
    }

    /// Unload every plugin.
    pub async fn unload_all(&self) {
        let ids: Vec<String> = self.plugins.read().await.keys().cloned().collect();
        for id in ids {
            if let Err(e) = self.unload(&id).await {
                warn!(category = "plugin", plugin = %id, error = %e, "Failed to unload plugin");
            }
        }
    }

    fn forget(&self, id: &str) -> usize {
        let removed = self.shared.registry.unregister_plugin(id);
        self.shared.tool_menus.retain(|_, entry| entry.plugin_id != id);
        self.shared.settings.remove(id);
        removed
    }

    /// Loaded plugins sorted by ID.
    pub async fn list(&self) -> Vec<PluginInfo> {
        let mut list: Vec<PluginInfo> = self
            .plugins
            .read()
            .await
            .values()
            .map(|p| PluginInfo {
                id: p.id().to_string(),
                name: p.name().to_string(),
            })
            .collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn is_loaded(&self, id: &str) -> bool {
        self.plugins.read().await.contains_key(id)
    }

    /// Settings last stored by a plugin.
    pub fn settings(&self, id: &str) -> Option<Value> {
        self.shared.settings.get(id).map(|entry| entry.value().clone())
    }

    /// Tool menu entries sorted by label.
    pub fn tool_menu(&self) -> Vec<ToolMenuItem> {
        let mut items: Vec<ToolMenuItem> = self
            .shared
            .tool_menus
            .iter()
            .map(|entry| ToolMenuItem {
                plugin_id: entry.plugin_id.clone(),
                label: entry.label.clone(),
            })
            .collect();
        items.sort_by(|a, b| a.label.cmp(&b.label));
        items
    }

    /// Run a tool menu action.
    pub async fn invoke_tool_menu(&self, label: &str) -> Result<()> {
        let entry = self
            .shared
            .tool_menus
            .get(label)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| PluginError::ToolMenuNotFound(label.to_string()))?;
        let handler = entry.handler.clone();
        guarded(async move { handler().await })
            .await
            .map_err(|source| PluginError::Handler {
                plugin: entry.plugin_id.clone(),
                source,
            })
    }

    /// Deliver a client message to plugins. Returns how many handlers took it.
    pub async fn dispatch_message(&self, event: &str, payload: Value) -> usize {
        self.pipeline.dispatch_message(event, payload).await
    }
}
