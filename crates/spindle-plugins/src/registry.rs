//! Handler registry keyed by hook and owning plugin.
//!
//! Each hook keeps its handlers in registration order. Unloading a plugin
//! removes all of its handlers under one write lock and flips the plugin's
//! liveness flag, so a snapshot taken earlier skips them too.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use spindle_commands::{LineContext, LineDirective};
use spindle_core::{Ack, JobEndReason, JobInfo};

use crate::error::HandlerError;

/// Result returned by plugin handlers.
pub type HandlerResult<T> = std::result::Result<T, HandlerError>;

/// Extension points a plugin can hook into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum HookKind {
    #[serde(rename = "onBeforeGcodeLine")]
    BeforeGcodeLine,
    #[serde(rename = "onAfterGcodeLine")]
    AfterGcodeLine,
    #[serde(rename = "onBeforeJobStart")]
    BeforeJobStart,
    #[serde(rename = "onAfterJobEnd")]
    AfterJobEnd,
    #[serde(rename = "onMessage")]
    Message,
}

impl HookKind {
    pub const ALL: [HookKind; 5] = [
        HookKind::BeforeGcodeLine,
        HookKind::AfterGcodeLine,
        HookKind::BeforeJobStart,
        HookKind::AfterJobEnd,
        HookKind::Message,
    ];

    /// Event name plugins register under.
    pub fn name(&self) -> &'static str {
        match self {
            HookKind::BeforeGcodeLine => "onBeforeGcodeLine",
            HookKind::AfterGcodeLine => "onAfterGcodeLine",
            HookKind::BeforeJobStart => "onBeforeJobStart",
            HookKind::AfterJobEnd => "onAfterJobEnd",
            HookKind::Message => "onMessage",
        }
    }
}

impl fmt::Display for HookKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for HookKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        HookKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| format!("Unknown plugin event: {}", s))
    }
}

pub type BeforeLineFn =
    Arc<dyn Fn(String, LineContext) -> BoxFuture<'static, HandlerResult<LineDirective>> + Send + Sync>;
pub type AfterLineFn =
    Arc<dyn Fn(String, Ack, LineContext) -> BoxFuture<'static, HandlerResult<()>> + Send + Sync>;
pub type BeforeJobFn =
    Arc<dyn Fn(JobInfo, String) -> BoxFuture<'static, HandlerResult<String>> + Send + Sync>;
pub type AfterJobFn =
    Arc<dyn Fn(JobInfo, JobEndReason) -> BoxFuture<'static, HandlerResult<()>> + Send + Sync>;
pub type MessageFn =
    Arc<dyn Fn(String, serde_json::Value) -> BoxFuture<'static, HandlerResult<()>> + Send + Sync>;

/// A plugin callback for one hook.
///
/// Handlers receive their inputs by value and own whatever state they
/// capture.
#[derive(Clone)]
pub enum EventHandler {
    BeforeGcodeLine(BeforeLineFn),
    AfterGcodeLine(AfterLineFn),
    BeforeJobStart(BeforeJobFn),
    AfterJobEnd(AfterJobFn),
    Message(MessageFn),
}

impl EventHandler {
    pub fn kind(&self) -> HookKind {
        match self {
            EventHandler::BeforeGcodeLine(_) => HookKind::BeforeGcodeLine,
            EventHandler::AfterGcodeLine(_) => HookKind::AfterGcodeLine,
            EventHandler::BeforeJobStart(_) => HookKind::BeforeJobStart,
            EventHandler::AfterJobEnd(_) => HookKind::AfterJobEnd,
            EventHandler::Message(_) => HookKind::Message,
        }
    }

    pub fn before_gcode_line<F, Fut>(f: F) -> Self
    where
        F: Fn(String, LineContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<LineDirective>> + Send + 'static,
    {
        EventHandler::BeforeGcodeLine(Arc::new(move |line: String, ctx: LineContext| f(line, ctx).boxed()))
    }

    pub fn after_gcode_line<F, Fut>(f: F) -> Self
    where
        F: Fn(String, Ack, LineContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<()>> + Send + 'static,
    {
        EventHandler::AfterGcodeLine(Arc::new(move |line: String, ack: Ack, ctx: LineContext| {
            f(line, ack, ctx).boxed()
        }))
    }

    pub fn before_job_start<F, Fut>(f: F) -> Self
    where
        F: Fn(JobInfo, String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<String>> + Send + 'static,
    {
        EventHandler::BeforeJobStart(Arc::new(move |job: JobInfo, text: String| f(job, text).boxed()))
    }

    pub fn after_job_end<F, Fut>(f: F) -> Self
    where
        F: Fn(JobInfo, JobEndReason) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<()>> + Send + 'static,
    {
        EventHandler::AfterJobEnd(Arc::new(move |job: JobInfo, reason: JobEndReason| f(job, reason).boxed()))
    }

    pub fn on_message<F, Fut>(f: F) -> Self
    where
        F: Fn(String, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult<()>> + Send + 'static,
    {
        EventHandler::Message(Arc::new(move |event: String, payload: serde_json::Value| {
            f(event, payload).boxed()
        }))
    }
}

impl fmt::Debug for EventHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EventHandler").field(&self.kind()).finish()
    }
}

/// One registered handler.
#[derive(Clone)]
pub struct Registration {
    pub plugin_id: String,
    alive: Arc<AtomicBool>,
    pub handler: EventHandler,
}

impl Registration {
    /// Check if the owning plugin is still loaded.
    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct RegistryInner {
    hooks: BTreeMap<HookKind, Vec<Registration>>,
    plugins: HashMap<String, Arc<AtomicBool>>,
}

/// Ordered map from hook to `(plugin, handler)` lists.
#[derive(Default)]
pub struct HandlerRegistry {
    inner: RwLock<RegistryInner>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a plugin as loaded and return its liveness flag.
    pub fn admit(&self, plugin_id: &str) -> Arc<AtomicBool> {
        let alive = Arc::new(AtomicBool::new(true));
        self.inner
            .write()
            .plugins
            .insert(plugin_id.to_string(), alive.clone());
        alive
    }

    /// Check if a plugin is registered.
    pub fn contains(&self, plugin_id: &str) -> bool {
        self.inner.read().plugins.contains_key(plugin_id)
    }

    /// Append a handler. Returns `false` when the plugin is not admitted.
    pub fn register(&self, plugin_id: &str, handler: EventHandler) -> bool {
        let mut inner = self.inner.write();
        let Some(alive) = inner.plugins.get(plugin_id).cloned() else {
            return false;
        };
        if !alive.load(Ordering::SeqCst) {
            return false;
        }
        inner
            .hooks
            .entry(handler.kind())
            .or_default()
            .push(Registration {
                plugin_id: plugin_id.to_string(),
                alive,
                handler,
            });
        true
    }

    /// Remove every handler of a plugin. Returns the number removed.
    pub fn unregister_plugin(&self, plugin_id: &str) -> usize {
        let mut inner = self.inner.write();
        if let Some(alive) = inner.plugins.remove(plugin_id) {
            alive.store(false, Ordering::SeqCst);
        }
        let mut removed = 0;
        for list in inner.hooks.values_mut() {
            let before = list.len();
            list.retain(|r| r.plugin_id != plugin_id);
            removed += before - list.len();
        }
        inner.hooks.retain(|_, list| !list.is_empty());
        removed
    }

    /// Handlers for a hook in registration order.
    pub fn snapshot(&self, kind: HookKind) -> Vec<Registration> {
        self.inner
            .read()
            .hooks
            .get(&kind)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of handlers registered for a hook.
    pub fn count(&self, kind: HookKind) -> usize {
        self.inner.read().hooks.get(&kind).map_or(0, Vec::len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> EventHandler {
        EventHandler::after_job_end(|_, _| async { Ok(()) })
    }

    #[test]
    fn test_hook_names_round_trip() {
        for kind in HookKind::ALL {
            assert_eq!(kind.name().parse::<HookKind>().unwrap(), kind);
        }
        assert!("onSomethingElse".parse::<HookKind>().is_err());
    }

    #[test]
    fn test_register_keeps_order() {
        let registry = HandlerRegistry::new();
        registry.admit("a");
        registry.admit("b");
        assert!(registry.register("b", noop()));
        assert!(registry.register("a", noop()));

        let ids: Vec<_> = registry
            .snapshot(HookKind::AfterJobEnd)
            .into_iter()
            .map(|r| r.plugin_id)
            .collect();
        assert_eq!(ids, vec!["b", "a"]);
    }

    #[test]
    fn test_unknown_plugin_cannot_register() {
        let registry = HandlerRegistry::new();
        assert!(!registry.register("ghost", noop()));
        assert_eq!(registry.count(HookKind::AfterJobEnd), 0);
    }

    #[test]
    fn test_unregister_removes_all_and_kills_snapshot() {
        let registry = HandlerRegistry::new();
        registry.admit("a");
        registry.admit("b");
        registry.register("a", noop());
        registry.register("a", EventHandler::on_message(|_, _| async { Ok(()) }));
        registry.register("b", noop());

        let snapshot = registry.snapshot(HookKind::AfterJobEnd);
        assert_eq!(registry.unregister_plugin("a"), 2);

        assert_eq!(registry.count(HookKind::AfterJobEnd), 1);
        assert_eq!(registry.count(HookKind::Message), 0);
        assert!(!snapshot[0].is_alive());
        assert!(snapshot[1].is_alive());
        assert!(!registry.register("a", noop()));
    }
}
