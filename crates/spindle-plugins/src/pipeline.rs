//! Plugin middleware pipeline.
//!
//! Runs registered handlers around each job line and job boundary. Handler
//! failures and panics are contained: the handler is treated as if it changed
//! nothing, unless it returns a fatal error, which fails the job.

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures::FutureExt;
use spindle_commands::{LineAction, LineContext, LineDirective, LineMiddleware};
use spindle_core::{Ack, EngineError, JobEndReason, JobInfo};
use tracing::{debug, error, warn};

use crate::error::HandlerError;
use crate::registry::{EventHandler, HandlerRegistry, HandlerResult, HookKind, Registration};

/// Run a handler future, turning a panic into a non-fatal handler error.
pub(crate) async fn guarded<T, F>(fut: F) -> HandlerResult<T>
where
    F: Future<Output = HandlerResult<T>>,
{
    match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(HandlerError::new(format!(
            "handler panicked: {}",
            panic_message(&panic)
        ))),
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn log_failure(registration: &Registration, hook: HookKind, err: &HandlerError) {
    if err.fatal {
        error!(
            category = "plugin",
            plugin = %registration.plugin_id,
            hook = %hook,
            error = %err,
            "Plugin handler aborted"
        );
    } else {
        warn!(
            category = "plugin",
            plugin = %registration.plugin_id,
            hook = %hook,
            error = %err,
            "Plugin handler failed"
        );
    }
}

/// [`LineMiddleware`] that dispatches to plugin handlers in registration
/// order.
#[derive(Clone)]
pub struct PluginPipeline {
    registry: Arc<HandlerRegistry>,
}

impl PluginPipeline {
    pub fn new(registry: Arc<HandlerRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    /// Live handlers for a hook. Handlers of plugins unloaded after the
    /// snapshot was taken are filtered again at call time.
    fn live(&self, hook: HookKind) -> impl Iterator<Item = Registration> {
        self.registry.snapshot(hook).into_iter()
    }

    /// Deliver a client message to every `onMessage` handler. Returns the
    /// number of handlers that accepted it.
    pub async fn dispatch_message(&self, event: &str, payload: serde_json::Value) -> usize {
        let mut delivered = 0;
        for registration in self.live(HookKind::Message) {
            if !registration.is_alive() {
                continue;
            }
            let EventHandler::Message(handler) = &registration.handler else {
                continue;
            };
            let handler = handler.clone();
            let (event, payload) = (event.to_string(), payload.clone());
            match guarded(async move { handler(event, payload).await }).await {
                Ok(()) => delivered += 1,
                Err(e) => log_failure(&registration, HookKind::Message, &e),
            }
        }
        delivered
    }
}

#[async_trait]
impl LineMiddleware for PluginPipeline {
    async fn before_job(&self, job: &JobInfo, text: String) -> Result<String, EngineError> {
        let mut text = text;
        for registration in self.live(HookKind::BeforeJobStart) {
            if !registration.is_alive() {
                continue;
            }
            let EventHandler::BeforeJobStart(handler) = &registration.handler else {
                continue;
            };
            let handler = handler.clone();
            let (job, input) = (job.clone(), text.clone());
            match guarded(async move { handler(job, input).await }).await {
                Ok(rewritten) => text = rewritten,
                Err(e) => {
                    log_failure(&registration, HookKind::BeforeJobStart, &e);
                    if e.fatal {
                        return Err(e.into_engine_error(&registration.plugin_id));
                    }
                }
            }
        }
        Ok(text)
    }

    async fn before_line(&self, line: &str, ctx: &LineContext) -> Result<LineDirective, EngineError> {
        let mut current = line.to_string();
        let mut skipped = false;
        let mut inject_before = Vec::new();
        let mut inject_after = Vec::new();

        for registration in self.live(HookKind::BeforeGcodeLine) {
            if !registration.is_alive() {
                continue;
            }
            let EventHandler::BeforeGcodeLine(handler) = &registration.handler else {
                continue;
            };
            let handler = handler.clone();
            let (input, line_ctx) = (current.clone(), ctx.clone());
            match guarded(async move { handler(input, line_ctx).await }).await {
                Ok(directive) => {
                    inject_before.extend(directive.inject_before);
                    inject_after.extend(directive.inject_after);
                    match directive.action {
                        LineAction::Keep => {}
                        LineAction::Replace(text) => current = text,
                        LineAction::Skip => {
                            debug!(
                                category = "plugin",
                                plugin = %registration.plugin_id,
                                line = ctx.line_number,
                                "Line skipped by plugin"
                            );
                            skipped = true;
                        }
                    }
                    // A skipped line is not offered to later handlers.
                    if skipped {
                        break;
                    }
                }
                Err(e) => {
                    log_failure(&registration, HookKind::BeforeGcodeLine, &e);
                    if e.fatal {
                        return Err(e.into_engine_error(&registration.plugin_id));
                    }
                }
            }
        }

        let action = if skipped {
            LineAction::Skip
        } else if current != line {
            LineAction::Replace(current)
        } else {
            LineAction::Keep
        };
        Ok(LineDirective {
            action,
            inject_before,
            inject_after,
        })
    }

    async fn after_line(&self, line: &str, ack: &Ack, ctx: &LineContext) {
        for registration in self.live(HookKind::AfterGcodeLine) {
            if !registration.is_alive() {
                continue;
            }
            let EventHandler::AfterGcodeLine(handler) = &registration.handler else {
                continue;
            };
            let handler = handler.clone();
            let (line, ack, line_ctx) = (line.to_string(), ack.clone(), ctx.clone());
            if let Err(e) = guarded(async move { handler(line, ack, line_ctx).await }).await {
                log_failure(&registration, HookKind::AfterGcodeLine, &e);
            }
        }
    }

    async fn after_job(&self, job: &JobInfo, reason: JobEndReason) {
        for registration in self.live(HookKind::AfterJobEnd) {
            if !registration.is_alive() {
                continue;
            }
            let EventHandler::AfterJobEnd(handler) = &registration.handler else {
                continue;
            };
            let handler = handler.clone();
            let job = job.clone();
            if let Err(e) = guarded(async move { handler(job, reason).await }).await {
                log_failure(&registration, HookKind::AfterJobEnd, &e);
            }
        }
    }
}
