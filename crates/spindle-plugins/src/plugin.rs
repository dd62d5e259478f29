//! Plugin contract.

use async_trait::async_trait;

use crate::context::PluginContext;
use crate::error::Result;

/// A loadable extension.
///
/// Plugins keep their own state and hand clones of it to the handlers they
/// register in [`Plugin::on_load`]. Handlers are removed by the host on
/// unload; `on_unload` only needs to release whatever else the plugin holds.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Unique plugin ID.
    fn id(&self) -> &str;

    /// Human-readable name.
    fn name(&self) -> &str {
        self.id()
    }

    async fn on_load(&self, ctx: PluginContext) -> Result<()>;

    async fn on_unload(&self) {}
}
