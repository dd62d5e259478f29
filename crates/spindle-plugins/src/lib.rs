//! Plugin middleware for the spindle streaming engine.
//!
//! Plugins register handlers for job and line hooks through a
//! [`PluginContext`]. The [`PluginHost`] owns loaded plugins and exposes a
//! [`PluginPipeline`] to install on the streaming queue.
//!
//! ```text
//! let host = PluginHost::new(queue.sender(), bus.clone());
//! let queue = queue.with_middleware(host.pipeline());
//! host.load(Arc::new(AutoDustBoot::default())).await?;
//! ```

pub mod builtin;
pub mod context;
pub mod error;
pub mod host;
pub mod pipeline;
pub mod plugin;
pub mod registry;

pub use builtin::{AutoDustBoot, DustBootSettings};
pub use context::{PluginContext, SendOptions, ToolMenuEntry};
pub use error::{HandlerError, PluginError, Result};
pub use host::{PluginHost, PluginInfo, ToolMenuItem};
pub use pipeline::PluginPipeline;
pub use plugin::Plugin;
pub use registry::{EventHandler, HandlerRegistry, HandlerResult, HookKind, Registration};
