//! Plugin SDK and shared types for the metricd monitoring agent
//!
//! This crate contains everything a collector plugin needs to compile
//! against: the capability traits, the request/result types exchanged
//! with the scheduler, the item key parser and the expression sets
//! consumers hand over with each refresh.

pub mod expressions;
pub mod itemkey;
pub mod plugin;

// Re-export commonly used types for convenience
pub use expressions::ExpressionSet;
pub use itemkey::parse_key;
pub use plugin::{
    CheckResult, ExportContext, Metric, MetricRegistry, Plugin, Request, ResultWriter,
};

/// Result type alias used throughout the shared crate
pub type Result<T> = anyhow::Result<T>;

/// Error taxonomy of the scheduler and its collaborators.
///
/// Per-item errors (`UnknownMetric`, `Plugin`, `Schedule`) are attached to
/// the item's result record and delivered to the client sink; the global
/// kinds are returned to the call site.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    /// The parsed key has no owning plugin, or key access rules reject it.
    #[error("Unknown metric {0}")]
    UnknownMetric(String),

    /// The plugin returned a failure from its export/collect/watch hook.
    #[error("{0}")]
    Plugin(String),

    /// No valid future instant could be computed for a task.
    #[error("cannot compute next scheduled time: {0}")]
    Schedule(String),

    /// Direct checks are rejected while the scheduler is shutting down.
    #[error("Cannot obtain item value during shutdown process.")]
    Shutdown,

    /// An on-demand check exceeded the caller's deadline.
    #[error("Timeout occurred while gathering data.")]
    Timeout,

    /// A plugin's Configure or Validate hook failed during startup.
    #[error("invalid plugin {plugin} configuration: {message}")]
    Config { plugin: String, message: String },

    /// Reload of user-parameter metrics failed; the previous set is kept.
    #[error("cannot process user parameters request: {0}")]
    UserParamReload(String),
}
