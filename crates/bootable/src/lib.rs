//! Abstract interface for components with a start/shutdown lifecycle.
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]

use async_trait::async_trait;

/// Trait for components that own background workers.
///
/// Producers, consumers, dispatchers, and reconcilers all share the same
/// lifecycle: created idle, `start` spawns the workers, `shutdown` cancels
/// them and waits for a clean exit. Both calls are idempotent while the
/// component is in the corresponding state.
#[async_trait]
pub trait Bootable
where
    Self: Send + Sync + 'static,
{
    /// Get the name of the component (used in logs).
    fn name(&self) -> &str;

    /// Start the component's workers.
    async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Cancel the component's workers and wait for them to exit.
    async fn shutdown(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;

    /// Wait for the component's workers to exit.
    async fn wait(&self);
}
