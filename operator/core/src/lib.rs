#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

/// A long-running component managed by the operator process.
///
/// Runnables are started once and are expected to run until `shutdown` is signaled, returning
/// only after they have released their resources.
#[async_trait::async_trait]
pub trait Runnable: Send + 'static {
    /// A human-readable name, used in logs.
    fn name(&self) -> &'static str;

    /// Indicates whether the runnable must only run on the replica that holds the controller lease.
    ///
    /// Runnables that return false are started on every replica.
    fn need_leader_election(&self) -> bool {
        true
    }

    /// Runs until `shutdown` is signaled.
    ///
    /// Errors are fatal to the process.
    async fn start(self: Box<Self>, shutdown: drain::Watch) -> anyhow::Result<()>;
}
