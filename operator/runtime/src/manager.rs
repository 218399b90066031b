use crate::core::Runnable;
use anyhow::{bail, Context, Result};
use tokio::task::JoinSet;
use tracing::{debug, info_span, Instrument};

/// Runs the process's [`Runnable`]s until shutdown.
///
/// The operator holds no controller lease, so every runnable runs on every replica. Runnables
/// that need leader election are rejected before anything is started.
#[derive(Default)]
pub struct Manager {
    runnables: Vec<Box<dyn Runnable>>,
}

// === impl Manager ===

impl Manager {
    pub fn add(&mut self, runnable: impl Runnable) {
        self.runnables.push(Box::new(runnable));
    }

    /// Starts all runnables and waits for them to complete.
    ///
    /// Returns the first error reported by a runnable.
    pub async fn run(self, shutdown: drain::Watch) -> Result<()> {
        if let Some(runnable) = self.runnables.iter().find(|r| r.need_leader_election()) {
            bail!("{} requires leader election", runnable.name());
        }

        let mut tasks = JoinSet::new();
        for runnable in self.runnables {
            let name = runnable.name();
            let shutdown = shutdown.clone();
            debug!(%name, "Starting");
            tasks.spawn(
                async move { runnable.start(shutdown).await.with_context(|| name) }
                    .instrument(info_span!("runnable", %name)),
            );
        }
        drop(shutdown);

        while let Some(res) = tasks.join_next().await {
            res.context("runnable task failed")??;
        }
        Ok(())
    }
}
