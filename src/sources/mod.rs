//! Reactive components bound to the board: one mirrors the issue lifecycle
//! into card placement, the other publishes cards from the outbound column.

use tokio::task::JoinHandle;

pub mod issues;
pub mod publish;

pub use issues::IssueSyncSource;
pub use publish::PublishSource;

/// Handle to a started source. Dropping it leaves the source running.
#[derive(Debug)]
pub struct SourceHandle {
    name: &'static str,
    task: JoinHandle<()>,
}

impl SourceHandle {
    pub(crate) fn new(name: &'static str, task: JoinHandle<()>) -> Self {
        Self { name, task }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Aborts the source together with all work it spawned
    pub fn stop(self) {
        tracing::debug!(source = self.name, "stopping source");
        self.task.abort();
    }
}
