//! The selector's scheduler: one task owns the selector and runs queued
//! work in order.

use super::FileSelector;
use crate::error::SelectorError;
use crate::storage::StorageWrapper;
use seed_core::Priority;
use seed_core::bencoding::Bencode;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

pub enum SelectorTask {
    /// Commit whatever is staged. A no-op when nothing is.
    CommitPending,
    SetPriorities(Vec<Priority>),
    SetPriority(usize, Priority),
    GetPriorities(oneshot::Sender<Vec<Priority>>),
    Pickle(oneshot::Sender<Bencode>),
    Shutdown,
}

/// Cloneable front for callers outside the scheduler task.
#[derive(Clone)]
pub struct SelectorHandle {
    tx: mpsc::UnboundedSender<SelectorTask>,
}

impl SelectorHandle {
    pub fn new(tx: mpsc::UnboundedSender<SelectorTask>) -> Self {
        Self { tx }
    }

    pub fn set_priorities(&self, priorities: Vec<Priority>) -> Result<(), SelectorError> {
        self.tx
            .send(SelectorTask::SetPriorities(priorities))
            .map_err(|_| SelectorError::Closed)
    }

    pub fn set_priority(&self, file: usize, priority: Priority) -> Result<(), SelectorError> {
        self.tx
            .send(SelectorTask::SetPriority(file, priority))
            .map_err(|_| SelectorError::Closed)
    }

    pub async fn get_priorities(&self) -> Result<Vec<Priority>, SelectorError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SelectorTask::GetPriorities(tx))
            .map_err(|_| SelectorError::Closed)?;
        rx.await.map_err(|_| SelectorError::Closed)
    }

    pub async fn pickle(&self) -> Result<Bencode, SelectorError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(SelectorTask::Pickle(tx))
            .map_err(|_| SelectorError::Closed)?;
        rx.await.map_err(|_| SelectorError::Closed)
    }

    /// Stops the scheduler after the work already queued.
    pub fn shutdown(&self) {
        let _ = self.tx.send(SelectorTask::Shutdown);
    }
}

impl<S: StorageWrapper> FileSelector<S> {
    pub fn handle_task(&mut self, task: SelectorTask) {
        match task {
            SelectorTask::CommitPending => self.set_priorities_now(),
            SelectorTask::SetPriorities(p) => {
                if let Err(e) = self.set_priorities(p) {
                    warn!("Rejected priorities: {}", e);
                }
            }
            SelectorTask::SetPriority(file, p) => {
                if let Err(e) = self.set_priority(file, p) {
                    warn!("Rejected priority for file {}: {}", file, e);
                }
            }
            SelectorTask::GetPriorities(reply) => {
                let _ = reply.send(self.get_priorities());
            }
            SelectorTask::Pickle(reply) => {
                let _ = reply.send(self.pickle());
            }
            SelectorTask::Shutdown => {}
        }
    }
}

/// Runs the selector until a `Shutdown` task arrives, then hands it back.
pub async fn run<S: StorageWrapper>(
    mut selector: FileSelector<S>,
    mut rx: mpsc::UnboundedReceiver<SelectorTask>,
) -> FileSelector<S> {
    while let Some(task) = rx.recv().await {
        if matches!(task, SelectorTask::Shutdown) {
            break;
        }
        selector.handle_task(task);
    }
    info!("File selector stopped");
    selector
}
