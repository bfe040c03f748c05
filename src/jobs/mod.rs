//! Deferred work. The HTTP response only confirms scheduling; execution
//! happens on a worker task. Tests run the dispatcher in inline mode so
//! a request returns with its side effects already applied.

pub mod ghost_migration;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::models::user::UserId;
use crate::store::Store;

#[derive(Debug, Clone)]
pub enum Job {
    GhostUserMigration {
        user_id: UserId,
        initiator_id: UserId,
        hard_delete: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchMode {
    /// Hand jobs to a background worker (production).
    Spawn,
    /// Run the job before returning (tests).
    Inline,
}

pub struct Dispatcher {
    mode: DispatchMode,
    store: Arc<Store>,
    tx: Option<mpsc::UnboundedSender<Job>>,
}

impl Dispatcher {
    /// `Spawn` mode starts the worker task, so it must be called from
    /// within a tokio runtime.
    pub fn new(store: Arc<Store>, mode: DispatchMode) -> Dispatcher {
        let tx = match mode {
            DispatchMode::Spawn => {
                let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
                let worker_store = store.clone();
                tokio::spawn(async move {
                    while let Some(job) = rx.recv().await {
                        run(&worker_store, job);
                    }
                });
                Some(tx)
            }
            DispatchMode::Inline => None,
        };
        Dispatcher { mode, store, tx }
    }

    pub fn enqueue(&self, job: Job) {
        match (&self.tx, self.mode) {
            (Some(tx), DispatchMode::Spawn) => {
                if tx.send(job).is_err() {
                    tracing::error!("job worker is gone; dropping job");
                }
            }
            _ => run(&self.store, job),
        }
    }
}

fn run(store: &Store, job: Job) {
    match job {
        Job::GhostUserMigration {
            user_id,
            initiator_id,
            hard_delete,
        } => ghost_migration::run(store, user_id, initiator_id, hard_delete),
    }
}
