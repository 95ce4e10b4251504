//! Stateless decision function from a `QueryContext` to {allow, learn,
//! block}. See `SPEC_FULL.md` §4.4.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::warn;

use crate::action::Action;
use crate::event::QueryContext;
use crate::fingerprint::{fingerprint, Fingerprint};
use crate::store::{Bucket, FingerprintStore, StoreEntry};
use crate::stream::Stream;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Learning,
    Protecting,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Block,
}

/// One pending training write. Queued by a learning-mode session, drained by
/// a single writer task so the proxy path never blocks on disk (§9 redesign
/// note: "fire-and-forget training writes").
pub struct TrainingJob {
    pub fingerprint: Fingerprint,
    pub entry: StoreEntry,
}

/// Bound chosen so a burst of queries on one connection cannot pin
/// unbounded memory while the writer task is catching up; overflow is a
/// logged drop, not backpressure on the proxy.
pub const TRAINING_QUEUE_CAPACITY: usize = 1024;

/// Spawns the single Store-writer task and returns the sender sessions use to
/// enqueue training writes.
pub fn spawn_training_writer(store: Arc<FingerprintStore>) -> mpsc::Sender<TrainingJob> {
    let (tx, mut rx) = mpsc::channel::<TrainingJob>(TRAINING_QUEUE_CAPACITY);
    tokio::spawn(async move {
        while let Some(job) = rx.recv().await {
            if let Err(e) = store.put(Bucket::Queries, &job.fingerprint, &job.entry) {
                warn!("training write failed, demoted to warning: {e}");
            }
        }
    });
    tx
}

pub struct PolicyEngine {
    pub mode: Mode,
    pub store: Arc<FingerprintStore>,
    pub training_tx: mpsc::Sender<TrainingJob>,
    pub action: Option<Arc<dyn Action>>,
}

impl PolicyEngine {
    /// Evaluate one `QueryContext`. `client` is handed to the configured
    /// action when a protection-mode lookup misses; it is the only way an
    /// action can end the session (by closing the socket).
    pub async fn evaluate(&self, ctx: &QueryContext, client: &mut (dyn Stream + '_)) -> Decision {
        let fp = fingerprint(ctx);

        match self.mode {
            Mode::Learning => {
                let job = TrainingJob {
                    fingerprint: fp,
                    entry: StoreEntry::from(ctx),
                };
                if self.training_tx.try_send(job).is_err() {
                    warn!("training queue full, dropping insert for this query");
                }
                Decision::Allow
            }
            Mode::Protecting => {
                let known = match self.store.exists(Bucket::Queries, &fp) {
                    Ok(known) => known,
                    Err(e) => {
                        // Storage failure at runtime fails closed: treat as
                        // unknown and invoke the action (§7).
                        warn!("protection-mode lookup failed, failing closed: {e}");
                        false
                    }
                };

                if known {
                    return Decision::Allow;
                }

                if let Err(e) = self.store.put(Bucket::Abnormal, &fp, &StoreEntry::from(ctx)) {
                    warn!("failed to record abnormal fingerprint: {e}");
                }

                match &self.action {
                    Some(action) => match action.invoke(client).await {
                        Ok(outcome) => outcome.into(),
                        Err(e) => {
                            warn!("policy action failed: {e}");
                            Decision::Allow
                        }
                    },
                    None => Decision::Allow,
                }
            }
        }
    }
}
