//! Session-scoped transaction coordination.
//!
//! A [`TransactionManager`] owns every transaction enlisted during one unit of
//! work and drives them together. Commit runs in three phases: prepare,
//! normal, then after-completion. The first failure rolls back everything not
//! yet committed.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{StorageError, StorageResult};

/// A participant in a unit of work.
#[async_trait]
pub trait StorageTransaction: Send + Sync {
    /// Name for logs.
    fn name(&self) -> String;

    /// Starts the transaction.
    ///
    /// ## Errors
    ///
    /// Returns an error if the transaction was already completed.
    async fn begin(&self) -> StorageResult<()>;

    /// Applies buffered work.
    ///
    /// ## Errors
    ///
    /// Returns the first backend failure.
    async fn commit(&self) -> StorageResult<()>;

    /// Discards buffered work.
    ///
    /// ## Errors
    ///
    /// Returns an error if the transaction cannot be rolled back.
    async fn rollback(&self) -> StorageResult<()>;

    /// Forbids commit.
    fn set_rollback_only(&self);

    /// Whether commit is forbidden.
    fn is_rollback_only(&self) -> bool;

    /// Whether the transaction is started and not yet completed.
    fn is_active(&self) -> bool;
}

/// Commit phase a transaction is enlisted in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnlistPhase {
    /// Committed first.
    Prepare,
    /// Regular participants.
    Normal,
    /// Committed last, after everything else succeeded.
    AfterCompletion,
}

#[derive(Default)]
struct ManagerState {
    active: bool,
    completed: bool,
    rollback_only: bool,
    prepare: Vec<Arc<dyn StorageTransaction>>,
    normal: Vec<Arc<dyn StorageTransaction>>,
    after_completion: Vec<Arc<dyn StorageTransaction>>,
}

impl ManagerState {
    fn ordered(&self) -> Vec<Arc<dyn StorageTransaction>> {
        self.prepare
            .iter()
            .chain(&self.normal)
            .chain(&self.after_completion)
            .cloned()
            .collect()
    }
}

/// Coordinates the transactions of one session.
pub struct TransactionManager {
    state: Mutex<ManagerState>,
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TransactionManager")
            .field("active", &state.active)
            .field("completed", &state.completed)
            .field("rollback_only", &state.rollback_only)
            .field("enlisted", &(state.prepare.len() + state.normal.len() + state.after_completion.len()))
            .finish()
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    /// Creates an inactive manager.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ManagerState::default()),
        }
    }

    /// Enlists a regular transaction, starting it if the manager is active.
    ///
    /// ## Errors
    ///
    /// Returns an error if the manager already completed or the transaction
    /// fails to start.
    pub async fn enlist(&self, tx: Arc<dyn StorageTransaction>) -> StorageResult<()> {
        self.enlist_in(EnlistPhase::Normal, tx).await
    }

    /// Enlists a transaction in a given phase.
    ///
    /// ## Errors
    ///
    /// Returns an error if the manager already completed or the transaction
    /// fails to start.
    pub async fn enlist_in(&self, phase: EnlistPhase, tx: Arc<dyn StorageTransaction>) -> StorageResult<()> {
        let start = {
            let mut state = self.state.lock();
            if state.completed {
                return Err(StorageError::Transaction(
                    "cannot enlist in a completed transaction".to_string(),
                ));
            }
            match phase {
                EnlistPhase::Prepare => state.prepare.push(Arc::clone(&tx)),
                EnlistPhase::Normal => state.normal.push(Arc::clone(&tx)),
                EnlistPhase::AfterCompletion => state.after_completion.push(Arc::clone(&tx)),
            }
            state.active
        };
        if start && !tx.is_active() {
            tx.begin().await?;
        }
        tracing::trace!(tx = %tx.name(), ?phase, "Enlisted transaction");
        Ok(())
    }

    /// Starts the manager and every enlisted transaction.
    ///
    /// ## Errors
    ///
    /// Returns an error if already started or a transaction fails to start.
    pub async fn begin(&self) -> StorageResult<()> {
        let txs = {
            let mut state = self.state.lock();
            if state.active || state.completed {
                return Err(StorageError::Transaction("transaction already started".to_string()));
            }
            state.active = true;
            state.ordered()
        };
        for tx in txs {
            tx.begin().await?;
        }
        Ok(())
    }

    /// Commits every enlisted transaction in phase order.
    ///
    /// ## Errors
    ///
    /// Returns [`StorageError::Transaction`] if the manager is not active or
    /// is rollback-only (everything is rolled back), or the first commit
    /// failure (everything not yet committed is rolled back).
    pub async fn commit(&self) -> StorageResult<()> {
        let (txs, rollback_only) = {
            let mut state = self.state.lock();
            if !state.active {
                return Err(StorageError::Transaction("transaction not active".to_string()));
            }
            state.active = false;
            state.completed = true;
            let txs = state.ordered();
            let rollback_only = state.rollback_only || txs.iter().any(|tx| tx.is_rollback_only());
            (txs, rollback_only)
        };

        if rollback_only {
            tracing::debug!("Transaction marked rollback-only, rolling back");
            rollback_all(&txs).await;
            return Err(StorageError::Transaction(
                "transaction is marked rollback-only".to_string(),
            ));
        }

        for (index, tx) in txs.iter().enumerate() {
            if let Err(err) = tx.commit().await {
                tracing::error!(tx = %tx.name(), error = %err, "Commit failed, rolling back remaining transactions");
                rollback_all(&txs[index + 1..]).await;
                return Err(err);
            }
        }
        Ok(())
    }

    /// Rolls back every enlisted transaction.
    ///
    /// ## Errors
    ///
    /// Returns an error if the manager is not active. Individual rollback
    /// failures are logged.
    pub async fn rollback(&self) -> StorageResult<()> {
        let txs = {
            let mut state = self.state.lock();
            if !state.active {
                return Err(StorageError::Transaction("transaction not active".to_string()));
            }
            state.active = false;
            state.completed = true;
            state.ordered()
        };
        rollback_all(&txs).await;
        Ok(())
    }

    /// Forbids commit.
    pub fn set_rollback_only(&self) {
        self.state.lock().rollback_only = true;
    }

    /// Whether commit is forbidden, by the manager or any participant.
    #[must_use]
    pub fn is_rollback_only(&self) -> bool {
        let state = self.state.lock();
        state.rollback_only || state.ordered().iter().any(|tx| tx.is_rollback_only())
    }

    /// Whether the manager is started and not yet completed.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }
}

async fn rollback_all(txs: &[Arc<dyn StorageTransaction>]) {
    for tx in txs {
        if let Err(err) = tx.rollback().await {
            tracing::warn!(tx = %tx.name(), error = %err, "Rollback failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[derive(Default)]
    struct Recorder {
        name: &'static str,
        fail_commit: bool,
        active: AtomicBool,
        rollback_only: AtomicBool,
        log: Arc<Mutex<Vec<String>>>,
    }

    impl Recorder {
        fn new(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                log: Arc::clone(log),
                ..Self::default()
            })
        }

        fn failing(name: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                fail_commit: true,
                log: Arc::clone(log),
                ..Self::default()
            })
        }
    }

    #[async_trait]
    impl StorageTransaction for Recorder {
        fn name(&self) -> String {
            self.name.to_string()
        }

        async fn begin(&self) -> StorageResult<()> {
            self.active.store(true, Ordering::SeqCst);
            self.log.lock().push(format!("begin {}", self.name));
            Ok(())
        }

        async fn commit(&self) -> StorageResult<()> {
            self.active.store(false, Ordering::SeqCst);
            self.log.lock().push(format!("commit {}", self.name));
            if self.fail_commit {
                return Err(StorageError::Internal("boom".to_string()));
            }
            Ok(())
        }

        async fn rollback(&self) -> StorageResult<()> {
            self.active.store(false, Ordering::SeqCst);
            self.log.lock().push(format!("rollback {}", self.name));
            Ok(())
        }

        fn set_rollback_only(&self) {
            self.rollback_only.store(true, Ordering::SeqCst);
        }

        fn is_rollback_only(&self) -> bool {
            self.rollback_only.load(Ordering::SeqCst)
        }

        fn is_active(&self) -> bool {
            self.active.load(Ordering::SeqCst)
        }
    }

    #[tokio::test]
    async fn commits_in_phase_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = TransactionManager::new();
        manager.begin().await.unwrap();
        manager
            .enlist_in(EnlistPhase::AfterCompletion, Recorder::new("after", &log))
            .await
            .unwrap();
        manager.enlist(Recorder::new("normal", &log)).await.unwrap();
        manager
            .enlist_in(EnlistPhase::Prepare, Recorder::new("prepare", &log))
            .await
            .unwrap();

        manager.commit().await.unwrap();

        let log = log.lock();
        let commits: Vec<&str> = log
            .iter()
            .filter(|l| l.starts_with("commit"))
            .map(String::as_str)
            .collect();
        assert_eq!(commits, vec!["commit prepare", "commit normal", "commit after"]);
        assert!(!manager.is_active());
    }

    #[tokio::test]
    async fn failure_rolls_back_the_rest() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = TransactionManager::new();
        manager.enlist(Recorder::failing("first", &log)).await.unwrap();
        manager.enlist(Recorder::new("second", &log)).await.unwrap();
        manager.begin().await.unwrap();

        assert!(manager.commit().await.is_err());

        let log = log.lock();
        assert!(log.contains(&"rollback second".to_string()));
        assert!(!log.contains(&"commit second".to_string()));
    }

    #[tokio::test]
    async fn rollback_only_refuses_commit() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = TransactionManager::new();
        manager.begin().await.unwrap();
        let recorder = Recorder::new("tx", &log);
        manager.enlist(recorder.clone()).await.unwrap();
        recorder.set_rollback_only();

        assert!(manager.is_rollback_only());
        assert!(matches!(manager.commit().await, Err(StorageError::Transaction(_))));
        assert_eq!(log.lock().last().map(String::as_str), Some("rollback tx"));
    }

    #[tokio::test]
    async fn cannot_enlist_after_completion() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let manager = TransactionManager::new();
        manager.begin().await.unwrap();
        manager.rollback().await.unwrap();
        assert!(manager.enlist(Recorder::new("late", &log)).await.is_err());
    }
}
