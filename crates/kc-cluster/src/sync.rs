//! Periodic user-storage synchronization.
//!
//! Each import-enabled storage provider may ask for a periodic full sync, a
//! periodic changed-users sync, or both. Every node schedules the timers;
//! the shared `<provider>::sync` lease makes sure only one node actually
//! syncs a provider at a time. Provider changes are broadcast on the
//! `user-storage` topic so every node reschedules.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use kc_core::Clock;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::coordinator::ClusterCoordinator;
use crate::error::ClusterResult;
use crate::event::{DcScope, EventPayload};
use crate::timer::TimerProvider;

/// Topic carrying storage provider changes.
pub const USER_STORAGE_TOPIC: &str = "user-storage";

/// Minimum lease timeout of a sync, in seconds.
pub const MIN_SYNC_TIMEOUT_SECS: u64 = 30;

/// Synchronization mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SyncMode {
    /// Import every user from the external store.
    Full,
    /// Import users changed since the last sync.
    Changed,
}

impl SyncMode {
    const fn timer_suffix(self) -> &'static str {
        match self {
            Self::Full => "FULL",
            Self::Changed => "CHANGED",
        }
    }
}

/// Counters of one synchronization.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    /// Users added.
    pub added: u64,
    /// Users updated.
    pub updated: u64,
    /// Users removed.
    pub removed: u64,
    /// Users that failed to sync.
    pub failed: u64,
    /// The sync did not run.
    pub ignored: bool,
}

impl SyncResult {
    /// A sync that did not run.
    #[must_use]
    pub const fn ignored() -> Self {
        Self {
            added: 0,
            updated: 0,
            removed: 0,
            failed: 0,
            ignored: true,
        }
    }

    /// Records a user addition.
    pub fn record_added(&mut self) {
        self.added += 1;
    }

    /// Records a user update.
    pub fn record_updated(&mut self) {
        self.updated += 1;
    }

    /// Records a user removal.
    pub fn record_removed(&mut self) {
        self.removed += 1;
    }

    /// Records a sync failure.
    pub fn record_failure(&mut self) {
        self.failed += 1;
    }

    /// Users processed.
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.added + self.updated + self.removed + self.failed
    }
}

/// A configured user-storage provider, as far as syncing is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageProviderModel {
    /// Provider component id.
    pub id: String,
    /// Display name.
    pub name: String,
    /// Whether the provider is enabled.
    pub enabled: bool,
    /// Whether users are imported into local storage.
    pub import_enabled: bool,
    /// Full sync period in seconds; zero or less disables it.
    pub full_sync_period: i64,
    /// Changed-users sync period in seconds; zero or less disables it.
    pub changed_sync_period: i64,
    /// Epoch seconds of the last completed sync; zero when never synced.
    pub last_sync: i64,
}

impl StorageProviderModel {
    /// Creates an enabled, importing provider without periodic sync.
    #[must_use]
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            enabled: true,
            import_enabled: true,
            full_sync_period: 0,
            changed_sync_period: 0,
            last_sync: 0,
        }
    }

    /// Enables periodic full sync.
    #[must_use]
    pub const fn with_full_sync(mut self, period_secs: i64) -> Self {
        self.full_sync_period = period_secs;
        self
    }

    /// Enables periodic changed-users sync.
    #[must_use]
    pub const fn with_changed_sync(mut self, period_secs: i64) -> Self {
        self.changed_sync_period = period_secs;
        self
    }

    /// Sets the import flag.
    #[must_use]
    pub const fn with_import(mut self, import_enabled: bool) -> Self {
        self.import_enabled = import_enabled;
        self
    }

    /// Sets the enabled flag.
    #[must_use]
    pub const fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    const fn period(&self, mode: SyncMode) -> i64 {
        match mode {
            SyncMode::Full => self.full_sync_period,
            SyncMode::Changed => self.changed_sync_period,
        }
    }

    /// Shared key of both sync modes.
    #[must_use]
    pub fn task_key(&self) -> String {
        format!("{}::sync", self.id)
    }

    /// Timer name of one sync mode.
    #[must_use]
    pub fn timer_name(&self, mode: SyncMode) -> String {
        format!("{}-{}", self.id, mode.timer_suffix())
    }
}

/// Storage provider created, updated or removed somewhere in the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageProviderEvent {
    /// The provider was removed.
    pub removed: bool,
    /// Owning realm.
    pub realm_id: String,
    /// Provider state after the change.
    pub provider: StorageProviderModel,
}

impl EventPayload for StorageProviderEvent {
    const KIND: &'static str = "user-storage-provider";
}

/// A storage provider able to import users.
#[async_trait]
pub trait ImportSynchronization: Send + Sync {
    /// Imports every user.
    ///
    /// ## Errors
    ///
    /// Returns an error if the external store fails.
    async fn sync(&self, realm_id: &str, provider: &StorageProviderModel) -> ClusterResult<SyncResult>;

    /// Imports users changed since `last_sync` (epoch seconds).
    ///
    /// ## Errors
    ///
    /// Returns an error if the external store fails.
    async fn sync_since(
        &self,
        last_sync: i64,
        realm_id: &str,
        provider: &StorageProviderModel,
    ) -> ClusterResult<SyncResult>;
}

/// Whether enough time passed since `last_sync` to sync again: never synced,
/// or more than half a period ago.
#[must_use]
pub const fn should_perform_new_sync(last_sync: i64, period_secs: i64, now_secs: i64) -> bool {
    if last_sync <= 0 {
        return true;
    }
    (now_secs - last_sync).saturating_mul(2) > period_secs
}

/// Schedules and runs periodic syncs on one node.
pub struct PeriodicSyncManager {
    coordinator: Arc<ClusterCoordinator>,
    timer: Arc<TimerProvider>,
    clock: Arc<dyn Clock>,
    importer: Arc<dyn ImportSynchronization>,
    providers: RwLock<HashMap<String, StorageProviderModel>>,
    this: Weak<Self>,
}

impl fmt::Debug for PeriodicSyncManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicSyncManager")
            .field("node_id", &self.coordinator.node_id())
            .field("providers", &self.providers.read().len())
            .finish_non_exhaustive()
    }
}

impl PeriodicSyncManager {
    /// Creates a manager and subscribes it to provider changes.
    #[must_use]
    pub fn new(
        coordinator: Arc<ClusterCoordinator>,
        timer: Arc<TimerProvider>,
        clock: Arc<dyn Clock>,
        importer: Arc<dyn ImportSynchronization>,
    ) -> Arc<Self> {
        let manager = Arc::new_cyclic(|this| Self {
            coordinator,
            timer,
            clock,
            importer,
            providers: RwLock::new(HashMap::new()),
            this: this.clone(),
        });
        let listener = Arc::downgrade(&manager);
        manager
            .coordinator
            .subscribe(USER_STORAGE_TOPIC, move |event: StorageProviderEvent| {
                if let Some(manager) = listener.upgrade() {
                    manager.on_provider_event(event);
                }
            });
        manager
    }

    /// Schedules the periodic syncs of every provider in `realm_id`.
    pub fn bootstrap(&self, realm_id: &str, providers: impl IntoIterator<Item = StorageProviderModel>) {
        for provider in providers.into_iter().filter(|p| p.import_enabled) {
            self.refresh_periodic_sync(realm_id, provider);
        }
    }

    /// The last known state of a provider.
    #[must_use]
    pub fn provider(&self, id: &str) -> Option<StorageProviderModel> {
        self.providers.read().get(id).cloned()
    }

    /// Runs a full sync unless another node is syncing this provider.
    pub async fn sync_all_users(&self, realm_id: &str, provider: &StorageProviderModel) -> SyncResult {
        self.run_sync(realm_id, provider, SyncMode::Full).await
    }

    /// Runs a changed-users sync unless another node is syncing this
    /// provider.
    pub async fn sync_changed_users(&self, realm_id: &str, provider: &StorageProviderModel) -> SyncResult {
        self.run_sync(realm_id, provider, SyncMode::Changed).await
    }

    async fn run_sync(&self, realm_id: &str, provider: &StorageProviderModel, mode: SyncMode) -> SyncResult {
        if !provider.enabled || !provider.import_enabled {
            return SyncResult::ignored();
        }
        let timeout = u64::try_from(provider.period(mode)).unwrap_or(0).max(MIN_SYNC_TIMEOUT_SECS);
        let previous_sync = self.provider(&provider.id).map_or(provider.last_sync, |p| p.last_sync);

        let outcome = self
            .coordinator
            .execute_if_not_executed(&provider.task_key(), timeout, || async {
                let started = self.clock.now_secs();
                let result = match mode {
                    SyncMode::Full => self.importer.sync(realm_id, provider).await,
                    SyncMode::Changed => self.importer.sync_since(previous_sync, realm_id, provider).await,
                };
                if matches!(&result, Ok(r) if !r.ignored) {
                    self.record_last_sync(provider, started);
                }
                result
            })
            .await;

        match outcome.into_result() {
            None => {
                tracing::debug!(provider = %provider.name, ?mode, "Sync ignored, already in progress");
                SyncResult::ignored()
            }
            Some(Ok(result)) => {
                tracing::info!(
                    provider = %provider.name,
                    ?mode,
                    added = result.added,
                    updated = result.updated,
                    removed = result.removed,
                    failed = result.failed,
                    "Sync finished"
                );
                result
            }
            Some(Err(err)) => {
                tracing::error!(provider = %provider.name, ?mode, error = %err, "Sync failed");
                SyncResult::ignored()
            }
        }
    }

    fn record_last_sync(&self, provider: &StorageProviderModel, last_sync: i64) {
        self.providers
            .write()
            .entry(provider.id.clone())
            .or_insert_with(|| provider.clone())
            .last_sync = last_sync;
    }

    /// Tells every node, this one included, that a provider changed.
    ///
    /// ## Errors
    ///
    /// Returns an error if the event cannot be published.
    pub async fn notify_to_refresh_periodic_sync(
        &self,
        realm_id: &str,
        provider: &StorageProviderModel,
        removed: bool,
    ) -> ClusterResult<()> {
        if !provider.import_enabled {
            return Ok(());
        }
        let event = StorageProviderEvent {
            removed,
            realm_id: realm_id.to_string(),
            provider: provider.clone(),
        };
        self.coordinator
            .notify(USER_STORAGE_TOPIC, &event, true, DcScope::AllDcs)
            .await
    }

    fn on_provider_event(&self, event: StorageProviderEvent) {
        if event.removed {
            self.remove_periodic_sync(&event.provider);
        } else {
            self.refresh_periodic_sync(&event.realm_id, event.provider);
        }
    }

    /// (Re)schedules the timers of a provider from its current periods.
    pub fn refresh_periodic_sync(&self, realm_id: &str, provider: StorageProviderModel) {
        tracing::debug!(
            provider = %provider.name,
            full = provider.full_sync_period,
            changed = provider.changed_sync_period,
            "Refreshing periodic sync"
        );
        {
            let mut providers = self.providers.write();
            let last_sync = providers.get(&provider.id).map_or(0, |p| p.last_sync);
            let mut stored = provider.clone();
            stored.last_sync = stored.last_sync.max(last_sync);
            providers.insert(provider.id.clone(), stored);
        }
        for mode in [SyncMode::Full, SyncMode::Changed] {
            self.schedule(realm_id, &provider, mode);
        }
    }

    fn schedule(&self, realm_id: &str, provider: &StorageProviderModel, mode: SyncMode) {
        let name = provider.timer_name(mode);
        let period = provider.period(mode);
        if period <= 0 {
            self.timer.cancel(&name);
            return;
        }

        let this = self.this.clone();
        let realm_id = realm_id.to_string();
        let provider_id = provider.id.clone();
        self.timer
            .schedule(name, Duration::from_secs(period.unsigned_abs()), move || {
                let this = this.clone();
                let realm_id = realm_id.clone();
                let provider_id = provider_id.clone();
                async move {
                    let Some(this) = this.upgrade() else {
                        return;
                    };
                    let Some(provider) = this.provider(&provider_id) else {
                        return;
                    };
                    if should_perform_new_sync(provider.last_sync, provider.period(mode), this.clock.now_secs()) {
                        this.run_sync(&realm_id, &provider, mode).await;
                    } else {
                        tracing::debug!(provider = %provider.name, ?mode, "Periodic sync skipped, last sync too recent");
                    }
                }
            });
    }

    /// Cancels both timers of a provider.
    pub fn remove_periodic_sync(&self, provider: &StorageProviderModel) {
        tracing::debug!(provider = %provider.name, "Removing periodic sync");
        self.timer.cancel(&provider.timer_name(SyncMode::Full));
        self.timer.cancel(&provider.timer_name(SyncMode::Changed));
        self.providers.write().remove(&provider.id);
    }
}
