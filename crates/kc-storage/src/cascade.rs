//! Removal cascades.
//!
//! Deleting an entity fires a before-remove event while it is still readable
//! and an after-remove event once the delete is buffered. The
//! [`CascadeRegistry`] maps each (removed type, phase) pair to an ordered list
//! of hooks; each hook removes or rewrites the dependents of one other entity
//! type. Hooks run in registration order and the first failure aborts the
//! removal.
//!
//! Providers do not know the registry. They raise events through an
//! [`InvalidationSink`], which the owning session implements.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use kc_core::{EntityType, RemovalEvent, RemovalPhase};

use crate::error::StorageResult;

/// Receives removal events raised by providers.
#[async_trait]
pub trait InvalidationSink: Send + Sync {
    /// Dispatches one event to every registered hook.
    ///
    /// ## Errors
    ///
    /// Returns the first hook failure.
    async fn invalidate(&self, event: RemovalEvent) -> StorageResult<()>;
}

type Hook<S> = Arc<dyn for<'a> Fn(&'a S, &'a RemovalEvent) -> BoxFuture<'a, StorageResult<()>> + Send + Sync>;

struct Registration<S> {
    removed: EntityType,
    phase: RemovalPhase,
    dependent: EntityType,
    name: &'static str,
    hook: Hook<S>,
}

/// Ordered cascade hooks over a scope `S` (the session).
pub struct CascadeRegistry<S> {
    registrations: Vec<Registration<S>>,
}

impl<S> fmt::Debug for CascadeRegistry<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.registrations.iter().map(|r| (r.removed, r.phase, r.name)))
            .finish()
    }
}

impl<S> Default for CascadeRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}

impl<S> CascadeRegistry<S> {
    /// An empty registry.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            registrations: Vec::new(),
        }
    }

    /// Registers a hook for removals of `removed` in `phase`. `dependent` is
    /// the entity type the hook touches, `name` identifies it in logs.
    pub fn register<F>(
        &mut self,
        removed: EntityType,
        phase: RemovalPhase,
        dependent: EntityType,
        name: &'static str,
        hook: F,
    ) where
        F: for<'a> Fn(&'a S, &'a RemovalEvent) -> BoxFuture<'a, StorageResult<()>> + Send + Sync + 'static,
    {
        self.registrations.push(Registration {
            removed,
            phase,
            dependent,
            name,
            hook: Arc::new(hook),
        });
    }

    /// Registers a before-remove hook.
    pub fn before_remove<F>(&mut self, removed: EntityType, dependent: EntityType, name: &'static str, hook: F)
    where
        F: for<'a> Fn(&'a S, &'a RemovalEvent) -> BoxFuture<'a, StorageResult<()>> + Send + Sync + 'static,
    {
        self.register(removed, RemovalPhase::BeforeRemove, dependent, name, hook);
    }

    /// Registers an after-remove hook.
    pub fn after_remove<F>(&mut self, removed: EntityType, dependent: EntityType, name: &'static str, hook: F)
    where
        F: for<'a> Fn(&'a S, &'a RemovalEvent) -> BoxFuture<'a, StorageResult<()>> + Send + Sync + 'static,
    {
        self.register(removed, RemovalPhase::AfterRemove, dependent, name, hook);
    }

    /// Names and dependent types of the hooks for one removal, in order.
    #[must_use]
    pub fn hooks_for(&self, removed: EntityType, phase: RemovalPhase) -> Vec<(EntityType, &'static str)> {
        self.registrations
            .iter()
            .filter(|r| r.removed == removed && r.phase == phase)
            .map(|r| (r.dependent, r.name))
            .collect()
    }

    /// Number of registered hooks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    /// Whether no hooks are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

impl<S: Sync> CascadeRegistry<S> {
    /// Runs the hooks matching `event` in registration order.
    ///
    /// ## Errors
    ///
    /// Returns the first hook failure; later hooks do not run.
    pub async fn fire(&self, scope: &S, event: &RemovalEvent) -> StorageResult<()> {
        for registration in self
            .registrations
            .iter()
            .filter(|r| r.removed == event.entity_type && r.phase == event.phase)
        {
            tracing::trace!(
                removed = %event.entity_type,
                id = %event.id,
                phase = ?event.phase,
                hook = registration.name,
                "Running cascade hook"
            );
            (registration.hook)(scope, event).await.inspect_err(|e| {
                tracing::warn!(
                    removed = %event.entity_type,
                    id = %event.id,
                    hook = registration.name,
                    error = %e,
                    "Cascade hook failed"
                );
            })?;
        }
        Ok(())
    }
}
