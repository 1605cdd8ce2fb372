//! Periodic maintenance.
//!
//! Every node schedules the same tasks; a cluster-wide lease makes sure only
//! one node runs each tick.

use std::sync::Arc;
use std::time::Duration;

use kc_cluster::{ClusterCoordinator, ExecutionResult, TimerProvider};
use kc_spi::KeycloakSessionFactory;

/// Timer and lease name of the expired session sweep.
pub const EXPIRED_SESSIONS_TASK: &str = "expired-sessions";

/// Removes expired sessions unless another node is already doing so.
///
/// The lease is held for at most `timeout_secs`.
pub async fn sweep_expired_sessions(
    cluster: &ClusterCoordinator,
    factory: &Arc<KeycloakSessionFactory>,
    timeout_secs: u64,
) -> ExecutionResult<u64> {
    let result = cluster
        .execute_if_not_executed(EXPIRED_SESSIONS_TASK, timeout_secs, || factory.remove_expired_sessions())
        .await;
    match result.into_result() {
        Some(Ok(removed)) => ExecutionResult::executed(removed),
        Some(Err(err)) => {
            tracing::error!(task = EXPIRED_SESSIONS_TASK, error = %err, "Expired session sweep failed");
            ExecutionResult::not_executed()
        }
        None => ExecutionResult::not_executed(),
    }
}

/// Schedules the expired session sweep at the configured interval.
///
/// Returns `false` when the interval is zero and nothing was scheduled.
pub fn schedule_session_sweep(timer: &TimerProvider, factory: &Arc<KeycloakSessionFactory>) -> bool {
    let interval = factory.config().sessions.expiration_sweep_interval_secs;
    if interval == 0 {
        tracing::info!("Expired session sweep disabled");
        return false;
    }

    let factory = Arc::clone(factory);
    timer.schedule(EXPIRED_SESSIONS_TASK, Duration::from_secs(interval), move || {
        let factory = Arc::clone(&factory);
        async move {
            let cluster = Arc::clone(factory.cluster());
            sweep_expired_sessions(&cluster, &factory, interval).await;
        }
    });
    true
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use kc_core::{Clock, Config, VirtualClock};
    use kc_model::SessionSettings;
    use kc_session::UserSessionEntity;

    use super::*;

    async fn factory_with_sessions(clock: &Arc<VirtualClock>, count: usize) -> Arc<KeycloakSessionFactory> {
        let dyn_clock: Arc<dyn Clock> = clock.clone();
        let factory = KeycloakSessionFactory::in_memory(Config::default(), dyn_clock);
        factory
            .run_in_transaction(|session| {
                Box::pin(async move {
                    let realms = session.realms().await?;
                    let mut realm = realms.create_realm(Some("r"), "r").await?;
                    realm.set_session_settings(SessionSettings::default().with_idle_timeout(60));
                    realms.update_realm(realm).await?;
                    let sessions = session.sessions().await?;
                    for n in 0..count {
                        let user = format!("user-{n}");
                        sessions
                            .create_user_session(UserSessionEntity::new("r", user.clone(), user, 0))
                            .await?;
                    }
                    Ok(())
                })
            })
            .await
            .unwrap();
        factory
    }

    #[tokio::test]
    async fn sweep_removes_expired_sessions_once() {
        let clock = Arc::new(VirtualClock::starting_at(1_000_000));
        let factory = factory_with_sessions(&clock, 3).await;
        clock.advance(Duration::from_secs(61));

        let cluster = Arc::clone(factory.cluster());
        let first = sweep_expired_sessions(&cluster, &factory, 60).await;
        assert_eq!(first.into_result(), Some(3));
        let second = sweep_expired_sessions(&cluster, &factory, 60).await;
        assert_eq!(second.into_result(), Some(0));
    }

    #[tokio::test]
    async fn sweep_is_skipped_while_the_lease_is_held() {
        let clock = Arc::new(VirtualClock::starting_at(1_000_000));
        let factory = factory_with_sessions(&clock, 1).await;
        clock.advance(Duration::from_secs(61));

        let cluster = Arc::clone(factory.cluster());
        let outer = cluster
            .execute_if_not_executed(EXPIRED_SESSIONS_TASK, 60, || async {
                sweep_expired_sessions(&cluster, &factory, 60).await.is_executed()
            })
            .await;
        assert_eq!(outer.into_result(), Some(false));
    }

    #[tokio::test]
    async fn zero_interval_disables_the_sweep() {
        let mut config = Config::default();
        config.sessions.expiration_sweep_interval_secs = 0;
        let factory = KeycloakSessionFactory::in_memory(config, Arc::new(VirtualClock::starting_at(0)));
        let timer = TimerProvider::new();
        assert!(!schedule_session_sweep(&timer, &factory));
        assert!(timer.scheduled().is_empty());
    }

    #[tokio::test]
    async fn sweep_is_scheduled_under_its_name() {
        let factory = KeycloakSessionFactory::in_memory(Config::default(), Arc::new(VirtualClock::starting_at(0)));
        let timer = TimerProvider::new();
        assert!(schedule_session_sweep(&timer, &factory));
        assert!(timer.is_scheduled(EXPIRED_SESSIONS_TASK));
        timer.cancel_all();
    }
}
