//! Session expiration times.
//!
//! A session expires at the earlier of its idle deadline (last refresh plus
//! the idle timeout) and its lifespan deadline (start plus the max
//! lifespan). A timeout of zero or less disables that bound; with both
//! disabled the session never expires on its own.
//!
//! | session            | idle timeout                        | max lifespan                         |
//! |--------------------|-------------------------------------|--------------------------------------|
//! | online             | SSO idle (remember-me override)     | SSO max (remember-me override)       |
//! | offline            | offline idle                        | offline max, when enabled            |
//! | client (online)    | client attribute, realm client, SSO | client attribute, realm client, SSO  |
//! | client (offline)   | client attribute, realm, offline    | client attribute, realm, offline     |
//!
//! A client session never outlives its user session.

use kc_model::client::attributes;
use kc_model::{ClientEntity, Entity, SessionSettings};

use crate::client_session::AuthenticatedClientSessionEntity;
use crate::user_session::UserSessionEntity;

const MILLIS_PER_SEC: i64 = 1000;

fn deadline(from_millis: i64, timeout_secs: i64) -> Option<i64> {
    (timeout_secs > 0).then(|| from_millis.saturating_add(timeout_secs.saturating_mul(MILLIS_PER_SEC)))
}

fn earliest(a: Option<i64>, b: Option<i64>) -> Option<i64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

// First positive value wins.
fn first_positive(candidates: impl IntoIterator<Item = i64>) -> i64 {
    candidates.into_iter().find(|&v| v > 0).unwrap_or(0)
}

/// Idle and lifespan timeouts, in seconds, of one session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    /// Idle timeout.
    pub idle_secs: i64,
    /// Max lifespan.
    pub max_secs: i64,
}

impl Timeouts {
    /// Timeouts of a user session.
    #[must_use]
    pub fn for_user_session(settings: &SessionSettings, offline: bool, remember_me: bool) -> Self {
        if offline {
            let max_secs = if settings.offline_session_max_lifespan_enabled {
                settings.offline_session_max_lifespan
            } else {
                0
            };
            return Self {
                idle_secs: settings.offline_session_idle_timeout,
                max_secs,
            };
        }

        let mut timeouts = Self {
            idle_secs: settings.sso_session_idle_timeout,
            max_secs: settings.sso_session_max_lifespan,
        };
        if remember_me {
            if settings.sso_session_idle_timeout_remember_me > 0 {
                timeouts.idle_secs = settings.sso_session_idle_timeout_remember_me;
            }
            if settings.sso_session_max_lifespan_remember_me > 0 {
                timeouts.max_secs = settings.sso_session_max_lifespan_remember_me;
            }
        }
        timeouts
    }

    /// Timeouts of a client session: the client's own override, then the
    /// realm's client setting, then the user session's.
    #[must_use]
    pub fn for_client_session(
        settings: &SessionSettings,
        client: Option<&ClientEntity>,
        offline: bool,
        remember_me: bool,
    ) -> Self {
        let parent = Self::for_user_session(settings, offline, remember_me);
        let (idle_attr, max_attr, realm_idle, realm_max) = if offline {
            (
                attributes::CLIENT_OFFLINE_SESSION_IDLE_TIMEOUT,
                attributes::CLIENT_OFFLINE_SESSION_MAX_LIFESPAN,
                settings.client_offline_session_idle_timeout,
                settings.client_offline_session_max_lifespan,
            )
        } else {
            (
                attributes::CLIENT_SESSION_IDLE_TIMEOUT,
                attributes::CLIENT_SESSION_MAX_LIFESPAN,
                settings.client_session_idle_timeout,
                settings.client_session_max_lifespan,
            )
        };
        let client_idle = client.and_then(|c| c.attribute_secs(idle_attr)).unwrap_or(0);
        let client_max = client.and_then(|c| c.attribute_secs(max_attr)).unwrap_or(0);

        Self {
            idle_secs: first_positive([client_idle, realm_idle, parent.idle_secs]),
            max_secs: first_positive([client_max, realm_max, parent.max_secs]),
        }
    }

    /// The earlier of both deadlines.
    #[must_use]
    pub fn expiration(self, started_millis: i64, last_refresh_millis: i64) -> Option<i64> {
        earliest(
            deadline(last_refresh_millis, self.idle_secs),
            deadline(started_millis, self.max_secs),
        )
    }
}

/// Expiration of a user session in a realm with `settings`.
#[must_use]
pub fn user_session_expiration(settings: &SessionSettings, session: &UserSessionEntity) -> Option<i64> {
    Timeouts::for_user_session(settings, session.is_offline(), session.is_remember_me())
        .expiration(session.started(), session.last_session_refresh())
}

/// Expiration of a client session inside `parent`.
#[must_use]
pub fn client_session_expiration(
    settings: &SessionSettings,
    client: Option<&ClientEntity>,
    parent: &UserSessionEntity,
    client_session: &AuthenticatedClientSessionEntity,
) -> Option<i64> {
    let own = Timeouts::for_client_session(settings, client, parent.is_offline(), parent.is_remember_me())
        .expiration(client_session.started, client_session.timestamp);
    match (own, parent.expiration()) {
        (Some(own), Some(cap)) => Some(own.min(cap)),
        (own, cap) => own.or(cap),
    }
}
