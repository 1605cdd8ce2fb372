//! Client session model.

use std::collections::BTreeMap;

use kc_model::ChangeMarker;
use serde::{Deserialize, Serialize};

/// Well-known client session note keys.
pub mod notes {
    /// Start time in epoch seconds, as a decimal string.
    pub const STARTED_AT: &str = "startedAt";
}

/// The state one client holds inside a user session.
///
/// Client sessions are owned by their user session and keyed there by the
/// client's internal id; they are stored and removed together with it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticatedClientSessionEntity {
    // === Identity ===
    /// Unique client session identifier.
    pub id: String,
    /// Internal id of the client.
    pub client_id: String,

    // === Timestamps ===
    /// Last refresh, epoch millis. Idle expiry counts from here.
    #[serde(default)]
    pub timestamp: i64,
    /// Creation, epoch millis. Lifespan expiry counts from here.
    #[serde(default)]
    pub started: i64,
    /// Expiration, epoch millis. `None` never expires on its own.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expiration: Option<i64>,

    // === Protocol Info ===
    /// Pending action, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    /// Protocol used (openid-connect, saml).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
    /// Redirect URI used for this session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redirect_uri: Option<String>,

    // === Notes ===
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    notes: BTreeMap<String, String>,

    #[serde(skip)]
    updated: ChangeMarker,
}

impl AuthenticatedClientSessionEntity {
    /// Creates a client session started at `now_millis`.
    #[must_use]
    pub fn new(id: impl Into<String>, client_id: impl Into<String>, now_millis: i64) -> Self {
        let mut session = Self {
            id: id.into(),
            client_id: client_id.into(),
            timestamp: now_millis,
            started: now_millis,
            updated: ChangeMarker::marked(),
            ..Self::default()
        };
        session
            .notes
            .insert(notes::STARTED_AT.to_string(), (now_millis / 1000).to_string());
        session
    }

    /// Sets the protocol.
    #[must_use]
    pub fn with_protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = Some(protocol.into());
        self
    }

    /// Sets the redirect URI.
    #[must_use]
    pub fn with_redirect_uri(mut self, uri: impl Into<String>) -> Self {
        self.redirect_uri = Some(uri.into());
        self
    }

    /// Gets a note.
    #[must_use]
    pub fn note(&self, key: &str) -> Option<&str> {
        self.notes.get(key).map(String::as_str)
    }

    /// All notes.
    #[must_use]
    pub const fn notes(&self) -> &BTreeMap<String, String> {
        &self.notes
    }

    /// Sets a note.
    pub fn set_note(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if self.notes.get(&key) != Some(&value) {
            self.notes.insert(key, value);
            self.updated.mark();
        }
    }

    /// Removes a note. Returns whether it was set.
    pub fn remove_note(&mut self, key: &str) -> bool {
        let removed = self.notes.remove(key).is_some();
        if removed {
            self.updated.mark();
        }
        removed
    }

    /// Replaces every note.
    pub fn set_notes(&mut self, notes: BTreeMap<String, String>) {
        if self.notes != notes {
            self.notes = notes;
            self.updated.mark();
        }
    }

    /// Moves the idle window forward.
    pub fn touch(&mut self, now_millis: i64) {
        if self.timestamp != now_millis {
            self.timestamp = now_millis;
            self.updated.mark();
        }
    }

    /// Sets the expiration.
    pub fn set_expiration(&mut self, expiration: Option<i64>) {
        if self.expiration != expiration {
            self.expiration = expiration;
            self.updated.mark();
        }
    }

    /// True once `now_millis` has reached the expiration.
    #[must_use]
    pub fn is_expired(&self, now_millis: i64) -> bool {
        self.expiration.is_some_and(|exp| exp <= now_millis)
    }

    /// Whether this client session changed since the last write.
    #[must_use]
    pub const fn is_updated(&self) -> bool {
        self.updated.is_marked()
    }

    /// Clears the dirty marker.
    pub fn clear_updated(&mut self) {
        self.updated.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_records_start() {
        let session = AuthenticatedClientSessionEntity::new("cs1", "app", 90_500).with_protocol("openid-connect");
        assert_eq!(session.note(notes::STARTED_AT), Some("90"));
        assert_eq!(session.timestamp, 90_500);
        assert_eq!(session.protocol.as_deref(), Some("openid-connect"));
        assert!(session.is_updated());
    }

    #[test]
    fn unchanged_notes_stay_clean() {
        let mut session = AuthenticatedClientSessionEntity::new("cs1", "app", 0);
        session.clear_updated();

        session.set_note(notes::STARTED_AT, "0");
        assert!(!session.is_updated());
        assert!(!session.remove_note("missing"));
        assert!(!session.is_updated());

        session.set_note("scope", "openid");
        assert!(session.is_updated());
    }

    #[test]
    fn expiry_is_inclusive() {
        let mut session = AuthenticatedClientSessionEntity::new("cs1", "app", 0);
        assert!(!session.is_expired(i64::MAX));
        session.set_expiration(Some(1_000));
        assert!(!session.is_expired(999));
        assert!(session.is_expired(1_000));
    }
}
