//! Entities owned by a user.
//!
//! Credentials, federated identity links and consents live inside their
//! user. They are never shared across users and disappear with the user.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::entity::ChangeMarker;

/// Well-known credential types.
pub mod credential_types {
    /// Password hash.
    pub const PASSWORD: &str = "password";
    /// Time-based one-time password.
    pub const OTP: &str = "otp";
    /// `WebAuthn` authenticator.
    pub const WEBAUTHN: &str = "webauthn";
}

/// A user credential.
///
/// `secret_data` holds already-encoded secrets; the storage core never
/// interprets it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialEntity {
    /// Unique identifier within the user.
    pub id: String,
    /// Credential type, see [`credential_types`].
    #[serde(rename = "type")]
    pub credential_type: String,
    /// User-facing label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_label: Option<String>,
    /// Encoded secret.
    #[serde(default)]
    pub secret_data: String,
    /// Public parameters.
    #[serde(default)]
    pub credential_data: String,
    /// Creation time, epoch millis.
    #[serde(default)]
    pub created_date: i64,
    /// Lower sorts first.
    #[serde(default)]
    pub priority: i32,
    #[serde(skip)]
    updated: ChangeMarker,
}

impl CredentialEntity {
    /// Creates a credential.
    #[must_use]
    pub fn new(
        id: impl Into<String>,
        credential_type: impl Into<String>,
        secret_data: impl Into<String>,
        created_date: i64,
    ) -> Self {
        Self {
            id: id.into(),
            credential_type: credential_type.into(),
            secret_data: secret_data.into(),
            created_date,
            updated: ChangeMarker::marked(),
            ..Self::default()
        }
    }

    /// Replaces the secret.
    pub fn set_secret_data(&mut self, secret_data: impl Into<String>) {
        self.secret_data = secret_data.into();
        self.updated.mark();
    }

    /// Sets the label.
    pub fn set_user_label(&mut self, label: Option<String>) {
        if self.user_label != label {
            self.user_label = label;
            self.updated.mark();
        }
    }

    /// Whether this credential changed since the last durable write.
    #[must_use]
    pub const fn is_updated(&self) -> bool {
        self.updated.is_marked()
    }

    pub(crate) fn clear_updated(&mut self) {
        self.updated.clear();
    }
}

/// A link to an account at an external identity provider.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FederatedIdentityEntity {
    /// Identity provider alias.
    pub identity_provider: String,
    /// User id at the provider.
    pub user_id: String,
    /// Username at the provider.
    #[serde(default)]
    pub user_name: String,
    /// Stored provider token.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip)]
    updated: ChangeMarker,
}

impl FederatedIdentityEntity {
    /// Creates a link.
    #[must_use]
    pub fn new(
        identity_provider: impl Into<String>,
        user_id: impl Into<String>,
        user_name: impl Into<String>,
    ) -> Self {
        Self {
            identity_provider: identity_provider.into(),
            user_id: user_id.into(),
            user_name: user_name.into(),
            token: None,
            updated: ChangeMarker::marked(),
        }
    }

    /// Replaces the stored token.
    pub fn set_token(&mut self, token: Option<String>) {
        if self.token != token {
            self.token = token;
            self.updated.mark();
        }
    }

    /// `provider:user` key used for lookups.
    #[must_use]
    pub fn key(&self) -> String {
        format!("{}:{}", self.identity_provider, self.user_id)
    }

    /// Whether this link changed since the last durable write.
    #[must_use]
    pub const fn is_updated(&self) -> bool {
        self.updated.is_marked()
    }

    pub(crate) fn clear_updated(&mut self) {
        self.updated.clear();
    }
}

/// Scopes a user granted to a client.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserConsentEntity {
    /// Internal client id.
    pub client_id: String,
    /// Granted client scope ids.
    #[serde(default)]
    pub granted_client_scopes: BTreeSet<String>,
    /// Creation time, epoch millis.
    #[serde(default)]
    pub created_date: i64,
    /// Last change, epoch millis.
    #[serde(default)]
    pub last_updated_date: i64,
    #[serde(skip)]
    updated: ChangeMarker,
}

impl UserConsentEntity {
    /// Creates a consent.
    #[must_use]
    pub fn new(client_id: impl Into<String>, now_millis: i64) -> Self {
        Self {
            client_id: client_id.into(),
            granted_client_scopes: BTreeSet::new(),
            created_date: now_millis,
            last_updated_date: now_millis,
            updated: ChangeMarker::marked(),
        }
    }

    /// Grants a client scope.
    pub fn grant_scope(&mut self, scope_id: impl Into<String>, now_millis: i64) {
        if self.granted_client_scopes.insert(scope_id.into()) {
            self.last_updated_date = now_millis;
            self.updated.mark();
        }
    }

    /// Whether this consent changed since the last durable write.
    #[must_use]
    pub const fn is_updated(&self) -> bool {
        self.updated.is_marked()
    }

    pub(crate) fn clear_updated(&mut self) {
        self.updated.clear();
    }
}
