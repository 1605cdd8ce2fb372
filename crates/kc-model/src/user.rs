//! User entity.
//!
//! Usernames and emails are stored lower-cased. Group and role memberships
//! are sets of ids; credentials, federated identities and consents are owned
//! children that contribute to the user's dirty state.

use std::collections::BTreeSet;

use kc_core::EntityType;
use serde::{Deserialize, Serialize};

use crate::credential::{CredentialEntity, FederatedIdentityEntity, UserConsentEntity};
use crate::entity::{set_tracked, Entity, EntityMeta};
use crate::searchable::{
    attribute_value, FieldPath, FieldValue, SearchableEntity, SearchableField, Value,
};

/// A user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntity {
    #[serde(flatten)]
    meta: EntityMeta,

    // === Identity ===
    username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(default)]
    email_verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    first_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    last_name: Option<String>,
    #[serde(default)]
    enabled: bool,
    #[serde(default)]
    created_timestamp: i64,

    // === Links ===
    #[serde(default, skip_serializing_if = "Option::is_none")]
    federation_link: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    service_account_client_link: Option<String>,

    // === Memberships ===
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    groups: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    roles: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    required_actions: BTreeSet<String>,

    // === Owned ===
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    credentials: Vec<CredentialEntity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    federated_identities: Vec<FederatedIdentityEntity>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    consents: Vec<UserConsentEntity>,
}

impl UserEntity {
    /// Creates an enabled user.
    #[must_use]
    pub fn new(realm_id: &str, username: &str, created_timestamp: i64) -> Self {
        let mut user = Self {
            username: username.to_lowercase(),
            enabled: true,
            created_timestamp,
            ..Self::default()
        };
        user.set_realm_id(realm_id);
        user
    }

    /// Lower-cased username, unique per realm.
    #[must_use]
    pub fn username(&self) -> &str {
        &self.username
    }

    /// Changes the username.
    pub fn set_username(&mut self, username: &str) {
        set_tracked(&mut self.meta, &mut self.username, username.to_lowercase());
    }

    /// Lower-cased email.
    #[must_use]
    pub fn email(&self) -> Option<&str> {
        self.email.as_deref()
    }

    /// Changes the email.
    pub fn set_email(&mut self, email: Option<&str>) {
        set_tracked(&mut self.meta, &mut self.email, email.map(str::to_lowercase));
    }

    /// Whether the email was verified.
    #[must_use]
    pub const fn is_email_verified(&self) -> bool {
        self.email_verified
    }

    /// Sets the email verification flag.
    pub fn set_email_verified(&mut self, verified: bool) {
        set_tracked(&mut self.meta, &mut self.email_verified, verified);
    }

    /// Given name.
    #[must_use]
    pub fn first_name(&self) -> Option<&str> {
        self.first_name.as_deref()
    }

    /// Sets the given name.
    pub fn set_first_name(&mut self, first_name: Option<String>) {
        set_tracked(&mut self.meta, &mut self.first_name, first_name);
    }

    /// Family name.
    #[must_use]
    pub fn last_name(&self) -> Option<&str> {
        self.last_name.as_deref()
    }

    /// Sets the family name.
    pub fn set_last_name(&mut self, last_name: Option<String>) {
        set_tracked(&mut self.meta, &mut self.last_name, last_name);
    }

    /// Whether the user may log in.
    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Enables or disables the user.
    pub fn set_enabled(&mut self, enabled: bool) {
        set_tracked(&mut self.meta, &mut self.enabled, enabled);
    }

    /// Creation time, epoch millis.
    #[must_use]
    pub const fn created_timestamp(&self) -> i64 {
        self.created_timestamp
    }

    /// Id of the user storage provider this user was imported from.
    #[must_use]
    pub fn federation_link(&self) -> Option<&str> {
        self.federation_link.as_deref()
    }

    /// Sets the federation link.
    pub fn set_federation_link(&mut self, link: Option<String>) {
        set_tracked(&mut self.meta, &mut self.federation_link, link);
    }

    /// Client this user is the service account of.
    #[must_use]
    pub fn service_account_client_link(&self) -> Option<&str> {
        self.service_account_client_link.as_deref()
    }

    /// Sets the service account link.
    pub fn set_service_account_client_link(&mut self, client_id: Option<String>) {
        set_tracked(&mut self.meta, &mut self.service_account_client_link, client_id);
    }

    // === Memberships ===

    /// Group ids.
    #[must_use]
    pub const fn groups(&self) -> &BTreeSet<String> {
        &self.groups
    }

    /// Joins a group.
    pub fn join_group(&mut self, group_id: impl Into<String>) {
        if self.groups.insert(group_id.into()) {
            self.meta.mark_updated();
        }
    }

    /// Leaves a group. Returns whether the user was a member.
    pub fn leave_group(&mut self, group_id: &str) -> bool {
        let removed = self.groups.remove(group_id);
        if removed {
            self.meta.mark_updated();
        }
        removed
    }

    /// Directly mapped role ids.
    #[must_use]
    pub const fn roles(&self) -> &BTreeSet<String> {
        &self.roles
    }

    /// Maps a role.
    pub fn grant_role(&mut self, role_id: impl Into<String>) {
        if self.roles.insert(role_id.into()) {
            self.meta.mark_updated();
        }
    }

    /// Unmaps a role. Returns whether it was mapped.
    pub fn revoke_role(&mut self, role_id: &str) -> bool {
        let removed = self.roles.remove(role_id);
        if removed {
            self.meta.mark_updated();
        }
        removed
    }

    /// Pending required actions.
    #[must_use]
    pub const fn required_actions(&self) -> &BTreeSet<String> {
        &self.required_actions
    }

    /// Adds a required action.
    pub fn add_required_action(&mut self, action: impl Into<String>) {
        if self.required_actions.insert(action.into()) {
            self.meta.mark_updated();
        }
    }

    /// Removes a required action.
    pub fn remove_required_action(&mut self, action: &str) {
        if self.required_actions.remove(action) {
            self.meta.mark_updated();
        }
    }

    // === Credentials ===

    /// Credentials ordered by priority.
    #[must_use]
    pub fn credentials(&self) -> &[CredentialEntity] {
        &self.credentials
    }

    /// Credential by id, mutable. Changes made through it mark the user dirty.
    pub fn credential_mut(&mut self, id: &str) -> Option<&mut CredentialEntity> {
        self.credentials.iter_mut().find(|c| c.id == id)
    }

    /// Adds a credential after the existing ones.
    pub fn add_credential(&mut self, mut credential: CredentialEntity) {
        credential.priority = self
            .credentials
            .iter()
            .map(|c| c.priority)
            .max()
            .map_or(10, |p| p + 10);
        self.credentials.push(credential);
        self.meta.mark_updated();
    }

    /// Removes a credential. Returns whether it existed.
    pub fn remove_credential(&mut self, id: &str) -> bool {
        let before = self.credentials.len();
        self.credentials.retain(|c| c.id != id);
        let removed = self.credentials.len() != before;
        if removed {
            self.meta.mark_updated();
        }
        removed
    }

    // === Federated identities ===

    /// Links to external identity providers.
    #[must_use]
    pub fn federated_identities(&self) -> &[FederatedIdentityEntity] {
        &self.federated_identities
    }

    /// Link for one provider, mutable.
    pub fn federated_identity_mut(
        &mut self,
        identity_provider: &str,
    ) -> Option<&mut FederatedIdentityEntity> {
        self.federated_identities
            .iter_mut()
            .find(|f| f.identity_provider == identity_provider)
    }

    /// Adds or replaces the link for the identity's provider.
    pub fn add_federated_identity(&mut self, identity: FederatedIdentityEntity) {
        self.federated_identities
            .retain(|f| f.identity_provider != identity.identity_provider);
        self.federated_identities.push(identity);
        self.meta.mark_updated();
    }

    /// Removes the link for a provider. Returns whether it existed.
    pub fn remove_federated_identity(&mut self, identity_provider: &str) -> bool {
        let before = self.federated_identities.len();
        self.federated_identities
            .retain(|f| f.identity_provider != identity_provider);
        let removed = self.federated_identities.len() != before;
        if removed {
            self.meta.mark_updated();
        }
        removed
    }

    // === Consents ===

    /// Consents granted to clients.
    #[must_use]
    pub fn consents(&self) -> &[UserConsentEntity] {
        &self.consents
    }

    /// Consent for a client, mutable.
    pub fn consent_mut(&mut self, client_id: &str) -> Option<&mut UserConsentEntity> {
        self.consents.iter_mut().find(|c| c.client_id == client_id)
    }

    /// Adds or replaces the consent for the consent's client.
    pub fn add_consent(&mut self, consent: UserConsentEntity) {
        self.consents.retain(|c| c.client_id != consent.client_id);
        self.consents.push(consent);
        self.meta.mark_updated();
    }

    /// Revokes the consent for a client. Returns whether it existed.
    pub fn remove_consent(&mut self, client_id: &str) -> bool {
        let before = self.consents.len();
        self.consents.retain(|c| c.client_id != client_id);
        let removed = self.consents.len() != before;
        if removed {
            self.meta.mark_updated();
        }
        removed
    }
}

impl Entity for UserEntity {
    const ENTITY_TYPE: EntityType = EntityType::User;

    fn meta(&self) -> &EntityMeta {
        &self.meta
    }

    fn meta_mut(&mut self) -> &mut EntityMeta {
        &mut self.meta
    }

    fn children_dirty(&self) -> bool {
        self.credentials.iter().any(CredentialEntity::is_updated)
            || self
                .federated_identities
                .iter()
                .any(FederatedIdentityEntity::is_updated)
            || self.consents.iter().any(UserConsentEntity::is_updated)
    }

    fn clear_children_dirty(&mut self) {
        self.credentials.iter_mut().for_each(CredentialEntity::clear_updated);
        self.federated_identities
            .iter_mut()
            .for_each(FederatedIdentityEntity::clear_updated);
        self.consents.iter_mut().for_each(UserConsentEntity::clear_updated);
    }
}

/// Searchable user fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UserField {
    /// User id.
    Id,
    /// Owning realm.
    RealmId,
    /// Username.
    Username,
    /// Given name.
    FirstName,
    /// Family name.
    LastName,
    /// Email.
    Email,
    /// Enabled flag.
    Enabled,
    /// Email verification flag.
    EmailVerified,
    /// Creation time.
    CreatedTimestamp,
    /// User storage provider id.
    FederationLink,
    /// Service account client id.
    ServiceAccountClient,
    /// Attribute; takes the attribute name as key.
    Attribute,
    /// Identity provider alias of any federated identity.
    IdpAlias,
    /// User id at any identity provider.
    IdpUserId,
    /// A directly mapped role id.
    AssignedRole,
    /// A group id.
    AssignedGroup,
    /// A client id the user consented to.
    ConsentForClient,
}

impl SearchableField for UserField {
    fn name(&self) -> &'static str {
        match self {
            Self::Id => "id",
            Self::RealmId => "realm_id",
            Self::Username => "username",
            Self::FirstName => "first_name",
            Self::LastName => "last_name",
            Self::Email => "email",
            Self::Enabled => "enabled",
            Self::EmailVerified => "email_verified",
            Self::CreatedTimestamp => "created_timestamp",
            Self::FederationLink => "federation_link",
            Self::ServiceAccountClient => "service_account_client",
            Self::Attribute => "attribute",
            Self::IdpAlias => "idp_alias",
            Self::IdpUserId => "idp_user_id",
            Self::AssignedRole => "assigned_role",
            Self::AssignedGroup => "assigned_group",
            Self::ConsentForClient => "consent_for_client",
        }
    }

    fn key_arity(&self) -> usize {
        usize::from(matches!(self, Self::Attribute))
    }

    fn path(&self) -> FieldPath {
        match self {
            Self::Id => FieldPath::Scalar("id"),
            Self::RealmId => FieldPath::Scalar("realm_id"),
            Self::Username => FieldPath::Scalar("username"),
            Self::FirstName => FieldPath::Scalar("first_name"),
            Self::LastName => FieldPath::Scalar("last_name"),
            Self::Email => FieldPath::Scalar("email"),
            Self::Enabled => FieldPath::Scalar("enabled"),
            Self::EmailVerified => FieldPath::Scalar("email_verified"),
            Self::CreatedTimestamp => FieldPath::Scalar("created_timestamp"),
            Self::FederationLink => FieldPath::Scalar("federation_link"),
            Self::ServiceAccountClient => FieldPath::Scalar("service_account_client_link"),
            Self::Attribute => FieldPath::MultiMap("attributes"),
            Self::IdpAlias => FieldPath::Nested("federated_identities", "identity_provider"),
            Self::IdpUserId => FieldPath::Nested("federated_identities", "user_id"),
            Self::AssignedRole => FieldPath::Array("roles"),
            Self::AssignedGroup => FieldPath::Array("groups"),
            Self::ConsentForClient => FieldPath::Nested("consents", "client_id"),
        }
    }
}

impl SearchableEntity for UserEntity {
    type Field = UserField;

    fn field_value(&self, field: UserField, keys: &[Value]) -> FieldValue {
        match field {
            UserField::Id => FieldValue::from_opt(self.id()),
            UserField::RealmId => FieldValue::from_opt(self.realm_id()),
            UserField::Username => FieldValue::from(self.username.as_str()),
            UserField::FirstName => FieldValue::from_opt(self.first_name()),
            UserField::LastName => FieldValue::from_opt(self.last_name()),
            UserField::Email => FieldValue::from_opt(self.email()),
            UserField::Enabled => FieldValue::from(self.enabled),
            UserField::EmailVerified => FieldValue::from(self.email_verified),
            UserField::CreatedTimestamp => FieldValue::from(self.created_timestamp),
            UserField::FederationLink => FieldValue::from_opt(self.federation_link()),
            UserField::ServiceAccountClient => {
                FieldValue::from_opt(self.service_account_client_link())
            }
            UserField::Attribute => attribute_value(self, keys),
            UserField::IdpAlias => FieldValue::from_strs(
                self.federated_identities.iter().map(|f| &f.identity_provider),
            ),
            UserField::IdpUserId => {
                FieldValue::from_strs(self.federated_identities.iter().map(|f| &f.user_id))
            }
            UserField::AssignedRole => FieldValue::from_strs(&self.roles),
            UserField::AssignedGroup => FieldValue::from_strs(&self.groups),
            UserField::ConsentForClient => {
                FieldValue::from_strs(self.consents.iter().map(|c| &c.client_id))
            }
        }
    }
}
