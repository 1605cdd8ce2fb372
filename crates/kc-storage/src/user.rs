//! User storage provider trait.

use async_trait::async_trait;
use kc_model::{CredentialEntity, FederatedIdentityEntity, UserConsentEntity, UserEntity};

use crate::error::StorageResult;

/// Provider for user storage operations.
///
/// Usernames are unique in a realm; emails too unless the realm allows
/// duplicates.
#[async_trait]
pub trait UserProvider: Send + Sync {
    /// Creates a user.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::Duplicate` if the id or username is taken, or
    /// `StorageError::NotFound` for an unknown realm.
    async fn add_user(&self, realm_id: &str, id: Option<&str>, username: &str) -> StorageResult<UserEntity>;

    /// Gets a user by ID.
    async fn get_user_by_id(&self, realm_id: &str, id: &str) -> StorageResult<Option<UserEntity>>;

    /// Gets a user by username (case-insensitive).
    async fn get_user_by_username(&self, realm_id: &str, username: &str) -> StorageResult<Option<UserEntity>>;

    /// Gets a user by email (case-insensitive).
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::Duplicate` if several users share the email.
    async fn get_user_by_email(&self, realm_id: &str, email: &str) -> StorageResult<Option<UserEntity>>;

    /// Gets the user linked to an identity provider account.
    async fn get_user_by_federated_identity(
        &self,
        realm_id: &str,
        identity_provider: &str,
        idp_user_id: &str,
    ) -> StorageResult<Option<UserEntity>>;

    /// Gets the service account user of a client.
    async fn get_service_account(&self, realm_id: &str, client_id: &str) -> StorageResult<Option<UserEntity>>;

    /// Users carrying an attribute value.
    async fn get_users_by_attribute(&self, realm_id: &str, name: &str, value: &str) -> StorageResult<Vec<UserEntity>>;

    /// Users imported from a federation provider.
    async fn get_users_by_federation_link(&self, realm_id: &str, link: &str) -> StorageResult<Vec<UserEntity>>;

    /// Searches users, ordered by username.
    async fn search_for_users(
        &self,
        realm_id: &str,
        search: &UserSearch,
        first: Option<i32>,
        max: Option<i32>,
    ) -> StorageResult<Vec<UserEntity>>;

    /// Direct members of a group, ordered by username.
    async fn get_group_members(
        &self,
        realm_id: &str,
        group_id: &str,
        first: Option<i32>,
        max: Option<i32>,
    ) -> StorageResult<Vec<UserEntity>>;

    /// Users granted a role directly, ordered by username.
    async fn get_role_members(
        &self,
        realm_id: &str,
        role_id: &str,
        first: Option<i32>,
        max: Option<i32>,
    ) -> StorageResult<Vec<UserEntity>>;

    /// Counts users in a realm.
    async fn count_users(&self, realm_id: &str) -> StorageResult<u64>;

    /// Writes back a modified user. Returns `false` if it no longer exists.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::Duplicate` if the username or email changed to
    /// a taken one.
    async fn update_user(&self, user: UserEntity) -> StorageResult<bool>;

    /// Adds the user to a group.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::NotFound` if the user does not exist.
    async fn join_group(&self, realm_id: &str, user_id: &str, group_id: &str) -> StorageResult<()>;

    /// Removes the user from a group.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::NotFound` if the user does not exist.
    async fn leave_group(&self, realm_id: &str, user_id: &str, group_id: &str) -> StorageResult<bool>;

    /// Grants a role to the user.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::NotFound` if the user does not exist.
    async fn grant_role(&self, realm_id: &str, user_id: &str, role_id: &str) -> StorageResult<()>;

    /// Revokes a role from the user.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::NotFound` if the user does not exist.
    async fn revoke_role(&self, realm_id: &str, user_id: &str, role_id: &str) -> StorageResult<bool>;

    /// Stores a credential on the user.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::NotFound` if the user does not exist.
    async fn add_credential(&self, realm_id: &str, user_id: &str, credential: CredentialEntity) -> StorageResult<()>;

    /// Removes a credential. Returns whether it existed.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::NotFound` if the user does not exist.
    async fn remove_credential(&self, realm_id: &str, user_id: &str, credential_id: &str) -> StorageResult<bool>;

    /// Links an identity provider account, replacing an earlier link to the
    /// same provider.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::NotFound` if the user does not exist.
    async fn add_federated_identity(
        &self,
        realm_id: &str,
        user_id: &str,
        identity: FederatedIdentityEntity,
    ) -> StorageResult<()>;

    /// Unlinks an identity provider account.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::NotFound` if the user does not exist.
    async fn remove_federated_identity(
        &self,
        realm_id: &str,
        user_id: &str,
        identity_provider: &str,
    ) -> StorageResult<bool>;

    /// Records a consent, replacing an earlier one for the same client.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::NotFound` if the user does not exist.
    async fn grant_consent(&self, realm_id: &str, user_id: &str, consent: UserConsentEntity) -> StorageResult<()>;

    /// The consent given to a client.
    async fn get_consent(&self, realm_id: &str, user_id: &str, client_id: &str) -> StorageResult<Option<UserConsentEntity>>;

    /// Revokes the consent given to a client.
    ///
    /// ## Errors
    ///
    /// Returns `StorageError::NotFound` if the user does not exist.
    async fn revoke_consent(&self, realm_id: &str, user_id: &str, client_id: &str) -> StorageResult<bool>;

    /// Removes a user, firing removal events. Returns `false` if absent.
    ///
    /// ## Errors
    ///
    /// Returns the first failing cascade hook.
    async fn remove_user(&self, realm_id: &str, id: &str) -> StorageResult<bool>;

    /// Removes every user of a realm without per-user events.
    async fn remove_users(&self, realm_id: &str) -> StorageResult<u64>;

    /// Removes users imported from a federation provider.
    async fn remove_imported_users(&self, realm_id: &str, link: &str) -> StorageResult<u64>;

    /// Drops a removed role from every user. Returns the number changed.
    async fn remove_role_references(&self, realm_id: &str, role_id: &str) -> StorageResult<u64>;

    /// Drops a removed group from every user. Returns the number changed.
    async fn remove_group_references(&self, realm_id: &str, group_id: &str) -> StorageResult<u64>;

    /// Drops consents given to a removed client. Returns the number changed.
    async fn remove_consents_for_client(&self, realm_id: &str, client_id: &str) -> StorageResult<u64>;
}

/// Search parameters for users. Every set filter must match.
#[derive(Debug, Default, Clone)]
pub struct UserSearch {
    /// Free text matched against username, email, first and last name.
    /// `*` acts as a wildcard; a double-quoted value matches exactly.
    pub search: Option<String>,
    /// Filter by username (exact match).
    pub username: Option<String>,
    /// Filter by email (exact match).
    pub email: Option<String>,
    /// Filter by first name (substring).
    pub first_name: Option<String>,
    /// Filter by last name (substring).
    pub last_name: Option<String>,
    /// Filter by enabled status.
    pub enabled: Option<bool>,
    /// Filter by email verified status.
    pub email_verified: Option<bool>,
    /// Filter by federation link.
    pub federation_link: Option<String>,
    /// Filter by linked identity provider.
    pub identity_provider: Option<String>,
    /// Filter by attribute (name, value).
    pub attributes: Vec<(String, String)>,
    /// Include service account users.
    pub include_service_accounts: bool,
}

impl UserSearch {
    /// Creates empty search parameters.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            search: None,
            username: None,
            email: None,
            first_name: None,
            last_name: None,
            enabled: None,
            email_verified: None,
            federation_link: None,
            identity_provider: None,
            attributes: Vec::new(),
            include_service_accounts: false,
        }
    }

    /// Sets the search string.
    #[must_use]
    pub fn search(mut self, search: impl Into<String>) -> Self {
        self.search = Some(search.into());
        self
    }

    /// Filters by username.
    #[must_use]
    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.username = Some(username.into());
        self
    }

    /// Filters by email.
    #[must_use]
    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    /// Filters by enabled status.
    #[must_use]
    pub const fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    /// Filters by an attribute value.
    #[must_use]
    pub fn attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.push((name.into(), value.into()));
        self
    }

    /// Includes service account users.
    #[must_use]
    pub const fn with_service_accounts(mut self) -> Self {
        self.include_service_accounts = true;
        self
    }
}
