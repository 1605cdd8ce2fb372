//! Map-backed user provider.
//!
//! Usernames and emails are stored lowercased, so uniqueness checks compare
//! the lowercased input with `EQ`.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use kc_core::{Clock, EntityType, RemovalEvent};
use kc_model::{CredentialEntity, Entity, FederatedIdentityEntity, UserConsentEntity, UserEntity, UserField};
use kc_storage::{
    Criteria, InvalidationSink, MapTransaction, Operator, Order, QueryParameters, RealmProvider, StorageError,
    StorageResult, UserProvider, UserSearch,
};

use crate::support::{contains, dispatch, modify, read_in_realm, require_realm};

/// User provider over a [`MapTransaction`].
pub struct MapUserProvider {
    tx: Arc<MapTransaction<UserEntity>>,
    realms: Arc<dyn RealmProvider>,
    clock: Arc<dyn Clock>,
    events: Weak<dyn InvalidationSink>,
}

impl std::fmt::Debug for MapUserProvider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MapUserProvider").field("tx", &self.tx).finish_non_exhaustive()
    }
}

fn in_realm(realm_id: &str) -> Criteria<UserField> {
    Criteria::new().compare(UserField::RealmId, Operator::Eq, realm_id)
}

fn by_username(query: QueryParameters<UserField>) -> QueryParameters<UserField> {
    query.order_by(UserField::Username, Order::Ascending)
}

/// Turns free search text into an ILIKE pattern.
///
/// A lone `*` matches everything, a quoted value is an exact match, `*`
/// inside the value is a wildcard, anything else is a substring search.
fn search_pattern(text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() || text == "*" {
        return None;
    }
    if text.len() >= 2 && text.starts_with('"') && text.ends_with('"') {
        return Some(text.to_string());
    }
    if text.contains('*') {
        return Some(text.replace('*', "%"));
    }
    Some(contains(text))
}

fn search_criteria(realm_id: &str, search: &UserSearch) -> Criteria<UserField> {
    let mut criteria = in_realm(realm_id);
    if !search.include_service_accounts {
        criteria = criteria.not_exists(UserField::ServiceAccountClient);
    }
    if let Some(pattern) = search.search.as_deref().and_then(search_pattern) {
        criteria = criteria.with(Criteria::or(
            [UserField::Username, UserField::Email, UserField::FirstName, UserField::LastName]
                .into_iter()
                .map(|field| Criteria::new().compare(field, Operator::ILike, pattern.as_str())),
        ));
    }
    let text_filters = [
        (UserField::Username, &search.username),
        (UserField::Email, &search.email),
        (UserField::FirstName, &search.first_name),
        (UserField::LastName, &search.last_name),
    ];
    for (field, value) in text_filters {
        if let Some(value) = value {
            criteria = criteria.compare(field, Operator::ILike, contains(value));
        }
    }
    if let Some(enabled) = search.enabled {
        criteria = criteria.compare(UserField::Enabled, Operator::Eq, enabled);
    }
    if let Some(verified) = search.email_verified {
        criteria = criteria.compare(UserField::EmailVerified, Operator::Eq, verified);
    }
    if let Some(link) = &search.federation_link {
        criteria = criteria.compare(UserField::FederationLink, Operator::Eq, link);
    }
    if let Some(alias) = &search.identity_provider {
        criteria = criteria.compare(UserField::IdpAlias, Operator::Eq, alias);
    }
    for (name, value) in &search.attributes {
        criteria = criteria.compare_keyed(UserField::Attribute, name, Operator::Eq, value);
    }
    criteria
}

impl MapUserProvider {
    /// Creates a provider.
    #[must_use]
    pub fn new(
        tx: Arc<MapTransaction<UserEntity>>,
        realms: Arc<dyn RealmProvider>,
        clock: Arc<dyn Clock>,
        events: Weak<dyn InvalidationSink>,
    ) -> Self {
        Self {
            tx,
            realms,
            clock,
            events,
        }
    }

    async fn select(&self, realm_id: &str, query: QueryParameters<UserField>) -> StorageResult<Vec<UserEntity>> {
        self.tx.set_realm_id(Some(realm_id));
        self.tx.read_all(&query).await
    }

    async fn with_value(&self, realm_id: &str, field: UserField, value: &str) -> StorageResult<Vec<UserEntity>> {
        let query = in_realm(realm_id).compare(field, Operator::Eq, value);
        self.select(realm_id, query.into()).await
    }

    async fn ensure_username_free(&self, realm_id: &str, username: &str, own_id: Option<&str>) -> StorageResult<()> {
        let username = username.to_lowercase();
        let clash = self
            .with_value(realm_id, UserField::Username, &username)
            .await?
            .iter()
            .any(|u| u.id() != own_id);
        if clash {
            return Err(StorageError::duplicate(EntityType::User, "username", username));
        }
        Ok(())
    }

    async fn ensure_email_free(&self, realm_id: &str, email: &str, own_id: Option<&str>) -> StorageResult<()> {
        let realm = require_realm(self.realms.as_ref(), realm_id).await?;
        if realm.is_duplicate_emails_allowed() {
            return Ok(());
        }
        let email = email.to_lowercase();
        let clash = self
            .with_value(realm_id, UserField::Email, &email)
            .await?
            .iter()
            .any(|u| u.id() != own_id);
        if clash {
            return Err(StorageError::duplicate(EntityType::User, "email", email));
        }
        Ok(())
    }

    async fn members(
        &self,
        realm_id: &str,
        field: UserField,
        value: &str,
        first: Option<i32>,
        max: Option<i32>,
    ) -> StorageResult<Vec<UserEntity>> {
        let query = by_username(in_realm(realm_id).compare(field, Operator::Eq, value).into()).pagination(first, max);
        self.select(realm_id, query).await
    }
}

#[async_trait]
impl UserProvider for MapUserProvider {
    async fn add_user(&self, realm_id: &str, id: Option<&str>, username: &str) -> StorageResult<UserEntity> {
        require_realm(self.realms.as_ref(), realm_id).await?;
        self.ensure_username_free(realm_id, username, None).await?;
        let mut user = UserEntity::new(realm_id, username, self.clock.now_millis());
        if let Some(id) = id {
            user.set_id(id)?;
        }
        self.tx.set_realm_id(Some(realm_id));
        let user = self.tx.create(user).await?;
        tracing::debug!(realm_id, user_id = ?user.id(), username = user.username(), "Created user");
        Ok(user)
    }

    async fn get_user_by_id(&self, realm_id: &str, id: &str) -> StorageResult<Option<UserEntity>> {
        read_in_realm(&self.tx, realm_id, id).await
    }

    async fn get_user_by_username(&self, realm_id: &str, username: &str) -> StorageResult<Option<UserEntity>> {
        Ok(self
            .with_value(realm_id, UserField::Username, &username.to_lowercase())
            .await?
            .into_iter()
            .next())
    }

    async fn get_user_by_email(&self, realm_id: &str, email: &str) -> StorageResult<Option<UserEntity>> {
        let email = email.to_lowercase();
        let mut users = self.with_value(realm_id, UserField::Email, &email).await?;
        if users.len() > 1 {
            return Err(StorageError::duplicate(EntityType::User, "email", email));
        }
        Ok(users.pop())
    }

    async fn get_user_by_federated_identity(
        &self,
        realm_id: &str,
        identity_provider: &str,
        idp_user_id: &str,
    ) -> StorageResult<Option<UserEntity>> {
        let query = in_realm(realm_id)
            .compare(UserField::IdpAlias, Operator::Eq, identity_provider)
            .compare(UserField::IdpUserId, Operator::Eq, idp_user_id);
        // Both values must sit on the same link, which field criteria cannot express.
        Ok(self.select(realm_id, query.into()).await?.into_iter().find(|user| {
            user.federated_identities()
                .iter()
                .any(|link| link.identity_provider == identity_provider && link.user_id == idp_user_id)
        }))
    }

    async fn get_service_account(&self, realm_id: &str, client_id: &str) -> StorageResult<Option<UserEntity>> {
        Ok(self
            .with_value(realm_id, UserField::ServiceAccountClient, client_id)
            .await?
            .into_iter()
            .next())
    }

    async fn get_users_by_attribute(&self, realm_id: &str, name: &str, value: &str) -> StorageResult<Vec<UserEntity>> {
        let query = in_realm(realm_id).compare_keyed(UserField::Attribute, name, Operator::Eq, value);
        self.select(realm_id, by_username(query.into())).await
    }

    async fn get_users_by_federation_link(&self, realm_id: &str, link: &str) -> StorageResult<Vec<UserEntity>> {
        self.members(realm_id, UserField::FederationLink, link, None, None).await
    }

    async fn search_for_users(
        &self,
        realm_id: &str,
        search: &UserSearch,
        first: Option<i32>,
        max: Option<i32>,
    ) -> StorageResult<Vec<UserEntity>> {
        let query = by_username(search_criteria(realm_id, search).into()).pagination(first, max);
        self.select(realm_id, query).await
    }

    async fn get_group_members(
        &self,
        realm_id: &str,
        group_id: &str,
        first: Option<i32>,
        max: Option<i32>,
    ) -> StorageResult<Vec<UserEntity>> {
        self.members(realm_id, UserField::AssignedGroup, group_id, first, max).await
    }

    async fn get_role_members(
        &self,
        realm_id: &str,
        role_id: &str,
        first: Option<i32>,
        max: Option<i32>,
    ) -> StorageResult<Vec<UserEntity>> {
        self.members(realm_id, UserField::AssignedRole, role_id, first, max).await
    }

    async fn count_users(&self, realm_id: &str) -> StorageResult<u64> {
        self.tx.set_realm_id(Some(realm_id));
        self.tx.count(&in_realm(realm_id).into()).await
    }

    async fn update_user(&self, user: UserEntity) -> StorageResult<bool> {
        let (Some(id), Some(realm_id)) = (user.id().map(str::to_string), user.realm_id().map(str::to_string)) else {
            return Err(StorageError::InvalidData("user update without id or realm".to_string()));
        };
        let Some(stored) = read_in_realm(&self.tx, &realm_id, &id).await? else {
            return Ok(false);
        };
        if stored.username() != user.username() {
            self.ensure_username_free(&realm_id, user.username(), Some(&id)).await?;
        }
        if let Some(email) = user.email() {
            if stored.email() != Some(email) {
                self.ensure_email_free(&realm_id, email, Some(&id)).await?;
            }
        }
        self.tx.update(user).await
    }

    async fn join_group(&self, realm_id: &str, user_id: &str, group_id: &str) -> StorageResult<()> {
        modify(&self.tx, realm_id, user_id, |u: &mut UserEntity| u.join_group(group_id)).await
    }

    async fn leave_group(&self, realm_id: &str, user_id: &str, group_id: &str) -> StorageResult<bool> {
        modify(&self.tx, realm_id, user_id, |u: &mut UserEntity| u.leave_group(group_id)).await
    }

    async fn grant_role(&self, realm_id: &str, user_id: &str, role_id: &str) -> StorageResult<()> {
        modify(&self.tx, realm_id, user_id, |u: &mut UserEntity| u.grant_role(role_id)).await
    }

    async fn revoke_role(&self, realm_id: &str, user_id: &str, role_id: &str) -> StorageResult<bool> {
        modify(&self.tx, realm_id, user_id, |u: &mut UserEntity| u.revoke_role(role_id)).await
    }

    async fn add_credential(&self, realm_id: &str, user_id: &str, credential: CredentialEntity) -> StorageResult<()> {
        modify(&self.tx, realm_id, user_id, |u: &mut UserEntity| u.add_credential(credential)).await
    }

    async fn remove_credential(&self, realm_id: &str, user_id: &str, credential_id: &str) -> StorageResult<bool> {
        modify(&self.tx, realm_id, user_id, |u: &mut UserEntity| u.remove_credential(credential_id)).await
    }

    async fn add_federated_identity(
        &self,
        realm_id: &str,
        user_id: &str,
        identity: FederatedIdentityEntity,
    ) -> StorageResult<()> {
        modify(&self.tx, realm_id, user_id, |u: &mut UserEntity| u.add_federated_identity(identity)).await
    }

    async fn remove_federated_identity(
        &self,
        realm_id: &str,
        user_id: &str,
        identity_provider: &str,
    ) -> StorageResult<bool> {
        modify(&self.tx, realm_id, user_id, |u: &mut UserEntity| {
            u.remove_federated_identity(identity_provider)
        })
        .await
    }

    async fn grant_consent(&self, realm_id: &str, user_id: &str, consent: UserConsentEntity) -> StorageResult<()> {
        modify(&self.tx, realm_id, user_id, |u: &mut UserEntity| u.add_consent(consent)).await
    }

    async fn get_consent(&self, realm_id: &str, user_id: &str, client_id: &str) -> StorageResult<Option<UserConsentEntity>> {
        Ok(read_in_realm(&self.tx, realm_id, user_id)
            .await?
            .and_then(|u| u.consents().iter().find(|c| c.client_id == client_id).cloned()))
    }

    async fn revoke_consent(&self, realm_id: &str, user_id: &str, client_id: &str) -> StorageResult<bool> {
        modify(&self.tx, realm_id, user_id, |u: &mut UserEntity| u.remove_consent(client_id)).await
    }

    async fn remove_user(&self, realm_id: &str, id: &str) -> StorageResult<bool> {
        if read_in_realm(&self.tx, realm_id, id).await?.is_none() {
            return Ok(false);
        }
        let event = RemovalEvent::before(EntityType::User, realm_id, id);
        dispatch(&self.events, event.clone()).await?;
        self.tx.set_realm_id(Some(realm_id));
        self.tx.delete(id).await?;
        dispatch(&self.events, event.into_after()).await?;
        Ok(true)
    }

    async fn remove_users(&self, realm_id: &str) -> StorageResult<u64> {
        self.tx.set_realm_id(Some(realm_id));
        self.tx.delete_matching(&in_realm(realm_id).into()).await
    }

    async fn remove_imported_users(&self, realm_id: &str, link: &str) -> StorageResult<u64> {
        let query = in_realm(realm_id).compare(UserField::FederationLink, Operator::Eq, link);
        self.tx.set_realm_id(Some(realm_id));
        let removed = self.tx.delete_matching(&query.into()).await?;
        tracing::info!(realm_id, federation_link = link, removed, "Removed imported users");
        Ok(removed)
    }

    async fn remove_role_references(&self, realm_id: &str, role_id: &str) -> StorageResult<u64> {
        let mut changed = 0;
        for mut user in self.with_value(realm_id, UserField::AssignedRole, role_id).await? {
            if user.revoke_role(role_id) {
                self.tx.update(user).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn remove_group_references(&self, realm_id: &str, group_id: &str) -> StorageResult<u64> {
        let mut changed = 0;
        for mut user in self.with_value(realm_id, UserField::AssignedGroup, group_id).await? {
            if user.leave_group(group_id) {
                self.tx.update(user).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    async fn remove_consents_for_client(&self, realm_id: &str, client_id: &str) -> StorageResult<u64> {
        let mut changed = 0;
        for mut user in self.with_value(realm_id, UserField::ConsentForClient, client_id).await? {
            if user.remove_consent(client_id) {
                self.tx.update(user).await?;
                changed += 1;
            }
        }
        Ok(changed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use kc_storage::StorageTransaction;

    #[test]
    fn search_text_patterns() {
        assert_eq!(search_pattern("*"), None);
        assert_eq!(search_pattern("  "), None);
        assert_eq!(search_pattern("\"Bob\"").as_deref(), Some("\"Bob\""));
        assert_eq!(search_pattern("jo*n").as_deref(), Some("jo%n"));
        assert_eq!(search_pattern("ali").as_deref(), Some("%ali%"));
    }

    #[tokio::test]
    async fn usernames_are_unique_ignoring_case() {
        let fx = Fixture::with_realm("acme").await;
        fx.users.add_user("acme", None, "Alice").await.unwrap();

        let err = fx.users.add_user("acme", None, "ALICE").await.unwrap_err();
        assert!(err.is_duplicate());

        let found = fx.users.get_user_by_username("acme", "aLiCe").await.unwrap().unwrap();
        assert_eq!(found.username(), "alice");
    }

    #[tokio::test]
    async fn adding_to_unknown_realm_fails() {
        let fx = Fixture::with_realm("acme").await;
        let err = fx.users.add_user("nowhere", None, "bob").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn duplicate_email_rejected_unless_realm_allows_it() {
        let fx = Fixture::with_realm("acme").await;
        let mut a = fx.users.add_user("acme", None, "a").await.unwrap();
        let mut b = fx.users.add_user("acme", None, "b").await.unwrap();
        a.set_email(Some("Shared@Example.com"));
        assert!(fx.users.update_user(a).await.unwrap());

        b.set_email(Some("shared@example.com"));
        let err = fx.users.update_user(b.clone()).await.unwrap_err();
        assert!(err.is_duplicate());

        let mut realm = fx.realms.get_realm("acme").await.unwrap().unwrap();
        realm.set_duplicate_emails_allowed(true);
        fx.realms.update_realm(realm).await.unwrap();
        assert!(fx.users.update_user(b).await.unwrap());

        let err = fx.users.get_user_by_email("acme", "SHARED@example.com").await.unwrap_err();
        assert!(err.is_duplicate());
    }

    #[tokio::test]
    async fn search_skips_service_accounts_and_orders_by_username() {
        let fx = Fixture::with_realm("acme").await;
        for name in ["carol", "alice", "bob"] {
            fx.users.add_user("acme", None, name).await.unwrap();
        }
        let mut robot = fx.users.add_user("acme", None, "service-account-app").await.unwrap();
        robot.set_service_account_client_link(Some("app".to_string()));
        fx.users.update_user(robot).await.unwrap();

        let all = fx
            .users
            .search_for_users("acme", &UserSearch::new().search("*"), None, None)
            .await
            .unwrap();
        let names: Vec<_> = all.iter().map(UserEntity::username).collect();
        assert_eq!(names, ["alice", "bob", "carol"]);

        let with_robots = fx
            .users
            .search_for_users("acme", &UserSearch::new().with_service_accounts(), Some(1), Some(2))
            .await
            .unwrap();
        let names: Vec<_> = with_robots.iter().map(UserEntity::username).collect();
        assert_eq!(names, ["bob", "carol"]);

        let service = fx.users.get_service_account("acme", "app").await.unwrap().unwrap();
        assert_eq!(service.username(), "service-account-app");
    }

    #[tokio::test]
    async fn federated_identity_lookup_requires_same_link() {
        let fx = Fixture::with_realm("acme").await;
        let user = fx.users.add_user("acme", None, "alice").await.unwrap();
        let id = user.id().unwrap().to_string();
        fx.users
            .add_federated_identity("acme", &id, FederatedIdentityEntity::new("github", "gh-1", "alice"))
            .await
            .unwrap();
        fx.users
            .add_federated_identity("acme", &id, FederatedIdentityEntity::new("google", "go-1", "alice"))
            .await
            .unwrap();

        assert!(fx
            .users
            .get_user_by_federated_identity("acme", "github", "gh-1")
            .await
            .unwrap()
            .is_some());
        assert!(fx
            .users
            .get_user_by_federated_identity("acme", "github", "go-1")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn consents_survive_commit() {
        let fx = Fixture::with_realm("acme").await;
        let user = fx.users.add_user("acme", None, "alice").await.unwrap();
        let id = user.id().unwrap().to_string();
        fx.users
            .grant_consent("acme", &id, UserConsentEntity::new("app", 0))
            .await
            .unwrap();
        fx.user_tx.commit().await.unwrap();

        let fresh = fx.reopen_users();
        assert!(fresh.get_consent("acme", &id, "app").await.unwrap().is_some());
        assert_eq!(fresh.remove_consents_for_client("acme", "app").await.unwrap(), 1);
        assert!(fresh.get_consent("acme", &id, "app").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_user_fires_both_phases() {
        let fx = Fixture::with_realm("acme").await;
        let user = fx.users.add_user("acme", None, "alice").await.unwrap();
        let id = user.id().unwrap().to_string();

        assert!(fx.users.remove_user("acme", &id).await.unwrap());
        assert!(!fx.users.remove_user("acme", &id).await.unwrap());
        let events = fx.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], RemovalEvent::before(EntityType::User, "acme", &id));
        assert_eq!(events[1], RemovalEvent::before(EntityType::User, "acme", &id).into_after());
    }
}
