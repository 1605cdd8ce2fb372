//! Session expiry and the realm lifecycle end to end.

use std::time::Duration;

use futures::TryStreamExt;
use kc_core::Config;
use kc_model::{Entity, UserEntity, UserField};
use kc_session::UserSessionEntity;
use kc_storage::{Criteria, Operator, QueryParameters, StorageError};

use crate::common::{TestEnv, T0};

#[tokio::test]
async fn expired_session_is_absent_and_deleted_on_read() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let realm = env.create_realm("r").await?;

    let session = env.session().await?;
    let created = session
        .sessions()
        .await?
        .create_user_session(UserSessionEntity::new(&realm, "u1", "alice", 0))
        .await?;
    let id = created.id().unwrap_or_default().to_string();
    assert_eq!(created.expiration(), Some(T0 + 60_000));
    session.commit().await?;

    let session = env.session().await?;
    assert!(session.sessions().await?.get_user_session(&realm, &id).await?.is_some());
    session.commit().await?;

    env.clock.advance(Duration::from_secs(61));
    let session = env.session().await?;
    assert!(session.sessions().await?.get_user_session(&realm, &id).await?.is_none());
    session.commit().await?;

    let stored = env.factory.storage().user_sessions().read(None, &id).await?;
    assert!(stored.is_none());
    Ok(())
}

#[tokio::test]
async fn sweep_removes_sessions_nobody_read() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let realm = env.create_realm("r").await?;

    let session = env.session().await?;
    let sessions = session.sessions().await?;
    for user in ["alice", "bob"] {
        sessions
            .create_user_session(UserSessionEntity::new(&realm, user, user, 0))
            .await?;
    }
    session.commit().await?;

    assert_eq!(env.factory.remove_expired_sessions().await?, 0);
    env.clock.advance(Duration::from_secs(61));
    assert_eq!(env.factory.remove_expired_sessions().await?, 2);
    Ok(())
}

#[tokio::test]
async fn realm_lifecycle_end_to_end() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let realm = env.create_realm("acme").await?;

    let session = env.session().await?;
    let users = session.users().await?;
    let mut user = users.add_user(&realm, None, "alice").await?;
    user.set_single_attribute("dept", "eng");
    users.update_user(user.clone()).await?;
    users.add_user(&realm, None, "bob").await?;
    session.commit().await?;
    let user_id = user.id().unwrap_or_default().to_string();

    let query = QueryParameters::with_criteria(
        Criteria::new()
            .compare(UserField::RealmId, Operator::Eq, realm.as_str())
            .compare_keyed(UserField::Attribute, "dept", Operator::Eq, "eng"),
    );
    let storage = env.factory.storage().users();
    let found: Vec<UserEntity> = storage.read_matching(None, &query).await?.try_collect().await?;
    let found: Vec<_> = found.iter().filter_map(|u| u.id()).collect();
    assert_eq!(found, vec![user_id.as_str()]);

    let session = env.session().await?;
    assert!(session.realms().await?.remove_realm(&realm).await?);
    session.commit().await?;

    assert!(storage.read(None, &user_id).await?.is_none());
    let session = env.session().await?;
    assert!(session.realms().await?.get_realm_by_name("acme").await?.is_none());
    session.close().await;
    Ok(())
}

#[tokio::test]
async fn realm_lifecycle_on_partitioned_backends() -> anyhow::Result<()> {
    let config = Config::from_lookup(|key| match key {
        "KC_STORAGE_USER" | "KC_STORAGE_USER_SESSION" => Some("realm-partitioned".to_string()),
        _ => None,
    })?;
    let env = TestEnv::configured(config).await?;
    let realm = env.create_realm("acme").await?;

    let session = env.session().await?;
    let user = session.users().await?.add_user(&realm, None, "alice").await?;
    let user_id = user.id().unwrap_or_default().to_string();
    let login = session
        .sessions()
        .await?
        .create_user_session(UserSessionEntity::new(&realm, &user_id, "alice", 0))
        .await?;
    let session_id = login.id().unwrap_or_default().to_string();
    session.commit().await?;

    let users = env.factory.storage().users();
    let user_sessions = env.factory.storage().user_sessions();
    let err = users.read(None, &user_id).await.unwrap_err();
    assert!(matches!(err, StorageError::RealmNotSet(_)));
    assert!(users.read(Some(&realm), &user_id).await?.is_some());

    let session = env.session().await?;
    assert!(session.sessions().await?.get_user_session(&realm, &session_id).await?.is_some());
    assert_eq!(session.users().await?.count_users(&realm).await?, 1);
    session.close().await;

    let session = env.session().await?;
    assert!(session.realms().await?.remove_realm(&realm).await?);
    session.commit().await?;

    assert!(users.read(Some(&realm), &user_id).await?.is_none());
    assert!(user_sessions.read(Some(&realm), &session_id).await?.is_none());
    assert!(!users.release_realm(&realm));
    assert!(!user_sessions.release_realm(&realm));

    let session = env.session().await?;
    assert!(session.realms().await?.get_realm_by_name("acme").await?.is_none());
    session.close().await;
    Ok(())
}

#[tokio::test]
async fn run_in_transaction_commits_the_job() -> anyhow::Result<()> {
    let env = TestEnv::new();
    env.factory
        .run_in_transaction(|session| {
            Box::pin(async move {
                session.realms().await?.create_realm(Some("r"), "r").await?;
                Ok(())
            })
        })
        .await?;

    let session = env.session().await?;
    assert!(session.realms().await?.get_realm("r").await?.is_some());
    session.close().await;
    Ok(())
}
