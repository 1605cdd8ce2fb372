//! Removal cascades through the root context.

use kc_model::{Entity, UserConsentEntity};
use kc_session::UserSessionEntity;

use crate::common::{TestEnv, T0};

fn id_of(entity: &impl Entity) -> String {
    entity.id().unwrap_or_default().to_string()
}

#[tokio::test]
async fn removed_role_leaves_no_dangling_references() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let realm = env.create_realm("r").await?;

    let session = env.session().await?;
    let roles = session.roles().await?;
    let parent = id_of(&roles.add_realm_role(&realm, None, "S").await?);
    let member = id_of(&roles.add_realm_role(&realm, None, "R").await?);
    roles.add_composite(&realm, &parent, &member).await?;

    let client = id_of(&session.clients().await?.add_client(&realm, None, "app").await?);
    session.clients().await?.add_scope_mapping(&realm, &client, &member).await?;
    let group = id_of(&session.groups().await?.create_group(&realm, None, "staff", None).await?);
    session.groups().await?.grant_role(&realm, &group, &member).await?;
    let user = id_of(&session.users().await?.add_user(&realm, None, "alice").await?);
    session.users().await?.grant_role(&realm, &user, &member).await?;
    session.commit().await?;

    let session = env.session().await?;
    assert!(session.roles().await?.remove_role(&realm, &member).await?);
    session.commit().await?;

    let session = env.session().await?;
    let parent = session.roles().await?.get_role_by_id(&realm, &parent).await?.unwrap();
    assert!(!parent.composite_roles().contains(&member));
    let client = session.clients().await?.get_client_by_id(&realm, &client).await?.unwrap();
    assert!(!client.scope_mappings().contains(&member));
    let group = session.groups().await?.get_group_by_id(&realm, &group).await?.unwrap();
    assert!(!group.granted_roles().contains(&member));
    let user = session.users().await?.get_user_by_id(&realm, &user).await?.unwrap();
    assert!(!user.roles().contains(&member));
    session.close().await;
    Ok(())
}

#[tokio::test]
async fn removed_group_loses_its_members() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let realm = env.create_realm("r").await?;

    let session = env.session().await?;
    let group = id_of(&session.groups().await?.create_group(&realm, None, "staff", None).await?);
    let users = session.users().await?;
    let user = id_of(&users.add_user(&realm, None, "alice").await?);
    users.join_group(&realm, &user, &group).await?;
    session.commit().await?;

    let session = env.session().await?;
    session.groups().await?.remove_group(&realm, &group).await?;
    let user = session.users().await?.get_user_by_id(&realm, &user).await?.unwrap();
    assert!(user.groups().is_empty());
    session.commit().await?;
    Ok(())
}

#[tokio::test]
async fn removed_client_takes_roles_consents_and_client_sessions() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let realm = env.create_realm("r").await?;

    let session = env.session().await?;
    let client = id_of(&session.clients().await?.add_client(&realm, None, "app").await?);
    let role = id_of(&session.roles().await?.add_client_role(&realm, &client, None, "viewer").await?);
    let users = session.users().await?;
    let user = id_of(&users.add_user(&realm, None, "alice").await?);
    users.grant_consent(&realm, &user, UserConsentEntity::new(client.clone(), T0)).await?;
    let sessions = session.sessions().await?;
    let user_session = id_of(
        &sessions
            .create_user_session(UserSessionEntity::new(&realm, user.clone(), "alice", 0))
            .await?,
    );
    sessions.create_client_session(&realm, &user_session, &client).await?;
    session.commit().await?;

    let session = env.session().await?;
    assert!(session.clients().await?.remove_client(&realm, &client).await?);
    session.commit().await?;

    let session = env.session().await?;
    assert!(session.roles().await?.get_role_by_id(&realm, &role).await?.is_none());
    assert!(session.users().await?.get_consent(&realm, &user, &client).await?.is_none());
    let remaining = session.sessions().await?.get_user_session(&realm, &user_session).await?.unwrap();
    assert!(remaining.client_session(&client).is_none());
    session.close().await;
    Ok(())
}

#[tokio::test]
async fn removed_user_takes_online_and_offline_sessions() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let realm = env.create_realm("r").await?;

    let session = env.session().await?;
    let user = id_of(&session.users().await?.add_user(&realm, None, "alice").await?);
    let sessions = session.sessions().await?;
    let online = id_of(
        &sessions
            .create_user_session(UserSessionEntity::new(&realm, user.clone(), "alice", 0))
            .await?,
    );
    let offline = id_of(&sessions.create_offline_user_session(&realm, &online).await?);
    session.commit().await?;

    let session = env.session().await?;
    session.users().await?.remove_user(&realm, &user).await?;
    session.commit().await?;

    let session = env.session().await?;
    let sessions = session.sessions().await?;
    assert!(sessions.get_user_session(&realm, &online).await?.is_none());
    assert!(sessions.get_offline_user_session(&realm, &offline).await?.is_none());
    session.close().await;
    Ok(())
}

#[tokio::test]
async fn rolled_back_removal_keeps_every_dependent() -> anyhow::Result<()> {
    let env = TestEnv::new();
    let realm = env.create_realm("r").await?;

    let session = env.session().await?;
    let user = id_of(&session.users().await?.add_user(&realm, None, "alice").await?);
    session.commit().await?;

    let session = env.session().await?;
    assert!(session.realms().await?.remove_realm(&realm).await?);
    session.rollback().await?;

    let session = env.session().await?;
    assert!(session.realms().await?.get_realm(&realm).await?.is_some());
    assert!(session.users().await?.get_user_by_id(&realm, &user).await?.is_some());
    session.close().await;
    Ok(())
}
