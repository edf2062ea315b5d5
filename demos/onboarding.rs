//! Walks one tenant through onboarding: an organization, a user with an
//! email code, verification, and an external identity provider link.
//!
//! Run with: `cargo run --example onboarding`
//!
//! Everything runs against the in-memory event store; nothing is persisted.

use std::sync::Arc;

use eventfold_iam::payload::org::LoginPolicySettings;
use eventfold_iam::{
    AddHuman, AddIdpToLoginPolicy, AddLoginPolicy, AddOrg, AddOrgIdpConfig, AddUserIdpLink,
    AesGcmEncryption, CommandContext, CommandError, Commands, InMemoryEventStore,
    RemoveIdpFromLoginPolicy, VerifyEmail,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let store = Arc::new(InMemoryEventStore::new());
    let key = AesGcmEncryption::generate_key();
    let commands = Commands::builder()
        .event_store(store.clone())
        .code_encryption(Arc::new(AesGcmEncryption::new("demo-key", &key)?))
        .build()?;
    let ctx = CommandContext::new("demo-instance").with_actor("operator");

    let org_id = commands
        .execute(
            &ctx,
            AddOrg {
                name: "Analytical Engines".into(),
                ..AddOrg::default()
            },
        )
        .await?
        .output;
    println!("org      = {org_id}");

    let added = commands
        .execute(
            &ctx,
            AddHuman {
                org_id: org_id.clone(),
                username: "ada".into(),
                first_name: "Ada".into(),
                last_name: "Lovelace".into(),
                email: "ada@engines.example".into(),
                return_email_code: true,
                ..AddHuman::default()
            },
        )
        .await?
        .output;
    println!("user     = {}", added.user_id);

    // A second claim of the same username is rejected before anything is written.
    let duplicate = commands
        .execute(
            &ctx,
            AddHuman {
                org_id: org_id.clone(),
                username: "ADA".into(),
                first_name: "Ada".into(),
                last_name: "Byron".into(),
                email: "byron@engines.example".into(),
                ..AddHuman::default()
            },
        )
        .await;
    assert!(matches!(duplicate, Err(CommandError::AlreadyExists(_))));

    let code = added.email_code.ok_or("email code was not returned")?;
    let wrong = commands
        .execute(
            &ctx,
            VerifyEmail {
                user_id: added.user_id.clone(),
                code: "000000".into(),
            },
        )
        .await;
    println!("wrong    = {}", wrong.is_err());
    commands
        .execute(
            &ctx,
            VerifyEmail {
                user_id: added.user_id.clone(),
                code,
            },
        )
        .await?;
    println!("verified = true");

    commands
        .execute(
            &ctx,
            AddLoginPolicy {
                org_id: org_id.clone(),
                settings: LoginPolicySettings {
                    allow_username_password: true,
                    allow_external_idp: true,
                    ..LoginPolicySettings::default()
                },
            },
        )
        .await?;
    let idp_id = commands
        .execute(
            &ctx,
            AddOrgIdpConfig {
                org_id: org_id.clone(),
                name: "GitHub".into(),
                ..AddOrgIdpConfig::default()
            },
        )
        .await?
        .output;
    commands
        .execute(
            &ctx,
            AddIdpToLoginPolicy {
                org_id: org_id.clone(),
                idp_config_id: idp_id.clone(),
            },
        )
        .await?;
    commands
        .execute(
            &ctx,
            AddUserIdpLink {
                user_id: added.user_id.clone(),
                idp_config_id: idp_id.clone(),
                external_user_id: "gh-1815".into(),
                display_name: "ada".into(),
            },
        )
        .await?;

    let before = store.len().await;
    commands
        .execute(
            &ctx,
            RemoveIdpFromLoginPolicy {
                org_id,
                idp_config_id: idp_id,
            },
        )
        .await?;
    println!("cascade  = {} events", store.len().await - before);
    println!("total    = {} events", store.len().await);
    Ok(())
}
