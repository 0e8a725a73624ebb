//! PostgreSQL repository conformance tests.
//!
//! All tests are ignored by default; run them against a scratch database
//! with `DATABASE_URL` set and `cargo test -- --ignored`.

use anyhow::Context;
use chrono::{Duration, Utc};
use secure_auth::{
    AccountRecord, AuditEntry, AuditEvent, BanState, IpBanRecord, Session,
    db::{
        AccountRepository, AuditRepository, BanRepository, Repositories, SessionRepository,
        TwoFactorRepository,
    },
    twofa::TwoFactorRecord,
};
use sqlx::PgPool;
use uuid::Uuid;

async fn setup_pool() -> anyhow::Result<PgPool> {
    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://postgres@localhost/secure_auth_test".to_string());
    let pool = PgPool::connect(&database_url)
        .await
        .context("failed to connect to test database")?;
    create_schema(&pool).await?;
    Ok(pool)
}

async fn create_schema(pool: &PgPool) -> anyhow::Result<()> {
    let statements = [
        "CREATE TABLE IF NOT EXISTS accounts (
            player_id UUID PRIMARY KEY,
            username TEXT NOT NULL,
            password_hash TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL,
            last_login_at TIMESTAMP,
            last_login_ip TEXT
        )",
        "CREATE TABLE IF NOT EXISTS sessions (
            binding TEXT PRIMARY KEY,
            player_id UUID NOT NULL,
            token UUID NOT NULL,
            issued_at TIMESTAMP NOT NULL,
            expires_at TIMESTAMP NOT NULL,
            ip TEXT
        )",
        "CREATE TABLE IF NOT EXISTS two_factor_auth (
            player_id UUID PRIMARY KEY,
            secret TEXT NOT NULL,
            confirmed BOOLEAN NOT NULL,
            recovery_codes TEXT[] NOT NULL,
            enrolled_at TIMESTAMP NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS ip_bans (
            ip TEXT PRIMARY KEY,
            permanent BOOLEAN NOT NULL,
            expires_at TIMESTAMP,
            reason TEXT NOT NULL,
            violations INT NOT NULL,
            created_at TIMESTAMP NOT NULL,
            last_violation_at TIMESTAMP NOT NULL
        )",
        "CREATE TABLE IF NOT EXISTS audit_log (
            id BIGSERIAL PRIMARY KEY,
            event TEXT NOT NULL,
            player_id UUID,
            username TEXT,
            ip TEXT NOT NULL,
            detail TEXT NOT NULL,
            created_at TIMESTAMP NOT NULL
        )",
    ];
    for statement in statements {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("schema setup failed")?;
    }
    Ok(())
}

fn test_account(username: &str) -> AccountRecord {
    AccountRecord {
        player_id: Uuid::new_v4(),
        username: username.to_string(),
        password_hash: "$argon2id$v=19$m=1024,t=1,p=1$c2FsdA$aGFzaA".to_string(),
        created_at: Utc::now(),
        last_login_at: None,
        last_login_ip: None,
    }
}

#[tokio::test]
#[ignore = "Requires database setup"]
async fn account_round_trip() {
    let repos = Repositories::postgres(setup_pool().await.expect("test database reachable"));
    let record = test_account(&format!("pg_user_{}", Uuid::new_v4().simple()));

    repos.accounts.insert(&record).await.unwrap();

    let found = repos
        .accounts
        .find_by_player_id(record.player_id)
        .await
        .unwrap()
        .expect("account must exist");
    assert_eq!(found.username, record.username);
    assert_eq!(found.password_hash, record.password_hash);

    let by_name = repos
        .accounts
        .find_by_username(&record.username.to_uppercase())
        .await
        .unwrap();
    assert!(by_name.is_some(), "username lookup is case-insensitive");

    let now = Utc::now();
    repos
        .accounts
        .update_last_login(record.player_id, now, "203.0.113.7")
        .await
        .unwrap();
    let found = repos
        .accounts
        .find_by_player_id(record.player_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(found.last_login_ip.as_deref(), Some("203.0.113.7"));

    repos.accounts.delete(record.player_id).await.unwrap();
    assert!(
        repos
            .accounts
            .find_by_player_id(record.player_id)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
#[ignore = "Requires database setup"]
async fn session_upsert_replaces_and_expires() {
    let repos = Repositories::postgres(setup_pool().await.expect("test database reachable"));
    let player = Uuid::new_v4();
    let binding = format!("{player}@203.0.113.7");
    let now = Utc::now();

    let first = Session {
        player_id: player,
        token: Uuid::new_v4(),
        binding: binding.clone(),
        issued_at: now,
        expires_at: now + Duration::hours(1),
        ip: Some("203.0.113.7".to_string()),
    };
    repos.sessions.upsert(&first).await.unwrap();

    let mut second = first.clone();
    second.token = Uuid::new_v4();
    repos.sessions.upsert(&second).await.unwrap();

    let found = repos
        .sessions
        .find_active(&binding, now)
        .await
        .unwrap()
        .expect("session must exist");
    assert_eq!(found.token, second.token);

    // Past expiry the repository refuses to return it
    assert!(
        repos
            .sessions
            .find_active(&binding, now + Duration::hours(2))
            .await
            .unwrap()
            .is_none()
    );

    repos.sessions.delete_for_player(player).await.unwrap();
    assert!(
        repos
            .sessions
            .find_active(&binding, now)
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
#[ignore = "Requires database setup"]
async fn two_factor_round_trip() {
    let repos = Repositories::postgres(setup_pool().await.expect("test database reachable"));
    let player = Uuid::new_v4();

    let record = TwoFactorRecord {
        player_id: player,
        secret: "JBSWY3DPEHPK3PXP".to_string(),
        confirmed: false,
        recovery_codes: vec!["digest-a".to_string(), "digest-b".to_string()],
        enrolled_at: Utc::now(),
    };
    repos.two_factor.upsert(&record).await.unwrap();

    let mut loaded = repos
        .two_factor
        .find(player)
        .await
        .unwrap()
        .expect("record must exist");
    assert!(!loaded.confirmed);
    assert_eq!(loaded.recovery_codes.len(), 2);

    loaded.confirmed = true;
    loaded.recovery_codes.remove(0);
    repos.two_factor.upsert(&loaded).await.unwrap();

    let reloaded = repos.two_factor.find(player).await.unwrap().unwrap();
    assert!(reloaded.confirmed);
    assert_eq!(reloaded.recovery_codes, vec!["digest-b".to_string()]);

    repos.two_factor.delete(player).await.unwrap();
    assert!(repos.two_factor.find(player).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "Requires database setup"]
async fn ban_round_trip_and_active_listing() {
    let repos = Repositories::postgres(setup_pool().await.expect("test database reachable"));
    let ip = format!("203.0.113.{}", rand::random::<u8>());
    let now = Utc::now();

    let record = IpBanRecord {
        ip: ip.clone(),
        state: BanState::Temp {
            expires_at: now + Duration::minutes(5),
        },
        reason: "threshold crossed".to_string(),
        violations: 1,
        created_at: now,
        last_violation_at: now,
    };
    repos.bans.upsert(&record).await.unwrap();

    let found = repos.bans.find(&ip).await.unwrap().expect("ban must exist");
    assert_eq!(found.violations, 1);
    assert!(matches!(found.state, BanState::Temp { .. }));

    let active = repos.bans.list_active(now).await.unwrap();
    assert!(active.iter().any(|b| b.ip == ip));

    // Expired temp bans drop out of the active listing
    let later = now + Duration::minutes(6);
    let active = repos.bans.list_active(later).await.unwrap();
    assert!(!active.iter().any(|b| b.ip == ip));

    repos.bans.delete(&ip).await.unwrap();
    assert!(repos.bans.find(&ip).await.unwrap().is_none());
}

#[tokio::test]
#[ignore = "Requires database setup"]
async fn audit_append_history_and_counts() {
    let repos = Repositories::postgres(setup_pool().await.expect("test database reachable"));
    let player = Uuid::new_v4();
    let now = Utc::now();

    for (event, detail) in [
        (AuditEvent::Register, "account created"),
        (AuditEvent::LoginFailure, "bad password"),
        (AuditEvent::LoginSuccess, "authenticated"),
    ] {
        let entry = AuditEntry {
            event,
            player_id: Some(player),
            username: Some("pg_audit_user".to_string()),
            ip: "203.0.113.7".to_string(),
            detail: detail.to_string(),
            created_at: now,
        };
        repos.audit.append(&entry).await.unwrap();
    }

    let history = repos.audit.history_for(player).await.unwrap();
    assert_eq!(history.len(), 3);

    let failures = repos
        .audit
        .count_events_since(AuditEvent::LoginFailure, now - Duration::hours(1))
        .await
        .unwrap();
    assert!(failures >= 1);
}
