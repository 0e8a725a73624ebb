//! Integration tests for the second-factor service: enrollment lifecycle,
//! skew tolerance, replay rejection, recovery codes.

use secure_auth::{
    Clock, MemoryBackend, TotpService, TwoFactorCheck,
    clock::ManualClock,
    config::TwoFactorConfig,
};
use chrono::{Duration, Utc};
use std::sync::Arc;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

fn test_config() -> TwoFactorConfig {
    TwoFactorConfig {
        skew_steps: 1,
        max_consecutive_failures: 3,
        recovery_code_count: 8,
    }
}

fn setup() -> (TotpService, ManualClock) {
    let clock = ManualClock::new(Utc::now());
    let service = TotpService::new(
        Arc::new(MemoryBackend::new()),
        Arc::new(clock.clone()),
        test_config(),
    );
    (service, clock)
}

/// Code an authenticator would have shown at `offset` from the clock's now.
fn code_at(secret: &str, clock: &ManualClock, offset: Duration) -> String {
    let totp = TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        Secret::Encoded(secret.to_string())
            .to_bytes()
            .expect("secret decodes"),
    )
    .expect("secret is valid");
    totp.generate((clock.now() + offset).timestamp().max(0) as u64)
}

async fn enroll_and_confirm(service: &TotpService, clock: &ManualClock, player: Uuid) -> secure_auth::TwoFactorSetup {
    let setup = service.enroll(player, "steve").await.expect("enrollment persists");
    let confirmed = service
        .confirm_enrollment(player, &code_at(&setup.secret, clock, Duration::zero()))
        .await
        .expect("confirmation persists");
    assert!(confirmed);
    // Step past the confirmation code's window so later verifies are not
    // caught by the replay guard
    clock.advance(Duration::seconds(60));
    setup
}

#[tokio::test]
async fn enrollment_is_pending_until_confirmed() {
    let (service, clock) = setup();
    let player = Uuid::new_v4();

    let setup = service.enroll(player, "steve").await.unwrap();
    assert!(!service.is_enabled(player).await.unwrap());

    // A pending secret does not verify live codes yet
    let check = service
        .verify(player, &code_at(&setup.secret, &clock, Duration::zero()))
        .await
        .unwrap();
    assert_eq!(check, TwoFactorCheck::Rejected);

    assert!(
        service
            .confirm_enrollment(player, &code_at(&setup.secret, &clock, Duration::zero()))
            .await
            .unwrap()
    );
    assert!(service.is_enabled(player).await.unwrap());

    // Confirming twice has nothing left to do
    assert!(
        !service
            .confirm_enrollment(player, &code_at(&setup.secret, &clock, Duration::zero()))
            .await
            .unwrap()
    );
}

#[tokio::test]
async fn wrong_first_code_keeps_enrollment_pending() {
    let (service, _clock) = setup();
    let player = Uuid::new_v4();
    service.enroll(player, "steve").await.unwrap();

    assert!(!service.confirm_enrollment(player, "000000").await.unwrap());
    assert!(!service.is_enabled(player).await.unwrap());
}

#[tokio::test]
async fn current_code_verifies_once() {
    let (service, clock) = setup();
    let player = Uuid::new_v4();
    let setup = enroll_and_confirm(&service, &clock, player).await;

    let code = code_at(&setup.secret, &clock, Duration::zero());
    assert_eq!(
        service.verify(player, &code).await.unwrap(),
        TwoFactorCheck::Accepted
    );

    // Identical code, identical step: replay
    assert_eq!(
        service.verify(player, &code).await.unwrap(),
        TwoFactorCheck::Rejected
    );
}

#[tokio::test]
async fn one_step_of_skew_is_tolerated_two_are_not() {
    let (service, clock) = setup();
    let player = Uuid::new_v4();
    let setup = enroll_and_confirm(&service, &clock, player).await;

    // One step behind: accepted
    let late = code_at(&setup.secret, &clock, Duration::seconds(-30));
    assert_eq!(
        service.verify(player, &late).await.unwrap(),
        TwoFactorCheck::Accepted
    );

    // Fresh window for the replay guard, then try two steps behind: rejected
    clock.advance(Duration::seconds(60));
    let too_late = code_at(&setup.secret, &clock, Duration::seconds(-60));
    assert_eq!(
        service.verify(player, &too_late).await.unwrap(),
        TwoFactorCheck::Rejected
    );

    // One step ahead (fast client clock): accepted
    let early = code_at(&setup.secret, &clock, Duration::seconds(30));
    assert_eq!(
        service.verify(player, &early).await.unwrap(),
        TwoFactorCheck::Accepted
    );
}

#[tokio::test]
async fn recovery_codes_are_single_use_and_removed() {
    let (service, clock) = setup();
    let player = Uuid::new_v4();
    let setup = enroll_and_confirm(&service, &clock, player).await;
    assert_eq!(setup.recovery_codes.len(), 8);

    let code = setup.recovery_codes[3].clone();
    match service.verify(player, &code).await.unwrap() {
        TwoFactorCheck::AcceptedRecovery { remaining } => assert_eq!(remaining, 7),
        other => panic!("expected recovery acceptance, got {other:?}"),
    }

    assert_eq!(
        service.verify(player, &code).await.unwrap(),
        TwoFactorCheck::Rejected
    );

    // Case and surrounding whitespace are forgiven
    let other = format!("  {}  ", setup.recovery_codes[4].to_lowercase());
    assert!(matches!(
        service.verify(player, &other).await.unwrap(),
        TwoFactorCheck::AcceptedRecovery { remaining: 6 }
    ));
}

#[tokio::test]
async fn disable_removes_secret_and_codes() {
    let (service, clock) = setup();
    let player = Uuid::new_v4();
    let setup = enroll_and_confirm(&service, &clock, player).await;

    service.disable(player).await.unwrap();
    assert!(!service.is_enabled(player).await.unwrap());
    assert_eq!(
        service
            .verify(player, &code_at(&setup.secret, &clock, Duration::zero()))
            .await
            .unwrap(),
        TwoFactorCheck::Rejected
    );
    assert_eq!(
        service.verify(player, &setup.recovery_codes[0]).await.unwrap(),
        TwoFactorCheck::Rejected
    );
}

#[tokio::test]
async fn re_enrollment_replaces_the_old_secret() {
    let (service, clock) = setup();
    let player = Uuid::new_v4();
    let old = enroll_and_confirm(&service, &clock, player).await;

    let fresh = service.enroll(player, "steve").await.unwrap();
    assert_ne!(old.secret, fresh.secret);

    // The old secret is gone, and 2FA is pending again until confirmation
    assert!(!service.is_enabled(player).await.unwrap());
    assert_eq!(
        service
            .verify(player, &code_at(&old.secret, &clock, Duration::zero()))
            .await
            .unwrap(),
        TwoFactorCheck::Rejected
    );
}

#[tokio::test]
async fn setup_exposes_a_provisioning_url() {
    let (service, _clock) = setup();
    let setup = service.enroll(Uuid::new_v4(), "steve").await.unwrap();
    assert!(setup.otpauth_url.starts_with("otpauth://totp/SecureAuth:steve?secret="));
    assert!(setup.otpauth_url.contains(&setup.secret));
    assert!(setup.otpauth_url.contains("period=30"));
}
