//! Binding guard behavior: the five-check validation order, the
//! concurrent-usage trip-wire, IP-change heuristics, notifications, and
//! the maintenance surface.

mod common;

use chrono::{DateTime, Duration, Utc};
use common::*;
use sqlx::types::Json;
use token_service::db::TokenStore;
use token_service::models::{
    AccessToken, GeoLocation, IpHistoryEntry, TokenBindingMetadata, User,
};
use token_service::security::hash_token_secret;
use token_service::services::{
    BindingFailureReason, BindingOutcome, EnforcementAction, SecurityBreachReason,
};

async fn issue_token(h: &TestHarness, user: &User, jti: &str) -> AccessToken {
    let token = AccessToken {
        jti: jti.to_string(),
        user_id: user.id,
        scopes: Json(vec!["access-api".to_string()]),
        token_hash: hash_token_secret(&format!("{}-secret", jti)),
        chain_id: None,
        revoked: false,
        last_refreshed_at: None,
        created_at: Utc::now(),
        expires_at: Some(Utc::now() + Duration::hours(1)),
    };
    h.store.insert_access_token(&token).await.unwrap();
    token
}

/// Binding metadata as it would look after a quiet stretch: bound to the
/// primary fingerprint/session, last touched `age` ago.
fn aged_metadata(
    jti: &str,
    ip: &str,
    country_code: Option<&str>,
    age: Duration,
) -> TokenBindingMetadata {
    let updated_at = Utc::now() - age;
    TokenBindingMetadata {
        token_jti: jti.to_string(),
        client_fingerprint: TEST_FINGERPRINT.to_string(),
        session_id: TEST_SESSION_ID.to_string(),
        ip_address: ip.to_string(),
        ip_history: Json(vec![IpHistoryEntry {
            ip: ip.to_string(),
            timestamp: updated_at,
            location: GeoLocation {
                country: None,
                country_code: country_code.map(str::to_string),
                city: None,
                is_private: false,
            },
        }]),
        ip_change_count: 0,
        country_code: country_code.map(str::to_string),
        city: None,
        last_geo_notification_at: None,
        user_agent: Some("test-agent/1.0".to_string()),
        created_at: updated_at,
        updated_at,
    }
}

#[tokio::test]
async fn test_binding_round_trip() {
    // GIVEN: a token set issued from 1.2.3.4
    let h = harness();
    let user = create_user(&h.store).await;
    let ctx = ctx("1.2.3.4");

    let set = h
        .tokens
        .create_token_set(
            &ctx,
            user.id,
            &["access-api".to_string()],
            TEST_SESSION_ID,
            TEST_FINGERPRINT,
        )
        .await
        .unwrap();
    let jti = jwt_jti(&set.access_token);
    let token = h.store.find_access_token(&jti).await.unwrap().unwrap();
    let before = h.store.find_binding_metadata(&jti).await.unwrap().unwrap();

    // WHEN: the same client validates immediately
    let outcome = h.binding.validate_binding(&token, &ctx).await.unwrap();

    // THEN: validation passes and the stored binding is untouched
    assert_eq!(outcome, BindingOutcome::Valid);
    let after = h.store.find_binding_metadata(&jti).await.unwrap().unwrap();
    assert_eq!(after.ip_address, before.ip_address);
    assert_eq!(after.ip_change_count, 0);
    assert_eq!(after.updated_at, before.updated_at);
    assert_eq!(after.ip_history.0.len(), 1);

    // AND: the request was recorded in the tracking window
    let stats = h.binding.security_stats().await.unwrap();
    assert_eq!(stats.active_tokens_tracked, 1);
}

#[tokio::test]
async fn test_fingerprint_mismatch_denies_without_revocation() {
    let h = harness();
    let user = create_user(&h.store).await;
    let token = issue_token(&h, &user, "fp-test").await;
    h.store
        .create_binding_metadata(&aged_metadata("fp-test", "1.2.3.4", Some("US"), Duration::hours(3)))
        .await
        .unwrap();

    let outcome = h
        .binding
        .validate_binding(&token, &ctx_with("1.2.3.4", "fp-other", TEST_SESSION_ID))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        BindingOutcome::BindingFailure {
            reason: BindingFailureReason::FingerprintMismatch,
            action: None,
        }
    );

    // Treated as a client artifact: nothing revoked, nothing mutated,
    // nobody notified.
    let token = h.store.find_access_token("fp-test").await.unwrap().unwrap();
    assert!(!token.revoked);
    let metadata = h
        .store
        .find_binding_metadata("fp-test")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metadata.ip_change_count, 0);
    assert!(h.notifier.records().is_empty());
}

#[tokio::test]
async fn test_session_mismatch_denied() {
    let h = harness();
    let user = create_user(&h.store).await;
    let token = issue_token(&h, &user, "session-test").await;
    h.store
        .create_binding_metadata(&aged_metadata(
            "session-test",
            "1.2.3.4",
            Some("US"),
            Duration::hours(3),
        ))
        .await
        .unwrap();

    let outcome = h
        .binding
        .validate_binding(&token, &ctx_with("1.2.3.4", TEST_FINGERPRINT, "session-other"))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        BindingOutcome::BindingFailure {
            reason: BindingFailureReason::SessionMismatch,
            action: None,
        }
    );
}

#[tokio::test]
async fn test_concurrent_ip_trip_wire_revokes_principal() {
    let h = harness();
    let user = create_user(&h.store).await;
    let token = issue_token(&h, &user, "concurrent-test").await;
    let bystander = issue_token(&h, &user, "bystander").await;
    h.store
        .create_binding_metadata(&aged_metadata(
            "concurrent-test",
            "1.2.3.4",
            Some("US"),
            Duration::hours(3),
        ))
        .await
        .unwrap();

    // IP A is active in the window
    let outcome = h
        .binding
        .validate_binding(&token, &ctx("1.2.3.4"))
        .await
        .unwrap();
    assert_eq!(outcome, BindingOutcome::Valid);

    // A second address shows up inside the window
    let outcome = h
        .binding
        .validate_binding(&token, &ctx("5.6.7.8"))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        BindingOutcome::SecurityBreach {
            reason: SecurityBreachReason::ConcurrentIpUsage,
            action: EnforcementAction::RevokeAllTokens,
        }
    );

    // Every token of the principal is now unusable, not just this chain
    assert!(h
        .store
        .find_access_token(&token.jti)
        .await
        .unwrap()
        .unwrap()
        .revoked);
    assert!(h
        .store
        .find_access_token(&bystander.jti)
        .await
        .unwrap()
        .unwrap()
        .revoked);

    // The principal was alerted with the concurrent address list
    let records = h.notifier.records();
    assert_eq!(records.len(), 1);
    match &records[0] {
        Notification::ConcurrentAccess {
            user_id,
            current_ip,
            concurrent_ips,
        } => {
            assert_eq!(*user_id, user.id);
            assert_eq!(current_ip, "5.6.7.8");
            assert_eq!(concurrent_ips, &vec!["1.2.3.4".to_string()]);
        }
        other => panic!("unexpected notification {:?}", other),
    }
}

#[tokio::test]
async fn test_concurrent_detection_is_idempotent_under_retrigger() {
    let h = harness();
    let user = create_user(&h.store).await;
    let token = issue_token(&h, &user, "retrigger-test").await;
    h.store
        .create_binding_metadata(&aged_metadata(
            "retrigger-test",
            "1.2.3.4",
            Some("US"),
            Duration::hours(3),
        ))
        .await
        .unwrap();

    h.binding
        .validate_binding(&token, &ctx("1.2.3.4"))
        .await
        .unwrap();

    // Two overlapping detections both resolve to the same end state
    let first = h
        .binding
        .validate_binding(&token, &ctx("5.6.7.8"))
        .await
        .unwrap();
    h.binding
        .validate_binding(&token, &ctx("1.2.3.4"))
        .await
        .unwrap();
    let second = h
        .binding
        .validate_binding(&token, &ctx("5.6.7.8"))
        .await
        .unwrap();

    assert!(matches!(first, BindingOutcome::SecurityBreach { .. }));
    assert!(matches!(second, BindingOutcome::SecurityBreach { .. }));
    assert!(h
        .store
        .find_access_token("retrigger-test")
        .await
        .unwrap()
        .unwrap()
        .revoked);
}

#[tokio::test]
async fn test_notification_failure_does_not_change_outcome() {
    let h = harness();
    let user = create_user(&h.store).await;
    let token = issue_token(&h, &user, "notify-fail").await;
    h.store
        .create_binding_metadata(&aged_metadata(
            "notify-fail",
            "1.2.3.4",
            Some("US"),
            Duration::hours(3),
        ))
        .await
        .unwrap();
    h.notifier.set_failing(true);

    h.binding
        .validate_binding(&token, &ctx("1.2.3.4"))
        .await
        .unwrap();
    let outcome = h
        .binding
        .validate_binding(&token, &ctx("5.6.7.8"))
        .await
        .unwrap();

    // Delivery failed, detection still enforced
    assert!(matches!(outcome, BindingOutcome::SecurityBreach { .. }));
    assert!(h
        .store
        .find_access_token("notify-fail")
        .await
        .unwrap()
        .unwrap()
        .revoked);
}

#[tokio::test]
async fn test_rapid_ip_change_rejected() {
    let h = harness();
    let user = create_user(&h.store).await;
    let token = issue_token(&h, &user, "rapid-test").await;
    // Last update two minutes ago, under the five-minute floor
    h.store
        .create_binding_metadata(&aged_metadata(
            "rapid-test",
            "1.2.3.4",
            Some("US"),
            Duration::minutes(2),
        ))
        .await
        .unwrap();

    let outcome = h
        .binding
        .validate_binding(&token, &ctx("5.6.7.8"))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        BindingOutcome::BindingFailure {
            reason: BindingFailureReason::RapidIpChanges,
            action: Some(EnforcementAction::Logout),
        }
    );
}

#[tokio::test]
async fn test_scenario_geo_jump_within_window() {
    // GIVEN: a binding last seen in the US thirty minutes ago
    let h = harness();
    let user = create_user(&h.store).await;
    let token = issue_token(&h, &user, "jump-test").await;
    h.store
        .create_binding_metadata(&aged_metadata(
            "jump-test",
            "1.2.3.4",
            Some("US"),
            Duration::minutes(30),
        ))
        .await
        .unwrap();

    // WHEN: the next request arrives from a German address
    let outcome = h
        .binding
        .validate_binding(&token, &ctx("77.88.99.1"))
        .await
        .unwrap();

    // THEN: thirty minutes is inside the two-hour window
    assert_eq!(
        outcome,
        BindingOutcome::BindingFailure {
            reason: BindingFailureReason::SuspiciousGeoJump,
            action: Some(EnforcementAction::Logout),
        }
    );
}

#[tokio::test]
async fn test_country_change_after_window_is_accepted_with_notification() {
    let h = harness();
    let user = create_user(&h.store).await;
    let token = issue_token(&h, &user, "notify-test").await;
    h.store
        .create_binding_metadata(&aged_metadata(
            "notify-test",
            "1.2.3.4",
            Some("US"),
            Duration::hours(3),
        ))
        .await
        .unwrap();

    let outcome = h
        .binding
        .validate_binding(&token, &ctx("77.88.99.1"))
        .await
        .unwrap();
    assert_eq!(outcome, BindingOutcome::Valid);

    let metadata = h
        .store
        .find_binding_metadata("notify-test")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metadata.ip_address, "77.88.99.1");
    assert_eq!(metadata.country_code.as_deref(), Some("DE"));
    assert_eq!(metadata.ip_change_count, 1);
    assert_eq!(metadata.ip_history.0.len(), 2);
    assert!(metadata.last_geo_notification_at.is_some());

    let records = h.notifier.records();
    assert_eq!(records.len(), 1);
    match &records[0] {
        Notification::LocationChange {
            user_id,
            country_code,
            ip,
        } => {
            assert_eq!(*user_id, user.id);
            assert_eq!(country_code.as_deref(), Some("DE"));
            assert_eq!(ip, "77.88.99.1");
        }
        other => panic!("unexpected notification {:?}", other),
    }
}

#[tokio::test]
async fn test_geo_notification_respects_cooldown() {
    let h = harness();
    let user = create_user(&h.store).await;
    let token = issue_token(&h, &user, "cooldown-test").await;

    let mut metadata = aged_metadata("cooldown-test", "1.2.3.4", Some("US"), Duration::hours(3));
    // A notification went out recently; the hour-long cooldown is active
    metadata.last_geo_notification_at = Some(Utc::now() - Duration::minutes(5));
    h.store.create_binding_metadata(&metadata).await.unwrap();

    let outcome = h
        .binding
        .validate_binding(&token, &ctx("77.88.99.1"))
        .await
        .unwrap();

    assert_eq!(outcome, BindingOutcome::Valid);
    assert!(h.notifier.records().is_empty());
}

#[tokio::test]
async fn test_scenario_max_ip_changes_exhausted() {
    let h = harness();
    let user = create_user(&h.store).await;
    let token = issue_token(&h, &user, "ceiling-test").await;

    let mut metadata = aged_metadata("ceiling-test", "1.2.3.4", Some("US"), Duration::hours(3));
    metadata.ip_change_count = 10;
    h.store.create_binding_metadata(&metadata).await.unwrap();

    // Even a plausible same-country move is refused at the ceiling
    let outcome = h
        .binding
        .validate_binding(&token, &ctx("5.6.7.8"))
        .await
        .unwrap();

    assert_eq!(
        outcome,
        BindingOutcome::BindingFailure {
            reason: BindingFailureReason::MaxIpChangesExceeded,
            action: Some(EnforcementAction::Logout),
        }
    );
}

#[tokio::test]
async fn test_same_country_change_accepted_quietly() {
    let h = harness();
    let user = create_user(&h.store).await;
    let token = issue_token(&h, &user, "quiet-test").await;
    h.store
        .create_binding_metadata(&aged_metadata(
            "quiet-test",
            "1.2.3.4",
            Some("US"),
            Duration::hours(3),
        ))
        .await
        .unwrap();

    let outcome = h
        .binding
        .validate_binding(&token, &ctx("5.6.7.8"))
        .await
        .unwrap();

    assert_eq!(outcome, BindingOutcome::Valid);
    let metadata = h
        .store
        .find_binding_metadata("quiet-test")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metadata.ip_address, "5.6.7.8");
    assert_eq!(metadata.ip_change_count, 1);
    // Same country: nobody notified
    assert!(h.notifier.records().is_empty());
    assert!(metadata.last_geo_notification_at.is_none());
}

#[tokio::test]
async fn test_private_address_never_notifies() {
    let h = harness();
    let user = create_user(&h.store).await;
    let token = issue_token(&h, &user, "private-test").await;
    h.store
        .create_binding_metadata(&aged_metadata(
            "private-test",
            "1.2.3.4",
            Some("US"),
            Duration::hours(3),
        ))
        .await
        .unwrap();

    let outcome = h
        .binding
        .validate_binding(&token, &ctx("192.168.1.50"))
        .await
        .unwrap();

    assert_eq!(outcome, BindingOutcome::Valid);
    assert!(h.notifier.records().is_empty());

    let metadata = h
        .store
        .find_binding_metadata("private-test")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metadata.country_code.as_deref(), Some("LOCAL"));
}

#[tokio::test]
async fn test_token_without_metadata_validates() {
    let h = harness();
    let user = create_user(&h.store).await;
    let token = issue_token(&h, &user, "unbound-test").await;

    let outcome = h
        .binding
        .validate_binding(&token, &ctx("1.2.3.4"))
        .await
        .unwrap();
    assert_eq!(outcome, BindingOutcome::Valid);
}

#[tokio::test]
async fn test_ip_history_capped_during_long_roaming() {
    let h = harness();
    let user = create_user(&h.store).await;
    let token = issue_token(&h, &user, "roaming-test").await;

    let mut metadata = aged_metadata("roaming-test", "1.2.3.4", Some("US"), Duration::hours(3));
    for i in 0..9 {
        metadata.push_ip_history(IpHistoryEntry {
            ip: format!("10.0.0.{}", i),
            timestamp: metadata.updated_at,
            location: GeoLocation::unknown(),
        });
    }
    h.store.create_binding_metadata(&metadata).await.unwrap();

    let outcome = h
        .binding
        .validate_binding(&token, &ctx("5.6.7.8"))
        .await
        .unwrap();
    assert_eq!(outcome, BindingOutcome::Valid);

    let metadata = h
        .store
        .find_binding_metadata("roaming-test")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(metadata.ip_history.0.len(), 10);
    assert_eq!(metadata.ip_history.0.last().unwrap().ip, "5.6.7.8");
}

#[tokio::test]
async fn test_cleanup_drops_stale_windows() {
    let h = harness();
    let user = create_user(&h.store).await;
    let token = issue_token(&h, &user, "sweep-live").await;
    h.store
        .create_binding_metadata(&aged_metadata(
            "sweep-live",
            "1.2.3.4",
            Some("US"),
            Duration::hours(3),
        ))
        .await
        .unwrap();

    // One live window via a real validation
    h.binding
        .validate_binding(&token, &ctx("1.2.3.4"))
        .await
        .unwrap();

    // One window whose entries have all aged out
    let stale = serde_json::json!({
        "9.9.9.9": {
            "ip": "9.9.9.9",
            "last_seen": Utc::now() - Duration::hours(2),
            "user_agent": null
        }
    });
    use token_service::cache::KeyValueStore;
    h.kv
        .put("token_ip_usage:sweep-stale", &stale.to_string(), None)
        .await
        .unwrap();

    assert_eq!(h.binding.security_stats().await.unwrap().active_tokens_tracked, 2);

    let cleaned = h.binding.cleanup_expired_tracking_data().await.unwrap();
    assert_eq!(cleaned, 1);
    assert_eq!(h.binding.security_stats().await.unwrap().active_tokens_tracked, 1);
}

#[tokio::test]
async fn test_revoke_all_user_tokens_clears_tracking() {
    let h = harness();
    let user = create_user(&h.store).await;
    let token = issue_token(&h, &user, "logout-test").await;
    h.store
        .create_binding_metadata(&aged_metadata(
            "logout-test",
            "1.2.3.4",
            Some("US"),
            Duration::hours(3),
        ))
        .await
        .unwrap();

    h.binding
        .validate_binding(&token, &ctx("1.2.3.4"))
        .await
        .unwrap();
    assert_eq!(h.binding.security_stats().await.unwrap().active_tokens_tracked, 1);

    let revoked = h
        .binding
        .revoke_all_user_tokens(user.id, "logout_everywhere")
        .await
        .unwrap();
    assert_eq!(revoked, 1);
    assert_eq!(h.binding.security_stats().await.unwrap().active_tokens_tracked, 0);

    // Safe to re-run
    let again = h
        .binding
        .revoke_all_user_tokens(user.id, "logout_everywhere")
        .await
        .unwrap();
    assert_eq!(again, 1);
}

/// DateTime fields survive the JSON round trip through the window store.
#[tokio::test]
async fn test_window_entries_round_trip_timestamps() {
    let h = harness();
    let user = create_user(&h.store).await;
    let token = issue_token(&h, &user, "stamp-test").await;
    h.store
        .create_binding_metadata(&aged_metadata(
            "stamp-test",
            "1.2.3.4",
            Some("US"),
            Duration::hours(3),
        ))
        .await
        .unwrap();

    let before: DateTime<Utc> = Utc::now();
    h.binding
        .validate_binding(&token, &ctx("1.2.3.4"))
        .await
        .unwrap();

    use token_service::cache::KeyValueStore;
    let raw = h
        .kv
        .get("token_ip_usage:stamp-test")
        .await
        .unwrap()
        .unwrap();
    let window: std::collections::HashMap<String, token_service::models::IpUsageEntry> =
        serde_json::from_str(&raw).unwrap();
    let entry = window.get("1.2.3.4").unwrap();
    assert!(entry.last_seen >= before - Duration::seconds(1));
    assert_eq!(entry.user_agent.as_deref(), Some("test-agent/1.0"));
}
