use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result, anyhow};
use async_trait::async_trait;
use referral_ledger::store;
use referral_ledger::{
    BonusReversal, EngagementEvent, EventOutcome, LanguageResolver, LanguageTag, LedgerError,
    LedgerPolicy, LedgerStore, ReferralLedger, ReferralLinkStatus, RegisterRequest, RootStore,
};

fn ledger_with(store: Arc<dyn LedgerStore>, policy: LedgerPolicy) -> ReferralLedger {
    ReferralLedger::new(store, Arc::new(LanguageResolver::default()), policy)
}

fn memory_ledger(total_spots: u64) -> (Arc<dyn LedgerStore>, ReferralLedger) {
    let store = store::memory(total_spots);
    let ledger = ledger_with(
        store.clone(),
        LedgerPolicy {
            total_spots,
            ..LedgerPolicy::default()
        },
    );
    (store, ledger)
}

fn request(user_id: &str, referral_code: Option<&str>) -> RegisterRequest {
    RegisterRequest {
        user_id: user_id.to_string(),
        username: Some(format!("user{user_id}")),
        language_hint: Some("en".to_string()),
        referral_code: referral_code.map(str::to_string),
    }
}

/// Memory store whose save number `fail_on` (1-based) reports a disk fault.
struct FaultyStore {
    inner: Arc<dyn LedgerStore>,
    saves: AtomicUsize,
    fail_on: usize,
}

#[async_trait]
impl LedgerStore for FaultyStore {
    async fn load(&self) -> Result<RootStore, LedgerError> {
        self.inner.load().await
    }

    async fn save(&self, store: &RootStore) -> Result<(), LedgerError> {
        let attempt = self.saves.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt == self.fail_on {
            return Err(LedgerError::Persistence {
                message: "disk full".to_string(),
            });
        }
        self.inner.save(store).await
    }
}

fn first_contact(language: Option<&str>, country: Option<&str>) -> EngagementEvent {
    EngagementEvent::FirstContact {
        language: language.map(str::to_string),
        country: country.map(str::to_string),
    }
}

#[tokio::test]
async fn referral_scenario_end_to_end() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store = store::json_file(dir.path().join("users.json"), 10_000);
    let ledger = ledger_with(store.clone(), LedgerPolicy::default());

    let first = ledger.register(request("100", None)).await.context("register 100")?;
    assert_eq!(first.user.tokens, 5_000);
    assert_eq!(first.user.referral_code, "REF100");
    assert_eq!(first.spots_left, 9_999);
    assert_eq!(first.referral, ReferralLinkStatus::NotRequested);

    let second = ledger
        .register(request("200", Some("REF100")))
        .await
        .context("register 200")?;
    assert_eq!(
        second.referral,
        ReferralLinkStatus::Linked {
            referrer_id: "100".to_string()
        }
    );
    assert_eq!(second.user.tokens, 5_000);
    assert_eq!(second.user.referred_by.as_deref(), Some("100"));

    let referrer = ledger.user("100").await?.ok_or_else(|| anyhow!("missing 100"))?;
    assert_eq!(referrer.tokens, 6_000);
    assert_eq!(referrer.referrals, vec!["200".to_string()]);

    let before = store.load().await?;
    let deleted = ledger.delete_user("100").await.context("delete 100")?;
    assert_eq!(deleted.orphaned, vec!["200".to_string()]);
    assert_eq!(deleted.referrer_id, None);

    let after = store.load().await?;
    assert_eq!(after.used_spots, before.used_spots - 1);
    assert!(!after.referral_codes.contains_key("REF100"));
    let orphan = after.users.get("200").ok_or_else(|| anyhow!("missing 200"))?;
    assert_eq!(orphan.referred_by, None);
    Ok(())
}

#[tokio::test]
async fn capacity_is_never_exceeded() -> Result<()> {
    let (store, ledger) = memory_ledger(2);
    ledger.register(request("1", None)).await?;
    ledger.register(request("2", None)).await?;

    let error = match ledger.register(request("3", None)).await {
        Ok(_) => return Err(anyhow!("expected capacity exceeded")),
        Err(error) => error,
    };
    assert!(matches!(error, LedgerError::CapacityExceeded { total_spots: 2 }));

    let state = store.load().await?;
    assert_eq!(state.used_spots, 2);
    assert!(!state.users.contains_key("3"));
    assert_eq!(ledger.spots_left().await?, 0);

    ledger.delete_user("1").await?;
    ledger.register(request("3", None)).await?;
    assert_eq!(ledger.spots_left().await?, 0);
    Ok(())
}

#[tokio::test]
async fn concurrent_registrations_respect_capacity() -> Result<()> {
    let (store, ledger) = memory_ledger(5);
    let ledger = Arc::new(ledger);

    let mut handles = Vec::new();
    for id in 1..=20 {
        let ledger = ledger.clone();
        handles.push(tokio::spawn(async move {
            ledger.register(request(&id.to_string(), None)).await
        }));
    }

    let mut admitted = 0;
    let mut rejected = 0;
    for handle in handles {
        match handle.await? {
            Ok(_) => admitted += 1,
            Err(LedgerError::CapacityExceeded { .. }) => rejected += 1,
            Err(other) => return Err(anyhow!("unexpected error: {other}")),
        }
    }
    assert_eq!(admitted, 5);
    assert_eq!(rejected, 15);

    let state = store.load().await?;
    assert_eq!(state.used_spots, 5);
    assert_eq!(state.users.len(), 5);
    Ok(())
}

#[tokio::test]
async fn duplicate_registration_leaves_state_unchanged() -> Result<()> {
    let (store, ledger) = memory_ledger(10);
    ledger.register(request("7", None)).await?;
    let before = store.load().await?;

    let result = ledger.register(request("7", None)).await;
    assert!(matches!(result, Err(LedgerError::AlreadyRegistered { .. })));
    assert_eq!(store.load().await?, before);
    Ok(())
}

#[tokio::test]
async fn referral_bonus_is_credited_once() -> Result<()> {
    let (_store, ledger) = memory_ledger(10);
    ledger.register(request("1", None)).await?;
    ledger.register(request("2", None)).await?;

    let linked = ledger.link_referral("2", "REF1").await?;
    assert_eq!(linked.referrer_id, "1");
    assert_eq!(linked.referrer_tokens, 6_000);

    let again = ledger.link_referral("2", "REF1").await;
    assert!(matches!(again, Err(LedgerError::AlreadyReferred { .. })));

    let summary = ledger
        .user_summary("1")
        .await?
        .ok_or_else(|| anyhow!("missing summary"))?;
    assert_eq!(summary.tokens, 6_000);
    assert_eq!(summary.referrals_count, 1);
    assert_eq!(summary.referral_earnings, 1_000);
    Ok(())
}

#[tokio::test]
async fn register_with_referral_twice_does_not_double_credit() -> Result<()> {
    let (_store, ledger) = memory_ledger(10);
    ledger.register(request("1", None)).await?;
    ledger.register(request("2", Some("REF1"))).await?;

    let repeat = ledger.register(request("2", Some("REF1"))).await;
    assert!(matches!(repeat, Err(LedgerError::AlreadyRegistered { .. })));

    let referrer = ledger.user("1").await?.ok_or_else(|| anyhow!("missing 1"))?;
    assert_eq!(referrer.tokens, 6_000);
    Ok(())
}

#[tokio::test]
async fn self_referral_is_rejected_without_balance_change() -> Result<()> {
    let (_store, ledger) = memory_ledger(10);
    let result = ledger.register(request("5", Some("REF5"))).await?;
    match result.referral {
        ReferralLinkStatus::Rejected { code, .. } => assert_eq!(code, "self_referral"),
        other => return Err(anyhow!("expected rejection, got {other:?}")),
    }
    assert_eq!(result.user.tokens, 5_000);
    assert_eq!(result.user.referred_by, None);

    let direct = ledger.link_referral("5", "REF5").await;
    assert!(matches!(direct, Err(LedgerError::SelfReferral { .. })));
    Ok(())
}

#[tokio::test]
async fn unknown_code_keeps_registration() -> Result<()> {
    let (store, ledger) = memory_ledger(10);
    let result = ledger.register(request("8", Some("REF999"))).await?;
    match result.referral {
        ReferralLinkStatus::Rejected { code, .. } => assert_eq!(code, "unknown_code"),
        other => return Err(anyhow!("expected rejection, got {other:?}")),
    }
    assert_eq!(store.load().await?.used_spots, 1);

    let linked = ledger.link_referral("8", "REF999").await;
    assert!(matches!(linked, Err(LedgerError::UnknownCode { .. })));
    Ok(())
}

#[tokio::test]
async fn deleting_referred_user_reverses_one_bonus() -> Result<()> {
    let (store, ledger) = memory_ledger(10);
    ledger.register(request("1", None)).await?;
    ledger.register(request("2", Some("REF1"))).await?;
    ledger.register(request("3", Some("REF1"))).await?;
    assert_eq!(
        ledger.user("1").await?.map(|user| user.tokens),
        Some(7_000)
    );

    let deleted = ledger.delete_user("2").await?;
    assert_eq!(deleted.referrer_id.as_deref(), Some("1"));
    assert_eq!(deleted.reversed_bonus, 1_000);

    let referrer = ledger.user("1").await?.ok_or_else(|| anyhow!("missing 1"))?;
    assert_eq!(referrer.tokens, 6_000);
    assert_eq!(referrer.referrals, vec!["3".to_string()]);

    let missing = ledger.delete_user("2").await;
    assert!(matches!(missing, Err(LedgerError::NotFound { .. })));
    assert_eq!(store.load().await?.used_spots, 2);
    Ok(())
}

#[tokio::test]
async fn bonus_reversal_policy_controls_negative_balances() -> Result<()> {
    for (reversal, expected_tokens, expected_reversed) in [
        (BonusReversal::AllowNegative, -800, 1_000),
        (BonusReversal::FloorAtZero, 0, 200),
    ] {
        let store = store::memory(10);
        let ledger = ledger_with(
            store.clone(),
            LedgerPolicy {
                total_spots: 10,
                initial_tokens: 0,
                referral_bonus: 1_000,
                bonus_reversal: reversal,
            },
        );
        ledger.register(request("1", None)).await?;
        ledger.register(request("2", Some("REF1"))).await?;
        assert_eq!(ledger.user("1").await?.map(|user| user.tokens), Some(1_000));

        // Tokens spent outside the ledger.
        let mut state = store.load().await?;
        if let Some(referrer) = state.users.get_mut("1") {
            referrer.tokens = 200;
        }
        store.save(&state).await?;

        let deleted = ledger.delete_user("2").await?;
        assert_eq!(deleted.reversed_bonus, expected_reversed, "{}", reversal.as_str());
        let referrer = ledger.user("1").await?.ok_or_else(|| anyhow!("missing 1"))?;
        assert_eq!(referrer.tokens, expected_tokens, "{}", reversal.as_str());
        assert!(referrer.referrals.is_empty());
    }
    Ok(())
}

#[tokio::test]
async fn deletion_unwinds_statistics_membership() -> Result<()> {
    let (store, ledger) = memory_ledger(10);
    ledger
        .register(RegisterRequest {
            user_id: "1".to_string(),
            username: None,
            language_hint: Some("uk".to_string()),
            referral_code: None,
        })
        .await?;
    ledger.record_event("1", first_contact(Some("uk"), Some("ua"))).await?;
    ledger.record_event("1", EngagementEvent::Engaged).await?;

    let before = store.load().await?;
    assert_eq!(before.statistics.languages.get(&LanguageTag::Ua), Some(&1));

    ledger.delete_user("1").await?;
    let after = store.load().await?;
    assert!(!after.counted_users.contains("1"));
    assert!(!after.webapp_users.contains("1"));
    assert!(!after.statistics.languages.contains_key(&LanguageTag::Ua));
    assert_eq!(after.statistics.total_bot_users, 1);
    assert_eq!(after.used_spots, 0);
    Ok(())
}

#[tokio::test]
async fn conversion_is_zero_without_users_and_half_with_one_of_two() -> Result<()> {
    let (_store, ledger) = memory_ledger(10);
    let empty = ledger.compute_statistics().await?;
    assert!(empty.conversion.abs() < f64::EPSILON);
    assert_eq!(empty.spots_left, 10);

    ledger.record_event("1", first_contact(Some("en"), None)).await?;
    ledger.record_event("2", first_contact(Some("ru"), Some("de"))).await?;
    ledger.record_event("1", EngagementEvent::Engaged).await?;

    let stats = ledger.compute_statistics().await?;
    assert_eq!(stats.total_users, 2);
    assert_eq!(stats.webapp_opens, 1);
    assert!((stats.conversion - 50.0).abs() < f64::EPSILON);
    assert_eq!(stats.countries.get("unknown"), Some(&1));
    assert_eq!(stats.countries.get("DE"), Some(&1));
    assert_eq!(stats.languages.get(&LanguageTag::Ru), Some(&1));
    Ok(())
}

#[tokio::test]
async fn events_are_idempotent_per_user() -> Result<()> {
    let (_store, ledger) = memory_ledger(10);

    let engaged_early = ledger.record_event("1", EngagementEvent::Engaged).await?;
    assert_eq!(engaged_early, EventOutcome::Ignored);

    assert_eq!(
        ledger.record_event("1", first_contact(Some("en"), Some("us"))).await?,
        EventOutcome::Recorded
    );
    assert_eq!(
        ledger.record_event("1", first_contact(Some("ru"), Some("ru"))).await?,
        EventOutcome::Ignored
    );
    assert_eq!(
        ledger.record_event("1", EngagementEvent::Engaged).await?,
        EventOutcome::Recorded
    );
    assert_eq!(
        ledger.record_event("1", EngagementEvent::Engaged).await?,
        EventOutcome::Ignored
    );

    let stats = ledger.compute_statistics().await?;
    assert_eq!(stats.total_users, 1);
    assert_eq!(stats.webapp_opens, 1);
    assert_eq!(stats.languages.get(&LanguageTag::Ru), None);
    Ok(())
}

#[tokio::test]
async fn clear_statistics_keeps_users() -> Result<()> {
    let (store, ledger) = memory_ledger(10);
    ledger.register(request("1", None)).await?;
    ledger.record_event("1", first_contact(Some("en"), None)).await?;
    ledger.clear_statistics().await?;

    let state = store.load().await?;
    assert_eq!(state.statistics.total_bot_users, 0);
    assert!(state.counted_users.is_empty());
    assert_eq!(state.users.len(), 1);
    assert_eq!(
        ledger.record_event("1", first_contact(None, None)).await?,
        EventOutcome::Recorded
    );
    Ok(())
}

#[tokio::test]
async fn referral_report_ranks_referrers() -> Result<()> {
    let (_store, ledger) = memory_ledger(10);
    ledger.register(request("1", None)).await?;
    ledger.register(request("2", None)).await?;
    ledger.register(request("3", Some("REF1"))).await?;
    ledger.register(request("4", Some("REF1"))).await?;
    ledger.register(request("5", Some("REF2"))).await?;

    let report = ledger.referral_report(2).await?;
    assert_eq!(report.total_users, 5);
    assert_eq!(report.total_referrals, 3);
    assert_eq!(report.total_referrers, 2);
    assert!((report.average_referrals - 0.6).abs() < f64::EPSILON);
    assert_eq!(
        report.top_referrers,
        vec![("1".to_string(), 2), ("2".to_string(), 1)]
    );
    assert_eq!(report.referral_sources.get("1"), Some(&2));

    let link = ledger
        .referral_link("1", "https://t.me/bot?start=")
        .await?;
    assert_eq!(link.as_deref(), Some("https://t.me/bot?start=REF1"));
    assert_eq!(ledger.referral_link("99", "x").await?, None);
    Ok(())
}

#[tokio::test]
async fn registration_uses_resolved_language() -> Result<()> {
    let (_store, ledger) = memory_ledger(10);
    let result = ledger
        .register(RegisterRequest {
            user_id: "11".to_string(),
            username: None,
            language_hint: Some("uk-UA".to_string()),
            referral_code: Some("   ".to_string()),
        })
        .await?;
    assert_eq!(result.user.language, LanguageTag::Ua);
    assert_eq!(result.referral, ReferralLinkStatus::NotRequested);

    let invalid = ledger.register(request("abc", None)).await;
    assert!(matches!(invalid, Err(LedgerError::InvalidRequest(_))));
    Ok(())
}

#[tokio::test]
async fn corrupt_store_surfaces_instead_of_resetting() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("users.json");
    std::fs::write(&path, r#"{"users": {}}"#)?;
    let ledger = ledger_with(store::json_file(&path, 10), LedgerPolicy::default());

    let result = ledger.register(request("1", None)).await;
    assert!(matches!(result, Err(LedgerError::CorruptState { .. })));
    assert_eq!(std::fs::read_to_string(&path)?, r#"{"users": {}}"#);
    Ok(())
}

#[tokio::test]
async fn equivalent_integer_ids_are_one_user() -> Result<()> {
    let (store, ledger) = memory_ledger(10);
    let first = ledger.register(request("7", None)).await?;
    assert_eq!(first.user.referral_code, "REF7");

    for alias in ["07", "+7", " 7 "] {
        let result = ledger.register(request(alias, None)).await;
        assert!(
            matches!(result, Err(LedgerError::AlreadyRegistered { ref user_id }) if user_id == "7"),
            "{alias}"
        );
    }

    let state = store.load().await?;
    assert_eq!(state.used_spots, 1);
    assert_eq!(state.users.keys().collect::<Vec<_>>(), vec!["7"]);
    assert!(ledger.user("007").await?.is_some());
    Ok(())
}

#[tokio::test]
async fn storage_fault_while_linking_is_surfaced() -> Result<()> {
    let inner = store::memory(10);
    let faulty: Arc<dyn LedgerStore> = Arc::new(FaultyStore {
        inner: inner.clone(),
        saves: AtomicUsize::new(0),
        fail_on: 3,
    });
    let ledger = ledger_with(
        faulty,
        LedgerPolicy {
            total_spots: 10,
            ..LedgerPolicy::default()
        },
    );
    ledger.register(request("1", None)).await?;

    // Save 2 stores user 2, save 3 (the referral credit) fails.
    let result = ledger.register(request("2", Some("REF1"))).await;
    assert!(matches!(result, Err(LedgerError::Persistence { .. })));

    let state = inner.load().await?;
    let referred = state.users.get("2").ok_or_else(|| anyhow!("missing 2"))?;
    assert_eq!(referred.referred_by, None);
    let referrer = state.users.get("1").ok_or_else(|| anyhow!("missing 1"))?;
    assert_eq!(referrer.tokens, 5_000);
    assert!(referrer.referrals.is_empty());

    // The registration itself stuck; the referral can be retried directly.
    let linked = ledger.link_referral("2", "REF1").await?;
    assert_eq!(linked.referrer_tokens, 6_000);
    Ok(())
}

#[tokio::test]
async fn registration_result_reflects_saved_link() -> Result<()> {
    let (store, ledger) = memory_ledger(10);
    ledger.register(request("1", None)).await?;
    let result = ledger.register(request("2", Some("REF1"))).await?;

    let saved = store.load().await?;
    assert_eq!(saved.users.get("2"), Some(&result.user));
    assert_eq!(result.spots_left, saved.spots_left());
    Ok(())
}

#[tokio::test]
async fn configured_capacity_governs_existing_store() -> Result<()> {
    let store = store::memory(2);
    let policy = |total_spots| LedgerPolicy {
        total_spots,
        ..LedgerPolicy::default()
    };

    let grown = ledger_with(store.clone(), policy(3));
    for id in ["1", "2", "3"] {
        grown.register(request(id, None)).await?;
    }
    assert_eq!(store.load().await?.total_spots, 3);
    assert_eq!(grown.compute_statistics().await?.total_spots, 3);

    let shrunk = ledger_with(store.clone(), policy(1));
    assert_eq!(shrunk.spots_left().await?, 0);
    let rejected = shrunk.register(request("4", None)).await;
    assert!(matches!(rejected, Err(LedgerError::CapacityExceeded { .. })));

    // Shrinking below usage keeps every registered user.
    shrunk.delete_user("3").await?;
    assert_eq!(store.load().await?.users.len(), 2);
    assert_eq!(shrunk.spots_left().await?, 0);
    Ok(())
}

#[tokio::test]
async fn deleted_user_can_return_with_new_language() -> Result<()> {
    let (_store, ledger) = memory_ledger(10);
    let mut first = request("9", None);
    first.language_hint = Some("ru".to_string());
    assert_eq!(ledger.register(first).await?.user.language, LanguageTag::Ru);

    ledger.delete_user("9").await?;

    let mut second = request("9", None);
    second.language_hint = Some("uk".to_string());
    assert_eq!(ledger.register(second).await?.user.language, LanguageTag::Ua);
    Ok(())
}

#[tokio::test]
async fn link_checks_run_in_order() -> Result<()> {
    let (_store, ledger) = memory_ledger(10);
    ledger.register(request("1", None)).await?;
    ledger.register(request("2", Some("REF1"))).await?;

    // An unknown code wins over a missing user.
    let unknown = ledger.link_referral("99", "REF404").await;
    assert!(matches!(unknown, Err(LedgerError::UnknownCode { .. })));

    let missing = ledger.link_referral("99", "REF1").await;
    assert!(matches!(missing, Err(LedgerError::NotFound { ref user_id }) if user_id == "99"));

    // Self referral wins over already referred.
    let own = ledger.link_referral("2", "REF2").await;
    assert!(matches!(own, Err(LedgerError::SelfReferral { .. })));

    let repeat = ledger.link_referral("2", "REF1").await;
    assert!(matches!(repeat, Err(LedgerError::AlreadyReferred { .. })));

    let referrer = ledger.user("1").await?.ok_or_else(|| anyhow!("missing 1"))?;
    assert_eq!(referrer.tokens, 6_000);
    Ok(())
}
