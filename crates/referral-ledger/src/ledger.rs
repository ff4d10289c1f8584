//! The referral ledger engine.
//!
//! Every operation runs inside one critical section that spans
//! load, mutate and save, so two registrations can never both observe
//! the last free spot.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::error::LedgerError;
use crate::language::LanguageResolver;
use crate::store::LedgerStore;
use crate::types::{
    DeleteResult, EngagementEvent, EventOutcome, LinkResult, ReferralLinkStatus, ReferralReport,
    RegisterRequest, RegistrationResult, RootStore, StatsView, UNKNOWN_COUNTRY, UserRecord,
    UserSummary, referral_code_for, round_two_decimals,
};

const LOG_TARGET: &str = "referral_ledger.ledger";

pub const DEFAULT_TOTAL_SPOTS: u64 = 10_000;
pub const DEFAULT_INITIAL_TOKENS: i64 = 5_000;
pub const DEFAULT_REFERRAL_BONUS: i64 = 1_000;

/// How a referral bonus is taken back when the referred user is deleted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BonusReversal {
    /// Subtract the full bonus even if the referrer ends up negative.
    #[default]
    AllowNegative,
    /// Subtract at most the referrer's remaining balance.
    FloorAtZero,
}

impl BonusReversal {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllowNegative => "allow_negative",
            Self::FloorAtZero => "floor_at_zero",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "allow_negative" => Some(Self::AllowNegative),
            "floor_at_zero" => Some(Self::FloorAtZero),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LedgerPolicy {
    pub total_spots: u64,
    pub initial_tokens: i64,
    pub referral_bonus: i64,
    pub bonus_reversal: BonusReversal,
}

impl Default for LedgerPolicy {
    fn default() -> Self {
        Self {
            total_spots: DEFAULT_TOTAL_SPOTS,
            initial_tokens: DEFAULT_INITIAL_TOKENS,
            referral_bonus: DEFAULT_REFERRAL_BONUS,
            bonus_reversal: BonusReversal::AllowNegative,
        }
    }
}

pub struct ReferralLedger {
    store: Arc<dyn LedgerStore>,
    languages: Arc<LanguageResolver>,
    policy: LedgerPolicy,
    gate: Mutex<()>,
}

impl ReferralLedger {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        languages: Arc<LanguageResolver>,
        policy: LedgerPolicy,
    ) -> Self {
        Self {
            store,
            languages,
            policy,
            gate: Mutex::new(()),
        }
    }

    pub fn policy(&self) -> &LedgerPolicy {
        &self.policy
    }

    pub fn languages(&self) -> &LanguageResolver {
        &self.languages
    }

    pub async fn register(
        &self,
        request: RegisterRequest,
    ) -> Result<RegistrationResult, LedgerError> {
        let user_id = normalize_user_id(&request.user_id)?;
        let referral_code = request
            .referral_code
            .as_deref()
            .map(str::trim)
            .filter(|code| !code.is_empty())
            .map(str::to_string);

        let _guard = self.gate.lock().await;

        let mut state = self.load_state().await?;
        if state.users.contains_key(&user_id) {
            return Err(LedgerError::AlreadyRegistered { user_id });
        }
        if state.used_spots >= state.total_spots {
            tracing::info!(
                target: LOG_TARGET,
                user_id = %user_id,
                total_spots = state.total_spots,
                "registration rejected: no spots left"
            );
            return Err(LedgerError::CapacityExceeded {
                total_spots: state.total_spots,
            });
        }

        let language = self
            .languages
            .language_for_user(&user_id, request.language_hint.as_deref());
        let code = referral_code_for(&user_id);
        let user = UserRecord {
            username: normalize_optional(request.username.as_deref()),
            language,
            tokens: self.policy.initial_tokens,
            referral_code: code.clone(),
            referred_by: None,
            referrals: Vec::new(),
            join_date: Utc::now(),
        };
        state.users.insert(user_id.clone(), user);
        state.referral_codes.insert(code, user_id.clone());
        state.used_spots += 1;
        self.store.save(&state).await?;

        tracing::info!(
            target: LOG_TARGET,
            user_id = %user_id,
            language = %language,
            spots_left = state.spots_left(),
            "user registered"
        );

        let referral = match referral_code {
            None => ReferralLinkStatus::NotRequested,
            Some(code) => {
                let mut linked = state.clone();
                match apply_link(&mut linked, &user_id, &code, self.policy.referral_bonus) {
                    Ok(link) => {
                        self.store.save(&linked).await?;
                        state = linked;
                        log_link(&link);
                        ReferralLinkStatus::Linked {
                            referrer_id: link.referrer_id,
                        }
                    }
                    Err(error) if error.is_rejection() => {
                        tracing::warn!(
                            target: LOG_TARGET,
                            user_id = %user_id,
                            referral_code = %code,
                            error = %error,
                            "referral rejected"
                        );
                        ReferralLinkStatus::Rejected {
                            code: error.code(),
                            message: error.to_string(),
                        }
                    }
                    Err(error) => return Err(error),
                }
            }
        };

        let user = state
            .users
            .get(&user_id)
            .cloned()
            .ok_or_else(|| LedgerError::corrupt(format!("registered user {user_id} vanished")))?;

        Ok(RegistrationResult {
            user_id,
            user,
            spots_left: state.spots_left(),
            referral,
        })
    }

    pub async fn link_referral(
        &self,
        user_id: &str,
        referral_code: &str,
    ) -> Result<LinkResult, LedgerError> {
        let user_id = normalize_user_id(user_id)?;
        let referral_code = referral_code.trim();
        let bonus = self.policy.referral_bonus;

        let _guard = self.gate.lock().await;
        let link = self
            .mutate(|state| apply_link(state, &user_id, referral_code, bonus))
            .await?;
        log_link(&link);
        Ok(link)
    }

    pub async fn delete_user(&self, user_id: &str) -> Result<DeleteResult, LedgerError> {
        let user_id = normalize_user_id(user_id)?;
        let bonus = self.policy.referral_bonus;
        let reversal = self.policy.bonus_reversal;

        let _guard = self.gate.lock().await;
        let result = self
            .mutate(|state| {
                let Some(user) = state.users.remove(&user_id) else {
                    return Err(LedgerError::NotFound {
                        user_id: user_id.clone(),
                    });
                };

                state.referral_codes.remove(&user.referral_code);

                let mut reversed_bonus = 0;
                if let Some(referrer_id) = user.referred_by.as_deref() {
                    if let Some(referrer) = state.users.get_mut(referrer_id) {
                        if let Some(position) =
                            referrer.referrals.iter().position(|id| *id == user_id)
                        {
                            referrer.referrals.remove(position);
                            reversed_bonus = match reversal {
                                BonusReversal::AllowNegative => bonus,
                                BonusReversal::FloorAtZero => bonus.min(referrer.tokens.max(0)),
                            };
                            referrer.tokens -= reversed_bonus;
                        }
                    }
                }

                let mut orphaned = Vec::new();
                for referral_id in &user.referrals {
                    if let Some(referral) = state.users.get_mut(referral_id) {
                        referral.referred_by = None;
                        orphaned.push(referral_id.clone());
                    }
                }

                state.counted_users.remove(&user_id);
                state.webapp_users.remove(&user_id);

                if let Some(count) = state.statistics.languages.get_mut(&user.language) {
                    if *count <= 1 {
                        state.statistics.languages.remove(&user.language);
                    } else {
                        *count -= 1;
                    }
                }

                state.used_spots = state.used_spots.saturating_sub(1);

                Ok(DeleteResult {
                    user_id: user_id.clone(),
                    referrer_id: user.referred_by.clone(),
                    reversed_bonus,
                    orphaned,
                    spots_left: state.spots_left(),
                })
            })
            .await?;
        self.languages.invalidate(&result.user_id);

        tracing::info!(
            target: LOG_TARGET,
            user_id = %result.user_id,
            orphaned = result.orphaned.len(),
            reversed_bonus = result.reversed_bonus,
            "user deleted"
        );
        Ok(result)
    }

    pub async fn compute_statistics(&self) -> Result<StatsView, LedgerError> {
        self.read(|state| {
            let stats = &state.statistics;
            let conversion = if stats.total_bot_users == 0 {
                0.0
            } else {
                round_two_decimals(
                    stats.webapp_opens as f64 / stats.total_bot_users as f64 * 100.0,
                )
            };
            StatsView {
                total_users: stats.total_bot_users,
                webapp_opens: stats.webapp_opens,
                conversion,
                languages: stats.languages.clone(),
                countries: stats.countries.clone(),
                total_spots: state.total_spots,
                used_spots: state.used_spots,
                spots_left: state.spots_left(),
            }
        })
        .await
    }

    pub async fn record_event(
        &self,
        user_id: &str,
        event: EngagementEvent,
    ) -> Result<EventOutcome, LedgerError> {
        let user_id = normalize_user_id(user_id)?;
        let _guard = self.gate.lock().await;

        let mut state = self.load_state().await?;
        let outcome = match event {
            EngagementEvent::FirstContact { language, country } => {
                if state.counted_users.contains(&user_id) {
                    EventOutcome::Ignored
                } else {
                    state.counted_users.insert(user_id.clone());
                    state.statistics.total_bot_users += 1;
                    if let Some(hint) = language.as_deref() {
                        let tag = self.languages.resolve(Some(hint));
                        *state.statistics.languages.entry(tag).or_insert(0) += 1;
                    }
                    let country = normalize_country(country.as_deref());
                    *state.statistics.countries.entry(country).or_insert(0) += 1;
                    EventOutcome::Recorded
                }
            }
            EngagementEvent::Engaged => {
                if state.counted_users.contains(&user_id)
                    && !state.webapp_users.contains(&user_id)
                {
                    state.webapp_users.insert(user_id.clone());
                    state.statistics.webapp_opens += 1;
                    EventOutcome::Recorded
                } else {
                    EventOutcome::Ignored
                }
            }
        };

        if outcome == EventOutcome::Recorded {
            self.store.save(&state).await?;
            tracing::info!(target: LOG_TARGET, user_id = %user_id, "statistics updated");
        }
        Ok(outcome)
    }

    pub async fn clear_statistics(&self) -> Result<(), LedgerError> {
        let _guard = self.gate.lock().await;
        self.mutate(|state| {
            state.statistics = Default::default();
            state.counted_users.clear();
            state.webapp_users.clear();
            Ok(())
        })
        .await?;
        tracing::info!(target: LOG_TARGET, "statistics cleared");
        Ok(())
    }

    pub async fn user(&self, user_id: &str) -> Result<Option<UserRecord>, LedgerError> {
        let user_id = normalize_user_id(user_id)?;
        self.read(|state| state.users.get(&user_id).cloned()).await
    }

    pub async fn user_summary(&self, user_id: &str) -> Result<Option<UserSummary>, LedgerError> {
        let bonus = self.policy.referral_bonus;
        Ok(self.user(user_id).await?.map(|user| {
            let referrals_count = user.referrals.len();
            UserSummary {
                tokens: user.tokens,
                referrals_count,
                referral_earnings: referrals_count as i64 * bonus,
                referral_code: user.referral_code,
                username: user.username,
                language: user.language,
            }
        }))
    }

    pub async fn spots_left(&self) -> Result<u64, LedgerError> {
        self.read(RootStore::spots_left).await
    }

    pub async fn referral_link(
        &self,
        user_id: &str,
        invite_link_base: &str,
    ) -> Result<Option<String>, LedgerError> {
        Ok(self
            .user(user_id)
            .await?
            .map(|user| format!("{invite_link_base}{}", user.referral_code)))
    }

    pub async fn referral_report(&self, top_n: usize) -> Result<ReferralReport, LedgerError> {
        self.read(|state| build_referral_report(state, top_n)).await
    }

    /// Loads the document with the configured capacity applied.
    ///
    /// Capacity never drops below `used_spots`; a shrunk ceiling only stops
    /// new registrations.
    async fn load_state(&self) -> Result<RootStore, LedgerError> {
        let mut state = self.store.load().await?;
        let configured = self.policy.total_spots;
        if state.total_spots != configured {
            let effective = configured.max(state.used_spots);
            if effective != configured {
                tracing::warn!(
                    target: LOG_TARGET,
                    configured,
                    used_spots = state.used_spots,
                    "configured capacity is below used spots"
                );
            }
            state.total_spots = effective;
        }
        Ok(state)
    }

    async fn read<T>(&self, view: impl FnOnce(&RootStore) -> T) -> Result<T, LedgerError> {
        let _guard = self.gate.lock().await;
        let state = self.load_state().await?;
        Ok(view(&state))
    }

    /// Load, apply `operation` to a working copy, and save once.
    ///
    /// The caller must hold `gate`. Nothing is written when `operation` fails.
    async fn mutate<T, F>(&self, operation: F) -> Result<T, LedgerError>
    where
        F: FnOnce(&mut RootStore) -> Result<T, LedgerError>,
    {
        let mut state = self.load_state().await?;
        let result = operation(&mut state)?;
        self.store.save(&state).await?;
        Ok(result)
    }
}

/// Credits `referral_code`'s owner for referring `user_id`.
///
/// Checks run in a fixed order: unknown code, missing user, self referral,
/// already referred.
fn apply_link(
    state: &mut RootStore,
    user_id: &str,
    referral_code: &str,
    bonus: i64,
) -> Result<LinkResult, LedgerError> {
    let Some(referrer_id) = state.referral_codes.get(referral_code).cloned() else {
        return Err(LedgerError::UnknownCode {
            code: referral_code.to_string(),
        });
    };
    let Some(user) = state.users.get(user_id) else {
        return Err(LedgerError::NotFound {
            user_id: user_id.to_string(),
        });
    };
    if referrer_id == user_id {
        return Err(LedgerError::SelfReferral {
            user_id: user_id.to_string(),
        });
    }
    if user.referred_by.is_some() {
        return Err(LedgerError::AlreadyReferred {
            user_id: user_id.to_string(),
        });
    }

    let referrer = state.users.get_mut(&referrer_id).ok_or_else(|| {
        LedgerError::corrupt(format!(
            "referral code {referral_code} points to missing user {referrer_id}"
        ))
    })?;
    if referrer.referrals.iter().any(|id| id == user_id) {
        return Err(LedgerError::AlreadyReferred {
            user_id: user_id.to_string(),
        });
    }
    referrer.referrals.push(user_id.to_string());
    referrer.tokens += bonus;
    let referrer_tokens = referrer.tokens;

    if let Some(user) = state.users.get_mut(user_id) {
        user.referred_by = Some(referrer_id.clone());
    }

    Ok(LinkResult {
        user_id: user_id.to_string(),
        referrer_id,
        referrer_tokens,
        bonus,
    })
}

fn log_link(link: &LinkResult) {
    tracing::info!(
        target: LOG_TARGET,
        user_id = %link.user_id,
        referrer_id = %link.referrer_id,
        bonus = link.bonus,
        "referral linked"
    );
}

fn build_referral_report(state: &RootStore, top_n: usize) -> ReferralReport {
    let total_users = state.users.len();
    let total_referrals: usize = state.users.values().map(|user| user.referrals.len()).sum();
    let total_referrers = state
        .users
        .values()
        .filter(|user| !user.referrals.is_empty())
        .count();
    let average_referrals = if total_users == 0 {
        0.0
    } else {
        round_two_decimals(total_referrals as f64 / total_users as f64)
    };

    let mut ranked: Vec<(String, usize)> = state
        .users
        .iter()
        .map(|(id, user)| (id.clone(), user.referrals.len()))
        .collect();
    ranked.sort_by(|left, right| right.1.cmp(&left.1).then_with(|| left.0.cmp(&right.0)));
    ranked.truncate(top_n);

    let mut referral_sources = BTreeMap::new();
    for referrer_id in state.users.values().filter_map(|user| user.referred_by.as_ref()) {
        *referral_sources.entry(referrer_id.clone()).or_insert(0) += 1;
    }

    ReferralReport {
        total_users,
        total_referrals,
        total_referrers,
        average_referrals,
        top_referrers: ranked,
        referral_sources,
    }
}

fn normalize_user_id(value: &str) -> Result<String, LedgerError> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(LedgerError::InvalidRequest(
            "user_id is required".to_string(),
        ));
    }
    trimmed.parse::<i64>().map(|id| id.to_string()).map_err(|_| {
        LedgerError::InvalidRequest(format!("user_id must be an integer, got {trimmed}"))
    })
}

fn normalize_optional(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn normalize_country(value: Option<&str>) -> String {
    normalize_optional(value).map_or_else(|| UNKNOWN_COUNTRY.to_string(), |c| c.to_uppercase())
}
