use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::language::LanguageTag;

pub const REFERRAL_CODE_PREFIX: &str = "REF";
pub const UNKNOWN_COUNTRY: &str = "unknown";

pub fn referral_code_for(user_id: &str) -> String {
    format!("{REFERRAL_CODE_PREFIX}{user_id}")
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub username: Option<String>,
    pub language: LanguageTag,
    pub tokens: i64,
    pub referral_code: String,
    pub referred_by: Option<String>,
    pub referrals: Vec<String>,
    pub join_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Statistics {
    pub total_bot_users: u64,
    pub webapp_opens: u64,
    pub languages: BTreeMap<LanguageTag, u64>,
    pub countries: BTreeMap<String, u64>,
}

/// The whole persisted document. Loaded and saved as one unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootStore {
    pub users: BTreeMap<String, UserRecord>,
    pub total_spots: u64,
    pub used_spots: u64,
    pub referral_codes: BTreeMap<String, String>,
    pub statistics: Statistics,
    pub counted_users: BTreeSet<String>,
    pub webapp_users: BTreeSet<String>,
}

impl RootStore {
    pub fn empty(total_spots: u64) -> Self {
        Self {
            users: BTreeMap::new(),
            total_spots,
            used_spots: 0,
            referral_codes: BTreeMap::new(),
            statistics: Statistics::default(),
            counted_users: BTreeSet::new(),
            webapp_users: BTreeSet::new(),
        }
    }

    pub fn spots_left(&self) -> u64 {
        self.total_spots.saturating_sub(self.used_spots)
    }

    /// Checks the cross-references between users, codes and capacity.
    pub fn validate(&self) -> Result<(), String> {
        if self.used_spots > self.total_spots {
            return Err(format!(
                "used_spots {} exceeds total_spots {}",
                self.used_spots, self.total_spots
            ));
        }

        for (code, owner_id) in &self.referral_codes {
            let Some(owner) = self.users.get(owner_id) else {
                return Err(format!(
                    "referral code {code} points to missing user {owner_id}"
                ));
            };
            if owner.referral_code != *code {
                return Err(format!(
                    "referral code {code} points to user {owner_id} who owns {}",
                    owner.referral_code
                ));
            }
        }

        for (user_id, user) in &self.users {
            if self.referral_codes.get(&user.referral_code) != Some(user_id) {
                return Err(format!(
                    "user {user_id} referral code {} is not indexed",
                    user.referral_code
                ));
            }
            if let Some(referrer_id) = user.referred_by.as_deref() {
                if !self.users.contains_key(referrer_id) {
                    return Err(format!(
                        "user {user_id} referred_by missing user {referrer_id}"
                    ));
                }
            }
            let mut seen = BTreeSet::new();
            for referral_id in &user.referrals {
                if !self.users.contains_key(referral_id) {
                    return Err(format!(
                        "user {user_id} lists missing referral {referral_id}"
                    ));
                }
                if !seen.insert(referral_id.as_str()) {
                    return Err(format!(
                        "user {user_id} lists referral {referral_id} twice"
                    ));
                }
            }
        }

        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct RegisterRequest {
    pub user_id: String,
    pub username: Option<String>,
    pub language_hint: Option<String>,
    pub referral_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ReferralLinkStatus {
    NotRequested,
    Linked { referrer_id: String },
    Rejected { code: &'static str, message: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RegistrationResult {
    pub user_id: String,
    pub user: UserRecord,
    pub spots_left: u64,
    pub referral: ReferralLinkStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkResult {
    pub user_id: String,
    pub referrer_id: String,
    pub referrer_tokens: i64,
    pub bonus: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeleteResult {
    pub user_id: String,
    pub referrer_id: Option<String>,
    pub reversed_bonus: i64,
    pub orphaned: Vec<String>,
    pub spots_left: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsView {
    pub total_users: u64,
    pub webapp_opens: u64,
    pub conversion: f64,
    pub languages: BTreeMap<LanguageTag, u64>,
    pub countries: BTreeMap<String, u64>,
    pub total_spots: u64,
    pub used_spots: u64,
    pub spots_left: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngagementEvent {
    FirstContact {
        language: Option<String>,
        country: Option<String>,
    },
    Engaged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventOutcome {
    Recorded,
    Ignored,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UserSummary {
    pub tokens: i64,
    pub referrals_count: usize,
    pub referral_earnings: i64,
    pub referral_code: String,
    pub username: Option<String>,
    pub language: LanguageTag,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReferralReport {
    pub total_users: usize,
    pub total_referrals: usize,
    pub total_referrers: usize,
    pub average_referrals: f64,
    pub top_referrers: Vec<(String, usize)>,
    pub referral_sources: BTreeMap<String, usize>,
}

pub(crate) fn round_two_decimals(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
