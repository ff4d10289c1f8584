use std::env;
use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

use crate::ledger::{
    BonusReversal, DEFAULT_INITIAL_TOKENS, DEFAULT_REFERRAL_BONUS, DEFAULT_TOTAL_SPOTS,
    LedgerPolicy,
};

const DEFAULT_STORE_PATH: &str = "data/users.json";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_TEXTS_DIR: &str = "bot/texts";
const DEFAULT_TEXTS_RELOAD_SECONDS: u64 = 30 * 60;
const DEFAULT_INVITE_LINK_BASE: &str = "https://t.me/AI_DropHelper_bot?start=";

const ENV_STORE_PATH: &str = "REFERRAL_LEDGER_STORE_PATH";
const ENV_LOG_FILTER: &str = "REFERRAL_LEDGER_LOG_FILTER";
const ENV_TOTAL_SPOTS: &str = "REFERRAL_LEDGER_TOTAL_SPOTS";
const ENV_INITIAL_TOKENS: &str = "REFERRAL_LEDGER_INITIAL_TOKENS";
const ENV_REFERRAL_BONUS: &str = "REFERRAL_LEDGER_REFERRAL_BONUS";
const ENV_BONUS_REVERSAL: &str = "REFERRAL_LEDGER_BONUS_REVERSAL";
const ENV_TEXTS_DIR: &str = "REFERRAL_LEDGER_TEXTS_DIR";
const ENV_TEXTS_RELOAD_SECONDS: &str = "REFERRAL_LEDGER_TEXTS_RELOAD_SECONDS";
const ENV_INVITE_LINK_BASE: &str = "REFERRAL_LEDGER_INVITE_LINK_BASE";

#[derive(Debug, Clone)]
pub struct LedgerConfig {
    pub store_path: PathBuf,
    pub log_filter: String,
    pub total_spots: u64,
    pub initial_tokens: i64,
    pub referral_bonus: i64,
    pub bonus_reversal: BonusReversal,
    pub texts_dir: PathBuf,
    pub texts_reload_interval: Duration,
    pub invite_link_base: String,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid {name} value '{value}': {message}")]
    InvalidValue {
        name: &'static str,
        value: String,
        message: String,
    },
}

impl LedgerConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Builds the config from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let read = |name: &str| {
            lookup(name)
                .map(|value| value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let store_path = read(ENV_STORE_PATH)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_STORE_PATH));

        let log_filter = read(ENV_LOG_FILTER).unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let total_spots = parse_number(ENV_TOTAL_SPOTS, read(ENV_TOTAL_SPOTS))?
            .unwrap_or(DEFAULT_TOTAL_SPOTS);
        let initial_tokens = parse_number(ENV_INITIAL_TOKENS, read(ENV_INITIAL_TOKENS))?
            .unwrap_or(DEFAULT_INITIAL_TOKENS);
        if initial_tokens < 0 {
            return Err(ConfigError::InvalidValue {
                name: ENV_INITIAL_TOKENS,
                value: initial_tokens.to_string(),
                message: "must not be negative".to_string(),
            });
        }
        let referral_bonus = parse_number(ENV_REFERRAL_BONUS, read(ENV_REFERRAL_BONUS))?
            .unwrap_or(DEFAULT_REFERRAL_BONUS);
        if referral_bonus < 0 {
            return Err(ConfigError::InvalidValue {
                name: ENV_REFERRAL_BONUS,
                value: referral_bonus.to_string(),
                message: "must not be negative".to_string(),
            });
        }

        let bonus_reversal = match read(ENV_BONUS_REVERSAL) {
            None => BonusReversal::default(),
            Some(value) => {
                BonusReversal::parse(&value).ok_or_else(|| ConfigError::InvalidValue {
                    name: ENV_BONUS_REVERSAL,
                    value,
                    message: "expected allow_negative or floor_at_zero".to_string(),
                })?
            }
        };

        let texts_dir = read(ENV_TEXTS_DIR)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_TEXTS_DIR));

        let texts_reload_interval = Duration::from_secs(
            parse_number(ENV_TEXTS_RELOAD_SECONDS, read(ENV_TEXTS_RELOAD_SECONDS))?
                .unwrap_or(DEFAULT_TEXTS_RELOAD_SECONDS),
        );

        let invite_link_base =
            read(ENV_INVITE_LINK_BASE).unwrap_or_else(|| DEFAULT_INVITE_LINK_BASE.to_string());

        Ok(Self {
            store_path,
            log_filter,
            total_spots,
            initial_tokens,
            referral_bonus,
            bonus_reversal,
            texts_dir,
            texts_reload_interval,
            invite_link_base,
        })
    }

    pub fn for_tests(dir: &Path) -> Self {
        Self {
            store_path: dir.join("users.json"),
            log_filter: "debug".to_string(),
            total_spots: DEFAULT_TOTAL_SPOTS,
            initial_tokens: DEFAULT_INITIAL_TOKENS,
            referral_bonus: DEFAULT_REFERRAL_BONUS,
            bonus_reversal: BonusReversal::AllowNegative,
            texts_dir: dir.join("texts"),
            texts_reload_interval: Duration::from_secs(DEFAULT_TEXTS_RELOAD_SECONDS),
            invite_link_base: DEFAULT_INVITE_LINK_BASE.to_string(),
        }
    }

    pub fn policy(&self) -> LedgerPolicy {
        LedgerPolicy {
            total_spots: self.total_spots,
            initial_tokens: self.initial_tokens,
            referral_bonus: self.referral_bonus,
            bonus_reversal: self.bonus_reversal,
        }
    }
}

fn parse_number<T>(name: &'static str, value: Option<String>) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .map(|raw| {
            raw.parse::<T>().map_err(|error| ConfigError::InvalidValue {
                name,
                value: raw.clone(),
                message: error.to_string(),
            })
        })
        .transpose()
}
