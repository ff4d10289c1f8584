//! Locale hint normalization and the per-user language cache.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};

/// One of the languages the bot ships texts for.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[serde(rename_all = "snake_case")]
pub enum LanguageTag {
    Ua,
    Ru,
    #[default]
    En,
}

impl LanguageTag {
    pub const ALL: [LanguageTag; 3] = [LanguageTag::Ua, LanguageTag::Ru, LanguageTag::En];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ua => "ua",
            Self::Ru => "ru",
            Self::En => "en",
        }
    }

    /// Strict lookup of a canonical tag (case-insensitive).
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ua" => Some(Self::Ua),
            "ru" => Some(Self::Ru),
            "en" => Some(Self::En),
            _ => None,
        }
    }
}

impl fmt::Display for LanguageTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn map_known_code(code: &str) -> Option<LanguageTag> {
    match code {
        "uk" | "ua" => Some(LanguageTag::Ua),
        "ru" => Some(LanguageTag::Ru),
        "en" | "en-us" | "en-gb" => Some(LanguageTag::En),
        _ => None,
    }
}

pub struct LanguageResolver {
    default_language: LanguageTag,
    user_languages: Mutex<HashMap<String, LanguageTag>>,
}

impl Default for LanguageResolver {
    fn default() -> Self {
        Self::new(LanguageTag::En)
    }
}

impl LanguageResolver {
    pub fn new(default_language: LanguageTag) -> Self {
        Self {
            default_language,
            user_languages: Mutex::new(HashMap::new()),
        }
    }

    pub fn default_language(&self) -> LanguageTag {
        self.default_language
    }

    pub fn supported_languages(&self) -> Vec<LanguageTag> {
        LanguageTag::ALL.to_vec()
    }

    /// Normalizes a client locale hint such as `uk`, `en-GB` or `en_US`.
    pub fn resolve(&self, hint: Option<&str>) -> LanguageTag {
        let Some(raw) = hint else {
            return self.default_language;
        };
        let normalized = raw.trim().to_ascii_lowercase().replace('_', "-");
        if normalized.is_empty() {
            return self.default_language;
        }
        if let Some(tag) = map_known_code(&normalized) {
            return tag;
        }
        let primary = normalized.split('-').next().unwrap_or_default();
        match map_known_code(primary) {
            Some(tag) => tag,
            None => {
                tracing::debug!(
                    target: "referral_ledger.language",
                    hint = raw,
                    fallback = %self.default_language,
                    "unsupported language hint"
                );
                self.default_language
            }
        }
    }

    /// First resolution for a user sticks until invalidated or overridden.
    pub fn language_for_user(&self, user_id: &str, hint: Option<&str>) -> LanguageTag {
        let mut cache = self
            .user_languages
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(cached) = cache.get(user_id) {
            return *cached;
        }
        let resolved = self.resolve(hint);
        cache.insert(user_id.to_string(), resolved);
        resolved
    }

    pub fn set_preference(&self, user_id: &str, language: &str) -> bool {
        let Some(tag) = LanguageTag::parse(language) else {
            tracing::warn!(
                target: "referral_ledger.language",
                user_id,
                language,
                "attempted to set unsupported language"
            );
            return false;
        };
        self.user_languages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(user_id.to_string(), tag);
        true
    }

    pub fn invalidate(&self, user_id: &str) {
        self.user_languages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(user_id);
    }

    pub fn clear(&self) {
        self.user_languages
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        tracing::info!(target: "referral_ledger.language", "language cache cleared");
    }
}
