//! Localized message texts keyed by `(MessageId, LanguageTag)`.
//!
//! Each supported language is read from `<dir>/<lang>.json`. Missing files
//! and missing keys fall back to the built-in English texts, but a file that
//! exists and cannot be parsed is reported as an error.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{PoisonError, RwLock};
use std::time::{Duration, Instant};

use crate::language::LanguageTag;

const LOG_TARGET: &str = "referral_ledger.locale";

pub const DEFAULT_RELOAD_INTERVAL: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, thiserror::Error)]
pub enum LocaleError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageId {
    Welcome,
    SpotsTaken,
    Button,
    StatsTitle,
    TokensLabel,
    ReferralsLabel,
    EarningsLabel,
    SpotsLeftLabel,
    ReferralLinkLabel,
    CopyLinkButton,
    LinkCopied,
    HelpTitle,
    HelpStart,
    HelpStats,
    HelpHelp,
    HelpAdditional,
    HelpTokensInfo,
    NotRegistered,
    ErrorOccurred,
}

impl MessageId {
    pub const ALL: [MessageId; 19] = [
        MessageId::Welcome,
        MessageId::SpotsTaken,
        MessageId::Button,
        MessageId::StatsTitle,
        MessageId::TokensLabel,
        MessageId::ReferralsLabel,
        MessageId::EarningsLabel,
        MessageId::SpotsLeftLabel,
        MessageId::ReferralLinkLabel,
        MessageId::CopyLinkButton,
        MessageId::LinkCopied,
        MessageId::HelpTitle,
        MessageId::HelpStart,
        MessageId::HelpStats,
        MessageId::HelpHelp,
        MessageId::HelpAdditional,
        MessageId::HelpTokensInfo,
        MessageId::NotRegistered,
        MessageId::ErrorOccurred,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Welcome => "welcome",
            Self::SpotsTaken => "spots_taken",
            Self::Button => "button",
            Self::StatsTitle => "stats_title",
            Self::TokensLabel => "tokens_label",
            Self::ReferralsLabel => "referrals_label",
            Self::EarningsLabel => "earnings_label",
            Self::SpotsLeftLabel => "spots_left_label",
            Self::ReferralLinkLabel => "referral_link_label",
            Self::CopyLinkButton => "copy_link_button",
            Self::LinkCopied => "link_copied",
            Self::HelpTitle => "help_title",
            Self::HelpStart => "help_start",
            Self::HelpStats => "help_stats",
            Self::HelpHelp => "help_help",
            Self::HelpAdditional => "help_additional",
            Self::HelpTokensInfo => "help_tokens_info",
            Self::NotRegistered => "not_registered",
            Self::ErrorOccurred => "error_occurred",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        Self::ALL.into_iter().find(|id| id.as_str() == value)
    }

    fn fallback_text(self) -> &'static str {
        match self {
            Self::Welcome => "Welcome to DropHelper!",
            Self::SpotsTaken => "Unfortunately, all spots are taken.",
            Self::Button => "Open DropHelper",
            Self::StatsTitle => "Your Statistics",
            Self::TokensLabel => "Helper Tokens",
            Self::ReferralsLabel => "Friends Invited",
            Self::EarningsLabel => "Earned from Referrals",
            Self::SpotsLeftLabel => "Spots Left",
            Self::ReferralLinkLabel => "Your Referral Link",
            Self::CopyLinkButton => "Copy Link",
            Self::LinkCopied => "Link copied!",
            Self::HelpTitle => "Available Commands",
            Self::HelpStart => "Start using the bot",
            Self::HelpStats => "View your statistics",
            Self::HelpHelp => "Show this message",
            Self::HelpAdditional => "Additional Information",
            Self::HelpTokensInfo => "Get tokens and invite friends",
            Self::NotRegistered => "You are not registered yet. Use /start command",
            Self::ErrorOccurred => "An error occurred: {error}",
        }
    }
}

type Texts = HashMap<MessageId, String>;

fn fallback_texts() -> Texts {
    MessageId::ALL
        .into_iter()
        .map(|id| (id, id.fallback_text().to_string()))
        .collect()
}

struct LoadedTexts {
    by_language: HashMap<LanguageTag, Texts>,
    loaded_at: Instant,
}

pub struct TextCatalog {
    dir: Option<PathBuf>,
    reload_interval: Duration,
    default_language: LanguageTag,
    texts: RwLock<LoadedTexts>,
}

impl TextCatalog {
    pub fn load(dir: impl Into<PathBuf>, reload_interval: Duration) -> Result<Self, LocaleError> {
        let dir = dir.into();
        let by_language = load_dir(&dir)?;
        Ok(Self {
            dir: Some(dir),
            reload_interval,
            default_language: LanguageTag::default(),
            texts: RwLock::new(LoadedTexts {
                by_language,
                loaded_at: Instant::now(),
            }),
        })
    }

    /// Catalog backed only by the built-in English texts.
    pub fn fallback() -> Self {
        let by_language = LanguageTag::ALL
            .into_iter()
            .map(|lang| (lang, fallback_texts()))
            .collect();
        Self {
            dir: None,
            reload_interval: DEFAULT_RELOAD_INTERVAL,
            default_language: LanguageTag::default(),
            texts: RwLock::new(LoadedTexts {
                by_language,
                loaded_at: Instant::now(),
            }),
        }
    }

    pub fn text(&self, id: MessageId, lang: LanguageTag) -> String {
        let texts = self.texts.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(text) = texts.by_language.get(&lang).and_then(|t| t.get(&id)) {
            return text.clone();
        }
        tracing::warn!(
            target: LOG_TARGET,
            key = id.as_str(),
            language = %lang,
            "missing text, using default language"
        );
        texts
            .by_language
            .get(&self.default_language)
            .and_then(|t| t.get(&id))
            .cloned()
            .unwrap_or_else(|| id.fallback_text().to_string())
    }

    /// Replaces `{name}` placeholders; unknown placeholders are left as-is.
    pub fn format(&self, id: MessageId, lang: LanguageTag, args: &[(&str, &str)]) -> String {
        let mut text = self.text(id, lang);
        for (name, value) in args {
            text = text.replace(&format!("{{{name}}}"), value);
        }
        text
    }

    pub fn reload_if_stale(&self) -> Result<bool, LocaleError> {
        let Some(dir) = self.dir.as_ref() else {
            return Ok(false);
        };
        {
            let texts = self.texts.read().unwrap_or_else(PoisonError::into_inner);
            if texts.loaded_at.elapsed() < self.reload_interval {
                return Ok(false);
            }
        }
        self.reload_from(dir)?;
        Ok(true)
    }

    pub fn reload(&self) -> Result<(), LocaleError> {
        match self.dir.as_ref() {
            Some(dir) => self.reload_from(dir),
            None => Ok(()),
        }
    }

    fn reload_from(&self, dir: &Path) -> Result<(), LocaleError> {
        let by_language = load_dir(dir)?;
        let mut texts = self.texts.write().unwrap_or_else(PoisonError::into_inner);
        texts.by_language = by_language;
        texts.loaded_at = Instant::now();
        Ok(())
    }
}

fn load_dir(dir: &Path) -> Result<HashMap<LanguageTag, Texts>, LocaleError> {
    let mut by_language = HashMap::new();
    for lang in LanguageTag::ALL {
        let path = dir.join(format!("{}.json", lang.as_str()));
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => {
                tracing::warn!(
                    target: LOG_TARGET,
                    path = %path.display(),
                    "localization file not found, using fallback texts"
                );
                by_language.insert(lang, fallback_texts());
                continue;
            }
            Err(source) => return Err(LocaleError::Read { path, source }),
        };
        let loaded: HashMap<String, String> = serde_json::from_str(&raw)
            .map_err(|source| LocaleError::Parse {
                path: path.clone(),
                source,
            })?;

        let mut texts = Texts::new();
        for id in MessageId::ALL {
            match loaded.get(id.as_str()) {
                Some(text) => {
                    texts.insert(id, text.clone());
                }
                None => {
                    tracing::warn!(
                        target: LOG_TARGET,
                        key = id.as_str(),
                        language = %lang,
                        "missing localization key, using fallback"
                    );
                    texts.insert(id, id.fallback_text().to_string());
                }
            }
        }
        tracing::info!(target: LOG_TARGET, language = %lang, "loaded localization");
        by_language.insert(lang, texts);
    }
    Ok(by_language)
}
