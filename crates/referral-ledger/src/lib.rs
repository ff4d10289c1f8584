//! Capacity-gated registration and referral ledger.
//!
//! [`ReferralLedger`] owns the business rules (spots, referral bonuses,
//! engagement statistics). A [`LedgerStore`] persists the whole state as a
//! single JSON document. [`LanguageResolver`] and [`TextCatalog`] are the
//! pieces a chat or web surface needs to talk to users in their language.

pub mod config;
pub mod error;
pub mod language;
pub mod ledger;
pub mod locale;
pub mod store;
pub mod types;

pub use config::{ConfigError, LedgerConfig};
pub use error::LedgerError;
pub use language::{LanguageResolver, LanguageTag};
pub use ledger::{BonusReversal, LedgerPolicy, ReferralLedger};
pub use locale::{LocaleError, MessageId, TextCatalog};
pub use store::LedgerStore;
pub use types::{
    DeleteResult, EngagementEvent, EventOutcome, LinkResult, ReferralLinkStatus, ReferralReport,
    RegisterRequest, RegistrationResult, RootStore, Statistics, StatsView, UserRecord,
    UserSummary,
};
