#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("user {user_id} is already registered")]
    AlreadyRegistered { user_id: String },
    #[error("all {total_spots} spots are taken")]
    CapacityExceeded { total_spots: u64 },
    #[error("unknown referral code {code}")]
    UnknownCode { code: String },
    #[error("user {user_id} cannot use their own referral code")]
    SelfReferral { user_id: String },
    #[error("user {user_id} was already referred")]
    AlreadyReferred { user_id: String },
    #[error("user {user_id} not found")]
    NotFound { user_id: String },
    #[error("corrupt ledger state: {message}")]
    CorruptState { message: String },
    #[error("{message}")]
    Persistence { message: String },
}

impl LedgerError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidRequest(_) => "invalid_request",
            Self::AlreadyRegistered { .. } => "already_registered",
            Self::CapacityExceeded { .. } => "capacity_exceeded",
            Self::UnknownCode { .. } => "unknown_code",
            Self::SelfReferral { .. } => "self_referral",
            Self::AlreadyReferred { .. } => "already_referred",
            Self::NotFound { .. } => "not_found",
            Self::CorruptState { .. } => "corrupt_state",
            Self::Persistence { .. } => "persistence_error",
        }
    }

    /// Rejections the caller caused, as opposed to storage faults.
    pub fn is_rejection(&self) -> bool {
        !matches!(
            self,
            Self::CorruptState { .. } | Self::Persistence { .. }
        )
    }

    pub(crate) fn corrupt(message: impl Into<String>) -> Self {
        Self::CorruptState {
            message: message.into(),
        }
    }
}
