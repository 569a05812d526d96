use ulid::Ulid;

#[derive(Debug)]
pub enum EngineError {
    /// Malformed or missing request fields — a caller bug, rejected
    /// before any business logic runs.
    InvalidInput(&'static str),
    /// The one error every token failure collapses into. Unknown,
    /// expired, revoked, used up, malformed: indistinguishable.
    InvalidToken,
    InThePast,
    BlockedHoliday,
    BlockedLunch,
    /// Double-booking detected. Advisory at listing time, authoritative
    /// inside the commit section. Retryable: re-list, re-submit.
    Conflict,
    NotFound(Ulid),
    AlreadyExists(Ulid),
    LimitExceeded(&'static str),
    WalError(String),
}

impl std::fmt::Display for EngineError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EngineError::InvalidInput(msg) => write!(f, "invalid input: {msg}"),
            EngineError::InvalidToken => write!(f, "booking link is invalid or expired"),
            EngineError::InThePast => write!(f, "requested time is in the past"),
            EngineError::BlockedHoliday => write!(f, "requested date is a bank holiday"),
            EngineError::BlockedLunch => write!(f, "requested time falls in the lunch block"),
            EngineError::Conflict => write!(f, "slot just taken, pick another"),
            EngineError::NotFound(id) => write!(f, "not found: {id}"),
            EngineError::AlreadyExists(id) => write!(f, "already exists: {id}"),
            EngineError::LimitExceeded(msg) => write!(f, "limit exceeded: {msg}"),
            EngineError::WalError(e) => write!(f, "WAL error: {e}"),
        }
    }
}

impl std::error::Error for EngineError {}
