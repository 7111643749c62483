use std::fmt;

use thiserror::Error;

/// Keeper-wide error taxonomy.
///
/// The scheduler loop catches the first four kinds at the loop head and
/// continues after a cadence sleep; `Invariant` suspends the eigen.
#[derive(Debug, Error)]
pub enum KeeperError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("auth: {0}")]
    Auth(String),

    #[error("payment ({}): {message}", code.as_str())]
    Payment { code: PaymentCode, message: String },

    #[error("upstream: {0}")]
    Upstream(String),

    #[error("revert: {0}")]
    Revert(RevertReport),

    #[error("invariant violated: {0}")]
    Invariant(String),
}

impl KeeperError {
    pub fn validation(msg: impl Into<String>) -> Self {
        KeeperError::Validation(msg.into())
    }

    pub fn auth(msg: impl Into<String>) -> Self {
        KeeperError::Auth(msg.into())
    }

    pub fn payment(code: PaymentCode, msg: impl Into<String>) -> Self {
        KeeperError::Payment {
            code,
            message: msg.into(),
        }
    }

    pub fn upstream(msg: impl Into<String>) -> Self {
        KeeperError::Upstream(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        KeeperError::Invariant(msg.into())
    }

    /// Whether the scheduler may keep looping after this error.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, KeeperError::Invariant(_))
    }
}

pub type KeeperResult<T> = Result<T, KeeperError>;

// ── Payment failure codes ───────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentCode {
    VerificationFailed,
    AlreadyConsumed,
    AmountShort,
    WrongRecipient,
    WrongToken,
    WrongChain,
    NotFinal,
    Expired,
    BadProof,
}

impl PaymentCode {
    /// Stable machine-readable code surfaced in HTTP error bodies.
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentCode::VerificationFailed => "payment_verification_failed",
            PaymentCode::AlreadyConsumed => "payment_consumed",
            PaymentCode::AmountShort => "payment_amount_short",
            PaymentCode::WrongRecipient => "payment_wrong_recipient",
            PaymentCode::WrongToken => "payment_wrong_token",
            PaymentCode::WrongChain => "payment_wrong_chain",
            PaymentCode::NotFinal => "payment_not_final",
            PaymentCode::Expired => "payment_expired",
            PaymentCode::BadProof => "payment_bad_proof",
        }
    }
}

// ── On-chain revert reports ─────────────────────────────────────────

/// A decoded on-chain revert, recorded in the trade log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevertReport {
    pub error_name: String,
    pub args: Vec<String>,
    pub next_action: NextAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextAction {
    /// Skip this cycle, plan again at the next cadence tick.
    SkipCycle,
    /// Repeated identical reverts: the eigen gets suspended.
    Suspend,
}

impl fmt::Display for RevertReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.error_name, self.args.join(", "))
    }
}
