use thiserror::Error;

use crate::amount::Cogs;
use crate::channel::ChannelId;

/// Boxed cause of a failed ledger call.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Payment channel errors.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Amount is negative, fractional or otherwise not a whole number of cogs.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// Escrow or token balance cannot cover a required top-up.
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Cogs, available: Cogs },

    /// A read or transaction against the ledger failed.
    #[error("ledger call `{method}` failed: {source}")]
    LedgerCallFailed {
        method: &'static str,
        #[source]
        source: BoxError,
    },

    /// Informational: the requested expiration does not extend the channel.
    #[error("no extension needed: channel expires at {current}, requested {requested}")]
    NoExtensionNeeded { current: u64, requested: u64 },

    /// Local snapshot of the channel no longer matches the ledger.
    #[error("stale state for channel {0}")]
    StaleChannelState(ChannelId),

    #[error("no usable service offer: {0}")]
    NoUsableServiceOffer(String),

    /// Timeout claim attempted before the channel expired.
    #[error("channel {channel_id} expires at block {expiration}, current block is {current_block}")]
    ChannelNotExpired {
        channel_id: ChannelId,
        expiration: u64,
        current_block: u64,
    },

    #[error("identity error: {0}")]
    Identity(#[from] IdentityError),
}

impl ChannelError {
    /// Wrap the cause of a failed ledger `method` call.
    pub fn ledger(method: &'static str, source: impl Into<BoxError>) -> Self {
        Self::LedgerCallFailed {
            method,
            source: source.into(),
        }
    }

    /// Whether this is a signal rather than a genuine failure.
    pub fn is_informational(&self) -> bool {
        matches!(self, Self::NoExtensionNeeded { .. })
    }
}

/// Errors that might occur while parsing an `Address` or `GroupId`.
#[derive(Debug, Error, PartialEq)]
pub enum IdentityError {
    #[error("invalid hex: {0}")]
    Hex(#[from] hex::FromHexError),

    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("cannot parse identity from empty string")]
    EmptyIdentity,
}
