//! Payment channel lifecycle and selection over an on-chain escrow ledger.
//!
//! A payer opens channels to a service's payment address out of its escrow
//! balance and pays for calls off-chain against them. This crate decides,
//! for every pending call, whether an existing channel can be reused or has
//! to be funded, extended or opened, using as few ledger transactions as
//! possible.

/// Token amounts in cogs
pub mod amount;
/// Channel records and the channel handle with its predicates and mutators
pub mod channel;
pub mod error;
/// Escrow account and the deposit-just-enough funding policy
pub mod funding;
/// Addresses and channel-group identifiers
pub mod identity;
/// The escrow ledger port
pub mod ledger;
/// Per-key serialization of channel selection and channel discovery
pub mod manager;
pub mod mock;
/// Service offers as published by the registry
pub mod offer;
/// The channel selection strategy
pub mod strategy;

pub use amount::Cogs;
pub use channel::{ChannelId, ChannelRecord, PaymentChannel};
pub use error::{ChannelError, IdentityError};
pub use funding::{ensure_escrow_covers, Account};
pub use identity::{Address, GroupId};
pub use ledger::{Ledger, TxReceipt};
pub use manager::{ChannelKey, ChannelManager};
pub use offer::ServiceOffer;
pub use strategy::{ChannelManagementStrategy, StrategyConfig};

pub type Result<T> = std::result::Result<T, ChannelError>;
