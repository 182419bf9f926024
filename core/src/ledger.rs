//! The escrow ledger as seen by the channel engine.
//!
//! [`Ledger`] mirrors the escrow contract's methods one-to-one and carries no
//! decision logic. Implementations own transport, timeouts and retries; they
//! surface terminal failures as [`ChannelError::LedgerCallFailed`].
//!
//! [`ChannelError::LedgerCallFailed`]: crate::ChannelError::LedgerCallFailed

use serde::{Deserialize, Serialize};

use crate::amount::Cogs;
use crate::channel::{ChannelId, ChannelRecord};
use crate::identity::{Address, GroupId};
use crate::Result;

// Escrow contract methods, as named on-chain.
pub const BALANCE_OF: &str = "balanceOf";
pub const DEPOSIT: &str = "deposit";
pub const WITHDRAW: &str = "withdraw";
pub const OPEN_CHANNEL: &str = "openChannel";
pub const DEPOSIT_AND_OPEN_CHANNEL: &str = "depositAndOpenChannel";
pub const CHANNEL_ADD_FUNDS: &str = "channelAddFunds";
pub const CHANNEL_EXTEND: &str = "channelExtend";
pub const CHANNEL_EXTEND_AND_ADD_FUNDS: &str = "channelExtendAndAddFunds";
pub const CHANNEL_CLAIM_TIMEOUT: &str = "channelClaimTimeout";
pub const CHANNELS: &str = "channels";
pub const CHANNEL_OPEN_EVENTS: &str = "ChannelOpen";

// Token contract methods and chain reads.
pub const TOKEN_BALANCE_OF: &str = "token.balanceOf";
pub const TOKEN_ALLOWANCE: &str = "token.allowance";
pub const TOKEN_APPROVE: &str = "token.approve";
pub const BLOCK_NUMBER: &str = "blockNumber";

/// Receipt of a mined ledger transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    /// Transaction hash, `0x`-prefixed hex.
    pub tx_hash: String,
    /// Block the transaction was mined in, when known.
    pub block_number: Option<u64>,
}

/// Arguments of `openChannel` / `depositAndOpenChannel`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenChannelParams {
    pub sender: Address,
    pub recipient: Address,
    pub group_id: GroupId,
    pub amount: Cogs,
    pub expiration: u64,
}

/// A channel opened on-chain, with its ledger-assigned id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpenedChannel {
    pub channel_id: ChannelId,
    pub receipt: TxReceipt,
}

/// Filter over channel-open events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelFilter {
    pub sender: Address,
    pub recipient: Address,
    pub group_id: GroupId,
}

/// A decoded channel-open event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelOpenEvent {
    pub channel_id: ChannelId,
    pub nonce: u64,
    pub sender: Address,
    pub recipient: Address,
    pub group_id: GroupId,
    pub amount: Cogs,
    pub expiration: u64,
    pub block_number: u64,
}

/// Typed facade over the remote escrow contract and its payment token.
///
/// Mutating methods resolve only once the transaction is mined; a
/// transaction that is dropped or reverts is an error.
#[async_trait::async_trait]
pub trait Ledger: Send + Sync {
    /// Latest block number.
    async fn current_block(&self) -> Result<u64>;

    /// Block the escrow contract was deployed at; default start of event scans.
    fn deployment_block(&self) -> u64;

    /// Escrow balance of `owner` (`balanceOf`).
    async fn escrow_balance(&self, owner: &Address) -> Result<Cogs>;

    /// Payment token balance of `owner`.
    async fn token_balance(&self, owner: &Address) -> Result<Cogs>;

    /// Amount of `owner`'s tokens the escrow contract may pull.
    async fn token_allowance(&self, owner: &Address) -> Result<Cogs>;

    /// Allow the escrow contract to pull `amount` of the signer's tokens.
    async fn approve_token(&self, amount: &Cogs) -> Result<TxReceipt>;

    /// Move `amount` from the token balance into escrow.
    async fn deposit(&self, amount: &Cogs) -> Result<TxReceipt>;

    /// Move `amount` from escrow back to the token balance.
    async fn withdraw(&self, amount: &Cogs) -> Result<TxReceipt>;

    /// Open a channel funded from escrow; the id is read from the open event.
    async fn open_channel(&self, params: &OpenChannelParams) -> Result<OpenedChannel>;

    /// Deposit `params.amount` and open a channel with it, atomically.
    async fn deposit_and_open_channel(&self, params: &OpenChannelParams) -> Result<OpenedChannel>;

    async fn channel_add_funds(&self, channel_id: ChannelId, amount: &Cogs) -> Result<TxReceipt>;

    async fn channel_extend(&self, channel_id: ChannelId, new_expiration: u64) -> Result<TxReceipt>;

    async fn channel_extend_and_add_funds(
        &self,
        channel_id: ChannelId,
        new_expiration: u64,
        amount: &Cogs,
    ) -> Result<TxReceipt>;

    async fn channel_claim_timeout(&self, channel_id: ChannelId) -> Result<TxReceipt>;

    /// Current on-chain record of a channel (`channels(id)`), `None` if it
    /// was never opened.
    async fn channel(&self, channel_id: ChannelId) -> Result<Option<ChannelRecord>>;

    /// Channel-open events matching `filter` in `[from_block, latest]`.
    async fn channel_open_events(
        &self,
        filter: &ChannelFilter,
        from_block: u64,
    ) -> Result<Vec<ChannelOpenEvent>>;
}
