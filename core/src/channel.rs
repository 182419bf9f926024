//! A single payment channel: its on-chain record, the predicates the
//! selection strategy evaluates, and the operations that mutate it.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::amount::Cogs;
use crate::funding::{ensure_escrow_covers, Account};
use crate::identity::{Address, GroupId};
use crate::ledger::{Ledger, TxReceipt};
use crate::{ChannelError, Result};

/// Ledger-assigned channel identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChannelId(pub u64);

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A channel as recorded by the escrow contract (`channels(id)`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelRecord {
    pub channel_id: ChannelId,
    /// Payer.
    pub sender: Address,
    /// Service payment address.
    pub recipient: Address,
    pub group_id: GroupId,
    /// Funds currently locked in the channel.
    pub value: Cogs,
    /// Bumped every time the recipient claims or the sender reclaims.
    pub nonce: u64,
    /// Block after which the sender may reclaim unused funds.
    pub expiration: u64,
}

/// Local handle to a payment channel.
///
/// The ledger is the source of truth: every mutation re-reads the record
/// once its transaction is mined. `amount_spent` is tracked on the caller
/// side (it is the cumulative amount authorized for the current nonce) and
/// is unknown to the ledger.
#[derive(Clone)]
pub struct PaymentChannel {
    ledger: Arc<dyn Ledger>,
    record: ChannelRecord,
    amount_spent: Cogs,
}

impl fmt::Debug for PaymentChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PaymentChannel")
            .field("record", &self.record)
            .field("amount_spent", &self.amount_spent)
            .finish()
    }
}

impl PaymentChannel {
    pub fn new(ledger: Arc<dyn Ledger>, record: ChannelRecord) -> Self {
        Self {
            ledger,
            record,
            amount_spent: Cogs::zero(),
        }
    }

    /// Read a channel's record from the ledger.
    pub async fn load(ledger: Arc<dyn Ledger>, channel_id: ChannelId) -> Result<Self> {
        let record = ledger
            .channel(channel_id)
            .await?
            .ok_or(ChannelError::StaleChannelState(channel_id))?;
        Ok(Self::new(ledger, record))
    }

    pub fn id(&self) -> ChannelId {
        self.record.channel_id
    }

    pub fn record(&self) -> &ChannelRecord {
        &self.record
    }

    pub fn value(&self) -> &Cogs {
        &self.record.value
    }

    pub fn nonce(&self) -> u64 {
        self.record.nonce
    }

    pub fn expiration(&self) -> u64 {
        self.record.expiration
    }

    pub fn amount_spent(&self) -> &Cogs {
        &self.amount_spent
    }

    /// Unspent funds: `value - amount_spent`.
    pub fn available(&self) -> Cogs {
        self.record.value.saturating_sub(&self.amount_spent)
    }

    /// Account for `amount` more authorized to the recipient.
    pub fn record_spend(&mut self, amount: &Cogs) -> Result<()> {
        let spent = &self.amount_spent + amount;
        if spent > self.record.value {
            return Err(ChannelError::InsufficientFunds {
                required: amount.clone(),
                available: self.available(),
            });
        }
        self.amount_spent = spent;
        Ok(())
    }

    pub fn has_sufficient_funds(&self, price: &Cogs) -> bool {
        self.available() >= *price
    }

    pub fn is_valid(&self, required_expiration: u64) -> bool {
        self.record.expiration >= required_expiration
    }

    /// Whether the sender may reclaim the channel at `current_block`.
    pub fn is_expired(&self, current_block: u64) -> bool {
        current_block >= self.record.expiration
    }

    /// Replace the local snapshot with the ledger's record.
    ///
    /// A nonce that moved forward means the recipient claimed (or the sender
    /// reclaimed) what was spent under the old nonce, so the local spend
    /// restarts from zero.
    #[instrument(skip(self), fields(channel_id = %self.record.channel_id))]
    pub async fn refresh(&mut self) -> Result<()> {
        let id = self.record.channel_id;
        let record = self
            .ledger
            .channel(id)
            .await?
            .ok_or(ChannelError::StaleChannelState(id))?;

        if record.sender != self.record.sender
            || record.recipient != self.record.recipient
            || record.group_id != self.record.group_id
        {
            warn!("Channel parties changed on-chain");
            return Err(ChannelError::StaleChannelState(id));
        }

        if record.nonce > self.record.nonce {
            debug!(
                old_nonce = self.record.nonce,
                new_nonce = record.nonce,
                "Nonce advanced, resetting local spend"
            );
            self.amount_spent = Cogs::zero();
        }
        debug!(value = %record.value, nonce = record.nonce, expiration = record.expiration, "Refreshed");
        self.record = record;
        Ok(())
    }

    /// Fail with `StaleChannelState` if the ledger record diverged from the
    /// local snapshot.
    pub async fn verify_unchanged(&self) -> Result<()> {
        let id = self.record.channel_id;
        match self.ledger.channel(id).await? {
            Some(record) if record == self.record => Ok(()),
            _ => Err(ChannelError::StaleChannelState(id)),
        }
    }

    /// Top up the channel by `amount`, depositing into escrow first if needed.
    #[instrument(skip(self, account), fields(channel_id = %self.record.channel_id))]
    pub async fn add_funds(&mut self, account: &Account, amount: &Cogs) -> Result<TxReceipt> {
        ensure_positive(amount)?;
        ensure_escrow_covers(account, amount).await?;

        info!("Sending channelAddFunds");
        let receipt = self
            .ledger
            .channel_add_funds(self.record.channel_id, amount)
            .await?;
        info!(tx_hash = %receipt.tx_hash, "channelAddFunds confirmed");

        self.refresh().await?;
        Ok(receipt)
    }

    /// Push the expiration out to `new_expiration`.
    ///
    /// Returns the informational `NoExtensionNeeded` without touching the
    /// ledger unless `new_expiration` is later than the current expiration.
    #[instrument(skip(self), fields(channel_id = %self.record.channel_id))]
    pub async fn extend_expiration(&mut self, new_expiration: u64) -> Result<TxReceipt> {
        if new_expiration <= self.record.expiration {
            return Err(ChannelError::NoExtensionNeeded {
                current: self.record.expiration,
                requested: new_expiration,
            });
        }

        info!("Sending channelExtend");
        let receipt = self
            .ledger
            .channel_extend(self.record.channel_id, new_expiration)
            .await?;
        info!(tx_hash = %receipt.tx_hash, "channelExtend confirmed");

        self.refresh().await?;
        Ok(receipt)
    }

    /// Extend and top up in one transaction.
    ///
    /// When `new_expiration` would not extend the channel this degrades to a
    /// plain top-up, still a single transaction.
    #[instrument(skip(self, account), fields(channel_id = %self.record.channel_id))]
    pub async fn extend_and_add_funds(
        &mut self,
        account: &Account,
        new_expiration: u64,
        amount: &Cogs,
    ) -> Result<TxReceipt> {
        if new_expiration <= self.record.expiration {
            debug!("Expiration already sufficient, only adding funds");
            return self.add_funds(account, amount).await;
        }
        ensure_positive(amount)?;
        ensure_escrow_covers(account, amount).await?;

        info!("Sending channelExtendAndAddFunds");
        let receipt = self
            .ledger
            .channel_extend_and_add_funds(self.record.channel_id, new_expiration, amount)
            .await?;
        info!(tx_hash = %receipt.tx_hash, "channelExtendAndAddFunds confirmed");

        self.refresh().await?;
        Ok(receipt)
    }

    /// Reclaim the channel's remaining value into escrow once it expired.
    #[instrument(skip(self), fields(channel_id = %self.record.channel_id))]
    pub async fn claim_timeout(&mut self) -> Result<TxReceipt> {
        let current_block = self.ledger.current_block().await?;
        if !self.is_expired(current_block) {
            return Err(ChannelError::ChannelNotExpired {
                channel_id: self.record.channel_id,
                expiration: self.record.expiration,
                current_block,
            });
        }

        info!("Sending channelClaimTimeout");
        let receipt = self
            .ledger
            .channel_claim_timeout(self.record.channel_id)
            .await?;
        info!(tx_hash = %receipt.tx_hash, "channelClaimTimeout confirmed");

        self.refresh().await?;
        Ok(receipt)
    }
}

fn ensure_positive(amount: &Cogs) -> Result<()> {
    if amount.is_zero() {
        Err(ChannelError::InvalidAmount("top-up must be positive".into()))
    } else {
        Ok(())
    }
}
