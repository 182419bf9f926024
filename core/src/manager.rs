//! Per-service channel bookkeeping.
//!
//! Selecting a channel reads channel state and then conditionally mutates
//! it, so two selections for the same (sender, recipient, group) must never
//! interleave. [`ChannelManager`] serializes them with one async mutex per
//! key and keeps each key's channel list in sync with the ledger's
//! channel-open events.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use crate::amount::Cogs;
use crate::channel::{ChannelId, ChannelRecord, PaymentChannel};
use crate::funding::Account;
use crate::identity::{Address, GroupId};
use crate::ledger::ChannelFilter;
use crate::offer::ServiceOffer;
use crate::strategy::{ChannelManagementStrategy, StrategyConfig};
use crate::{ChannelError, Result};

/// Channels between one sender and one service group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelKey {
    pub sender: Address,
    pub recipient: Address,
    pub group_id: GroupId,
}

impl From<ChannelKey> for ChannelFilter {
    fn from(key: ChannelKey) -> Self {
        ChannelFilter {
            sender: key.sender,
            recipient: key.recipient,
            group_id: key.group_id,
        }
    }
}

#[derive(Default)]
struct ChannelSet {
    // Oldest first.
    channels: Vec<PaymentChannel>,
    last_read_block: Option<u64>,
}

/// Owns the known channels of one payer and serializes selections per key.
pub struct ChannelManager {
    account: Account,
    strategy: ChannelManagementStrategy,
    sets: Mutex<HashMap<ChannelKey, Arc<Mutex<ChannelSet>>>>,
}

impl ChannelManager {
    pub fn new(account: Account, config: StrategyConfig) -> Self {
        Self {
            account,
            strategy: ChannelManagementStrategy::new(config),
            sets: Mutex::new(HashMap::new()),
        }
    }

    pub fn account(&self) -> &Account {
        &self.account
    }

    pub fn key_for(&self, offer: &ServiceOffer) -> Result<ChannelKey> {
        let (recipient, group_id) = offer.target()?;
        Ok(ChannelKey {
            sender: *self.account.address(),
            recipient,
            group_id,
        })
    }

    async fn set_for(&self, key: ChannelKey) -> Arc<Mutex<ChannelSet>> {
        let mut sets = self.sets.lock().await;
        sets.entry(key).or_default().clone()
    }

    /// Refresh known channels and pick up channels opened since the last
    /// sync, returning the resulting records oldest first.
    pub async fn sync_channels(&self, offer: &ServiceOffer) -> Result<Vec<ChannelRecord>> {
        let key = self.key_for(offer)?;
        let set = self.set_for(key).await;
        let mut set = set.lock().await;
        self.sync(key, &mut set).await?;
        Ok(set.channels.iter().map(|c| c.record().clone()).collect())
    }

    /// Select (opening, funding or extending as needed) a channel usable for
    /// one call to `offer`.
    #[instrument(skip_all, fields(recipient = ?offer.payment_address, price = %offer.price_per_call))]
    pub async fn select_channel(&self, offer: &ServiceOffer) -> Result<PaymentChannel> {
        let key = self.key_for(offer)?;
        let set = self.set_for(key).await;
        let mut set = set.lock().await;

        self.sync(key, &mut set).await?;
        let channel = self
            .strategy
            .select_channel(&self.account, offer, &mut set.channels)
            .await?;
        info!(
            channel_id = %channel.id(),
            value = %channel.value(),
            expiration = channel.expiration(),
            "Channel selected"
        );
        Ok(channel.clone())
    }

    /// Account for `amount` authorized to the recipient over `channel_id`.
    pub async fn record_spend(
        &self,
        offer: &ServiceOffer,
        channel_id: ChannelId,
        amount: &Cogs,
    ) -> Result<()> {
        let key = self.key_for(offer)?;
        let set = self.set_for(key).await;
        let mut set = set.lock().await;
        let channel = set
            .channels
            .iter_mut()
            .find(|c| c.id() == channel_id)
            .ok_or(ChannelError::StaleChannelState(channel_id))?;
        channel.record_spend(amount)
    }

    /// Reclaim every expired channel that still holds value; returns the
    /// reclaimed channel ids.
    #[instrument(skip_all, fields(recipient = ?offer.payment_address))]
    pub async fn claim_expired(&self, offer: &ServiceOffer) -> Result<Vec<ChannelId>> {
        let key = self.key_for(offer)?;
        let set = self.set_for(key).await;
        let mut set = set.lock().await;
        self.sync(key, &mut set).await?;

        let current_block = self.account.ledger().current_block().await?;
        let mut claimed = Vec::new();
        for channel in set.channels.iter_mut() {
            if channel.is_expired(current_block) && !channel.value().is_zero() {
                channel.claim_timeout().await?;
                info!(channel_id = %channel.id(), "Reclaimed expired channel");
                claimed.push(channel.id());
            }
        }
        Ok(claimed)
    }

    async fn sync(&self, key: ChannelKey, set: &mut ChannelSet) -> Result<()> {
        let ledger = self.account.ledger();

        let mut index = 0;
        while index < set.channels.len() {
            match set.channels[index].refresh().await {
                Ok(()) => index += 1,
                Err(ChannelError::StaleChannelState(id)) => {
                    warn!(channel_id = %id, "Dropping channel no longer on-chain as known");
                    set.channels.remove(index);
                }
                Err(e) => return Err(e),
            }
        }

        let current_block = ledger.current_block().await?;
        let from_block = set
            .last_read_block
            .map_or_else(|| ledger.deployment_block(), |b| b + 1);
        if from_block > current_block {
            return Ok(());
        }

        let mut events = ledger
            .channel_open_events(&ChannelFilter::from(key), from_block)
            .await?;
        events.sort_by_key(|e| e.channel_id);
        debug!(from_block, count = events.len(), "Fetched channel-open events");

        for event in events {
            if set.channels.iter().any(|c| c.id() == event.channel_id) {
                continue;
            }
            match PaymentChannel::load(ledger.clone(), event.channel_id).await {
                Ok(channel) => set.channels.push(channel),
                Err(ChannelError::StaleChannelState(id)) => {
                    warn!(channel_id = %id, "Channel from open event not found on-chain");
                }
                Err(e) => return Err(e),
            }
        }
        set.channels.sort_by_key(|c| c.id());
        set.last_read_block = Some(current_block);
        Ok(())
    }
}
