//! Channel selection: decide whether a pending call reuses, extends, funds
//! or opens a channel, issuing as few ledger transactions as possible.
//!
//! The decision is a pure function of the channel snapshots ([`plan`]); only
//! [`ChannelManagementStrategy::select_channel`] talks to the ledger.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};

use crate::amount::Cogs;
use crate::channel::PaymentChannel;
use crate::funding::Account;
use crate::ledger::OpenChannelParams;
use crate::offer::ServiceOffer;
use crate::{ChannelError, Result};

/// Tuning knobs of the selection strategy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    /// Extra blocks granted on top of the required expiration whenever a
    /// channel is opened or extended.
    pub block_offset: u64,
    /// Number of calls a channel is funded for at a time.
    pub call_allowance: u64,
    /// Re-read a channel and fail with `StaleChannelState` if it diverged
    /// before mutating it.
    pub revalidate_before_mutation: bool,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            block_offset: 0,
            call_allowance: 1,
            revalidate_before_mutation: false,
        }
    }
}

/// What a pending call needs from a channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRequirements {
    /// Unspent funds the channel must hold.
    pub funds: Cogs,
    /// Minimum channel expiration.
    pub expiration: u64,
    /// Expiration used when opening or extending.
    pub target_expiration: u64,
}

/// How a channel measures up against [`CallRequirements`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelFitness {
    Reusable,
    NeedsExtension,
    NeedsFunding { shortfall: Cogs },
    NeedsBoth { shortfall: Cogs },
}

/// The action selected for a pending call; indices point into the channel
/// list the plan was computed from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SelectionPlan {
    Open,
    Reuse(usize),
    Extend(usize),
    Fund { index: usize, amount: Cogs },
    ExtendAndFund { index: usize, amount: Cogs },
}

pub fn classify(channel: &PaymentChannel, req: &CallRequirements) -> ChannelFitness {
    let funded = channel.has_sufficient_funds(&req.funds);
    let valid = channel.is_valid(req.expiration);
    let shortfall = || req.funds.saturating_sub(&channel.available());
    match (funded, valid) {
        (true, true) => ChannelFitness::Reusable,
        (true, false) => ChannelFitness::NeedsExtension,
        (false, true) => ChannelFitness::NeedsFunding {
            shortfall: shortfall(),
        },
        (false, false) => ChannelFitness::NeedsBoth {
            shortfall: shortfall(),
        },
    }
}

/// Pick the action for a pending call.
///
/// First match wins, scanning channels in order (oldest first): a channel
/// usable as is, then one that only needs a later expiration, then one that
/// only needs funds. Failing all three, the first channel gets both fixed in
/// one combined transaction. With no channels at all, a new one is opened.
pub fn plan(channels: &[PaymentChannel], req: &CallRequirements) -> SelectionPlan {
    if channels.is_empty() {
        return SelectionPlan::Open;
    }

    let fitness: Vec<ChannelFitness> = channels.iter().map(|c| classify(c, req)).collect();

    if let Some(index) = fitness.iter().position(|f| *f == ChannelFitness::Reusable) {
        return SelectionPlan::Reuse(index);
    }
    if let Some(index) = fitness
        .iter()
        .position(|f| *f == ChannelFitness::NeedsExtension)
    {
        return SelectionPlan::Extend(index);
    }
    let needs_funding = fitness.iter().enumerate().find_map(|(index, f)| match f {
        ChannelFitness::NeedsFunding { shortfall } => Some((index, shortfall.clone())),
        _ => None,
    });
    if let Some((index, amount)) = needs_funding {
        return SelectionPlan::Fund { index, amount };
    }

    SelectionPlan::ExtendAndFund {
        index: 0,
        amount: req.funds.saturating_sub(&channels[0].available()),
    }
}

/// Selects or prepares a channel able to pay for one call to a service.
#[derive(Debug, Clone, Default)]
pub struct ChannelManagementStrategy {
    config: StrategyConfig,
}

impl ChannelManagementStrategy {
    pub fn new(config: StrategyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &StrategyConfig {
        &self.config
    }

    /// Requirements of a call to `offer` made at `current_block`.
    pub fn requirements(&self, offer: &ServiceOffer, current_block: u64) -> CallRequirements {
        let expiration = current_block.saturating_add(offer.expiration_threshold);
        CallRequirements {
            funds: offer.price_per_call.scale(self.config.call_allowance.max(1)),
            expiration,
            target_expiration: expiration.saturating_add(self.config.block_offset),
        }
    }

    /// Return a channel from `known` (or a newly opened one, appended to
    /// `known`) that has enough funds and validity for one call to `offer`.
    ///
    /// `known` must hold this sender's channels for the offer's recipient and
    /// group, oldest first, freshly synced with the ledger. At most one
    /// channel transaction is issued (plus an escrow deposit when funding
    /// requires one). Errors abort the selection as they occur.
    #[instrument(skip_all, fields(account = %account.address(), channels = known.len()))]
    pub async fn select_channel<'a>(
        &self,
        account: &Account,
        offer: &ServiceOffer,
        known: &'a mut Vec<PaymentChannel>,
    ) -> Result<&'a mut PaymentChannel> {
        let (recipient, group_id) = offer.target()?;
        let current_block = account.ledger().current_block().await?;
        let req = self.requirements(offer, current_block);
        let plan = plan(known, &req);
        debug!(?plan, ?req, current_block, "Selection planned");

        let index = match plan {
            SelectionPlan::Open => {
                let params = OpenChannelParams {
                    sender: *account.address(),
                    recipient,
                    group_id,
                    amount: req.funds.clone(),
                    expiration: req.target_expiration,
                };
                let channel = self.open_channel(account, &params).await?;
                known.push(channel);
                known.len() - 1
            }
            SelectionPlan::Reuse(index) => {
                debug!(channel_id = %known[index].id(), "Reusing channel");
                index
            }
            SelectionPlan::Extend(index) => {
                let channel = &mut known[index];
                self.revalidate(channel).await?;
                info!(channel_id = %channel.id(), to = req.target_expiration, "Extending channel");
                channel.extend_expiration(req.target_expiration).await?;
                index
            }
            SelectionPlan::Fund { index, amount } => {
                let channel = &mut known[index];
                self.revalidate(channel).await?;
                info!(channel_id = %channel.id(), %amount, "Funding channel");
                channel.add_funds(account, &amount).await?;
                index
            }
            SelectionPlan::ExtendAndFund { index, amount } => {
                let channel = &mut known[index];
                self.revalidate(channel).await?;
                info!(
                    channel_id = %channel.id(),
                    to = req.target_expiration,
                    %amount,
                    "Extending and funding channel"
                );
                channel
                    .extend_and_add_funds(account, req.target_expiration, &amount)
                    .await?;
                index
            }
        };

        let channel = &mut known[index];
        if !channel.has_sufficient_funds(&req.funds) || !channel.is_valid(req.expiration) {
            return Err(ChannelError::StaleChannelState(channel.id()));
        }
        Ok(channel)
    }

    /// Open a channel funded from escrow, or from the token balance in one
    /// combined transaction when escrow cannot cover it.
    async fn open_channel(
        &self,
        account: &Account,
        params: &OpenChannelParams,
    ) -> Result<PaymentChannel> {
        let ledger = account.ledger();
        let escrow = account.escrow_balance().await?;

        let opened = if escrow >= params.amount {
            info!(amount = %params.amount, expiration = params.expiration, "Opening channel");
            ledger.open_channel(params).await?
        } else {
            info!(
                amount = %params.amount,
                %escrow,
                expiration = params.expiration,
                "Escrow short, depositing and opening channel"
            );
            account.prepare_token_transfer(&params.amount).await?;
            ledger.deposit_and_open_channel(params).await?
        };
        info!(channel_id = %opened.channel_id, tx_hash = %opened.receipt.tx_hash, "Channel opened");

        PaymentChannel::load(ledger.clone(), opened.channel_id).await
    }

    async fn revalidate(&self, channel: &PaymentChannel) -> Result<()> {
        if self.config.revalidate_before_mutation {
            channel.verify_unchanged().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::channel::{ChannelId, ChannelRecord};
    use crate::identity::{Address, GroupId};
    use crate::mock::MockLedger;

    fn channel(ledger: &Arc<MockLedger>, value: u64, spent: u64, expiration: u64) -> PaymentChannel {
        let mut ch = PaymentChannel::new(
            ledger.clone(),
            ChannelRecord {
                channel_id: ChannelId(0),
                sender: Address::new([0xaa; 20]),
                recipient: Address::new([0xbb; 20]),
                group_id: GroupId::new([1; 32]),
                value: Cogs::from_u64(value),
                nonce: 0,
                expiration,
            },
        );
        ch.record_spend(&Cogs::from_u64(spent)).unwrap();
        ch
    }

    fn req(funds: u64, expiration: u64) -> CallRequirements {
        CallRequirements {
            funds: Cogs::from_u64(funds),
            expiration,
            target_expiration: expiration,
        }
    }

    #[test]
    fn classification_covers_all_quadrants() {
        let ledger = Arc::new(MockLedger::new(Address::new([0xaa; 20])));
        let r = req(5, 150);
        assert_eq!(classify(&channel(&ledger, 10, 0, 200), &r), ChannelFitness::Reusable);
        assert_eq!(
            classify(&channel(&ledger, 10, 0, 100), &r),
            ChannelFitness::NeedsExtension
        );
        assert_eq!(
            classify(&channel(&ledger, 10, 8, 200), &r),
            ChannelFitness::NeedsFunding {
                shortfall: Cogs::from_u64(3)
            }
        );
        assert_eq!(
            classify(&channel(&ledger, 10, 8, 100), &r),
            ChannelFitness::NeedsBoth {
                shortfall: Cogs::from_u64(3)
            }
        );
    }

    #[test]
    fn plan_prefers_cheapest_fix() {
        let ledger = Arc::new(MockLedger::new(Address::new([0xaa; 20])));
        let r = req(5, 150);

        assert_eq!(plan(&[], &r), SelectionPlan::Open);

        let both = channel(&ledger, 0, 0, 0);
        let funding = channel(&ledger, 2, 0, 200);
        let extension = channel(&ledger, 9, 0, 10);
        let reusable = channel(&ledger, 5, 0, 150);

        let all = vec![both.clone(), funding.clone(), extension.clone(), reusable];
        assert_eq!(plan(&all, &r), SelectionPlan::Reuse(3));

        let no_reuse = vec![both.clone(), funding.clone(), extension];
        assert_eq!(plan(&no_reuse, &r), SelectionPlan::Extend(2));

        let only_funding = vec![both.clone(), funding];
        assert_eq!(
            plan(&only_funding, &r),
            SelectionPlan::Fund {
                index: 1,
                amount: Cogs::from_u64(3)
            }
        );

        let nothing_fits = vec![channel(&ledger, 10, 8, 100), both];
        assert_eq!(
            plan(&nothing_fits, &r),
            SelectionPlan::ExtendAndFund {
                index: 0,
                amount: Cogs::from_u64(3)
            }
        );
    }

    #[test]
    fn plan_is_deterministic_and_takes_first_match() {
        let ledger = Arc::new(MockLedger::new(Address::new([0xaa; 20])));
        let channels = vec![
            channel(&ledger, 10, 0, 100),
            channel(&ledger, 10, 0, 200),
            channel(&ledger, 10, 0, 300),
        ];
        let r = req(5, 150);
        assert_eq!(plan(&channels, &r), SelectionPlan::Reuse(1));
        assert_eq!(plan(&channels, &r), plan(&channels, &r));
    }

    #[test]
    fn requirements_apply_allowance_and_offset() {
        let offer = ServiceOffer::new(
            Address::new([0xbb; 20]),
            GroupId::new([1; 32]),
            Cogs::from_u64(5),
            100,
        );
        let strategy = ChannelManagementStrategy::default();
        assert_eq!(strategy.requirements(&offer, 50), req(5, 150));

        let strategy = ChannelManagementStrategy::new(StrategyConfig {
            block_offset: 240,
            call_allowance: 3,
            ..Default::default()
        });
        let r = strategy.requirements(&offer, 50);
        assert_eq!(r.funds, Cogs::from_u64(15));
        assert_eq!(r.expiration, 150);
        assert_eq!(r.target_expiration, 390);
    }

    #[test]
    fn config_defaults_fill_missing_fields() {
        let config: StrategyConfig = serde_json::from_str(r#"{"block_offset": 10}"#).unwrap();
        assert_eq!(config.block_offset, 10);
        assert_eq!(config.call_allowance, 1);
        assert!(!config.revalidate_before_mutation);
    }
}
