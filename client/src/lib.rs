use std::sync::Arc;

pub use error::{ClientError, Result};
pub use ethereum::EthereumLedger;
use interface::{Balances, LedgerConfig, SelectedChannel};
use paychan_core::{
    Account, Address, ChannelId, ChannelManager, ChannelRecord, Cogs, Ledger, ServiceOffer,
    StrategyConfig, TxReceipt,
};

pub mod error;
pub mod ethereum;
pub mod interface;

/// Payer-side client: escrow account operations plus channel selection
/// for service offers.
pub struct PaychanClient {
    manager: ChannelManager,
}

impl PaychanClient {
    /// Connect to the escrow ledger described by `config`.
    pub async fn connect(config: &LedgerConfig) -> Result<Self> {
        let ledger = EthereumLedger::new(config).await?;
        let address = ledger.sender();
        Ok(Self::with_ledger(
            Arc::new(ledger),
            address,
            config.strategy.clone(),
        ))
    }

    /// Build a client over any ledger implementation.
    pub fn with_ledger(ledger: Arc<dyn Ledger>, address: Address, strategy: StrategyConfig) -> Self {
        let account = Account::new(ledger, address);
        Self {
            manager: ChannelManager::new(account, strategy),
        }
    }

    pub fn account(&self) -> &Account {
        self.manager.account()
    }

    pub async fn balances(&self) -> Result<Balances> {
        let account = self.account();
        Ok(Balances {
            account: *account.address(),
            escrow: account.escrow_balance().await?,
            token: account.token_balance().await?,
        })
    }

    pub async fn deposit(&self, amount: &Cogs) -> Result<TxReceipt> {
        Ok(self.account().deposit_to_escrow(amount).await?)
    }

    pub async fn withdraw(&self, amount: &Cogs) -> Result<TxReceipt> {
        Ok(self.account().withdraw_from_escrow(amount).await?)
    }

    /// Channels from this account to the offer's payment group.
    pub async fn channels(&self, offer: &ServiceOffer) -> Result<Vec<ChannelRecord>> {
        Ok(self.manager.sync_channels(offer).await?)
    }

    /// Make sure a channel can pay for one call to `offer` and return it.
    pub async fn select_channel(&self, offer: &ServiceOffer) -> Result<SelectedChannel> {
        let channel = self.manager.select_channel(offer).await?;
        Ok(SelectedChannel {
            channel: channel.record().clone(),
            amount_spent: channel.amount_spent().clone(),
            available: channel.available(),
        })
    }

    /// Account for a payment authorized over a previously selected channel.
    pub async fn record_spend(
        &self,
        offer: &ServiceOffer,
        channel_id: ChannelId,
        amount: &Cogs,
    ) -> Result<()> {
        Ok(self.manager.record_spend(offer, channel_id, amount).await?)
    }

    /// Reclaim the unspent value of every expired channel to the offer's group.
    pub async fn claim_timeout(&self, offer: &ServiceOffer) -> Result<Vec<ChannelId>> {
        Ok(self.manager.claim_expired(offer).await?)
    }
}

#[cfg(test)]
mod tests {
    use paychan_core::mock::{LedgerCall, MockLedger};
    use paychan_core::{ChannelError, GroupId};

    use super::*;

    fn payer() -> Address {
        Address::new([0xaa; 20])
    }

    fn offer() -> ServiceOffer {
        ServiceOffer::new(
            Address::new([0xbb; 20]),
            GroupId::new([3; 32]),
            Cogs::from_u64(10),
            50,
        )
    }

    fn client(ledger: &Arc<MockLedger>) -> PaychanClient {
        PaychanClient::with_ledger(ledger.clone(), payer(), StrategyConfig::default())
    }

    #[tokio::test]
    async fn deposit_then_select_opens_from_escrow() {
        let ledger = Arc::new(MockLedger::new(payer()));
        ledger.set_token_balance(Cogs::from_u64(100));
        ledger.set_block(1_000);
        let client = client(&ledger);

        client.deposit(&Cogs::from_u64(40)).await.unwrap();
        let balances = client.balances().await.unwrap();
        assert_eq!(balances.escrow, Cogs::from_u64(40));
        assert_eq!(balances.token, Cogs::from_u64(60));

        let selected = client.select_channel(&offer()).await.unwrap();
        assert_eq!(selected.channel.value, Cogs::from_u64(10));
        assert_eq!(selected.channel.expiration, 1_050);
        assert_eq!(selected.available, Cogs::from_u64(10));
        assert!(matches!(
            ledger.channel_calls().as_slice(),
            [LedgerCall::OpenChannel(_)]
        ));

        let channels = client.channels(&offer()).await.unwrap();
        assert_eq!(channels, vec![selected.channel]);
    }

    #[tokio::test]
    async fn spend_then_select_tops_up() {
        let ledger = Arc::new(MockLedger::new(payer()));
        ledger.set_escrow_balance(Cogs::from_u64(100));
        let client = client(&ledger);

        let first = client.select_channel(&offer()).await.unwrap();
        let id = first.channel.channel_id;
        client
            .record_spend(&offer(), id, &Cogs::from_u64(10))
            .await
            .unwrap();

        let second = client.select_channel(&offer()).await.unwrap();
        assert_eq!(second.channel.channel_id, id);
        assert_eq!(second.channel.value, Cogs::from_u64(20));
        assert_eq!(second.amount_spent, Cogs::from_u64(10));
    }

    #[tokio::test]
    async fn withdraw_more_than_escrow_is_rejected() {
        let ledger = Arc::new(MockLedger::new(payer()));
        ledger.set_escrow_balance(Cogs::from_u64(5));
        let client = client(&ledger);

        let err = client.withdraw(&Cogs::from_u64(6)).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Channel(ChannelError::InsufficientFunds { .. })
        ));
        assert!(ledger.calls().is_empty());
    }

    #[tokio::test]
    async fn claim_timeout_returns_funds_to_escrow() {
        let ledger = Arc::new(MockLedger::new(payer()));
        ledger.set_escrow_balance(Cogs::from_u64(10));
        let client = client(&ledger);

        let selected = client.select_channel(&offer()).await.unwrap();
        ledger.set_block(selected.channel.expiration + 1);

        let claimed = client.claim_timeout(&offer()).await.unwrap();
        assert_eq!(claimed, vec![selected.channel.channel_id]);
        assert_eq!(
            client.balances().await.unwrap().escrow,
            Cogs::from_u64(10)
        );
    }
}
