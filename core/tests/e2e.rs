use std::sync::Arc;

use paychan_core::ledger::{CHANNEL_ADD_FUNDS, OPEN_CHANNEL};
use paychan_core::mock::{LedgerCall, MockLedger};
use paychan_core::{
    Account, Address, ChannelError, ChannelId, ChannelManagementStrategy, ChannelRecord, Cogs,
    GroupId, PaymentChannel, ServiceOffer, StrategyConfig,
};

fn payer() -> Address {
    Address::new([0xaa; 20])
}

fn recipient() -> Address {
    Address::new([0xbb; 20])
}

fn group() -> GroupId {
    GroupId::new([7; 32])
}

fn offer(price: u64, threshold: u64) -> ServiceOffer {
    ServiceOffer::new(recipient(), group(), Cogs::from_u64(price), threshold)
}

struct Fixture {
    ledger: Arc<MockLedger>,
    account: Account,
    strategy: ChannelManagementStrategy,
}

impl Fixture {
    fn new(block: u64) -> Self {
        let ledger = Arc::new(MockLedger::new(payer()));
        ledger.set_block(block);
        let account = Account::new(ledger.clone(), payer());
        Self {
            ledger,
            account,
            strategy: ChannelManagementStrategy::new(StrategyConfig::default()),
        }
    }

    /// Seed an on-chain channel and load it with `spent` already authorized.
    async fn channel(&self, value: u64, spent: u64, expiration: u64) -> PaymentChannel {
        let id = self.ledger.seed_channel(ChannelRecord {
            channel_id: ChannelId(0),
            sender: payer(),
            recipient: recipient(),
            group_id: group(),
            value: Cogs::from_u64(value),
            nonce: 0,
            expiration,
        });
        let mut channel = PaymentChannel::load(self.ledger.clone(), id).await.unwrap();
        channel.record_spend(&Cogs::from_u64(spent)).unwrap();
        channel
    }
}

#[tokio::test]
async fn opens_from_escrow_without_depositing() {
    let fx = Fixture::new(50);
    fx.ledger.set_escrow_balance(Cogs::from_u64(5));
    let mut known = Vec::new();

    let channel = fx
        .strategy
        .select_channel(&fx.account, &offer(5, 100), &mut known)
        .await
        .unwrap();

    assert_eq!(channel.value(), &Cogs::from_u64(5));
    assert_eq!(channel.expiration(), 150);
    let calls = fx.ledger.calls();
    assert_eq!(calls.len(), 1);
    assert!(matches!(&calls[0], LedgerCall::OpenChannel(p) if p.amount == Cogs::from_u64(5)));
    assert_eq!(known.len(), 1);
}

#[tokio::test]
async fn short_escrow_deposits_and_opens_in_one_transaction() {
    let fx = Fixture::new(50);
    fx.ledger.set_escrow_balance(Cogs::from_u64(2));
    fx.ledger.set_token_balance(Cogs::from_u64(100));
    fx.ledger.set_allowance(Cogs::from_u64(100));
    let mut known = Vec::new();

    let channel = fx
        .strategy
        .select_channel(&fx.account, &offer(5, 100), &mut known)
        .await
        .unwrap();

    assert_eq!(channel.value(), &Cogs::from_u64(5));
    assert_eq!(channel.expiration(), 150);
    let calls = fx.ledger.calls();
    assert_eq!(calls.len(), 1);
    assert!(matches!(&calls[0], LedgerCall::DepositAndOpenChannel(_)));
    // Existing escrow stays untouched.
    assert_eq!(fx.account.escrow_balance().await.unwrap(), Cogs::from_u64(2));
}

#[tokio::test]
async fn opening_without_any_funds_fails_fast() {
    let fx = Fixture::new(50);
    let mut known = Vec::new();

    let err = fx
        .strategy
        .select_channel(&fx.account, &offer(5, 100), &mut known)
        .await
        .unwrap_err();

    assert!(matches!(err, ChannelError::InsufficientFunds { .. }));
    assert!(fx.ledger.calls().is_empty());
    assert!(known.is_empty());
}

#[tokio::test]
async fn usable_channel_is_reused_without_transactions() {
    let fx = Fixture::new(50);
    let mut known = vec![
        fx.channel(3, 0, 500).await,
        fx.channel(10, 2, 200).await,
        fx.channel(10, 0, 300).await,
    ];
    let expected = known[1].id();
    let before = known[1].record().clone();

    let channel = fx
        .strategy
        .select_channel(&fx.account, &offer(5, 100), &mut known)
        .await
        .unwrap();

    assert_eq!(channel.id(), expected);
    assert_eq!(channel.record(), &before);
    assert!(fx.ledger.calls().is_empty());
}

#[tokio::test]
async fn funded_but_expiring_channel_is_extended() {
    let fx = Fixture::new(50);
    let mut known = vec![fx.channel(2, 0, 500).await, fx.channel(10, 0, 120).await];
    let id = known[1].id();

    let channel = fx
        .strategy
        .select_channel(&fx.account, &offer(5, 100), &mut known)
        .await
        .unwrap();

    assert_eq!(channel.id(), id);
    assert_eq!(channel.expiration(), 150);
    assert_eq!(fx.ledger.calls(), vec![LedgerCall::Extend(id, 150)]);
}

#[tokio::test]
async fn valid_but_underfunded_channel_is_topped_up_by_shortfall() {
    let fx = Fixture::new(50);
    fx.ledger.set_token_balance(Cogs::from_u64(100));
    let mut known = vec![fx.channel(10, 8, 400).await];
    let id = known[0].id();

    let channel = fx
        .strategy
        .select_channel(&fx.account, &offer(5, 100), &mut known)
        .await
        .unwrap();

    assert_eq!(channel.value(), &Cogs::from_u64(13));
    assert_eq!(channel.available(), Cogs::from_u64(5));
    assert_eq!(
        fx.ledger.channel_calls(),
        vec![LedgerCall::AddFunds(id, Cogs::from_u64(3))]
    );
    // Escrow was empty, so exactly the shortfall was deposited first.
    assert!(fx.ledger.calls().contains(&LedgerCall::Deposit(Cogs::from_u64(3))));
}

#[tokio::test]
async fn nothing_fits_extends_and_funds_first_channel() {
    // C1(value=10, spent=8, expiration=100), price 5, required expiration 150.
    let fx = Fixture::new(50);
    fx.ledger.set_escrow_balance(Cogs::from_u64(10));
    let mut known = vec![fx.channel(10, 8, 100).await, fx.channel(1, 0, 60).await];
    let id = known[0].id();

    let channel = fx
        .strategy
        .select_channel(&fx.account, &offer(5, 100), &mut known)
        .await
        .unwrap();

    assert_eq!(channel.id(), id);
    assert_eq!(channel.value(), &Cogs::from_u64(13));
    assert_eq!(channel.expiration(), 150);
    assert!(channel.has_sufficient_funds(&Cogs::from_u64(5)));
    assert_eq!(
        fx.ledger.calls(),
        vec![LedgerCall::ExtendAndAddFunds(id, 150, Cogs::from_u64(3))]
    );
}

#[tokio::test]
async fn every_case_issues_at_most_one_channel_transaction() {
    let layouts: &[&[(u64, u64, u64)]] = &[
        &[],
        &[(10, 0, 500)],
        &[(10, 0, 60)],
        &[(2, 0, 500)],
        &[(0, 0, 0)],
        &[(0, 0, 0), (2, 0, 500), (10, 0, 60)],
        &[(10, 10, 60), (10, 10, 70)],
    ];

    for layout in layouts {
        let fx = Fixture::new(50);
        fx.ledger.set_escrow_balance(Cogs::from_u64(1_000));
        let mut known = Vec::new();
        for (value, spent, expiration) in layout.iter() {
            known.push(fx.channel(*value, *spent, *expiration).await);
        }

        let channel = fx
            .strategy
            .select_channel(&fx.account, &offer(5, 100), &mut known)
            .await
            .unwrap();

        assert!(channel.has_sufficient_funds(&Cogs::from_u64(5)));
        assert!(channel.is_valid(150));
        assert!(
            fx.ledger.channel_calls().len() <= 1,
            "layout {layout:?} issued {:?}",
            fx.ledger.channel_calls()
        );
    }
}

#[tokio::test]
async fn ledger_failure_aborts_selection() {
    let fx = Fixture::new(50);
    fx.ledger.set_escrow_balance(Cogs::from_u64(100));
    fx.ledger.fail_next(OPEN_CHANNEL);
    let mut known = Vec::new();

    let err = fx
        .strategy
        .select_channel(&fx.account, &offer(5, 100), &mut known)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ChannelError::LedgerCallFailed { method: "openChannel", .. }
    ));
    assert!(known.is_empty());

    let mut known = vec![fx.channel(10, 8, 400).await];
    fx.ledger.fail_next(CHANNEL_ADD_FUNDS);
    let err = fx
        .strategy
        .select_channel(&fx.account, &offer(5, 100), &mut known)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        ChannelError::LedgerCallFailed { method: "channelAddFunds", .. }
    ));
    assert_eq!(known[0].value(), &Cogs::from_u64(10));
}

#[tokio::test]
async fn unusable_offer_is_rejected_before_any_call() {
    let fx = Fixture::new(50);
    let mut bad = offer(5, 100);
    bad.payment_address = None;
    let mut known = Vec::new();

    assert!(matches!(
        fx.strategy.select_channel(&fx.account, &bad, &mut known).await,
        Err(ChannelError::NoUsableServiceOffer(_))
    ));
    assert!(fx.ledger.calls().is_empty());
}

#[tokio::test]
async fn revalidation_catches_concurrent_spend() {
    let fx = Fixture::new(50);
    let strategy = ChannelManagementStrategy::new(StrategyConfig {
        revalidate_before_mutation: true,
        ..Default::default()
    });
    let mut known = vec![fx.channel(10, 0, 120).await];
    fx.ledger.claim_by_recipient(known[0].id(), Cogs::from_u64(4));

    let err = strategy
        .select_channel(&fx.account, &offer(5, 100), &mut known)
        .await
        .unwrap_err();
    assert!(matches!(err, ChannelError::StaleChannelState(_)));
    assert!(fx.ledger.calls().is_empty());
}

#[tokio::test]
async fn block_offset_pads_new_expirations() {
    let fx = Fixture::new(50);
    fx.ledger.set_escrow_balance(Cogs::from_u64(30));
    let strategy = ChannelManagementStrategy::new(StrategyConfig {
        block_offset: 240,
        call_allowance: 2,
        ..Default::default()
    });
    let mut known = Vec::new();

    let channel = strategy
        .select_channel(&fx.account, &offer(5, 100), &mut known)
        .await
        .unwrap();
    assert_eq!(channel.value(), &Cogs::from_u64(10));
    assert_eq!(channel.expiration(), 390);
}
