//! The payer's escrow account and the policy that keeps it funded.

use std::sync::Arc;

use tracing::{debug, info, instrument};

use crate::amount::Cogs;
use crate::identity::Address;
use crate::ledger::{Ledger, TxReceipt};
use crate::{ChannelError, Result};

/// The payer's view of its escrow and token balances.
#[derive(Clone)]
pub struct Account {
    ledger: Arc<dyn Ledger>,
    address: Address,
}

impl Account {
    pub fn new(ledger: Arc<dyn Ledger>, address: Address) -> Self {
        Self { ledger, address }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    /// Funds held by the escrow contract but not assigned to any channel.
    pub async fn escrow_balance(&self) -> Result<Cogs> {
        self.ledger.escrow_balance(&self.address).await
    }

    /// Payment token balance outside escrow.
    pub async fn token_balance(&self) -> Result<Cogs> {
        self.ledger.token_balance(&self.address).await
    }

    /// Make `amount` of the token balance pullable by the escrow contract.
    ///
    /// Fails with `InsufficientFunds` before any transaction when the token
    /// balance is short; approves only when the current allowance is lower
    /// than `amount`.
    pub async fn prepare_token_transfer(&self, amount: &Cogs) -> Result<()> {
        let balance = self.token_balance().await?;
        if balance < *amount {
            return Err(ChannelError::InsufficientFunds {
                required: amount.clone(),
                available: balance,
            });
        }

        let allowance = self.ledger.token_allowance(&self.address).await?;
        if allowance < *amount {
            debug!(%allowance, %amount, "Approving escrow contract");
            self.ledger.approve_token(amount).await?;
        }
        Ok(())
    }

    /// Move `amount` from the token balance into escrow.
    #[instrument(skip(self), fields(account = %self.address))]
    pub async fn deposit_to_escrow(&self, amount: &Cogs) -> Result<TxReceipt> {
        if amount.is_zero() {
            return Err(ChannelError::InvalidAmount("deposit must be positive".into()));
        }
        self.prepare_token_transfer(amount).await?;
        let receipt = self.ledger.deposit(amount).await?;
        info!(tx_hash = %receipt.tx_hash, "Deposited into escrow");
        Ok(receipt)
    }

    /// Move `amount` from escrow back to the token balance.
    #[instrument(skip(self), fields(account = %self.address))]
    pub async fn withdraw_from_escrow(&self, amount: &Cogs) -> Result<TxReceipt> {
        if amount.is_zero() {
            return Err(ChannelError::InvalidAmount("withdrawal must be positive".into()));
        }
        let balance = self.escrow_balance().await?;
        if balance < *amount {
            return Err(ChannelError::InsufficientFunds {
                required: amount.clone(),
                available: balance,
            });
        }
        let receipt = self.ledger.withdraw(amount).await?;
        info!(tx_hash = %receipt.tx_hash, "Withdrew from escrow");
        Ok(receipt)
    }
}

/// Amount missing from `balance` to cover `required`; zero when covered.
pub fn escrow_shortfall(required: &Cogs, balance: &Cogs) -> Cogs {
    required.saturating_sub(balance)
}

/// Guarantee the escrow balance covers `required` before a funding call.
///
/// Deposits exactly the shortfall, never more, and returns the amount
/// deposited. Fails before any channel is touched if the token balance
/// cannot cover the shortfall.
#[instrument(skip(account), fields(account = %account.address()))]
pub async fn ensure_escrow_covers(account: &Account, required: &Cogs) -> Result<Cogs> {
    let balance = account.escrow_balance().await?;
    let shortfall = escrow_shortfall(required, &balance);
    if shortfall.is_zero() {
        debug!(%balance, "Escrow already covers requirement");
        return Ok(shortfall);
    }

    info!(%balance, %shortfall, "Escrow short, depositing");
    account.deposit_to_escrow(&shortfall).await?;
    Ok(shortfall)
}
