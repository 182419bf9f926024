//! In-memory escrow ledger for exercising channel state transitions
//! without a chain. NOT FOR PRODUCTION USE.
//!
//! Follows the escrow contract's rules closely enough for tests: balances
//! move between token, escrow and channels, reverts are errors, and every
//! state-changing call is recorded in order.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::amount::Cogs;
use crate::channel::{ChannelId, ChannelRecord};
use crate::identity::Address;
use crate::ledger::*;
use crate::{ChannelError, Result};

/// A state-changing call observed by the mock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LedgerCall {
    ApproveToken(Cogs),
    Deposit(Cogs),
    Withdraw(Cogs),
    OpenChannel(OpenChannelParams),
    DepositAndOpenChannel(OpenChannelParams),
    AddFunds(ChannelId, Cogs),
    Extend(ChannelId, u64),
    ExtendAndAddFunds(ChannelId, u64, Cogs),
    ClaimTimeout(ChannelId),
}

impl LedgerCall {
    /// Whether the call changes a channel (as opposed to balances only).
    pub fn touches_channel(&self) -> bool {
        !matches!(
            self,
            Self::ApproveToken(_) | Self::Deposit(_) | Self::Withdraw(_)
        )
    }
}

/// Reason a mock transaction was rejected.
#[derive(Debug, thiserror::Error)]
#[error("execution reverted: {0}")]
pub struct Revert(pub String);

#[derive(Default)]
struct MockState {
    block: u64,
    escrow: HashMap<Address, Cogs>,
    tokens: HashMap<Address, Cogs>,
    allowances: HashMap<Address, Cogs>,
    // channel id -> (record, block opened at)
    channels: BTreeMap<u64, (ChannelRecord, u64)>,
    next_channel_id: u64,
    calls: Vec<LedgerCall>,
    tx_count: u64,
    fail_next: Option<&'static str>,
}

/// Escrow ledger held in memory, transacting on behalf of one signer.
pub struct MockLedger {
    signer: Address,
    deployment_block: u64,
    state: Mutex<MockState>,
}

impl MockLedger {
    pub fn new(signer: Address) -> Self {
        Self {
            signer,
            deployment_block: 0,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with_deployment_block(mut self, block: u64) -> Self {
        self.deployment_block = block;
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        state.block = state.block.max(block);
        self
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_block(&self, block: u64) {
        self.state().block = block;
    }

    pub fn set_escrow_balance(&self, amount: Cogs) {
        self.state().escrow.insert(self.signer, amount);
    }

    pub fn set_token_balance(&self, amount: Cogs) {
        self.state().tokens.insert(self.signer, amount);
    }

    pub fn set_allowance(&self, amount: Cogs) {
        self.state().allowances.insert(self.signer, amount);
    }

    /// Insert an already-open channel at the current block, assigning the
    /// next channel id (the record's own id is ignored).
    pub fn seed_channel(&self, mut record: ChannelRecord) -> ChannelId {
        let mut state = self.state();
        let id = ChannelId(state.next_channel_id);
        state.next_channel_id += 1;
        record.channel_id = id;
        let block = state.block;
        state.channels.insert(id.0, (record, block));
        id
    }

    /// Simulate the recipient claiming `amount` from a channel.
    pub fn claim_by_recipient(&self, channel_id: ChannelId, amount: Cogs) {
        let mut state = self.state();
        if let Some((record, _)) = state.channels.get_mut(&channel_id.0) {
            record.value = record.value.saturating_sub(&amount);
            record.nonce += 1;
        }
    }

    /// Delete a channel from the ledger, as if its record were wiped.
    pub fn remove_channel(&self, channel_id: ChannelId) {
        self.state().channels.remove(&channel_id.0);
    }

    /// Make the next call to `method` fail with `LedgerCallFailed`.
    pub fn fail_next(&self, method: &'static str) {
        self.state().fail_next = Some(method);
    }

    /// State-changing calls in submission order.
    pub fn calls(&self) -> Vec<LedgerCall> {
        self.state().calls.clone()
    }

    /// State-changing calls that touched a channel.
    pub fn channel_calls(&self) -> Vec<LedgerCall> {
        self.calls()
            .into_iter()
            .filter(LedgerCall::touches_channel)
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state().calls.clear();
    }

    pub fn channel_record(&self, channel_id: ChannelId) -> Option<ChannelRecord> {
        self.state()
            .channels
            .get(&channel_id.0)
            .map(|(record, _)| record.clone())
    }

    fn balance_of(map: &HashMap<Address, Cogs>, owner: &Address) -> Cogs {
        map.get(owner).cloned().unwrap_or_default()
    }
}

impl MockState {
    fn check_failure(&mut self, method: &'static str) -> Result<()> {
        if self.fail_next == Some(method) {
            self.fail_next = None;
            return Err(ChannelError::ledger(method, Revert("injected failure".into())));
        }
        Ok(())
    }

    fn receipt(&mut self, call: LedgerCall) -> TxReceipt {
        self.calls.push(call);
        self.tx_count += 1;
        TxReceipt {
            tx_hash: format!("0x{:064x}", self.tx_count),
            block_number: Some(self.block),
        }
    }

    fn debit(
        map: &mut HashMap<Address, Cogs>,
        owner: &Address,
        amount: &Cogs,
        method: &'static str,
        what: &str,
    ) -> Result<()> {
        let current = map.entry(*owner).or_default();
        match current.checked_sub(amount) {
            Some(rest) => {
                *current = rest;
                Ok(())
            }
            None => Err(ChannelError::ledger(
                method,
                Revert(format!("insufficient {what}")),
            )),
        }
    }

    fn credit(map: &mut HashMap<Address, Cogs>, owner: &Address, amount: &Cogs) {
        *map.entry(*owner).or_default() += amount;
    }

    fn do_deposit(&mut self, signer: &Address, amount: &Cogs, method: &'static str) -> Result<()> {
        let allowance = MockLedger::balance_of(&self.allowances, signer);
        let tokens = MockLedger::balance_of(&self.tokens, signer);
        if allowance < *amount || tokens < *amount {
            return Err(ChannelError::ledger(
                method,
                Revert("token transfer failed".into()),
            ));
        }
        Self::debit(&mut self.allowances, signer, amount, method, "allowance")?;
        Self::debit(&mut self.tokens, signer, amount, method, "tokens")?;
        Self::credit(&mut self.escrow, signer, amount);
        Ok(())
    }

    fn do_open(
        &mut self,
        signer: &Address,
        params: &OpenChannelParams,
        method: &'static str,
    ) -> Result<ChannelId> {
        if params.sender != *signer {
            return Err(ChannelError::ledger(method, Revert("sender mismatch".into())));
        }
        Self::debit(&mut self.escrow, signer, &params.amount, method, "escrow")?;
        let id = ChannelId(self.next_channel_id);
        self.next_channel_id += 1;
        let record = ChannelRecord {
            channel_id: id,
            sender: params.sender,
            recipient: params.recipient,
            group_id: params.group_id,
            value: params.amount.clone(),
            nonce: 0,
            expiration: params.expiration,
        };
        self.channels.insert(id.0, (record, self.block));
        Ok(id)
    }

    fn owned_channel(
        &mut self,
        signer: &Address,
        channel_id: ChannelId,
        method: &'static str,
    ) -> Result<&mut ChannelRecord> {
        match self.channels.get_mut(&channel_id.0) {
            Some((record, _)) if record.sender == *signer => Ok(record),
            Some(_) => Err(ChannelError::ledger(method, Revert("not the sender".into()))),
            None => Err(ChannelError::ledger(method, Revert("unknown channel".into()))),
        }
    }
}

#[async_trait::async_trait]
impl Ledger for MockLedger {
    async fn current_block(&self) -> Result<u64> {
        let mut state = self.state();
        state.check_failure(BLOCK_NUMBER)?;
        Ok(state.block)
    }

    fn deployment_block(&self) -> u64 {
        self.deployment_block
    }

    async fn escrow_balance(&self, owner: &Address) -> Result<Cogs> {
        let mut state = self.state();
        state.check_failure(BALANCE_OF)?;
        Ok(Self::balance_of(&state.escrow, owner))
    }

    async fn token_balance(&self, owner: &Address) -> Result<Cogs> {
        let mut state = self.state();
        state.check_failure(TOKEN_BALANCE_OF)?;
        Ok(Self::balance_of(&state.tokens, owner))
    }

    async fn token_allowance(&self, owner: &Address) -> Result<Cogs> {
        let mut state = self.state();
        state.check_failure(TOKEN_ALLOWANCE)?;
        Ok(Self::balance_of(&state.allowances, owner))
    }

    async fn approve_token(&self, amount: &Cogs) -> Result<TxReceipt> {
        let mut state = self.state();
        state.check_failure(TOKEN_APPROVE)?;
        state.allowances.insert(self.signer, amount.clone());
        Ok(state.receipt(LedgerCall::ApproveToken(amount.clone())))
    }

    async fn deposit(&self, amount: &Cogs) -> Result<TxReceipt> {
        let mut state = self.state();
        state.check_failure(DEPOSIT)?;
        state.do_deposit(&self.signer, amount, DEPOSIT)?;
        Ok(state.receipt(LedgerCall::Deposit(amount.clone())))
    }

    async fn withdraw(&self, amount: &Cogs) -> Result<TxReceipt> {
        let mut state = self.state();
        state.check_failure(WITHDRAW)?;
        MockState::debit(&mut state.escrow, &self.signer, amount, WITHDRAW, "escrow")?;
        MockState::credit(&mut state.tokens, &self.signer, amount);
        Ok(state.receipt(LedgerCall::Withdraw(amount.clone())))
    }

    async fn open_channel(&self, params: &OpenChannelParams) -> Result<OpenedChannel> {
        let mut state = self.state();
        state.check_failure(OPEN_CHANNEL)?;
        let channel_id = state.do_open(&self.signer, params, OPEN_CHANNEL)?;
        let receipt = state.receipt(LedgerCall::OpenChannel(params.clone()));
        Ok(OpenedChannel {
            channel_id,
            receipt,
        })
    }

    async fn deposit_and_open_channel(&self, params: &OpenChannelParams) -> Result<OpenedChannel> {
        let mut state = self.state();
        state.check_failure(DEPOSIT_AND_OPEN_CHANNEL)?;
        state.do_deposit(&self.signer, &params.amount, DEPOSIT_AND_OPEN_CHANNEL)?;
        let channel_id = state.do_open(&self.signer, params, DEPOSIT_AND_OPEN_CHANNEL)?;
        let receipt = state.receipt(LedgerCall::DepositAndOpenChannel(params.clone()));
        Ok(OpenedChannel {
            channel_id,
            receipt,
        })
    }

    async fn channel_add_funds(&self, channel_id: ChannelId, amount: &Cogs) -> Result<TxReceipt> {
        let mut state = self.state();
        state.check_failure(CHANNEL_ADD_FUNDS)?;
        state.owned_channel(&self.signer, channel_id, CHANNEL_ADD_FUNDS)?;
        MockState::debit(&mut state.escrow, &self.signer, amount, CHANNEL_ADD_FUNDS, "escrow")?;
        let record = state.owned_channel(&self.signer, channel_id, CHANNEL_ADD_FUNDS)?;
        record.value += amount;
        Ok(state.receipt(LedgerCall::AddFunds(channel_id, amount.clone())))
    }

    async fn channel_extend(&self, channel_id: ChannelId, new_expiration: u64) -> Result<TxReceipt> {
        let mut state = self.state();
        state.check_failure(CHANNEL_EXTEND)?;
        let record = state.owned_channel(&self.signer, channel_id, CHANNEL_EXTEND)?;
        if new_expiration < record.expiration {
            return Err(ChannelError::ledger(
                CHANNEL_EXTEND,
                Revert("expiration must not decrease".into()),
            ));
        }
        record.expiration = new_expiration;
        Ok(state.receipt(LedgerCall::Extend(channel_id, new_expiration)))
    }

    async fn channel_extend_and_add_funds(
        &self,
        channel_id: ChannelId,
        new_expiration: u64,
        amount: &Cogs,
    ) -> Result<TxReceipt> {
        const METHOD: &str = CHANNEL_EXTEND_AND_ADD_FUNDS;
        let mut state = self.state();
        state.check_failure(METHOD)?;
        let record = state.owned_channel(&self.signer, channel_id, METHOD)?;
        if new_expiration < record.expiration {
            return Err(ChannelError::ledger(
                METHOD,
                Revert("expiration must not decrease".into()),
            ));
        }
        MockState::debit(&mut state.escrow, &self.signer, amount, METHOD, "escrow")?;
        let record = state.owned_channel(&self.signer, channel_id, METHOD)?;
        record.expiration = new_expiration;
        record.value += amount;
        Ok(state.receipt(LedgerCall::ExtendAndAddFunds(
            channel_id,
            new_expiration,
            amount.clone(),
        )))
    }

    async fn channel_claim_timeout(&self, channel_id: ChannelId) -> Result<TxReceipt> {
        let mut state = self.state();
        state.check_failure(CHANNEL_CLAIM_TIMEOUT)?;
        let block = state.block;
        let record = state.owned_channel(&self.signer, channel_id, CHANNEL_CLAIM_TIMEOUT)?;
        if block < record.expiration {
            return Err(ChannelError::ledger(
                CHANNEL_CLAIM_TIMEOUT,
                Revert("channel not expired".into()),
            ));
        }
        let refund = std::mem::take(&mut record.value);
        record.nonce += 1;
        MockState::credit(&mut state.escrow, &self.signer, &refund);
        Ok(state.receipt(LedgerCall::ClaimTimeout(channel_id)))
    }

    async fn channel(&self, channel_id: ChannelId) -> Result<Option<ChannelRecord>> {
        let mut state = self.state();
        state.check_failure(CHANNELS)?;
        Ok(state
            .channels
            .get(&channel_id.0)
            .map(|(record, _)| record.clone()))
    }

    async fn channel_open_events(
        &self,
        filter: &ChannelFilter,
        from_block: u64,
    ) -> Result<Vec<ChannelOpenEvent>> {
        let mut state = self.state();
        state.check_failure(CHANNEL_OPEN_EVENTS)?;
        Ok(state
            .channels
            .values()
            .filter(|(record, opened_at)| {
                *opened_at >= from_block
                    && record.sender == filter.sender
                    && record.recipient == filter.recipient
                    && record.group_id == filter.group_id
            })
            .map(|(record, opened_at)| ChannelOpenEvent {
                channel_id: record.channel_id,
                nonce: 0,
                sender: record.sender,
                recipient: record.recipient,
                group_id: record.group_id,
                amount: record.value.clone(),
                expiration: record.expiration,
                block_number: *opened_at,
            })
            .collect())
    }
}
