use std::sync::Arc;

use ethers::abi::{parse_abi, Detokenize, RawLog, Tokenize};
use ethers::contract::{Contract, EthEvent, EthLogDecode};
use ethers::middleware::SignerMiddleware;
use ethers::providers::{Http, Middleware, Provider};
use ethers::signers::{LocalWallet, Signer};
use ethers::types::{Address as EthAddress, TransactionReceipt, H256, U256, U64};
use paychan_core::channel::{ChannelId, ChannelRecord};
use paychan_core::ledger::{
    ChannelFilter, ChannelOpenEvent, OpenChannelParams, OpenedChannel, BALANCE_OF, BLOCK_NUMBER,
    CHANNELS, CHANNEL_ADD_FUNDS, CHANNEL_CLAIM_TIMEOUT, CHANNEL_EXTEND,
    CHANNEL_EXTEND_AND_ADD_FUNDS, CHANNEL_OPEN_EVENTS, DEPOSIT, DEPOSIT_AND_OPEN_CHANNEL,
    OPEN_CHANNEL, TOKEN_ALLOWANCE, TOKEN_APPROVE, TOKEN_BALANCE_OF, WITHDRAW,
};
use paychan_core::{Address, ChannelError, Cogs, GroupId, Ledger, TxReceipt};
use tracing::{debug, info, instrument, trace};

use crate::error::ClientError;
use crate::interface::LedgerConfig;

// Multi-party escrow contract, the subset the channel engine drives.
const ESCROW_ABI: &[&str] = &[
    "function balanceOf(address owner) view returns (uint256)",
    "function deposit(uint256 value) returns (bool)",
    "function withdraw(uint256 value) returns (bool)",
    "function openChannel(address signer, address recipient, bytes32 groupId, uint256 value, uint256 expiration) returns (bool)",
    "function depositAndOpenChannel(address signer, address recipient, bytes32 groupId, uint256 value, uint256 expiration) returns (bool)",
    "function channelAddFunds(uint256 channelId, uint256 amount) returns (bool)",
    "function channelExtend(uint256 channelId, uint256 newExpiration) returns (bool)",
    "function channelExtendAndAddFunds(uint256 channelId, uint256 newExpiration, uint256 amount)",
    "function channelClaimTimeout(uint256 channelId)",
    "function channels(uint256 channelId) view returns (uint256 nonce, address sender, address signer, address recipient, bytes32 groupId, uint256 value, uint256 expiration)",
    "event ChannelOpen(uint256 channelId, uint256 nonce, address indexed sender, address signer, address indexed recipient, bytes32 indexed groupId, uint256 amount, uint256 expiration)",
];

const TOKEN_ABI: &[&str] = &[
    "function balanceOf(address owner) view returns (uint256)",
    "function allowance(address owner, address spender) view returns (uint256)",
    "function approve(address spender, uint256 value) returns (bool)",
];

/// ABI for the `ChannelOpen` event
#[derive(Clone, Debug, EthEvent)]
#[ethevent(
    name = "ChannelOpen",
    abi = "ChannelOpen(
    uint256 channelId,
    uint256 nonce,
    address indexed sender,
    address signer,
    address indexed recipient,
    bytes32 indexed groupId,
    uint256 amount,
    uint256 expiration)"
)]
struct ChannelOpenLog {
    channel_id: U256,
    nonce: U256,
    sender: EthAddress,
    _signer: EthAddress,
    recipient: EthAddress,
    group_id: [u8; 32],
    amount: U256,
    expiration: U256,
}

type SignerClient = SignerMiddleware<Provider<Http>, LocalWallet>;

/// `(nonce, sender, signer, recipient, groupId, value, expiration)`
type ChannelTuple = (U256, EthAddress, EthAddress, EthAddress, [u8; 32], U256, U256);

/// Escrow ledger backed by the multi-party escrow contract on an
/// Ethereum-compatible chain.
pub struct EthereumLedger {
    provider: Provider<Http>,
    escrow: Contract<SignerClient>,
    token: Contract<SignerClient>,
    sender: Address,
    deployment_block: u64,
    confirmations: usize,
}

impl EthereumLedger {
    pub async fn new(config: &LedgerConfig) -> crate::Result<Self> {
        let LedgerConfig {
            rpc_url,
            sender_private_key,
            escrow_address,
            token_address,
            deployment_block,
            confirmations,
            ..
        } = config;

        if escrow_address.is_zero() || token_address.is_zero() {
            return Err(ClientError::ConfigMismatch(
                "escrow and token addresses must be set".into(),
            ));
        }
        if escrow_address == token_address {
            return Err(ClientError::ConfigMismatch(
                "escrow and token addresses must differ".into(),
            ));
        }

        let provider = Provider::<Http>::try_from(rpc_url.as_str())?;
        let chain_id = provider.get_chainid().await?.as_u64();
        debug!(%chain_id, "Connected to Ethereum");

        let wallet = sender_private_key
            .parse::<LocalWallet>()?
            .with_chain_id(chain_id);
        let sender = from_eth_address(wallet.address());
        debug!(%sender, "Wallet configured");

        let escrow_abi = parse_abi(ESCROW_ABI).map_err(|e| ClientError::Ethereum(e.to_string()))?;
        let token_abi = parse_abi(TOKEN_ABI).map_err(|e| ClientError::Ethereum(e.to_string()))?;

        let client = Arc::new(SignerMiddleware::new(provider.clone(), wallet));
        let escrow = Contract::new(to_eth_address(escrow_address), escrow_abi, client.clone());
        let token = Contract::new(to_eth_address(token_address), token_abi, client);

        Ok(Self {
            provider,
            escrow,
            token,
            sender,
            deployment_block: *deployment_block,
            confirmations: *confirmations,
        })
    }

    /// Address transactions are signed with.
    pub fn sender(&self) -> Address {
        self.sender
    }

    async fn call<T, D>(
        &self,
        contract: &Contract<SignerClient>,
        method: &'static str,
        args: T,
    ) -> Result<D, ChannelError>
    where
        T: Tokenize,
        D: Detokenize + Send + Sync,
    {
        contract
            .method::<T, D>(abi_name(method), args)
            .map_err(|e| ledger_error(method, e))?
            .call()
            .await
            .map_err(|e| ledger_error(method, e))
    }

    #[instrument(skip(self, contract, args))]
    async fn send<T: Tokenize>(
        &self,
        contract: &Contract<SignerClient>,
        method: &'static str,
        args: T,
    ) -> Result<TransactionReceipt, ChannelError> {
        let call = contract
            .method::<T, ()>(abi_name(method), args)
            .map_err(|e| ledger_error(method, e))?;

        info!("Sending {method} transaction");
        let pending = call.send().await.map_err(|e| ledger_error(method, e))?;
        let receipt = pending
            .confirmations(self.confirmations)
            .await
            .map_err(|e| ledger_error(method, e))?
            .ok_or_else(|| ChannelError::ledger(method, ClientError::TxDropped))?;

        if receipt.status != Some(U64::from(1)) {
            return Err(ChannelError::ledger(
                method,
                ClientError::Reverted(format!("{:?}", receipt.transaction_hash)),
            ));
        }
        info!(tx_hash = ?receipt.transaction_hash, block = ?receipt.block_number, "{method} transaction confirmed");
        Ok(receipt)
    }

    async fn open(
        &self,
        method: &'static str,
        params: &OpenChannelParams,
    ) -> Result<OpenedChannel, ChannelError> {
        if params.sender != self.sender {
            return Err(ChannelError::ledger(
                method,
                ClientError::ConfigMismatch(format!(
                    "channel sender {} is not the configured wallet {}",
                    params.sender, self.sender
                )),
            ));
        }

        let args = (
            // The payer signs its own payment authorizations.
            to_eth_address(&params.sender),
            to_eth_address(&params.recipient),
            *params.group_id.as_bytes(),
            to_u256(&params.amount)?,
            U256::from(params.expiration),
        );
        let receipt = self.send(&self.escrow, method, args).await?;

        let event = receipt
            .logs
            .iter()
            .find_map(|log| {
                trace!(topics = ?log.topics, "Parsing log");
                <ChannelOpenLog as EthLogDecode>::decode_log(&RawLog {
                    topics: log.topics.clone(),
                    data: log.data.to_vec(),
                })
                .ok()
            })
            .ok_or_else(|| {
                ChannelError::ledger(method, ClientError::MissingEvent("ChannelOpen".into()))
            })?;

        Ok(OpenedChannel {
            channel_id: ChannelId(to_u64(method, event.channel_id)?),
            receipt: tx_receipt(&receipt),
        })
    }
}

#[async_trait::async_trait]
impl Ledger for EthereumLedger {
    async fn current_block(&self) -> paychan_core::Result<u64> {
        let block = self
            .provider
            .get_block_number()
            .await
            .map_err(|e| ledger_error(BLOCK_NUMBER, e))?;
        Ok(block.as_u64())
    }

    fn deployment_block(&self) -> u64 {
        self.deployment_block
    }

    async fn escrow_balance(&self, owner: &Address) -> paychan_core::Result<Cogs> {
        let balance: U256 = self
            .call(&self.escrow, BALANCE_OF, to_eth_address(owner))
            .await?;
        Ok(from_u256(balance))
    }

    async fn token_balance(&self, owner: &Address) -> paychan_core::Result<Cogs> {
        let balance: U256 = self
            .call(&self.token, TOKEN_BALANCE_OF, to_eth_address(owner))
            .await?;
        Ok(from_u256(balance))
    }

    async fn token_allowance(&self, owner: &Address) -> paychan_core::Result<Cogs> {
        let allowance: U256 = self
            .call(
                &self.token,
                TOKEN_ALLOWANCE,
                (to_eth_address(owner), self.escrow.address()),
            )
            .await?;
        Ok(from_u256(allowance))
    }

    async fn approve_token(&self, amount: &Cogs) -> paychan_core::Result<TxReceipt> {
        let args = (self.escrow.address(), to_u256(amount)?);
        let receipt = self.send(&self.token, TOKEN_APPROVE, args).await?;
        Ok(tx_receipt(&receipt))
    }

    async fn deposit(&self, amount: &Cogs) -> paychan_core::Result<TxReceipt> {
        let receipt = self
            .send(&self.escrow, DEPOSIT, to_u256(amount)?)
            .await?;
        Ok(tx_receipt(&receipt))
    }

    async fn withdraw(&self, amount: &Cogs) -> paychan_core::Result<TxReceipt> {
        let receipt = self
            .send(&self.escrow, WITHDRAW, to_u256(amount)?)
            .await?;
        Ok(tx_receipt(&receipt))
    }

    async fn open_channel(&self, params: &OpenChannelParams) -> paychan_core::Result<OpenedChannel> {
        self.open(OPEN_CHANNEL, params).await
    }

    async fn deposit_and_open_channel(
        &self,
        params: &OpenChannelParams,
    ) -> paychan_core::Result<OpenedChannel> {
        self.open(DEPOSIT_AND_OPEN_CHANNEL, params).await
    }

    async fn channel_add_funds(
        &self,
        channel_id: ChannelId,
        amount: &Cogs,
    ) -> paychan_core::Result<TxReceipt> {
        let args = (
            U256::from(channel_id.0),
            to_u256(amount)?,
        );
        let receipt = self.send(&self.escrow, CHANNEL_ADD_FUNDS, args).await?;
        Ok(tx_receipt(&receipt))
    }

    async fn channel_extend(
        &self,
        channel_id: ChannelId,
        new_expiration: u64,
    ) -> paychan_core::Result<TxReceipt> {
        let args = (U256::from(channel_id.0), U256::from(new_expiration));
        let receipt = self.send(&self.escrow, CHANNEL_EXTEND, args).await?;
        Ok(tx_receipt(&receipt))
    }

    async fn channel_extend_and_add_funds(
        &self,
        channel_id: ChannelId,
        new_expiration: u64,
        amount: &Cogs,
    ) -> paychan_core::Result<TxReceipt> {
        let args = (
            U256::from(channel_id.0),
            U256::from(new_expiration),
            to_u256(amount)?,
        );
        let receipt = self
            .send(&self.escrow, CHANNEL_EXTEND_AND_ADD_FUNDS, args)
            .await?;
        Ok(tx_receipt(&receipt))
    }

    async fn channel_claim_timeout(&self, channel_id: ChannelId) -> paychan_core::Result<TxReceipt> {
        let receipt = self
            .send(&self.escrow, CHANNEL_CLAIM_TIMEOUT, U256::from(channel_id.0))
            .await?;
        Ok(tx_receipt(&receipt))
    }

    async fn channel(&self, channel_id: ChannelId) -> paychan_core::Result<Option<ChannelRecord>> {
        let (nonce, sender, _signer, recipient, group_id, value, expiration): ChannelTuple = self
            .call(&self.escrow, CHANNELS, U256::from(channel_id.0))
            .await?;

        // Unknown ids read back as an all-zero struct.
        if sender.is_zero() {
            return Ok(None);
        }

        Ok(Some(ChannelRecord {
            channel_id,
            sender: from_eth_address(sender),
            recipient: from_eth_address(recipient),
            group_id: GroupId::new(group_id),
            value: from_u256(value),
            nonce: to_u64(CHANNELS, nonce)?,
            expiration: to_u64(CHANNELS, expiration)?,
        }))
    }

    #[instrument(skip(self, filter), fields(sender = %filter.sender, recipient = %filter.recipient))]
    async fn channel_open_events(
        &self,
        filter: &ChannelFilter,
        from_block: u64,
    ) -> paychan_core::Result<Vec<ChannelOpenEvent>> {
        let logs = self
            .escrow
            .event::<ChannelOpenLog>()
            .from_block(from_block)
            .topic1(H256::from(to_eth_address(&filter.sender)))
            .topic2(H256::from(to_eth_address(&filter.recipient)))
            .topic3(H256::from(*filter.group_id.as_bytes()))
            .query_with_meta()
            .await
            .map_err(|e| ledger_error(CHANNEL_OPEN_EVENTS, e))?;
        debug!(count = logs.len(), "Fetched ChannelOpen logs");

        logs.into_iter()
            .map(|(log, meta)| {
                Ok(ChannelOpenEvent {
                    channel_id: ChannelId(to_u64(CHANNEL_OPEN_EVENTS, log.channel_id)?),
                    nonce: to_u64(CHANNEL_OPEN_EVENTS, log.nonce)?,
                    sender: from_eth_address(log.sender),
                    recipient: from_eth_address(log.recipient),
                    group_id: GroupId::new(log.group_id),
                    amount: from_u256(log.amount),
                    expiration: to_u64(CHANNEL_OPEN_EVENTS, log.expiration)?,
                    block_number: meta.block_number.as_u64(),
                })
            })
            .collect()
    }
}

// Token methods are labelled `token.<name>`; the contract knows them as `<name>`.
fn abi_name(method: &'static str) -> &'static str {
    method.strip_prefix("token.").unwrap_or(method)
}

fn ledger_error(method: &'static str, err: impl ToString) -> ChannelError {
    ChannelError::ledger(method, ClientError::Ethereum(err.to_string()))
}

fn tx_receipt(receipt: &TransactionReceipt) -> TxReceipt {
    TxReceipt {
        tx_hash: format!("{:?}", receipt.transaction_hash),
        block_number: receipt.block_number.map(|b| b.as_u64()),
    }
}

fn to_eth_address(address: &Address) -> EthAddress {
    EthAddress::from(*address.as_bytes())
}

fn from_eth_address(address: EthAddress) -> Address {
    Address::new(address.0)
}

fn to_u256(amount: &Cogs) -> Result<U256, ChannelError> {
    let bytes = amount.to_bytes_be();
    if bytes.len() > 32 {
        return Err(ChannelError::InvalidAmount(format!(
            "{amount} does not fit in uint256"
        )));
    }
    Ok(U256::from_big_endian(&bytes))
}

fn from_u256(value: U256) -> Cogs {
    let mut bytes = [0u8; 32];
    value.to_big_endian(&mut bytes);
    Cogs::from_bytes_be(&bytes)
}

fn to_u64(method: &'static str, value: U256) -> Result<u64, ChannelError> {
    if value > U256::from(u64::MAX) {
        return Err(ChannelError::ledger(method, ClientError::Overflow("u64")));
    }
    Ok(value.as_u64())
}
