use paychan_core::ChannelError;

pub type Result<T> = std::result::Result<T, ClientError>;

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("Ledger configuration mismatch: {0}")]
    ConfigMismatch(String),
    #[error("Wallet error: {0}")]
    Wallet(String),
    #[error("Ethereum error: {0}")]
    Ethereum(String),
    #[error("Transaction dropped from mempool")]
    TxDropped,
    #[error("Transaction {0} reverted")]
    Reverted(String),
    #[error("Missing `{0}` event in receipt")]
    MissingEvent(String),
    #[error("Value does not fit in {0}")]
    Overflow(&'static str),
    #[error("URL parse error")]
    UrlParse(#[from] url::ParseError),
    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl From<ethers::providers::ProviderError> for ClientError {
    fn from(value: ethers::providers::ProviderError) -> Self {
        Self::Ethereum(value.to_string())
    }
}

impl From<ethers::signers::WalletError> for ClientError {
    fn from(value: ethers::signers::WalletError) -> Self {
        Self::Wallet(value.to_string())
    }
}
