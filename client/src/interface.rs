use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;

use anyhow::Context;
use paychan_core::{Address, ChannelRecord, Cogs, StrategyConfig};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

pub fn load_input_data<P, T>(path: P) -> anyhow::Result<T>
where
    P: AsRef<Path>,
    T: DeserializeOwned,
{
    let path = path.as_ref();
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == ErrorKind::NotFound => {
            anyhow::bail!(
                "Input file {:?} not found. \
                Pass --config/--offer explicitly or create it next to the binary.",
                path
            );
        }
        Err(e) => return Err(e).context(format!("opening file {:?}", path)),
    };
    serde_json::from_reader(file).with_context(|| format!("parsing JSON from {:?}", path))
}

pub fn save_output_data<P, T>(path: P, data: &T) -> anyhow::Result<()>
where
    P: AsRef<Path>,
    T: Serialize,
{
    let path = path.as_ref();

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating directory {:?}", parent))?;
    }

    let file = File::create(path).with_context(|| format!("creating file {:?}", path))?;
    serde_json::to_writer_pretty(file, data)
        .with_context(|| format!("serializing to JSON to {:?}", path))
}

/// Connection to the escrow ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// JSON-RPC endpoint URL
    pub rpc_url: String,
    /// Hex-encoded secp256k1 key of the paying account
    pub sender_private_key: String,
    /// Escrow (multi-party escrow) contract address
    pub escrow_address: Address,
    /// ERC-20 payment token address
    pub token_address: Address,
    /// Block the escrow contract was deployed at; event scans start here.
    #[serde(default)]
    pub deployment_block: u64,
    /// Confirmations to wait for before a transaction counts as mined.
    #[serde(default = "default_confirmations")]
    pub confirmations: usize,
    #[serde(default)]
    pub strategy: StrategyConfig,
}

fn default_confirmations() -> usize {
    1
}

/// Escrow and token balances of the paying account.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Balances {
    pub account: Address,
    pub escrow: Cogs,
    pub token: Cogs,
}

/// Result of a channel selection, written by `paychan-cli select`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedChannel {
    #[serde(flatten)]
    pub channel: ChannelRecord,
    pub amount_spent: Cogs,
    /// Unspent funds
    pub available: Cogs,
}
