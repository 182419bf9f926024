use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueHint};
use paychan_client::interface::{load_input_data, save_output_data, LedgerConfig};
use paychan_client::PaychanClient;
use paychan_core::{Cogs, ServiceOffer};
use tracing::info;
use tracing_subscriber::EnvFilter;

const DEFAULT_LEDGER_CONFIG_PATH: &str = "./ledger_config.json";
const DEFAULT_SERVICE_OFFER_PATH: &str = "./service_offer.json";
const DEFAULT_SELECTED_CHANNEL_PATH: &str = "./selected_channel.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();

    let config: LedgerConfig = load_input_data(&cli.config)?;
    let client = PaychanClient::connect(&config)
        .await
        .with_context(|| format!("connecting to ledger at {}", config.rpc_url))?;

    match cli.command {
        Commands::Balance => {
            let balances = client.balances().await?;
            println!("{}", serde_json::to_string_pretty(&balances)?);
        }
        Commands::Deposit { amount } => {
            let receipt = client.deposit(&amount).await?;
            info!(%amount, tx_hash = %receipt.tx_hash, "Deposit successful");
        }
        Commands::Withdraw { amount } => {
            let receipt = client.withdraw(&amount).await?;
            info!(%amount, tx_hash = %receipt.tx_hash, "Withdrawal successful");
        }
        Commands::Channels { offer } => {
            let offer: ServiceOffer = load_input_data(&offer)?;
            let channels = client.channels(&offer).await?;
            println!("{}", serde_json::to_string_pretty(&channels)?);
        }
        Commands::Select { offer, outfile } => {
            let offer: ServiceOffer = load_input_data(&offer)?;
            let selected = client.select_channel(&offer).await?;
            save_output_data(&outfile, &selected)?;
            info!(
                channel_id = %selected.channel.channel_id,
                available = %selected.available,
                "Channel ready, written to {:?}",
                outfile
            );
        }
        Commands::ClaimTimeout { offer } => {
            let offer: ServiceOffer = load_input_data(&offer)?;
            let claimed = client.claim_timeout(&offer).await?;
            info!(count = claimed.len(), "Expired channels claimed: {:?}", claimed);
        }
    }

    Ok(())
}

#[derive(Parser)]
#[command(name = "paychan-cli")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[arg(short, long,
        global = true,
        value_parser,
        default_value = DEFAULT_LEDGER_CONFIG_PATH,
        value_hint = ValueHint::FilePath)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show escrow and token balances
    Balance,
    /// Move tokens into escrow
    Deposit {
        #[arg(short, long)]
        amount: Cogs,
    },
    /// Move unallocated escrow back to the token balance
    Withdraw {
        #[arg(short, long)]
        amount: Cogs,
    },
    /// List channels to a service group
    Channels {
        #[arg(short, long,
            value_parser,
            default_value = DEFAULT_SERVICE_OFFER_PATH,
            value_hint = ValueHint::FilePath)]
        offer: PathBuf,
    },
    /// Get a channel ready to pay for one call, opening or topping up as needed
    Select {
        #[arg(short, long,
            value_parser,
            default_value = DEFAULT_SERVICE_OFFER_PATH,
            value_hint = ValueHint::FilePath)]
        offer: PathBuf,

        #[arg(short = 'O', long,
            value_parser,
            default_value = DEFAULT_SELECTED_CHANNEL_PATH,
            value_hint = ValueHint::FilePath)]
        outfile: PathBuf,
    },
    /// Reclaim funds from expired channels
    ClaimTimeout {
        #[arg(short, long,
            value_parser,
            default_value = DEFAULT_SERVICE_OFFER_PATH,
            value_hint = ValueHint::FilePath)]
        offer: PathBuf,
    },
}
