#![forbid(unsafe_code)]
//! NetherChain node: initialize a data directory, run a peer, inspect the chain.

use clap::{Parser, Subcommand};
use colored::*;
use std::path::PathBuf;
use std::sync::Arc;
use netherchain::blockchain::ChainManager;
use netherchain::config::{load_config, DEFAULT_CONFIG_FILE};
use netherchain::crypto::Address;
use netherchain::genesis::Genesis;
use netherchain::node::{open_chain, Node};
use netherchain::persistence::open_data_dir;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Node configuration file
    #[arg(long, short, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,
    /// Overrides `database.path` from the configuration
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Write a development genesis file
    Genesis {
        /// Address credited by the genesis block
        #[arg(long)]
        coinbase: String,
        /// Initial balances as ADDRESS=AMOUNT
        #[arg(long = "alloc")]
        alloc: Vec<String>,
        #[arg(long, default_value_t = 16)]
        difficulty: u32,
        #[arg(long, default_value = "genesis.json")]
        out: PathBuf,
    },
    /// Create the chain in the data directory from a genesis file
    Init {
        #[arg(long)]
        genesis: PathBuf,
    },
    /// Start the node
    Run,
    /// Print the chain tip, and a balance if an address is given
    Status {
        #[arg(long)]
        address: Option<String>,
    },
}

fn init_logging(verbose: u8) {
    let default = match verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn parse_alloc(entry: &str) -> Result<(Address, u64), Box<dyn std::error::Error>> {
    let (addr, amount) = entry
        .split_once('=')
        .ok_or_else(|| format!("alloc entry '{}' must look like ADDRESS=AMOUNT", entry))?;
    Ok((Address::decode(addr)?, amount.parse()?))
}

fn print_chain(chain: &ChainManager) -> Result<(), Box<dyn std::error::Error>> {
    let tip = chain.get_block(&chain.tip_hash())?;
    println!("{}", "NetherChain".bright_cyan().bold());
    println!("  {} {}", "Chain id:".bright_white(), chain.genesis().chain_id);
    println!("  {} {}", "Height:".bright_white(), chain.best_height().to_string().bright_green());
    println!("  {} {}", "Tip:".bright_white(), tip.header.hash_str().yellow());
    println!("  {} {}", "Difficulty:".bright_white(), chain.difficulty());
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let mut config = load_config(&cli.config)?;
    if let Some(dir) = cli.data_dir {
        config.database.path = dir;
    }

    match cli.command {
        Commands::Genesis {
            coinbase,
            alloc,
            difficulty,
            out,
        } => {
            let coinbase = Address::decode(&coinbase)?;
            let alloc = alloc
                .iter()
                .map(|entry| parse_alloc(entry))
                .collect::<Result<Vec<_>, _>>()?;
            let mut genesis = Genesis::dev(coinbase, difficulty, &alloc);
            genesis.genesis_time = chrono::Utc::now().timestamp_millis();
            std::fs::write(&out, genesis.to_json()?)?;
            println!("{} {}", "Wrote genesis to".bright_green(), out.display());
        }
        Commands::Init { genesis } => {
            std::fs::create_dir_all(&config.database.path)?;
            let (store, _lock) = open_data_dir(&config.database.path)?;
            let chain = ChainManager::initialize(store, Genesis::load(&genesis)?)?;
            println!("{}", "Chain initialized".bright_green().bold());
            print_chain(&chain)?;
        }
        Commands::Run => {
            let node = Arc::new(Node::init(config)?);
            node.run().await?;
        }
        Commands::Status { address } => {
            let (store, _lock) = open_data_dir(&config.database.path)?;
            let chain = open_chain(store, None)?;
            print_chain(&chain)?;
            if let Some(address) = address {
                let account = chain.account(&Address::decode(&address)?)?;
                println!(
                    "  {} {} (nonce {})",
                    "Balance:".bright_white(),
                    account.balance.to_string().bright_green(),
                    account.nonce
                );
            }
        }
    }
    Ok(())
}
