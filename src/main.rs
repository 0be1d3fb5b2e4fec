use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::info;

use utxo_ledger::blockchain::{Address, Blockchain, BlockchainError, Wallets};
use utxo_ledger::config::{load_config, Config, DEFAULT_CONFIG_FILE};

#[derive(Debug, Parser)]
#[command(name = "utxo-ledger", version, about = "A single-node UTXO ledger")]
struct Cli {
    /// Path to the TOML config file
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Overrides the block store directory
    #[arg(long, global = true)]
    data_dir: Option<PathBuf>,

    /// Overrides the wallet file
    #[arg(long, global = true)]
    wallet_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Creates a blockchain whose genesis reward goes to ADDRESS
    #[command(name = "createblockchain", visible_alias = "createBlockchain")]
    CreateBlockchain {
        #[arg(long)]
        address: String,
    },

    /// Prints the balance of ADDRESS
    #[command(name = "getbalance", visible_alias = "getBalance")]
    GetBalance {
        #[arg(long)]
        address: String,
    },

    /// Sends AMOUNT from one wallet address to another
    #[command(name = "send")]
    Send {
        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,

        #[arg(long)]
        amount: u64,
    },

    /// Prints every block from the tip back to genesis
    #[command(name = "printchain", visible_alias = "printChain")]
    PrintChain,

    /// Creates a new wallet and prints its address
    #[command(name = "createwallet", visible_alias = "createWallet")]
    CreateWallet,

    /// Lists the addresses in the wallet file
    #[command(name = "listaddresses", visible_alias = "listAddresses")]
    ListAddresses,
}

fn parse_address(address: &str) -> Result<Address> {
    address
        .parse::<Address>()
        .with_context(|| format!("Address is not valid: {}", address))
}

fn create_blockchain(config: &Config, address: &str) -> Result<()> {
    let address = parse_address(address)?;

    let chain = Blockchain::create(&config.data_dir, &address, config.mining.options())?;
    chain.flush()?;

    println!("Blockchain created, genesis reward sent to {}", address);
    Ok(())
}

fn get_balance(config: &Config, address: &str) -> Result<()> {
    let address = parse_address(address)?;
    let chain = Blockchain::open(&config.data_dir, config.mining.options())?;

    let balance = chain.balance(&address.pub_key_hash()?)?;
    println!("Balance of {}: {}", address, balance);
    Ok(())
}

fn send(config: &Config, from: &str, to: &str, amount: u64) -> Result<()> {
    let from = parse_address(from)?;
    let to = parse_address(to)?;

    let wallets = Wallets::load(&config.wallet_file)?;
    let keys = wallets
        .get_wallet(from.as_str())
        .context("Sender address is not in the wallet file")?;

    let chain = Blockchain::open(&config.data_dir, config.mining.options())?;
    let block = chain.send(keys, &to, amount)?;

    info!("Transfer mined in block {}", hex::encode(&block.hash));
    println!("Success!");
    Ok(())
}

fn print_chain(config: &Config) -> Result<()> {
    let chain = Blockchain::open(&config.data_dir, config.mining.options())?;

    for block in chain.iter()? {
        let block = block?;

        println!("Previous Hash: {}", hex::encode(&block.prev_hash));
        println!("Hash: {}", hex::encode(&block.hash));
        println!("Nonce: {}", block.nonce);
        println!("Proof of work: {}", block.validate_proof());
        for tx in &block.transactions {
            println!("{}", tx);
        }
        println!();
    }

    Ok(())
}

fn create_wallet(config: &Config) -> Result<()> {
    let mut wallets = Wallets::load(&config.wallet_file)?;
    let address = wallets.add_wallet();
    wallets.save()?;

    println!("New address is: {}", address);
    Ok(())
}

fn list_addresses(config: &Config) -> Result<()> {
    let wallets = Wallets::load(&config.wallet_file)?;
    let addresses = wallets.addresses();

    if addresses.is_empty() {
        println!("No addresses found");
    }
    for address in addresses {
        println!("{}", address);
    }
    Ok(())
}

fn run(cli: Cli) -> Result<()> {
    let mut config = load_config(&cli.config)
        .with_context(|| format!("Failed to load {}", cli.config.display()))?;
    if let Some(data_dir) = cli.data_dir {
        config.data_dir = data_dir;
    }
    if let Some(wallet_file) = cli.wallet_file {
        config.wallet_file = wallet_file;
    }
    config.validate().context("Invalid command line overrides")?;

    match cli.command {
        Command::CreateBlockchain { address } => create_blockchain(&config, &address),
        Command::GetBalance { address } => get_balance(&config, &address),
        Command::Send { from, to, amount } => send(&config, &from, &to, amount),
        Command::PrintChain => print_chain(&config),
        Command::CreateWallet => create_wallet(&config),
        Command::ListAddresses => list_addresses(&config),
    }
}

fn main() -> ExitCode {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let cli = Cli::parse();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            let shortfall = err
                .downcast_ref::<BlockchainError>()
                .map_or(false, BlockchainError::is_insufficient_funds);

            if shortfall {
                println!("{}", err);
                ExitCode::SUCCESS
            } else {
                eprintln!("Error: {:#}", err);
                ExitCode::FAILURE
            }
        }
    }
}
