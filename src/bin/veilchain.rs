#![forbid(unsafe_code)]
//! Veilchain engine CLI

use clap::{Parser, Subcommand};
use colored::Colorize;
use crossbeam_channel::RecvTimeoutError;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use veilchain::account::Accounts;
use veilchain::api::{run_api_server, ApiState};
use veilchain::chain::Chain;
use veilchain::config::{load_config_from, Config};
use veilchain::miner::MinerPool;
use veilchain::network::PeerListener;
use veilchain::transaction::Transactions;

/// Airdrop bounds mirrored from the API surface.
const MAX_AIRDROP_AMOUNT: f64 = 10_000.0;

#[derive(Parser)]
#[command(name = "veilchain", version, about = "Veilchain blockchain engine")]
struct Cli {
    /// Path to the configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start the proof-of-work miner engine
    Miner {
        /// Worker threads; defaults to the configured count
        #[arg(long, short)]
        threads: Option<usize>,
    },
    /// Start the node listener other peers synchronize from
    Node {
        /// Listener port; defaults to the configured p2p port
        #[arg(long, short)]
        port: Option<u16>,
    },
    /// Start the HTTP API server
    Serve {
        /// API port; defaults to the configured api port
        #[arg(long, short)]
        port: Option<u16>,
    },
    /// Account management
    Account {
        #[command(subcommand)]
        command: AccountCommand,
    },
    /// Deposit an amount of coins into an account
    Airdrop {
        /// Destination account address
        to: String,
        /// Amount to credit; must be > 0 and <= 10000
        amount: f64,
    },
    /// Transfer coins from an account to a destination account
    Send {
        /// Account to be debited
        from: String,
        /// Account to be credited
        to: String,
        /// Amount to transfer
        amount: f64,
    },
}

#[derive(Subcommand)]
enum AccountCommand {
    /// Create a new account identified by a label
    New { label: String },
    /// Display all accounts registered in the blockchain
    List,
}

fn main() {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let config = load_config_from(&cli.config)?;

    match cli.command {
        Command::Miner { threads } => run_miner(&config, threads),
        Command::Node { port } => run_node(&config, port),
        Command::Serve { port } => run_serve(&config, port),
        Command::Account { command } => run_account(&config, command),
        Command::Airdrop { to, amount } => {
            if amount <= 0.0 || amount > MAX_AIRDROP_AMOUNT {
                return Err(format!(
                    "Invalid amount: {}. Range allowed is greater than 0 up to {}",
                    amount, MAX_AIRDROP_AMOUNT
                )
                .into());
            }
            let accounts = Accounts::open(&config.database.path)?;
            let account = accounts.airdrop(&to, amount)?;
            println!("Balance: {:.8}", account.balance);
            Ok(())
        }
        Command::Send { from, to, amount } => {
            if amount <= 0.0 {
                return Err(format!("Invalid amount: {}", amount).into());
            }
            let accounts = Accounts::open(&config.database.path)?;
            let transactions = Transactions::open(&config.database.path)?;
            let transaction = transactions.create(&accounts, &from, &to, amount)?;
            println!(
                "Created the transaction: {}",
                transaction.id.to_hex().green()
            );
            Ok(())
        }
    }
}

fn run_account(
    config: &Config,
    command: AccountCommand,
) -> Result<(), Box<dyn std::error::Error>> {
    let accounts = Accounts::open(&config.database.path)?;
    match command {
        AccountCommand::New { label } => {
            let account = accounts.create(&label)?;
            println!("Account {} created.", account.address.to_hex().green());
        }
        AccountCommand::List => {
            for account in accounts.list()? {
                println!(
                    "Address: {} Balance: {:>16.8} Label: {}",
                    account.address.to_hex().yellow(),
                    account.balance,
                    account.label()
                );
            }
        }
    }
    Ok(())
}

/// Runs the mining workers and keeps an idle timer on screen; a found block
/// resets the timer through the pool's event channel.
fn run_miner(config: &Config, threads: Option<usize>) -> Result<(), Box<dyn std::error::Error>> {
    let chain = Arc::new(Chain::open(&config.database.path)?);

    let current = chain
        .current_block()?
        .ok_or("chain is unavailable; genesis creation did not complete")?;
    println!(
        "Current block: [id:{} diff:{} hash:{}]",
        current.id,
        current.difficulty,
        current.hash.to_hex()
    );

    let threads = threads.unwrap_or_else(|| config.miner.effective_threads());
    let pool = MinerPool::spawn(chain, threads)?;
    println!(
        "Started miner engine with {} threads.",
        pool.thread_count()
    );

    let mut idle_seconds: u64 = 0;
    loop {
        match pool.events().recv_timeout(Duration::from_secs(1)) {
            Ok(found) => {
                idle_seconds = 0;
                println!(
                    "\r{} block {} [H:{} T:{}]",
                    "Mined".green().bold(),
                    found.id,
                    found.hash.to_hex(),
                    found.thread_id
                );
            }
            Err(RecvTimeoutError::Timeout) => {
                idle_seconds += 1;
                print!(
                    "\r{}:{:02}:{:02}",
                    idle_seconds / 3600,
                    idle_seconds / 60 % 60,
                    idle_seconds % 60
                );
                std::io::stdout().flush()?;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    pool.shutdown();
    Ok(())
}

fn run_node(config: &Config, port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let chain = Arc::new(Chain::open(&config.database.path)?);
    let port = port.unwrap_or(config.network.p2p_port);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        PeerListener::new(chain)
            .run(port)
            .await
            .map_err(|e| e.into())
    })
}

fn run_serve(config: &Config, port: Option<u16>) -> Result<(), Box<dyn std::error::Error>> {
    let state = ApiState {
        chain: Arc::new(Chain::open(&config.database.path)?),
        accounts: Arc::new(Accounts::open(&config.database.path)?),
        transactions: Arc::new(Transactions::open(&config.database.path)?),
    };
    let port = port.unwrap_or(config.network.api_port);

    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async { run_api_server(state, port).await.map_err(|e| e.into()) })
}
