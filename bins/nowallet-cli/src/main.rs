//! nowallet — brainwallet-seeded HD Bitcoin wallet for Electrum servers.
//!
//! Derives the wallet from an email-like salt and a passphrase, discovers
//! its addresses on a server, optionally sends one payment, and then keeps
//! printing the wallet state as server notifications arrive.

mod settings;

use std::future::Future;
use std::io::{self, Write};
use std::path::PathBuf;
use std::process;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use bitcoin::{Amount, Denomination};
use clap::{Args, Parser, Subcommand};
use nowallet_core::{LinkError, ServerLink};
use nowallet_network::{ClientConfig, ElectrumClient};
use nowallet_wallet::{Seed, SeedParams, Wallet, WalletConfig, WalletError};
use rand::seq::SliceRandom;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, error, info, warn};
use zeroize::Zeroizing;

use settings::Settings;

/// Brainwallet-seeded HD Bitcoin wallet.
#[derive(Parser, Debug)]
#[command(name = "nowallet", version, about = "Brainwallet-seeded HD Bitcoin wallet")]
struct Cli {
    /// Settings file (default: <config_dir>/nowallet/nowallet.toml)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Candidate server as host or host:port (repeatable)
    #[arg(long = "server", value_name = "HOST[:PORT]")]
    servers: Vec<String>,

    /// Use Bitcoin testnet
    #[arg(long, conflicts_with = "mainnet")]
    testnet: bool,

    /// Use Bitcoin mainnet
    #[arg(long)]
    mainnet: bool,

    /// BIP-44 account number
    #[arg(long)]
    account: Option<u32>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long)]
    log_level: Option<String>,

    /// Log output format ("text" or "json")
    #[arg(long)]
    log_format: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Discover the wallet and follow it live (default).
    Watch,
    /// Send one payment, then follow the wallet live.
    Spend(SpendArgs),
}

#[derive(Args, Debug)]
struct SpendArgs {
    /// Destination address; prompted for when omitted.
    #[arg(long)]
    to: Option<String>,

    /// Amount in coins (e.g. 0.001); prompted for when omitted.
    #[arg(long)]
    amount: Option<String>,
}

impl Cli {
    /// Apply command-line overrides on top of file/environment settings.
    fn apply(&self, settings: &mut Settings) {
        if !self.servers.is_empty() {
            settings.servers = self.servers.clone();
        }
        if self.testnet {
            settings.network = "testnet".to_string();
        } else if self.mainnet {
            settings.network = "mainnet".to_string();
        }
        if let Some(account) = self.account {
            settings.account = account;
        }
        if let Some(level) = &self.log_level {
            settings.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            settings.log_format = format.clone();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    cli.apply(&mut settings);

    init_logging(&settings.log_level, &settings.log_format);

    let network = settings.network()?;
    if settings.servers.is_empty() {
        bail!("No servers configured (use --server or the settings file)");
    }
    info!("nowallet v{}", env!("CARGO_PKG_VERSION"));
    info!(%network, account = settings.account, servers = settings.servers.len(), "starting");

    let wallet_config = WalletConfig {
        network,
        account: settings.account,
        request_timeout: settings.request_timeout(),
        ..WalletConfig::default()
    };
    let client_config = ClientConfig {
        connect_timeout: settings.connect_timeout(),
        request_timeout: settings.request_timeout(),
        ..ClientConfig::default()
    };

    let salt = prompt_line("Enter email (salt)")?;
    let passphrase = prompt_password("Enter passphrase")?;
    let seed = derive_seed(salt, passphrase, wallet_config.seed_params).await?;

    let client = match connect_any(&settings.servers, &client_config).await {
        Ok(client) => client,
        Err(e) => {
            error!(error = %e, "could not connect to any server");
            process::exit(1);
        }
    };
    let link: Arc<dyn ServerLink> = Arc::new(client);
    let wallet = Wallet::from_seed(&seed, link, wallet_config)?;
    drop(seed);

    let report = wallet.discover().await.context("Address discovery failed")?;
    info!(
        spend_scanned = report.spend.scanned,
        change_scanned = report.change.scanned,
        "discovery complete"
    );
    println!("{}", wallet.summary()?);

    if let Some(Command::Spend(args)) = &cli.command {
        send_payment(&wallet, args).await?;
        println!("{}", wallet.summary()?);
    }

    follow(&wallet, tokio::signal::ctrl_c()).await
}

/// Run live sync until `shutdown` completes, printing the summary after
/// every event.
async fn follow<F>(wallet: &Wallet, shutdown: F) -> Result<()>
where
    F: Future<Output = io::Result<()>>,
{
    let mut events = wallet.subscribe_events();
    let mut sync = tokio::spawn(wallet.live_sync().run());
    info!("following wallet (Ctrl+C to stop)");

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    debug!(?event, "wallet event");
                    println!("{}", wallet.summary()?);
                }
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "missed wallet events"),
                Err(RecvError::Closed) => return Ok(()),
            },
            result = &mut sync => {
                return match result.context("live sync task panicked")? {
                    Ok(never) => match never {},
                    Err(e) => Err(e).context("Live sync stopped"),
                };
            }
            _ = &mut shutdown => {
                info!("received shutdown signal");
                sync.abort();
                return Ok(());
            }
        }
    }
}

/// Check the amount against the discovered balance and run one spend.
async fn send_payment(wallet: &Wallet, args: &SpendArgs) -> Result<()> {
    let destination = match &args.to {
        Some(to) => to.clone(),
        None => prompt_line("Destination address")?,
    };
    let amount_text = match &args.amount {
        Some(amount) => amount.clone(),
        None => prompt_line("Amount to send")?,
    };
    let amount = parse_amount(&amount_text)?;

    let balance = wallet.balance();
    if amount.to_sat() > balance {
        bail!(
            "Amount {} exceeds balance {}",
            amount.display_in(Denomination::Bitcoin),
            Amount::from_sat(balance).display_in(Denomination::Bitcoin)
        );
    }

    let receipt = wallet
        .spend(&destination, amount.to_sat())
        .await
        .context("Spend failed")?;

    println!("\n=== TRANSACTION SENT ===");
    println!("TxID: {}", receipt.txid);
    println!("To: {destination}");
    println!("Amount: {}", Amount::from_sat(receipt.amount).display_in(Denomination::Bitcoin));
    println!("Fee: {} sat", receipt.fee);
    if receipt.change > 0 {
        println!("Change: {} sat", receipt.change);
    }
    Ok(())
}

/// Parse a coin amount such as `0.001`.
fn parse_amount(text: &str) -> Result<Amount> {
    let amount = Amount::from_str_in(text.trim(), Denomination::Bitcoin)
        .with_context(|| format!("Invalid amount: {text}"))?;
    if amount == Amount::ZERO {
        bail!("Amount must be greater than zero");
    }
    Ok(amount)
}

/// Stretch the seed material on a blocking thread.
async fn derive_seed(salt: String, passphrase: Zeroizing<String>, params: SeedParams) -> Result<Seed> {
    info!("deriving seed (this takes a few seconds)");
    let seed = tokio::task::spawn_blocking(move || Seed::derive(&salt, &passphrase, &params))
        .await
        .context("Seed derivation task failed")??;
    Ok(seed)
}

/// Try the candidate servers in random order until one connects. Fails with
/// the last server's error when none does.
async fn connect_any(servers: &[String], config: &ClientConfig) -> Result<ElectrumClient, WalletError> {
    let mut candidates = servers.to_vec();
    candidates.shuffle(&mut rand::thread_rng());

    let mut last_error = LinkError::Connect("no servers configured".to_string());
    for server in candidates {
        match ElectrumClient::connect(&server, config).await {
            Ok(client) => {
                info!(server = %client.server(), "connected");
                return Ok(client);
            }
            Err(e) => {
                warn!(%server, error = %e, "server unavailable");
                last_error = e;
            }
        }
    }
    Err(WalletError::ConnectionFailed(last_error))
}

fn prompt_line(prompt: &str) -> Result<String> {
    print!("{prompt}: ");
    io::stdout().flush().context("Failed to flush stdout")?;
    let mut line = String::new();
    io::stdin().read_line(&mut line).context("Failed to read input")?;
    let line = line.trim().to_string();
    if line.is_empty() {
        bail!("{prompt} must not be empty");
    }
    Ok(line)
}

fn prompt_password(prompt: &str) -> Result<Zeroizing<String>> {
    rpassword::prompt_password(format!("{prompt}: "))
        .map(Zeroizing::new)
        .context("Failed to read passphrase")
}

/// Initialize tracing subscriber with the given log level and output format.
///
/// Pass `format = "json"` for structured JSON output. Any other value
/// defaults to human-readable text.
fn init_logging(level_str: &str, format: &str) {
    use tracing_subscriber::filter::EnvFilter;
    use tracing_subscriber::fmt;
    use tracing_subscriber::prelude::*;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level_str));

    if format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json().with_writer(io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_level(true).with_writer(io::stderr))
            .init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use nowallet_core::types::Chain;
    use nowallet_tests::helpers::{MockServer, reference_wallet, wallet_address};

    #[test]
    fn parses_coin_amounts() {
        assert_eq!(parse_amount("0.001").unwrap().to_sat(), 100_000);
        assert_eq!(parse_amount(" 1.5 ").unwrap().to_sat(), 150_000_000);
        assert!(parse_amount("0").is_err());
        assert!(parse_amount("abc").is_err());
        assert!(parse_amount("0.000000001").is_err());
    }

    #[test]
    fn flags_override_settings() {
        let cli = Cli::parse_from([
            "nowallet",
            "--server",
            "a.example:50001",
            "--server",
            "b.example",
            "--mainnet",
            "--account",
            "3",
            "spend",
            "--amount",
            "0.5",
        ]);
        let mut settings = Settings::default();
        cli.apply(&mut settings);

        assert_eq!(settings.servers, vec!["a.example:50001", "b.example"]);
        assert_eq!(settings.network, "mainnet");
        assert_eq!(settings.account, 3);
        assert!(matches!(
            cli.command,
            Some(Command::Spend(SpendArgs { to: None, amount: Some(_) }))
        ));
    }

    #[tokio::test]
    async fn unreachable_servers_are_connection_failed() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let err = connect_any(&[addr], &ClientConfig::default()).await.unwrap_err();
        assert!(matches!(err, WalletError::ConnectionFailed(LinkError::Connect(_))));
    }

    #[tokio::test]
    async fn empty_server_list_is_connection_failed() {
        let err = connect_any(&[], &ClientConfig::default()).await.unwrap_err();
        assert!(matches!(err, WalletError::ConnectionFailed(LinkError::Connect(_))));
    }

    #[tokio::test]
    async fn follow_stops_on_shutdown_amid_events() {
        let server = Arc::new(MockServer::new());
        let wallet = reference_wallet(&server);
        wallet.discover().await.unwrap();

        for index in 0..5 {
            let address = wallet_address(Chain::Spend, index);
            server.fund(&address, 1_000, 0);
            server.notify(&address);
        }
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        stop_tx.send(()).unwrap();

        let shutdown = async move {
            let _ = stop_rx.await;
            Ok(())
        };
        let result = tokio::time::timeout(Duration::from_secs(5), follow(&wallet, shutdown)).await;
        assert!(result.unwrap().is_ok());
    }

    #[tokio::test]
    async fn follow_reports_a_closed_notification_stream() {
        let server = Arc::new(MockServer::new());
        let wallet = reference_wallet(&server);
        wallet.discover().await.unwrap();
        server.close_notifications();

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            follow(&wallet, std::future::pending::<io::Result<()>>()),
        )
        .await
        .unwrap();
        assert!(result.is_err());
    }

    #[test]
    fn network_flags_conflict() {
        assert!(Cli::try_parse_from(["nowallet", "--testnet", "--mainnet"]).is_err());
    }

    #[test]
    fn defaults_to_watch_without_overrides() {
        let cli = Cli::parse_from(["nowallet"]);
        let mut settings = Settings::default();
        cli.apply(&mut settings);
        assert!(cli.command.is_none());
        assert_eq!(settings, Settings::default());
    }
}
