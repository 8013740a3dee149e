//! Market shaper - main entry point
//!
//! Two subcommands:
//! - run: start the agent (background makers + operator console on stdin)
//! - exec: run a single operator command against the configured exchange

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::watch;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use market_shaper::commands::CommandProcessor;
use market_shaper::config::Config;
use market_shaper::exchange::paper::PaperExchange;
use market_shaper::exchange::{registry, TradingApi};
use market_shaper::ledger::Ledger;
use market_shaper::maker::scheduler::Scheduler;
use market_shaper::maker::MakerContext;
use market_shaper::notify::Notifier;
use market_shaper::params::TradeParams;
use market_shaper::rates::RateInfoClient;

#[derive(Parser, Debug)]
#[command(name = "market-shaper")]
#[command(about = "Automated market-making and order-book-shaping agent", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the agent with the operator console attached
    Run {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.json")]
        config: String,

        /// Trade against the in-memory paper exchange
        #[arg(long)]
        paper: bool,
    },

    /// Execute one operator command and exit
    Exec {
        /// Path to configuration file
        #[arg(short, long, default_value = "config.json")]
        config: String,

        /// The command, e.g. `exec -- balances`
        #[arg(trailing_var_arg = true, required = true)]
        command: Vec<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    dotenv::dotenv().ok();

    let file_appender = tracing_appender::rolling::daily("logs", "market-shaper.log");
    let (file_writer, _guard) = tracing_appender::non_blocking(file_appender);
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(if cli.verbose { "debug" } else { "info" })
    });
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(file_writer),
        )
        .init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to build tokio runtime")?;

    match cli.command {
        Commands::Run { config, paper } => runtime.block_on(run(config, paper)),
        Commands::Exec { config, command } => runtime.block_on(exec(config, command.join(" "))),
    }
}

/// Wires the adapter, ledger, params and caches into one context
async fn build_context(config: &Config, force_paper: bool) -> Result<Arc<MakerContext>> {
    let paper = force_paper || config.exchange == "paper";

    let (api, rates): (Arc<dyn TradingApi>, Arc<RateInfoClient>) = if paper {
        let exchange = PaperExchange::new(config.pair.clone(), dec!(100), dec!(0.1), 50, dec!(5));
        exchange.deposit(&config.pair.base, dec!(1000));
        exchange.deposit(&config.pair.quote, dec!(100000));
        let mut usd = HashMap::new();
        usd.insert(config.pair.base.clone(), dec!(100));
        (
            Arc::new(exchange),
            Arc::new(RateInfoClient::with_static(usd)),
        )
    } else {
        (
            registry::create(&config.exchange, &config.credentials())?,
            Arc::new(RateInfoClient::new()),
        )
    };

    let markets = api
        .load_markets()
        .await
        .context("Failed to load markets")?;
    let Some(market) = markets.get(&config.pair.symbol()).cloned() else {
        // unrecoverable misconfiguration
        bail!("pair {} is not listed on {}", config.pair, api.name());
    };

    let state_dir = PathBuf::from(&config.state_dir);
    let ledger = Arc::new(Ledger::open(state_dir.join("ledger.db"))?);
    let params_path = state_dir.join("params.json");
    let params = TradeParams::load(&params_path)?;

    Ok(Arc::new(MakerContext::new(
        config.pair.clone(),
        api,
        ledger,
        rates,
        Arc::new(Notifier::new()),
        market,
        params,
        Some(params_path),
    )))
}

async fn run(config_path: String, paper: bool) -> Result<()> {
    let config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;

    let ctx = build_context(&config, paper).await?;
    let processor = CommandProcessor::new(ctx.clone(), config.amount_to_confirm_usd);

    info!(
        "market-shaper starting: {} on {}{}",
        ctx.pair,
        ctx.api.name(),
        if paper { " (paper)" } else { "" }
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = Scheduler::new(ctx.clone()).spawn(shutdown_rx);

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    info!("operator console ready, type 'help' for commands");

    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => {
                        let line = line.trim();
                        if line.is_empty() {
                            continue;
                        }
                        if line == "quit" || line == "exit" {
                            break;
                        }
                        let outcome = processor.handle(line).await;
                        println!("{}", outcome.reply);
                        if let Some(notify) = outcome.notify {
                            ctx.notifier.notify(outcome.notify_type, &notify);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        error!("console read failed: {}", e);
                        break;
                    }
                }
            }
            result = tokio::signal::ctrl_c() => {
                if let Err(e) = result {
                    error!("signal handler failed: {}", e);
                }
                info!("shutting down...");
                break;
            }
        }
    }

    // stop further iterations; in-flight ticks finish on their own
    let _ = shutdown_tx.send(true);
    for handle in handles {
        if let Err(e) = handle.await {
            warn!("background task ended abnormally: {}", e);
        }
    }

    let params = ctx.snapshot_params().await;
    if let Err(e) = params.save(PathBuf::from(&config.state_dir).join("params.json")) {
        warn!("could not persist trade params on shutdown: {}", e);
    }
    info!("market-shaper stopped");
    Ok(())
}

async fn exec(config_path: String, command: String) -> Result<()> {
    let config = Config::from_file(&config_path)
        .with_context(|| format!("Failed to load config from {}", config_path))?;
    let ctx = build_context(&config, false).await?;
    let processor = CommandProcessor::new(ctx, config.amount_to_confirm_usd);

    let outcome = processor.handle(&command).await;
    println!("{}", outcome.reply);
    Ok(())
}
