//! GuessRounds operator CLI
//!
//! Every command opens the persisted engine, applies one operation and exits,
//! except `run-local`, which keeps a local VRF oracle running.

use clap::{Parser, Subcommand};
use guessrounds::{
    config::{GuessRoundsConfig, OracleProvider},
    errors::{ConfigurationError, GuessRoundsResult},
    games::VrfParams,
    Address, EngineFactory, EngineHandle, RandomSeed, RoundPhase, SystemClock,
};
use serde::Serialize;
use std::{path::PathBuf, sync::Arc, time::Duration};

/// GuessRounds CLI
#[derive(Parser)]
#[command(name = "guessrounds")]
#[command(about = "Pari-mutuel number guessing rounds backed by verifiable randomness")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Data directory override
    #[arg(short, long)]
    data_dir: Option<String>,

    /// Address the command is issued as (defaults to the configured owner)
    #[arg(long)]
    caller: Option<Address>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the store with the configured settings (no-op if it exists)
    Init,

    /// Show phase, current round and settings
    Status,

    /// Ask the oracle for the next round's randomness
    RequestRound {
        /// Seconds to wait for activation when a local oracle is configured
        #[arg(long, default_value = "10")]
        wait_secs: u64,
    },

    /// Deliver a seed for a pending request (deferred oracle mode)
    Fulfill {
        #[arg(long)]
        request_id: u64,

        /// Decimal integer or 0x-prefixed 32-byte hex word
        #[arg(long)]
        seed: RandomSeed,
    },

    /// Start the next round with an explicit target, bypassing the oracle
    StartManual {
        #[arg(long)]
        target: u32,
    },

    /// Submit a guess for the current round
    Guess {
        #[arg(long)]
        number: u32,

        /// Stake in wei; defaults to the current entry fee
        #[arg(long)]
        stake: Option<u128>,
    },

    /// Close and settle the current round
    Settle,

    /// List settled rounds
    Winners,

    /// List guesses of a round (current round by default)
    Guesses {
        #[arg(long)]
        round: Option<u64>,
    },

    /// Block new guesses
    Pause,

    /// Allow guesses again
    Resume,

    SetFee {
        #[arg(long)]
        wei: u128,
    },

    SetDuration {
        #[arg(long)]
        seconds: u64,
    },

    SetVrfParams {
        #[arg(long)]
        coordinator: String,
        #[arg(long)]
        key_hash: String,
        #[arg(long)]
        subscription_id: u64,
        #[arg(long, default_value = "250000")]
        callback_gas_limit: u32,
        #[arg(long, default_value = "3")]
        request_confirmations: u16,
    },

    /// Withdraw the accrued operator balance
    Withdraw,

    /// Run rounds back to back against an in-process VRF oracle
    RunLocal {
        /// Number of rounds to run
        #[arg(short, long, default_value = "1")]
        rounds: u32,

        /// Wait for each round to end and settle it (needed for more than one round)
        #[arg(long)]
        settle: bool,
    },
}

#[tokio::main]
async fn main() -> GuessRoundsResult<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => GuessRoundsConfig::load_from_file(path)?,
        None => GuessRoundsConfig::default(),
    };
    if let Some(dir) = cli.data_dir.clone() {
        config.storage.data_directory = dir;
    }
    if matches!(cli.command, Commands::RunLocal { .. }) {
        config.oracle.provider = OracleProvider::LocalVrf;
    }

    let default_level = if cli.verbose {
        "debug"
    } else {
        config.monitoring.log_level.as_filter()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| format!("guessrounds={}", default_level).into()),
        )
        .init();

    let caller = match cli.caller {
        Some(caller) => caller,
        None => config
            .owner()
            .map_err(|e| ConfigurationError::ValidationFailed(e.to_string()))?,
    };

    let handle = EngineFactory::create(&config, Arc::new(SystemClock)).await?;
    let result = run_command(&handle, cli.command, caller).await;
    handle.shutdown();
    result
}

async fn run_command(handle: &EngineHandle, command: Commands, caller: Address) -> GuessRoundsResult<()> {
    let service = &handle.service;

    match command {
        Commands::Init => {
            println!("engine ready, owner {}", service.owner().await);
            print_json(&service.status().await)
        }
        Commands::Status => print_json(&service.status().await),
        Commands::RequestRound { wait_secs } => {
            let request = service.request_next_round(caller).await?;
            print_json(&request)?;
            if handle.worker.is_some() {
                match service
                    .wait_for_activation(request.request_id, Duration::from_secs(wait_secs))
                    .await
                {
                    Some(round) => print_json(&round)?,
                    None => println!("request {} still pending", request.request_id),
                }
            }
            Ok(())
        }
        Commands::Fulfill { request_id, seed } => {
            let fulfillment = service.on_fulfilled(request_id, seed).await?;
            println!("{:?}", fulfillment);
            if let Some(round) = service.current_round().await {
                print_json(&round)?;
            }
            Ok(())
        }
        Commands::StartManual { target } => {
            let round = service.admin_start_next_round_manual(caller, target).await?;
            print_json(&round)
        }
        Commands::Guess { number, stake } => {
            let stake = match stake {
                Some(stake) => stake,
                None => service.entry_fee_wei().await,
            };
            let index = service.submit_guess(caller, number, stake).await?;
            println!("guess #{} recorded for round {}", index, service.current_round_id().await);
            Ok(())
        }
        Commands::Settle => {
            let outcome = service.end_and_settle(caller).await?;
            print_json(&outcome)
        }
        Commands::Winners => print_json(&service.winners().await),
        Commands::Guesses { round } => {
            let round_id = match round {
                Some(id) => id,
                None => service.current_round_id().await,
            };
            print_json(&service.get_guesses(round_id).await)
        }
        Commands::Pause => service.set_paused(caller, true).await,
        Commands::Resume => service.set_paused(caller, false).await,
        Commands::SetFee { wei } => service.set_entry_fee_wei(caller, wei).await,
        Commands::SetDuration { seconds } => service.set_round_duration(caller, seconds).await,
        Commands::SetVrfParams {
            coordinator,
            key_hash,
            subscription_id,
            callback_gas_limit,
            request_confirmations,
        } => {
            let params = VrfParams {
                coordinator,
                key_hash,
                subscription_id,
                callback_gas_limit,
                request_confirmations,
            };
            service.set_vrf_params(caller, params).await
        }
        Commands::Withdraw => {
            let amount = service.withdraw_operator_balance(caller).await?;
            println!("withdrew {} wei", amount);
            Ok(())
        }
        Commands::RunLocal { rounds, settle } => run_local(handle, caller, rounds, settle).await,
    }
}

async fn run_local(handle: &EngineHandle, caller: Address, rounds: u32, settle: bool) -> GuessRoundsResult<()> {
    let service = &handle.service;
    if let Some(key) = &handle.vrf_public_key {
        println!("local VRF key: {}", key);
    }

    for _ in 0..rounds {
        let request = service.request_next_round(caller).await?;
        let Some(round) = service
            .wait_for_activation(request.request_id, Duration::from_secs(30))
            .await
        else {
            tracing::warn!(request_id = request.request_id, "Oracle did not answer; stopping");
            break;
        };
        println!(
            "round {} active until {} (commit {})",
            round.id, round.end_time, round.rng_commit
        );

        if !settle {
            break;
        }

        let wait = round.seconds_remaining(service.now());
        tracing::info!(round_id = round.id, wait, "Waiting for round to end");
        tokio::time::sleep(Duration::from_secs(wait)).await;
        while service.phase().await == RoundPhase::Active {
            tokio::time::sleep(Duration::from_millis(250)).await;
        }

        let outcome = service.end_and_settle(caller).await?;
        print_json(&outcome)?;
    }
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> GuessRoundsResult<()> {
    let text = serde_json::to_string_pretty(value)?;
    println!("{}", text);
    Ok(())
}
