//! mental-table: demo table for mental-poker
//!
//! every peer runs in this process over `LocalNetwork`, with the same
//! driver a networked peer would use.
//!
//! ## usage
//!
//! ```bash
//! # deal one round between three peers with small primes
//! mental-table deal --peers 3 --bits 512 --secret test
//!
//! # settings from a toml file (written with defaults if missing)
//! mental-table deal --config table.toml --rounds 3
//!
//! # sequential squarings per second for 2048-bit primes
//! mental-table calibrate --bits 2048
//!
//! # reuse a measured rate instead of calibrating per peer
//! mental-table deal --bits 1024 --secret test --rate 250000
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::OsRng;
use tracing::info;

use mental_poker::timelock::spawn_calibration;
use mental_poker::{
    GameConfig, LocalNetwork, PuzzleModulus, RoundDriver, Session, SigningIdentity, SquaringRate,
};

#[derive(Parser, Debug)]
#[command(name = "mental-table")]
#[command(about = "deal mental poker between in-process peers", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Deal rounds and print every peer's hand
    Deal {
        /// TOML config file, created with defaults if missing
        #[arg(short, long)]
        config: Option<PathBuf>,

        /// Peers at the table
        #[arg(short, long, default_value_t = 3)]
        peers: usize,

        /// Rounds to play
        #[arg(short, long, default_value_t = 1)]
        rounds: u32,

        /// Bits per shared-modulus prime
        #[arg(long)]
        bits: Option<u64>,

        /// Session secret keying the reference deck
        #[arg(long, env = "MENTAL_TABLE_SECRET")]
        secret: Option<String>,

        /// Time-lock delay for escrowed keys (seconds)
        #[arg(long)]
        delay_secs: Option<u64>,

        /// Per-message peer timeout (ms)
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Known squarings per second; skips per-peer calibration
        #[arg(long)]
        rate: Option<u64>,
    },

    /// Measure sequential squarings per second
    Calibrate {
        /// Bits per shared-modulus prime; puzzles are measured on a wider modulus
        #[arg(long, default_value_t = mental_poker::DEFAULT_BIT_LENGTH)]
        bits: u64,

        /// Squarings to time
        #[arg(long, default_value_t = 100_000)]
        squarings: u64,

        /// Report the puzzle size for this delay (seconds)
        #[arg(long, default_value_t = 30)]
        delay_secs: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "mental_table=info,mental_poker=info".into()),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Deal { config, peers, rounds, bits, secret, delay_secs, timeout_ms, rate } => {
            let mut table = match config {
                Some(path) => load_or_create(&path)?,
                None => GameConfig { session_secret: "mental-table".into(), ..Default::default() },
            };
            if let Some(bits) = bits {
                table.bit_length = bits;
            }
            if let Some(secret) = secret {
                table.session_secret = secret;
            }
            if let Some(delay) = delay_secs {
                table.timelock_delay_secs = delay;
            }
            if let Some(timeout) = timeout_ms {
                table.peer_timeout_ms = timeout;
            }
            deal(table, peers, rounds, rate.map(SquaringRate::new)).await
        }
        Commands::Calibrate { bits, squarings, delay_secs } => calibrate(bits, squarings, delay_secs).await,
    }
}

fn load_or_create(path: &Path) -> Result<GameConfig> {
    if path.exists() {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config file '{}'", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing TOML config '{}'", path.display()))
    } else {
        let config = GameConfig { session_secret: "mental-table".into(), ..Default::default() };
        let text = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
        fs::write(path, text).with_context(|| format!("writing default config to '{}'", path.display()))?;
        info!("wrote default config to {}", path.display());
        Ok(config)
    }
}

async fn deal(config: GameConfig, peers: usize, rounds: u32, rate: Option<SquaringRate>) -> Result<()> {
    config.validate().context("invalid table configuration")?;
    info!("dealing {} round(s) between {} peers, {}-bit primes", rounds, peers, config.bit_length);

    let identities: Vec<SigningIdentity> = (0..peers).map(|_| SigningIdentity::generate(&mut OsRng)).collect();
    let order: Vec<_> = identities.iter().map(SigningIdentity::peer_id).collect();
    let links = LocalNetwork::mesh(&order);

    let mut handles = Vec::with_capacity(peers);
    for (identity, link) in identities.iter().cloned().zip(links) {
        let mut session = Session::new(config.clone(), identity, order.clone())?;
        for other in &identities {
            if other.peer_id() != session.local() {
                session.register_peer(other.peer_id(), other.verifying_key());
            }
        }
        let mut driver = RoundDriver::new(session, link)?;
        if let Some(rate) = rate {
            driver.session_mut().set_squaring_rate(rate);
        }

        handles.push(tokio::spawn(async move {
            driver.establish_modulus().await?;
            let mut outcomes = Vec::with_capacity(rounds as usize);
            for _ in 0..rounds {
                outcomes.push(driver.run_round().await?);
            }
            Ok::<_, mental_poker::Error>(outcomes)
        }));
    }

    for (seat, (handle, peer)) in handles.into_iter().zip(&order).enumerate() {
        let outcomes = handle
            .await
            .context("peer task panicked")?
            .with_context(|| format!("seat {} ({})", seat, peer))?;

        for outcome in outcomes {
            let board: Vec<String> = outcome.board.iter().map(ToString::to_string).collect();
            println!(
                "round {} seat {} [{}]: {} {}   board: {}",
                outcome.round,
                seat,
                peer,
                outcome.hand[0],
                outcome.hand[1],
                board.join(" ")
            );
        }
    }
    Ok(())
}

async fn calibrate(bits: u64, squarings: u64, delay_secs: u64) -> Result<()> {
    info!("generating puzzle primes for {}-bit shared primes", bits);
    let modulus = tokio::task::spawn_blocking(move || PuzzleModulus::generate(bits, &mut OsRng))
        .await
        .context("prime generation panicked")??;

    let rate = spawn_calibration(modulus.n().clone(), squarings).await?;
    println!("{}-bit puzzle modulus: {} squarings/s", modulus.bits(), rate.per_second());
    println!(
        "{}s delay: {} iterations",
        delay_secs,
        rate.iterations_for(Duration::from_secs(delay_secs))
    );
    Ok(())
}
