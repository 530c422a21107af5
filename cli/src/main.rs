/*
    swapify-sync | Background reconciliation engine for Swapify shared playlists.
    Copyright (C) 2025  Israel Alberto Roldan Vega

    This program is free software: you can redistribute it and/or modify
    it under the terms of the GNU Affero General Public License as published
    by the Free Software Foundation, either version 3 of the License, or
    (at your option) any later version.

    This program is distributed in the hope that it will be useful,
    but WITHOUT ANY WARRANTY; without even the implied warranty of
    MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
    GNU Affero General Public License for more details.

    You should have received a copy of the GNU Affero General Public License
    along with this program.  If not, see <https://www.gnu.org/licenses/>.
*/

mod server;

use anyhow::Context;
use clap::{Parser, Subcommand};
use dotenvy::dotenv;
use log::info;
use std::fs::File;
use std::io::Write;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;
use std::time::Duration;
use swapify_core::{
    BudgetConfig, CycleReport, Engine, EngineConfig, GatedSpotify, LogNotifier, NotificationQueue,
    RateBudget, RspotifyGateway, Store,
};
use tokio::sync::watch;

/// How often expired entries are pruned from the rate budget.
const SWEEP_EVERY: Duration = Duration::from_secs(5);

#[derive(Parser)]
#[command(name = "swapify-sync")]
#[command(about = "Keeps Swapify shared playlists in step with what members actually hear", long_about = None)]
struct Cli {
    /// SQLite database holding users, playlists and listens
    #[arg(long, global = true, env = "SWAPIFY_DATABASE_URL", default_value = "sqlite://swapify.db")]
    database_url: String,

    /// Use the 50 calls / 30 s budget for apps in development mode
    #[arg(long, global = true, env = "SWAPIFY_CONSTRAINED_BUDGET")]
    constrained_budget: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the polling scheduler and the HTTP trigger until Ctrl+C
    Serve {
        /// Address of the trigger endpoint
        #[arg(long, env = "SWAPIFY_BIND", default_value = "127.0.0.1:8787")]
        bind: SocketAddr,

        /// Shared secret expected in the x-swapify-secret header. Empty disables the trigger.
        #[arg(long, env = "SWAPIFY_TRIGGER_SECRET", default_value = "", hide_env_values = true)]
        trigger_secret: String,

        /// Overrides the poll interval from the environment
        #[arg(long)]
        poll_interval_ms: Option<u64>,
    },
    /// Runs a single cycle and prints its counters
    RunOnce {
        /// Output the cycle report to a JSON file
        #[arg(long)]
        json: Option<String>,
    },
    /// Repairs drift between local playlists and Spotify
    Sync {
        /// Only this playlist (local id)
        #[arg(long, short = 'p')]
        playlist: Option<String>,
    },
    /// Creates the database schema and exits
    InitDb,
}

#[tokio::main]
async fn main() {
    if dotenv().is_err() {
        // Silently ignore
    }

    env_logger::init();

    let cli = Cli::parse();

    let result = match &cli.command {
        Commands::Serve {
            bind,
            trigger_secret,
            poll_interval_ms,
        } => handle_serve(&cli, *bind, trigger_secret, *poll_interval_ms).await,
        Commands::RunOnce { json } => handle_run_once(&cli, json.as_deref()).await,
        Commands::Sync { playlist } => handle_sync(&cli, playlist.as_deref()).await,
        Commands::InitDb => handle_init_db(&cli).await,
    };

    if let Err(e) = result {
        eprintln!();
        eprintln!("[ERROR] {:#}", e);
        process::exit(1);
    }
}

async fn build_engine(cli: &Cli, poll_interval_ms: Option<u64>) -> anyhow::Result<Arc<Engine>> {
    let mut config = EngineConfig::from_env().context("Invalid SWAPIFY_* configuration")?;
    if cli.constrained_budget {
        config.budget = BudgetConfig::constrained();
    }
    if let Some(ms) = poll_interval_ms {
        config.poll_interval = Duration::from_millis(ms);
    }
    config.validate()?;

    let store = Store::connect(&cli.database_url)
        .await
        .with_context(|| format!("Cannot open database {}", cli.database_url))?;

    let budget = Arc::new(RateBudget::new(config.budget));
    budget.spawn_sweeper(SWEEP_EVERY);
    let api = GatedSpotify::new(Arc::new(RspotifyGateway::new()), budget, config.budget_max_wait);
    let (notifications, _worker) = NotificationQueue::spawn(Arc::new(LogNotifier), config.notification_capacity);

    Ok(Arc::new(Engine::new(store, api, notifications, config)))
}

async fn handle_serve(
    cli: &Cli,
    bind: SocketAddr,
    trigger_secret: &str,
    poll_interval_ms: Option<u64>,
) -> anyhow::Result<()> {
    let engine = build_engine(cli, poll_interval_ms).await?;
    if trigger_secret.is_empty() {
        info!("No trigger secret set, POST /api/cycle will always answer 401");
    }

    let (stop_tx, stop_rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl+C received, shutting down");
        }
        let _ = stop_tx.send(true);
    });

    let scheduler = tokio::spawn(Arc::clone(&engine).run_forever(stopped(stop_rx.clone())));
    let state = server::AppState::new(engine, trigger_secret);
    server::serve(state, bind, stopped(stop_rx)).await?;
    scheduler.await.context("Scheduler task failed")?;

    println!("Stopped.");
    Ok(())
}

async fn stopped(mut rx: watch::Receiver<bool>) {
    while !*rx.borrow() {
        if rx.changed().await.is_err() {
            break;
        }
    }
}

async fn handle_run_once(cli: &Cli, json_path: Option<&str>) -> anyhow::Result<()> {
    let engine = build_engine(cli, None).await?;
    println!("Running one reconciliation cycle...");

    let report = engine
        .run_cycle()
        .await
        .context("Another cycle is already running")?;
    print_report(&report);

    if let Some(path) = json_path {
        let mut file = File::create(path).with_context(|| format!("Failed to create file '{}'", path))?;
        let json_content = serde_json::to_string_pretty(&report)?;
        file.write_all(json_content.as_bytes())
            .context("Failed to write report to file")?;
        println!();
        println!("[SAVED] Report saved to: {}", path);
    }
    Ok(())
}

fn print_report(report: &CycleReport) {
    println!();
    println!("---------------------------------------------------");
    println!("CYCLE REPORT{}", if report.aborted { " (ABORTED)" } else { "" });
    println!("---------------------------------------------------");
    println!("Users Polled:        {}", report.users_polled);
    println!("Listens Recorded:    {}", report.listens_recorded);
    println!("Skips Detected:      {}", report.skips_detected);
    println!("Reactions Inferred:  {}", report.reactions_inferred);
    println!("Tracks Scheduled:    {}", report.tracks_scheduled);
    println!("Tracks Removed:      {}", report.tracks_removed);
    println!("Tracks Archived:     {}", report.tracks_archived);
    println!("Tokens Invalidated:  {}", report.tokens_invalidated);
    println!("Failures:            {}", report.failures());
    println!("---------------------------------------------------");
}

async fn handle_sync(cli: &Cli, playlist: Option<&str>) -> anyhow::Result<()> {
    let engine = build_engine(cli, None).await?;
    match playlist {
        Some(id) => println!("Syncing playlist {} with Spotify...", id),
        None => println!("Syncing every playlist with Spotify..."),
    }

    let report = engine
        .run_sync(playlist)
        .await
        .context("A cycle is already running")?;

    println!();
    println!("---------------------------------------------------");
    println!("SYNC COMPLETE");
    println!("---------------------------------------------------");
    println!("Adopted from Spotify:  {}", report.inserted);
    println!("Retired locally:       {}", report.removed);
    println!("Removals retried:      {}", report.retried);
    println!("Remote failures:       {}", report.remote_failures);
    println!("---------------------------------------------------");
    Ok(())
}

async fn handle_init_db(cli: &Cli) -> anyhow::Result<()> {
    Store::connect(&cli.database_url)
        .await
        .with_context(|| format!("Cannot open database {}", cli.database_url))?;
    println!("[OK] Database ready at {}", cli.database_url);
    Ok(())
}
