use clap::{Parser, Subcommand};
use folkhart_client::config::ClientConfig;
use folkhart_client::{connect, Session, Startup};
use folkhart_engine::countdown::format_secs;
use folkhart_engine::{spawn_driver, Wallet};
use folkhart_protocol::{RunKind, RunMode, StartRunRequest};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Parser)]
#[command(name = "folkhart", version, about = "Folkhart adventure client")]
struct Cli {
    /// YAML config file (defaults to ~/.folkhart/config.yaml when present).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[arg(long, global = true)]
    base_url: Option<String>,

    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Show both run slots and any unclaimed rewards.
    Status,
    /// Start a dungeon run or an idle-farm session.
    Start {
        #[arg(long)]
        kind: RunKind,
        #[arg(long, default_value = "idle")]
        mode: RunMode,
        #[arg(long)]
        dungeon: Option<String>,
    },
    /// Spend gems to finish the running run now.
    FastFinish {
        #[arg(long)]
        kind: RunKind,
        #[arg(long)]
        cost: i64,
        /// Current gem balance.
        #[arg(long)]
        gems: i64,
    },
    /// Acknowledge an unclaimed reward.
    Dismiss {
        #[arg(long)]
        kind: RunKind,
    },
    /// Keep the client running: tick, poll and complete runs until Ctrl-C.
    Watch,
    /// Recent local storage activity.
    History {
        #[arg(long, default_value_t = 20)]
        limit: usize,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let mut config = ClientConfig::load(cli.config.as_deref())?;
    if let Some(url) = cli.base_url {
        config.base_url = url;
    }
    if let Some(db) = cli.db {
        config.db_path = db;
    }

    let session = match connect(&config).await? {
        Startup::Ready(session) => session,
        Startup::LoggedOut => {
            eprintln!("[folkhart] session expired by server; please log in again");
            std::process::exit(2);
        }
    };

    match cli.command {
        Command::Status => print_status(&session),
        Command::Start {
            kind,
            mode,
            dungeon,
        } => {
            let run = session
                .adventure
                .start_run(
                    kind,
                    StartRunRequest {
                        mode: Some(mode),
                        dungeon_id: dungeon,
                    },
                )
                .await?;
            println!("started {} ({}) id={}", run.label(), kind, run.id);
            print_status(&session);
        }
        Command::FastFinish { kind, cost, gems } => {
            session.adventure.set_wallet(Wallet { gold: 0, gems });
            let reward = session.adventure.fast_finish(kind, cost).await?;
            println!("{reward}");
            println!("gems left: {}", session.adventure.wallet().gems);
        }
        Command::Dismiss { kind } => match session.adventure.dismiss_reward(kind) {
            Some(reward) => println!("dismissed: {}", reward.label),
            None => println!("no unclaimed {kind} reward"),
        },
        Command::Watch => watch(&session, &config).await?,
        Command::History { limit } => {
            for event in session.kv.history(limit)? {
                println!(
                    "{:>6}  {}  {:<11} {}",
                    event.seq,
                    folkhart_engine::run::format_timestamp_ms(event.ts_ms),
                    event.kind,
                    event.key
                );
            }
        }
    }
    Ok(())
}

fn print_status(session: &Session) {
    for kind in RunKind::ALL {
        let view = session.adventure.snapshot(kind);
        match (&view.run, view.display_secs) {
            (Some(run), Some(secs)) => println!(
                "{kind:<10} {:<18} {} [{}] {}",
                view.phase,
                run.label(),
                mode_name(run.mode),
                format_secs(secs)
            ),
            (Some(run), None) => println!("{kind:<10} {:<18} {}", view.phase, run.label()),
            (None, _) => println!("{kind:<10} {}", view.phase),
        }
        if let Some(reward) = &view.reward {
            println!("{reward}");
        }
    }
}

fn mode_name(mode: RunMode) -> &'static str {
    match mode {
        RunMode::Idle => "idle",
        RunMode::Active => "active",
    }
}

async fn watch(session: &Session, config: &ClientConfig) -> anyhow::Result<()> {
    let driver = spawn_driver(session.adventure.clone(), config.driver());
    let mut shown: HashSet<String> = HashSet::new();
    let mut display = tokio::time::interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = display.tick() => {
                for reward in session.adventure.pending_rewards() {
                    if shown.insert(reward.run_id.clone()) {
                        println!("{reward}");
                        println!("(dismiss with: folkhart dismiss --kind {})", reward.source_kind);
                    }
                }
                for kind in RunKind::ALL {
                    let view = session.adventure.snapshot(kind);
                    if let (Some(run), Some(secs)) = (&view.run, view.display_secs) {
                        println!("{kind}: {} {}", run.label(), format_secs(secs));
                    }
                }
            }
        }
    }

    driver.shutdown();
    Ok(())
}
