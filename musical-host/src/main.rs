//! Operator CLI for a shared creative space host.
//!
//! ```text
//! musical-host serve --bind 0.0.0.0:9191 --log scene.log
//! musical-host dump scene.log --limit 20
//! musical-host new-space
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use log::info;
use serde::Serialize;
use tokio::net::TcpListener;

use musical_collab::{
    transport, Host, HostConfig, Instruction, InstructionCounter, InstructionTag, LogReader,
    LogReporter, SpaceId,
};

#[derive(Parser, Debug)]
#[command(name = "musical-host", version, about = "Host a shared creative space")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Serve a space to WebSocket participants until Ctrl-C.
    Serve {
        /// Address to listen on.
        #[arg(long, default_value = "127.0.0.1:9191")]
        bind: String,

        /// Space log to open or create.
        #[arg(long, value_name = "PATH")]
        log: PathBuf,

        /// Space identifier announced to participants. Defaults to the one
        /// remembered next to the log, or a fresh one for a new log.
        #[arg(long)]
        space: Option<SpaceId>,

        /// Leader-clock viewpoint period in milliseconds (0 disables it).
        #[arg(long, default_value = "100")]
        viewpoint_ms: u64,
    },

    /// Print each record of a space log as one JSON line.
    Dump {
        #[arg(value_name = "PATH")]
        path: PathBuf,

        /// Stop after this many records.
        #[arg(long)]
        limit: Option<u64>,
    },

    /// Print a fresh space identifier.
    NewSpace,
}

#[derive(Serialize)]
struct DumpLine<'a> {
    index: u64,
    offset: u64,
    #[serde(flatten)]
    instruction: &'a Instruction,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    match Cli::parse().command {
        Command::Serve { bind, log, space, viewpoint_ms } => {
            serve(bind, log, space, viewpoint_ms).await
        }
        Command::Dump { path, limit } => dump(path, limit),
        Command::NewSpace => {
            println!("{}", SpaceId::new_random());
            Ok(())
        }
    }
}

async fn serve(
    bind: String,
    log_path: PathBuf,
    space: Option<SpaceId>,
    viewpoint_ms: u64,
) -> anyhow::Result<()> {
    let space = resolve_space(&log_path, space)?;
    let config = HostConfig {
        bind_addr: bind,
        viewpoint_interval: (viewpoint_ms > 0).then(|| Duration::from_millis(viewpoint_ms)),
        ..HostConfig::new(space, log_path)
    };

    let counter = Arc::new(InstructionCounter::new());
    let host = Host::spawn(config.clone(), counter.clone(), Arc::new(LogReporter))
        .with_context(|| format!("opening {}", config.log_path.display()))?;
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("binding {}", config.bind_addr))?;
    info!("Space {} ready", config.space);

    tokio::select! {
        result = transport::serve(listener, host.clone()) => result?,
        signal = tokio::signal::ctrl_c() => {
            signal.context("waiting for Ctrl-C")?;
            info!("Shutting down");
        }
    }

    let stats = host.stats();
    host.shutdown().await?;

    let counts = counter.snapshot();
    info!(
        "Served {} connections, {} records in log, {} instructions observed",
        stats.connections_accepted,
        stats.records,
        counts.total()
    );
    for tag in InstructionTag::ALL {
        if counts.get(tag) > 0 {
            info!("  {tag:?}: {}", counts.get(tag));
        }
    }
    Ok(())
}

/// `scene.log` keeps its space identifier in `scene.log.space`.
fn space_file(log_path: &Path) -> PathBuf {
    let mut name = log_path.as_os_str().to_owned();
    name.push(".space");
    PathBuf::from(name)
}

/// The space a log belongs to stays the same across restarts. An explicit
/// `--space` wins and is remembered for the next start.
fn resolve_space(log_path: &Path, explicit: Option<SpaceId>) -> anyhow::Result<SpaceId> {
    let path = space_file(log_path);
    let space = match explicit {
        Some(space) => space,
        None if path.exists() => {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading {}", path.display()))?;
            return text
                .trim()
                .parse()
                .with_context(|| format!("parsing space identifier in {}", path.display()));
        }
        None => SpaceId::new_random(),
    };
    fs::write(&path, format!("{space}\n")).with_context(|| format!("writing {}", path.display()))?;
    Ok(space)
}

fn dump(path: PathBuf, limit: Option<u64>) -> anyhow::Result<()> {
    let mut reader =
        LogReader::open(&path).with_context(|| format!("opening {}", path.display()))?;
    if let Some(limit) = limit {
        reader = reader.with_limit(limit);
    }
    for record in reader {
        let record = record?;
        let line = DumpLine {
            index: record.index,
            offset: record.offset,
            instruction: &record.instruction,
        };
        println!("{}", serde_json::to_string(&line)?);
    }
    Ok(())
}
