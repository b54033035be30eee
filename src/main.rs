use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use log::{info, warn};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use quorum::network::LocalNetwork;
use quorum::raft::{ApplyMsg, Raft, RaftConfig, RaftError};
use quorum::storage::{open_storage, StorageConfig};

#[derive(Parser)]
#[command(name = "quorum")]
#[command(about = "Raft leader election and log replication")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an in-process cluster over a simulated network
    Simulate {
        /// Number of replicas
        #[arg(short, long, default_value_t = 3)]
        replicas: usize,

        /// Number of commands to submit
        #[arg(short, long, default_value_t = 10)]
        commands: usize,

        /// Crash the leader halfway through
        #[arg(long)]
        crash_leader: bool,

        /// Enable the pre-vote phase
        #[arg(long)]
        pre_vote: bool,

        /// Keep each replica's state under this directory instead of memory
        #[arg(short, long)]
        data_dir: Option<PathBuf>,
    },

    /// Load and validate a JSON replica configuration
    CheckConfig {
        /// Path to the config file
        path: PathBuf,
    },
}

fn init_logging() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
}

type AppliedLogs = Arc<Mutex<Vec<Vec<ApplyMsg>>>>;

async fn find_leader(replicas: &[Option<Raft>], wait: Duration) -> Option<Raft> {
    let deadline = Instant::now() + wait;
    while Instant::now() < deadline {
        for raft in replicas.iter().flatten() {
            if raft.get_role().await.1 {
                return Some(raft.clone());
            }
        }
        sleep(Duration::from_millis(50)).await;
    }
    None
}

async fn submit_with_retry(replicas: &[Option<Raft>], command: Vec<u8>) -> anyhow::Result<u64> {
    for _attempt in 0..10u32 {
        let Some(leader) = find_leader(replicas, Duration::from_secs(2)).await else {
            continue;
        };
        match leader.submit(command.clone()).await {
            Ok(proposal) => return Ok(proposal.index),
            Err(RaftError::NotLeader { .. }) | Err(RaftError::NotRunning) => {
                sleep(Duration::from_millis(50)).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
    bail!("no leader accepted the command")
}

async fn simulate(
    replicas: usize,
    commands: usize,
    crash_leader: bool,
    pre_vote: bool,
    data_dir: Option<PathBuf>,
) -> anyhow::Result<()> {
    let net = LocalNetwork::new();
    let applied: AppliedLogs = Arc::new(Mutex::new(vec![Vec::new(); replicas]));
    let mut handles: Vec<Option<Raft>> = Vec::with_capacity(replicas);

    for id in 0..replicas {
        let mut config = RaftConfig::new(id, replicas);
        config.pre_vote = pre_vote;

        let storage_config = match &data_dir {
            Some(dir) => StorageConfig::File {
                data_dir: dir.join(format!("replica-{id}")).display().to_string(),
            },
            None => StorageConfig::Memory,
        };
        let storage = open_storage(&storage_config)
            .with_context(|| format!("opening storage for replica {id}"))?;

        let (raft, mut rx) = Raft::start(config, storage, net.transport(id))?;
        net.register(id, raft.clone()).await;

        let applied = Arc::clone(&applied);
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                applied.lock().await[id].push(msg);
            }
        });
        handles.push(Some(raft));
    }

    let mut last_index = 0;
    for i in 0..commands {
        if crash_leader && i == commands / 2 {
            if let Some(leader) = find_leader(&handles, Duration::from_secs(5)).await {
                let id = leader.id();
                warn!("Crashing leader {id}");
                leader.shutdown().await;
                net.disconnect(id).await;
                handles[id] = None;
            }
        }
        last_index = submit_with_retry(&handles, format!("cmd-{i}").into_bytes()).await?;
    }

    // Give the survivors a moment to apply everything the leader accepted.
    let deadline = Instant::now() + Duration::from_secs(3);
    while Instant::now() < deadline {
        let logs = applied.lock().await;
        let caught_up = handles
            .iter()
            .enumerate()
            .filter(|(_, raft)| raft.is_some())
            .all(|(id, _)| logs[id].last().is_some_and(|m| m.index >= last_index));
        drop(logs);
        if caught_up {
            break;
        }
        sleep(Duration::from_millis(50)).await;
    }

    for raft in handles.iter().flatten() {
        raft.shutdown().await;
    }
    net.clear().await;

    info!("Simulation finished after {} RPCs", net.rpc_count());
    let logs = applied.lock().await;
    for (id, log) in logs.iter().enumerate() {
        let stream: Vec<String> = log
            .iter()
            .map(|m| format!("{}@{}:{}", m.index, m.term, String::from_utf8_lossy(&m.command)))
            .collect();
        let state = if handles[id].is_some() { "" } else { " (crashed)" };
        println!("replica {id}{state}: [{}]", stream.join(", "));
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    // Parse command line arguments
    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            replicas,
            commands,
            crash_leader,
            pre_vote,
            data_dir,
        } => {
            info!("Starting a simulated cluster of {replicas} replicas");
            simulate(replicas, commands, crash_leader, pre_vote, data_dir).await?;
        }
        Command::CheckConfig { path } => {
            let config = RaftConfig::from_json_file(&path)
                .with_context(|| format!("loading {}", path.display()))?;
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
