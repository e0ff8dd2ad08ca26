use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

use gossip_raft::{
    Config, HookContext, MemoryMesh, MemoryTransport, Message, NodeHooks, Raft, Retrying,
    Transport,
};

/// Where `simulate` writes its log when not on stderr, read from
/// `GOSSIP_RAFT_LOG_FILE`, `GOSSIP_RAFT_LOG_MAX_SIZE_MB` and
/// `GOSSIP_RAFT_LOG_MAX_FILES`.
struct LogFileSettings {
    path: PathBuf,
    max_bytes: u64,
    keep: u32,
}

impl LogFileSettings {
    fn from_env() -> Option<Self> {
        let path = std::env::var_os("GOSSIP_RAFT_LOG_FILE")?;
        let number = |key: &str, default: u64| {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .unwrap_or(default)
        };
        Some(Self {
            path: PathBuf::from(path),
            max_bytes: number("GOSSIP_RAFT_LOG_MAX_SIZE_MB", 10).saturating_mul(1024 * 1024),
            keep: u32::try_from(number("GOSSIP_RAFT_LOG_MAX_FILES", 3)).unwrap_or(u32::MAX),
        })
    }
}

/// Size-capped node log. When a write would cross the cap, `node.log` becomes
/// `node.log.1`, older generations shift up by one and anything past `keep`
/// is deleted.
struct NodeLog {
    settings: LogFileSettings,
    file: File,
    written: u64,
}

impl NodeLog {
    fn open(settings: LogFileSettings) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(&settings.path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            settings,
            file,
            written,
        })
    }

    fn generation(&self, n: u32) -> PathBuf {
        let mut name = self.settings.path.clone().into_os_string();
        name.push(format!(".{n}"));
        PathBuf::from(name)
    }

    fn roll_over(&mut self) -> io::Result<()> {
        self.file.flush()?;
        let keep = self.settings.keep.max(1);

        let oldest = self.generation(keep);
        if oldest.exists() {
            fs::remove_file(&oldest)?;
        }
        for n in (1..keep).rev() {
            let from = self.generation(n);
            if from.exists() {
                fs::rename(&from, self.generation(n + 1))?;
            }
        }
        fs::rename(&self.settings.path, self.generation(1))?;

        self.file = File::create(&self.settings.path)?;
        self.written = 0;
        Ok(())
    }
}

impl Write for NodeLog {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        // A single record larger than the cap still goes into a fresh file.
        if self.written > 0 && self.written + buf.len() as u64 > self.settings.max_bytes {
            self.roll_over()?;
        }
        self.file.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

fn init_logging() {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));

    if let Some(settings) = LogFileSettings::from_env() {
        let shown = settings.path.display().to_string();
        match NodeLog::open(settings) {
            Ok(log) => {
                builder.target(env_logger::Target::Pipe(Box::new(log)));
            }
            Err(e) => eprintln!("Cannot open log file {shown}: {e}, logging to stderr"),
        }
    }

    builder.init();
}

#[derive(Parser)]
#[command(name = "gossip-raft")]
#[command(about = "Leader election and leader-job coordination over a gossip topic")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run an in-memory cluster and report who leads
    Simulate {
        /// JSON config file; flags below override its values
        #[arg(short, long)]
        config: Option<String>,

        /// Number of nodes
        #[arg(short, long)]
        nodes: Option<usize>,

        /// Heartbeat interval in milliseconds
        #[arg(long)]
        heartbeat_ms: Option<u64>,

        /// Leader job interval in milliseconds
        #[arg(long)]
        job_interval_ms: Option<u64>,

        /// Close the current leader's transport after this many seconds
        #[arg(long)]
        kill_leader_after: Option<u64>,

        /// Stop after this many seconds (runs until Ctrl-C otherwise)
        #[arg(short, long)]
        duration: Option<u64>,

        /// Interval in milliseconds between status reports
        #[arg(long, default_value_t = 1000)]
        status_interval_ms: u64,
    },

    /// Print the default configuration as JSON
    DefaultConfig,
}

/// Stand-in for the reporting job: logs one submission round per tick.
struct SubmissionLogger {
    rounds: AtomicU64,
}

#[async_trait]
impl NodeHooks for SubmissionLogger {
    async fn leader_job(&self, ctx: HookContext) -> anyhow::Result<()> {
        let round = self.rounds.fetch_add(1, Ordering::SeqCst) + 1;
        let raft = ctx.raft();
        info!(
            "Leader {} submitting round {round} (term {}, {} live peers)",
            raft.identity(),
            raft.current_term(),
            raft.live_peer_count()
        );
        Ok(())
    }

    async fn handle_custom_message(&self, _ctx: HookContext, message: Message) -> anyhow::Result<()> {
        anyhow::bail!("unknown message type {}", message.kind)
    }
}

struct SimNode {
    transport: Arc<MemoryTransport>,
    raft: Raft,
}

fn print_status(nodes: &[SimNode]) {
    for node in nodes {
        let state = node.raft.state();
        println!(
            "{:<8} {:<9} term={:<4} leader={:<8} peers={}{}",
            node.raft.identity(),
            state.role.to_string(),
            state.current_term,
            state.leader_id.as_deref().unwrap_or("-"),
            node.raft.live_peer_count(),
            if node.transport.is_closed() { " (closed)" } else { "" },
        );
    }
    println!();
}

async fn simulate(
    config: Config,
    kill_leader_after: Option<u64>,
    duration: Option<u64>,
    status_interval: Duration,
) -> anyhow::Result<()> {
    let cancel = CancellationToken::new();
    let mesh = MemoryMesh::new();

    let mut nodes = Vec::with_capacity(config.cluster_size);
    for i in 1..=config.cluster_size {
        let transport = Arc::new(mesh.join(format!("node-{i}")));
        let shared: Arc<dyn Transport> = transport.clone();
        let hooks = Retrying::new(
            SubmissionLogger {
                rounds: AtomicU64::new(0),
            },
            config.retry.clone(),
        );
        let raft = Raft::new(shared, config.raft.clone())?.with_hooks(Arc::new(hooks));

        let runner = raft.clone();
        let token = cancel.clone();
        tokio::spawn(async move {
            if let Err(e) = runner.run(token).await {
                error!("Node {} stopped with error: {e}", runner.identity());
            }
        });

        nodes.push(SimNode { transport, raft });
    }
    info!("Started {} nodes", nodes.len());

    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => {
                    info!("Received Ctrl-C, shutting down");
                    cancel.cancel();
                }
                Err(e) => warn!("Cannot listen for Ctrl-C: {e}"),
            }
        });
    }
    if let Some(secs) = duration {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            sleep(Duration::from_secs(secs)).await;
            cancel.cancel();
        });
    }

    let started = tokio::time::Instant::now();
    let mut killed = false;
    let mut ticker = tokio::time::interval(status_interval);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {}
        }

        if let Some(secs) = kill_leader_after {
            if !killed && started.elapsed() >= Duration::from_secs(secs) {
                match nodes.iter().find(|n| n.raft.is_leader() && !n.transport.is_closed()) {
                    Some(leader) => {
                        warn!("Closing transport of leader {}", leader.raft.identity());
                        leader.transport.close();
                        killed = true;
                    }
                    None => info!("No leader yet, postponing leader shutdown"),
                }
            }
        }

        print_status(&nodes);
    }

    // Let the node tasks observe cancellation before exiting.
    sleep(Duration::from_millis(100)).await;
    print_status(&nodes);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        Command::Simulate {
            config,
            nodes,
            heartbeat_ms,
            job_interval_ms,
            kill_leader_after,
            duration,
            status_interval_ms,
        } => {
            let mut cfg = match config {
                Some(path) => Config::from_file(&path)
                    .with_context(|| format!("loading config from {path}"))?,
                None => Config::default(),
            };
            if let Some(n) = nodes {
                cfg.cluster_size = n;
            }
            if let Some(ms) = heartbeat_ms {
                cfg.raft.heartbeat_interval_ms = ms;
            }
            if let Some(ms) = job_interval_ms {
                cfg.raft.leader_job_interval_ms = ms;
            }
            cfg.validate()?;

            info!(
                "Simulating {} nodes (heartbeat {}ms, leader job every {}ms)",
                cfg.cluster_size, cfg.raft.heartbeat_interval_ms, cfg.raft.leader_job_interval_ms
            );
            simulate(
                cfg,
                kill_leader_after,
                duration,
                Duration::from_millis(status_interval_ms.max(1)),
            )
            .await?;
        }
        Command::DefaultConfig => {
            println!("{}", Config::default().to_json_pretty()?);
        }
    }

    Ok(())
}
