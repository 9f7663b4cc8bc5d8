//! Mnemos CLI - operator commands for the mnemos memory system
//!
//! Usage:
//!   mnemos setup                          Create the data directory and databases
//!   mnemos health                         Probe the graph store
//!   mnemos stats                          Show node and edge counts
//!   mnemos observe <user> <role> <text>   Append a conversation turn
//!   mnemos recall <user> <query>          Render prompt context for a query
//!   mnemos consolidate --extractor <cmd>  Fold pending transcripts into the graph now
//!   mnemos serve --extractor <cmd>        Run the daily consolidation loop
//!   mnemos decay                          Apply importance decay

use clap::{Parser, Subcommand};
use colored::*;
use mnemos::{
    ChunkOutcome, CommandExtractor, MemoryConfig, MemorySystem, PassReport, Role,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "mnemos")]
#[command(about = "Mnemos - working memory and context graph for conversational agents")]
#[command(version)]
struct Cli {
    /// Path to data directory [default: ./mnemos_data]
    #[arg(short, long, env = "MNEMOS_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// JSON config file; flags below override it
    #[arg(short, long, env = "MNEMOS_CONFIG")]
    config: Option<PathBuf>,

    /// Local hour (0-23) of the daily consolidation
    #[arg(long, env = "MNEMOS_TRIGGER_HOUR")]
    trigger_hour: Option<u32>,

    /// Turns per consolidation chunk
    #[arg(long, env = "MNEMOS_CHUNK_SIZE")]
    chunk_size: Option<usize>,

    /// Long-term memories returned by recall
    #[arg(long, env = "MNEMOS_TOP_K")]
    top_k: Option<usize>,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the data directory, databases and a default config file
    Setup,

    /// Check that the graph store answers
    Health,

    /// Show graph statistics
    Stats,

    /// Append a conversation turn to the transcript log
    Observe {
        /// User id
        user: String,

        /// Speaker: user, assistant or system
        role: String,

        /// Message text
        text: String,
    },

    /// Render the prompt context for a query
    Recall {
        /// User id
        user: String,

        /// Query text
        query: String,

        /// Session id
        #[arg(short, long, default_value = "cli")]
        session: String,
    },

    /// Consolidate pending transcripts now, ignoring the trigger hour
    Consolidate {
        /// Extractor command; receives chunk JSON on stdin, prints a proposal
        #[arg(short, long, env = "MNEMOS_EXTRACTOR")]
        extractor: String,

        /// Only this user
        #[arg(short, long)]
        user: Option<String>,
    },

    /// Run the scheduled consolidation loop until interrupted
    Serve {
        /// Extractor command; receives chunk JSON on stdin, prints a proposal
        #[arg(short, long, env = "MNEMOS_EXTRACTOR")]
        extractor: String,
    },

    /// Apply importance decay to every memory
    Decay,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_filter = if cli.verbose {
        "debug"
    } else {
        "info,mnemos=debug"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| default_filter.into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let config = load_config(&cli).await?;

    match cli.command {
        Commands::Setup => cmd_setup(config).await,
        Commands::Health => cmd_health(config).await,
        Commands::Stats => cmd_stats(config).await,
        Commands::Observe { user, role, text } => cmd_observe(config, user, role, text).await,
        Commands::Recall {
            user,
            query,
            session,
        } => cmd_recall(config, user, session, query).await,
        Commands::Consolidate { extractor, user } => {
            cmd_consolidate(config, extractor, user).await
        }
        Commands::Serve { extractor } => cmd_serve(config, extractor).await,
        Commands::Decay => cmd_decay(config).await,
    }
}

async fn load_config(cli: &Cli) -> anyhow::Result<MemoryConfig> {
    let mut config = match &cli.config {
        Some(path) => MemoryConfig::from_json_file(path).await?,
        None => MemoryConfig::default(),
    };
    if let Some(dir) = &cli.data_dir {
        config.data_dir = dir.clone();
    }
    if let Some(hour) = cli.trigger_hour {
        config.consolidation.trigger_hour = hour;
    }
    if let Some(size) = cli.chunk_size {
        config.consolidation.chunk_size = size;
    }
    if let Some(k) = cli.top_k {
        config.retrieval.default_top_k = k;
    }
    config.validate()?;
    Ok(config)
}

async fn cmd_setup(config: MemoryConfig) -> anyhow::Result<()> {
    let system = MemorySystem::open(config.clone()).await?;

    println!(
        "{}",
        format!("Initialized mnemos in {}", config.data_dir.display())
            .bold()
            .green()
    );
    println!("  Graph:       {}", config.graph_path().display());
    println!("  Transcripts: {}", config.transcript_path().display());

    let config_path = config.data_dir.join("mnemos.json");
    if tokio::fs::try_exists(&config_path).await? {
        println!("  Config:      {} (kept)", config_path.display());
    } else {
        tokio::fs::write(&config_path, serde_json::to_string_pretty(&config)?).await?;
        println!("  Config:      {}", config_path.display());
    }

    system.close().await?;
    Ok(())
}

async fn cmd_health(config: MemoryConfig) -> anyhow::Result<()> {
    let system = MemorySystem::open(config).await?;
    let health = system.health().await;

    let status = if health.healthy {
        "healthy".green().bold()
    } else {
        "unhealthy".red().bold()
    };
    println!("{} {} ({}ms)", health.backend.cyan(), status, health.response_time_ms);
    if let Some(detail) = &health.detail {
        println!("  {}", detail);
    }

    system.close().await?;
    if !health.healthy {
        anyhow::bail!("graph store is unhealthy");
    }
    Ok(())
}

async fn cmd_stats(config: MemoryConfig) -> anyhow::Result<()> {
    let system = MemorySystem::open(config).await?;
    let stats = system.stats().await?;

    println!("{}", "Mnemos Statistics".bold().underline());
    println!("  Total memories: {}", stats.total_nodes);
    println!("  Embedded:       {}", stats.embedded_nodes);
    println!("  Relationships:  {}", stats.total_edges);

    if !stats.nodes_by_context.is_empty() {
        println!("\n{}", "By Context:".bold());
        for (context, count) in &stats.nodes_by_context {
            println!("  {}: {}", context, count);
        }
    }
    if !stats.edges_by_type.is_empty() {
        println!("\n{}", "By Relationship:".bold());
        for (kind, count) in &stats.edges_by_type {
            println!("  {}: {}", kind, count);
        }
    }

    let pending = system.transcripts().pending_users().await?;
    println!("\n  Users with pending transcripts: {}", pending.len());

    system.close().await?;
    Ok(())
}

async fn cmd_observe(
    config: MemoryConfig,
    user: String,
    role: String,
    text: String,
) -> anyhow::Result<()> {
    let role: Role = role.parse()?;
    let system = MemorySystem::open(config).await?;
    let turn = system
        .transcripts()
        .append(&user, role, &text, chrono::Utc::now())
        .await?;

    println!("{}", "Turn recorded".green().bold());
    println!("  Session: {}", turn.session_id.cyan());
    println!("  Seq:     {}", turn.seq);

    system.close().await?;
    Ok(())
}

async fn cmd_recall(
    config: MemoryConfig,
    user: String,
    session: String,
    query: String,
) -> anyhow::Result<()> {
    let system = MemorySystem::open(config).await?;
    let mut manager = system.session(&user, &session)?;

    let context = manager.recall(&query).await;
    println!("{}", context);

    manager.disconnect().await?;
    system.close().await?;
    Ok(())
}

async fn cmd_consolidate(
    config: MemoryConfig,
    extractor: String,
    user: Option<String>,
) -> anyhow::Result<()> {
    let system = MemorySystem::open(config).await?;
    let extractor = Arc::new(CommandExtractor::from_command_line(&extractor)?);
    let pipeline = system.pipeline(extractor);

    let users = match user {
        Some(user) => vec![user],
        None => system.transcripts().pending_users().await?,
    };
    if users.is_empty() {
        println!("{}", "Nothing to consolidate".yellow());
    }

    for user in users {
        let report = pipeline.run_user(&user).await?;
        print_pass(&report);
    }

    system.close().await?;
    Ok(())
}

async fn cmd_serve(config: MemoryConfig, extractor: String) -> anyhow::Result<()> {
    let trigger_hour = config.consolidation.trigger_hour;
    let system = MemorySystem::open(config).await?;
    let extractor = Arc::new(CommandExtractor::from_command_line(&extractor)?);
    let pipeline = Arc::new(system.pipeline(extractor));

    let (stop_tx, stop_rx) = watch::channel(false);
    let worker = tokio::spawn(Arc::clone(&pipeline).run(stop_rx));

    println!(
        "{}",
        format!("Consolidating daily from {:02}:00, Ctrl-C to stop", trigger_hour).bold()
    );
    tokio::signal::ctrl_c().await?;
    tracing::info!("shutdown requested");
    // The receiver may already be gone if the loop ended on its own
    let _ = stop_tx.send(true);
    worker.await?;

    system.close().await?;
    println!("{}", "Stopped".green());
    Ok(())
}

async fn cmd_decay(config: MemoryConfig) -> anyhow::Result<()> {
    let system = MemorySystem::open(config).await?;

    println!("{}", "Running decay...".bold());
    let report = system.run_maintenance().await?;
    println!("  Memories checked: {}", report.checked);
    println!("  Importance adjusted: {}", report.decayed);

    system.close().await?;
    println!("{}", "Decay complete".green());
    Ok(())
}

fn print_pass(report: &PassReport) {
    let header = format!(
        "{}: {} chunk(s), {} consolidated, {} failed",
        report.user_id,
        report.chunks.len(),
        report.consolidated(),
        report.failed()
    );
    if report.complete {
        println!("{}", header.green().bold());
    } else {
        println!("{} {}", header.yellow().bold(), "(incomplete, will retry)".yellow());
    }

    for chunk in &report.chunks {
        let outcome = match &chunk.outcome {
            ChunkOutcome::Consolidated => "consolidated".green(),
            ChunkOutcome::FailedSkipped(reason) => format!("failed: {reason}").red(),
            ChunkOutcome::Aborted(reason) => format!("aborted: {reason}").yellow(),
        };
        println!(
            "  chunk {} ({} turns): {} [added {}, updated {}, rejected {}, edges {}]",
            chunk.index + 1,
            chunk.turns,
            outcome,
            chunk.summary.added,
            chunk.summary.updated,
            chunk.summary.rejected,
            chunk.summary.edges
        );
    }
}
