// meshmerge: command-line node
//
// Manages a local repo and runs it as a replication node over TCP.

mod config;
mod engine;
mod swarm;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::*;
use engine::JsonEngine;
use meshmerge_core::{DocId, RepoBackend, RepoEvent};
use std::sync::Arc;
use swarm::TcpSwarm;

#[derive(Parser)]
#[command(name = "meshmerge")]
#[command(about = "meshmerge: replicated documents over append-only feeds", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create the repo and its identity
    Init,
    /// Show repo information
    Info,
    /// Create a new document
    Create,
    /// Apply a change (a JSON object) to a document
    Change { doc: String, json: String },
    /// Print a document's current state
    Show { doc: String },
    /// Configure settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Run a replication node
    Serve {
        #[arg(short, long)]
        port: Option<u16>,
        /// Address to dial, host:port (repeatable)
        #[arg(long = "peer")]
        peers: Vec<String>,
        /// Documents to open and follow
        #[arg(long = "doc")]
        docs: Vec<String>,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    Set { key: String, value: String },
    Get { key: String },
    List,
    AddPeer { addr: String },
    RemovePeer { addr: String },
}

#[tokio::main]
async fn main() -> Result<()> {
    meshmerge_core::init_tracing("warn");

    let cli = Cli::parse();

    match cli.command {
        Commands::Init => cmd_init().await,
        Commands::Info => cmd_info().await,
        Commands::Create => cmd_create().await,
        Commands::Change { doc, json } => cmd_change(doc, json).await,
        Commands::Show { doc } => cmd_show(doc).await,
        Commands::Config { action } => cmd_config(action),
        Commands::Serve { port, peers, docs } => cmd_serve(port, peers, docs).await,
    }
}

fn open_repo(config: &config::Config) -> Result<RepoBackend<JsonEngine>> {
    RepoBackend::open(config.repo_config()?, JsonEngine).context("Failed to open repo")
}

fn parse_doc(doc: &str) -> Result<DocId> {
    doc.parse().with_context(|| format!("Invalid document id: {}", doc))
}

async fn cmd_init() -> Result<()> {
    println!("{}", "Initializing meshmerge...".bold());
    println!();

    let config = config::Config::load()?;
    println!("  {} Configuration", "✓".green());

    let storage = config.storage_path()?;
    let repo = open_repo(&config)?;
    println!("  {} Repo: {}", "✓".green(), storage.display());
    println!();

    println!("{}", "Repo Information:".bold());
    println!("  ID: {}", repo.id().to_string().bright_cyan());
    println!();

    println!("{}", "Next steps:".bold());
    println!("  • Create a document: {}", "meshmerge create".bright_green());
    println!("  • Start a node:      {}", "meshmerge serve --peer <host:port>".bright_green());

    repo.close().await?;
    Ok(())
}

async fn cmd_info() -> Result<()> {
    let config = config::Config::load()?;
    let repo = open_repo(&config)?;

    println!("{}", "Repo Information".bold());
    println!("  ID:        {}", repo.id().to_string().bright_cyan());
    println!("  Storage:   {}", config.storage_path()?.display());
    println!("  Feeds:     {}", repo.feeds().feed_ids().len());

    let docs = repo.doc_ids();
    println!("  Documents: {}", docs.len());
    for doc in docs {
        println!("    {} {}", "•".bright_green(), doc.to_string().bright_yellow());
    }

    repo.close().await?;
    Ok(())
}

async fn cmd_create() -> Result<()> {
    let config = config::Config::load()?;
    let repo = open_repo(&config)?;
    let doc = repo.create_doc()?;
    println!("{} Created document {}", "✓".green(), doc.to_string().bright_yellow());
    repo.close().await?;
    Ok(())
}

async fn cmd_change(doc: String, json: String) -> Result<()> {
    let doc = parse_doc(&doc)?;
    let value: serde_json::Value = serde_json::from_str(&json).context("Change is not JSON")?;
    anyhow::ensure!(value.is_object(), "Change must be a JSON object");

    let config = config::Config::load()?;
    let repo = open_repo(&config)?;
    repo.open_doc(doc)?;
    let seq = repo.change(&doc, json.as_bytes())?;
    println!("{} Change {} written to {}", "✓".green(), seq, doc.short().bright_yellow());
    repo.close().await?;
    Ok(())
}

async fn cmd_show(doc: String) -> Result<()> {
    let doc = parse_doc(&doc)?;
    let config = config::Config::load()?;
    let repo = open_repo(&config)?;
    repo.open_doc(doc)?;

    let state = repo
        .with_doc_state(&doc, |state| serde_json::Value::Object(state.clone()))
        .context("Document did not open")?;
    println!("{}", serde_json::to_string_pretty(&state)?);
    if !repo.is_ready(&doc) {
        println!("{}", "(not yet caught up with peers)".dimmed());
    }
    repo.close().await?;
    Ok(())
}

fn cmd_config(action: ConfigAction) -> Result<()> {
    let mut config = config::Config::load()?;
    match action {
        ConfigAction::Set { key, value } => {
            config.set(&key, &value)?;
            config.save()?;
            println!("{} {} = {}", "✓".green(), key.bright_cyan(), value);
        }
        ConfigAction::Get { key } => match config.list().into_iter().find(|(k, _)| *k == key) {
            Some((_, value)) => println!("{}", value),
            None => anyhow::bail!("Unknown config key: {}", key),
        },
        ConfigAction::List => {
            println!("{}", "Configuration".bold());
            for (key, value) in config.list() {
                println!("  {}: {}", key.bright_cyan(), value);
            }
        }
        ConfigAction::AddPeer { addr } => {
            config.add_peer(addr.clone());
            config.save()?;
            println!("{} Added peer {}", "✓".green(), addr);
        }
        ConfigAction::RemovePeer { addr } => {
            config.remove_peer(&addr);
            config.save()?;
            println!("{} Removed peer {}", "✓".green(), addr);
        }
    }
    Ok(())
}

async fn cmd_serve(port: Option<u16>, peers: Vec<String>, docs: Vec<String>) -> Result<()> {
    let config = config::Config::load()?;
    let repo = open_repo(&config)?;
    let mut events = repo.events().subscribe()?;

    let mut dial = config.peers.clone();
    dial.extend(peers);
    let (swarm, incoming) = TcpSwarm::bind(port.unwrap_or(config.listen_port), dial).await?;
    let local_addr = swarm.local_addr();
    repo.attach_swarm(swarm as Arc<dyn meshmerge_core::Swarm>, incoming)
        .await?;

    let mut follow = repo.doc_ids();
    for doc in &docs {
        follow.push(parse_doc(doc)?);
    }
    for doc in follow {
        repo.open_doc(doc)?;
    }

    println!("{}", "meshmerge node running".bold());
    println!("  ID:        {}", repo.id().to_string().bright_cyan());
    println!("  Listening: {}", local_addr.to_string().bright_yellow());
    println!("  Press Ctrl-C to stop");
    println!();

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => print_event(&event),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    println!();
    println!("{}", "Shutting down...".dimmed());
    drop(events);
    repo.close().await?;
    Ok(())
}

fn print_event(event: &RepoEvent<serde_json::Value>) {
    match event {
        RepoEvent::Ready { doc_id, patch, .. } => {
            println!("{} {} ready: {}", "●".green(), doc_id.short().bright_yellow(), patch);
        }
        RepoEvent::Patch {
            doc_id,
            patch,
            local,
            ..
        } => {
            let origin = if *local { "local" } else { "remote" };
            println!("{} {} {} patch: {}", "Δ".cyan(), doc_id.short().bright_yellow(), origin, patch);
        }
        RepoEvent::DocumentMessage {
            doc_id,
            peer,
            contents,
        } => {
            println!(
                "{} {} message from {}: {}",
                "✉".bright_magenta(),
                doc_id.short().bright_yellow(),
                peer.short().bright_cyan(),
                contents
            );
        }
        RepoEvent::ClockUpdated { doc_id, repo, clock } => {
            tracing::debug!("Clock of {} at {}: {:?}", doc_id.short(), repo.short(), clock);
        }
    }
}
