//! Memvault — CLI entry point.
//!
//! A thin demo surface over the library: ingest memories, run semantic
//! recall, inspect the knowledge graph.

#![forbid(unsafe_code)]

use anyhow::Result;
use clap::{Parser, Subcommand};
use memvault::{EngineSettings, Memory, MemoryEngine};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "memvault", about = "Personal client-side memory engine", version)]
struct Cli {
    /// Config file (TOML); MEMVAULT__* env vars override it
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// User whose memory space to operate on
    #[arg(long, global = true, default_value = "default")]
    user: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest a memory
    Ingest {
        /// The memory text
        text: String,
        /// Category label
        #[arg(long, default_value = "general")]
        category: String,
    },
    /// Semantic recall
    Search {
        /// Query text
        query: String,
        /// Number of results
        #[arg(short, default_value_t = 5)]
        k: usize,
    },
    /// Show graph statistics, or the memories around an entity
    Graph {
        /// Entity id to expand (omit for statistics)
        entity: Option<String>,
    },
    /// Flush pending vectors to durable storage
    Flush,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "memvault=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let settings = EngineSettings::load(cli.config.as_deref())?;
    let engine = MemoryEngine::new(settings).await?;

    match cli.command {
        Commands::Ingest { text, category } => {
            let memory = Memory::new(&cli.user, text).with_category(category);
            let outcome = engine.remember(&memory).await?;
            println!(
                "remembered {} as vector {} (+{} entities, +{} relationships)",
                memory.id,
                outcome.vector_id,
                outcome.graph.entities_added,
                outcome.graph.relationships_added
            );
            engine.force_flush(&cli.user).await?;
        }
        Commands::Search { query, k } => {
            let result = engine.recall(&cli.user, &query, k).await?;
            if result.matches.is_empty() {
                println!("no matches");
            }
            for m in &result.matches {
                let memory_id = m.metadata["memory_id"].as_str().unwrap_or("?");
                println!("{:.3}  {}  (vector {})", m.similarity, memory_id, m.vector_id);
            }
            if !result.related_memories.is_empty() {
                println!("graph-related: {}", result.related_memories.join(", "));
            }
        }
        Commands::Graph { entity } => match entity {
            Some(entity_id) => {
                let related = engine.related_to_entity(&cli.user, &entity_id, None).await?;
                println!("memories: {}", related.memories.join(", "));
                for e in &related.connected_entities {
                    println!("connected: {} ({})", e.id, e.entity_type);
                }
            }
            None => {
                let stats = engine.stats(&cli.user).await?;
                println!(
                    "entities: {}  relationships: {}  memories: {}",
                    stats.graph.total_entities,
                    stats.graph.total_relationships,
                    stats.graph.source_memory_count
                );
                println!(
                    "index version: {}  pending vectors: {}",
                    stats.index_version, stats.pending_vectors
                );
            }
        },
        Commands::Flush => {
            engine.force_flush(&cli.user).await?;
            println!("flushed");
        }
    }

    engine.shutdown().await?;
    Ok(())
}
