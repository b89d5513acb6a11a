//! CLI entry point for dex.
//!
//! A thin shell over the same `sync`/`search`/`repo`/`tool_interface`
//! modules the stdio tool interface uses (§6 "Commands must be provided
//! but are a thin shell over the tool interface").

use std::process::ExitCode;

use clap::{Parser as ClapParser, Subcommand};

use dex::config::{self, Config};
use dex::error::DexError;
use dex::model::Source;
use dex::repo;
use dex::search::SearchOutcome;
use dex::store::Store;
use dex::sync::{self as sync_mod, SyncOptions};
use dex::tool_interface;

#[derive(ClapParser)]
#[command(name = "dex", about = "Local-first indexer and hybrid search over AI coding assistant conversations")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Detect, extract, and index conversations from every installed source.
    Sync {
        /// Re-extract and re-insert every conversation regardless of mtime.
        #[arg(long)]
        force: bool,
    },
    /// Hybrid full-text + vector search over indexed conversations.
    Search {
        /// Free-text query, optionally with `source:`/`model:`/`file:` prefixes.
        query: Vec<String>,
        #[arg(short, long, default_value_t = 10)]
        limit: usize,
    },
    /// List indexed conversations, most recently updated first.
    List {
        #[arg(short, long, default_value_t = 20)]
        limit: usize,
        #[arg(short, long)]
        source: Option<String>,
    },
    /// Print one conversation's messages in full.
    Show {
        id: String,
    },
    /// Print the embedding worker's current progress and a store summary.
    Status,
    /// Run the JSON-RPC stdio tool interface (§4.10).
    Serve,
    /// Create a default config file.
    Init,
    /// Get a config value, or print all values when no key is given.
    Get {
        key: Option<String>,
    },
    /// Set a config value.
    Set {
        key: String,
        value: String,
    },
    /// Remove a config value.
    Unset {
        key: String,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt().with_env_filter(tracing_subscriber::EnvFilter::from_default_env()).init();

    let cli = Cli::parse();
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(DexError::InvalidInput(msg)) => {
            eprintln!("Error: {msg}");
            ExitCode::from(2)
        }
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<(), DexError> {
    // Config subcommands never touch the store, so they're handled before
    // it's opened.
    match cli.command {
        Command::Init => return config::init(),
        Command::Get { key } => {
            return match key {
                Some(k) => config::get_value(&k),
                None => config::list_values(),
            };
        }
        Command::Set { key, value } => return config::set_value(&key, &value),
        Command::Unset { key } => return config::unset_value(&key),
        Command::Sync { force } => {
            let (store, data_dir, config) = open_store()?;
            run_sync(&store, &data_dir, &config, force)
        }
        Command::Search { query, limit } => {
            let (store, _data_dir, config) = open_store()?;
            run_search(&store, &config, &query.join(" "), limit)
        }
        Command::List { limit, source } => {
            let (store, _data_dir, _config) = open_store()?;
            run_list(&store, limit, source)
        }
        Command::Show { id } => {
            let (store, _data_dir, _config) = open_store()?;
            run_show(&store, &id)
        }
        Command::Status => {
            let (store, data_dir, _config) = open_store()?;
            run_status(&store, &data_dir)
        }
        Command::Serve => {
            let (store, _data_dir, config) = open_store()?;
            tool_interface::run(&store, &config)
        }
    }
}

fn open_store() -> Result<(Store, std::path::PathBuf, Config), DexError> {
    let config = Config::load();
    let data_dir = config
        .data_dir_path()
        .ok_or_else(|| DexError::Other("could not determine data directory".to_string()))?;
    std::fs::create_dir_all(&data_dir)?;
    let store = Store::open(&data_dir.join("dex.db"))?;
    Ok((store, data_dir, config))
}

fn run_sync(store: &Store, data_dir: &std::path::Path, config: &Config, force: bool) -> Result<(), DexError> {
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(async {
        let progress = sync_mod::sync(
            store,
            data_dir,
            config,
            SyncOptions { force },
            Box::new(|p| {
                if let Some(phase) = p.phase {
                    eprintln!("[{phase:?}] projects={} conversations={} messages={}", p.projects_processed, p.conversations_indexed, p.messages_indexed);
                }
            }),
        )
        .await?;
        eprintln!(
            "Synced {} conversations, {} messages.",
            progress.conversations_indexed, progress.messages_indexed
        );
        Ok(())
    })
}

fn run_search(store: &Store, config: &Config, query: &str, limit: usize) -> Result<(), DexError> {
    if query.trim().is_empty() {
        return Err(DexError::InvalidInput("search requires a query".to_string()));
    }
    let runtime = tokio::runtime::Runtime::new()?;
    let embedding = sync_mod::embedding_client_from_config(config);
    runtime.block_on(async {
        let outcome = dex::search::search(store, query, limit, embedding.as_ref()).await?;
        match outcome {
            SearchOutcome::Search(results) => {
                for m in &results.results {
                    println!("{}  {}  score={:.3}", m.conversation.id, m.conversation.title, m.score);
                    if let Some(best) = &m.best_match {
                        println!("    {}", best.snippet);
                    }
                }
                println!("({} total)", results.total_conversations);
            }
            SearchOutcome::List { conversations, total } => {
                for c in &conversations {
                    println!("{}  {}", c.id, c.title);
                }
                println!("({total} total)");
            }
        }
        Ok(())
    })
}

fn run_list(store: &Store, limit: usize, source: Option<String>) -> Result<(), DexError> {
    let source: Option<Source> = match source {
        Some(s) => Some(
            s.to_lowercase()
                .parse()
                .map_err(|_| DexError::InvalidInput(format!("unknown source: {s}")))?,
        ),
        None => None,
    };
    let filter = repo::ListFilter { source, ..Default::default() };
    let (conversations, total) = repo::list_conversations(store.connection(), &filter, limit, 0)?;
    for c in &conversations {
        println!("{}  [{}]  {}", c.id, c.source, c.title);
    }
    println!("({total} total)");
    Ok(())
}

fn run_show(store: &Store, id: &str) -> Result<(), DexError> {
    let options = dex::retrieval::GetOptions::default();
    let retrieved = dex::retrieval::get(store.connection(), &[id.to_string()], &options)?;
    let Some(rc) = retrieved.into_iter().next() else {
        return Err(DexError::InvalidInput(format!("no such conversation: {id}")));
    };
    println!("{}", rc.conversation.title);
    for m in &rc.messages {
        println!("[{:?}] {}", m.role, m.content);
    }
    Ok(())
}

fn run_status(store: &Store, data_dir: &std::path::Path) -> Result<(), DexError> {
    let (_, total) = repo::list_conversations(store.connection(), &repo::ListFilter::default(), 0, 0)?;
    println!("conversations indexed: {total}");

    let progress_path = data_dir.join("worker-progress.json");
    match dex::embed::read_progress(&progress_path) {
        Some(progress) => println!(
            "embedding worker: {:?} ({}/{})",
            progress.status, progress.completed, progress.total
        ),
        None => println!("embedding worker: no progress recorded"),
    }
    Ok(())
}
