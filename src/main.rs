use clap::{Parser, Subcommand};
use graphmem::Config;
use graphmem::db::{Db, migrate};
use graphmem::graph::{EpisodeSource, GraphStore};
use graphmem::service::{AddEpisodeRequest, EpisodeListing, KnowledgeService, SearchResponse};
use std::io::Read;
use std::path::Path;
use anyhow::Result;

#[derive(Parser, Debug)]
#[command(name = "graphmem")]
#[command(about = "Knowledge graph memory over text episodes: ingest, search, inspect")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Ingest one episode and extract entities and relations from it
    Add {
        /// Episode name
        #[arg(short, long)]
        name: String,

        /// Episode content; read from stdin when omitted
        content: Option<String>,

        /// Description of where the episode came from
        #[arg(long, default_value = "cli")]
        source_description: String,

        /// Group (tenant or session) the episode belongs to
        #[arg(short, long)]
        group: Option<String>,

        /// Content kind: message, text, json or conversation
        #[arg(long)]
        source: Option<String>,

        /// Extract with the remote backend, falling back to local rules
        #[arg(long)]
        remote: bool,

        /// Print the result as JSON
        #[arg(long)]
        json: bool,
    },

    /// Search entities by name or summary
    Search {
        /// Query text
        query: String,

        /// Restrict the search to these groups (repeatable)
        #[arg(short, long)]
        group: Vec<String>,

        /// Maximum number of hits
        #[arg(short, long)]
        limit: Option<usize>,

        /// Re-rank hits by embedding similarity to the query
        #[arg(long)]
        semantic: bool,

        /// Print the results as JSON
        #[arg(long)]
        json: bool,
    },

    /// List the most recent episodes, newest first
    Episodes {
        /// Restrict the listing to these groups (repeatable)
        #[arg(short, long)]
        group: Vec<String>,

        /// How many episodes to list
        #[arg(short, long)]
        last: Option<usize>,

        /// Print the listing as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show corpus statistics
    Stats {
        /// Print the counters as JSON
        #[arg(long)]
        json: bool,
    },

    /// Verify the database schema, indexes and pragmas
    Verify,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logger from environment variable or default to info level
    env_logger::Builder::from_env(
        env_logger::Env::default()
            .filter_or("RUST_LOG", "info")
    ).init();

    let cli = Cli::parse();

    // Load configuration
    let config = Config::load()?;

    // Initialize database
    let db = Db::new(config.db_path());

    // Run migrations
    let migrations_dir = Path::new("migrations");
    db.with_connection(|conn| {
        migrate::run_migrations(conn, migrations_dir)
    }).await?;

    match cli.command {
        Command::Verify => {
            log::info!("Starting GraphMem v{}", env!("CARGO_PKG_VERSION"));
            log::info!("Database path: {}", config.db_path().display());
            verify_database_schema(&db).await?;
        }
        Command::Add { name, content, source_description, group, source, remote, json } => {
            let content = match content {
                Some(text) => text,
                None => read_stdin()?,
            };
            let request = AddEpisodeRequest {
                name,
                content,
                source_description,
                group_id: group,
                source: source.as_deref().map(EpisodeSource::parse),
                use_remote: remote,
            };
            let service = build_service(db, &config).await?;
            match service.add_episode(request).await {
                Ok(result) if json => {
                    println!("{}", serde_json::to_string_pretty(&result)?);
                }
                Ok(result) => {
                    println!("\n=== Episode Ingested ===\n");
                    println!("{:<12} {}", "Episode:", result.episode_id);
                    println!("{:<12} {}", "Entities:", result.nodes_created);
                    println!("{:<12} {}", "Relations:", result.edges_created);
                }
                // In JSON mode the error goes to stdout as a structured
                // payload; scripts match on the stable kind string.
                Err(e) if json => {
                    let payload = serde_json::json!({
                        "error": e.to_string(),
                        "kind": e.kind(),
                    });
                    println!("{}", serde_json::to_string_pretty(&payload)?);
                    std::process::exit(1);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Command::Search { query, group, limit, semantic, json } => {
            let service = build_service(db, &config).await?;
            let response = service.search(&query, group, limit, semantic).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&response)?);
            } else {
                print_search_results(&query, &response);
            }
        }
        Command::Episodes { group, last, json } => {
            let service = build_service(db, &config).await?;
            let listing = service.get_episodes(group, last).await;
            if json {
                println!("{}", serde_json::to_string_pretty(&listing)?);
            } else {
                print_episode_listing(&listing);
            }
        }
        Command::Stats { json } => {
            let service = build_service(db, &config).await?;
            let stats = service.stats().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            } else {
                println!("\n=== GraphMem Corpus Statistics ===\n");
                println!("{:<12} {:>8}", "Episodes", stats.episodes);
                println!("{:<12} {:>8}", "Entities", stats.entities);
                println!("{:<12} {:>8}", "Relations", stats.relations);
                println!("{:<12} {:>8}", "Groups", stats.groups);
                println!();
            }
        }
    }

    Ok(())
}

/// Open the graph store and wire the knowledge service on top of it.
/// Extracted to avoid duplicating this setup across subcommands.
async fn build_service(db: Db, config: &Config) -> Result<KnowledgeService> {
    let store = GraphStore::new(db);
    store.ensure_indexes().await?;
    Ok(KnowledgeService::new(store, config))
}

/// Read episode content from stdin when it is not passed as an argument.
fn read_stdin() -> Result<String> {
    let mut buffer = String::new();
    std::io::stdin().read_to_string(&mut buffer)?;
    if buffer.trim().is_empty() {
        anyhow::bail!("No episode content: pass it as an argument or pipe it on stdin");
    }
    Ok(buffer)
}

fn print_search_results(query: &str, response: &SearchResponse) {
    println!("\nQuery: \"{}\"\n", query);

    if let Some(ref error) = response.error {
        println!("⚠️  Search degraded, graph store unavailable: {}", error);
    }

    if response.results.is_empty() {
        println!("No entities found.");
        return;
    }

    for hit in &response.results {
        println!("─────────────────────────────────────────────────────────────────────────────");
        println!("{} [{}]", hit.name, hit.group_id);
        if !hit.summary.is_empty() {
            println!("Summary: {}", hit.summary);
        }
        println!("Mentioned in {} episode(s)", hit.episode_uuids.len());
    }
    println!("─────────────────────────────────────────────────────────────────────────────");
    println!("\nResults: {}", response.count);
}

fn print_episode_listing(listing: &EpisodeListing) {
    if let Some(ref error) = listing.error {
        println!("⚠️  Listing degraded, graph store unavailable: {}", error);
    }

    if listing.episodes.is_empty() {
        println!("No episodes found.");
        return;
    }

    println!("\n{} episode(s), newest first:\n", listing.count);
    for episode in &listing.episodes {
        println!(
            "{}  [{}] {} ({})",
            episode.created_at.format("%Y-%m-%d %H:%M:%S"),
            episode.group_id,
            episode.name,
            episode.source.as_str(),
        );
        println!("    uuid: {}", episode.uuid);
    }
}

/// Verify that all expected database objects exist
async fn verify_database_schema(db: &Db) -> Result<()> {
    use graphmem::error::GraphMemError;

    db.with_connection(|conn| {
        // Check tables
        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
        let tables: Vec<String> = stmt.query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        let expected_tables = vec!["entities", "entity_mentions", "episodes", "relations", "schema_migrations"];
        let mut all_tables_exist = true;

        for table in &expected_tables {
            if !tables.iter().any(|t| t == table) {
                log::error!("Missing table: {}", table);
                all_tables_exist = false;
            } else {
                log::debug!("✓ Table exists: {}", table);
            }
        }

        if !all_tables_exist {
            return Err(GraphMemError::Config("Not all required tables exist".to_string()));
        }

        // Check migrations
        let applied = migrate::get_applied_migrations(conn)?;
        if applied.is_empty() {
            return Err(GraphMemError::Config("No migrations applied".to_string()));
        }
        log::debug!("✓ {} migrations applied", applied.len());

        // Check lookup indexes (created lazily when the service first starts)
        let mut stmt = conn.prepare("SELECT name FROM sqlite_master WHERE type='index' AND name LIKE 'idx_%' ORDER BY name")?;
        let indexes: Vec<String> = stmt.query_map([], |row| row.get::<_, String>(0))?
            .collect::<std::result::Result<Vec<_>, rusqlite::Error>>()?;

        let expected_indexes = vec![
            "idx_entities_group",
            "idx_entities_name",
            "idx_episodes_created",
            "idx_episodes_group",
            "idx_mentions_episode",
            "idx_relations_group",
        ];

        for index_name in &expected_indexes {
            if indexes.iter().any(|i| i == index_name) {
                log::debug!("✓ Lookup index exists: {}", index_name);
            } else {
                log::warn!("Lookup index not found: {} (created on first ingest or search)", index_name);
            }
        }

        // Check pragmas
        let journal_mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
        if journal_mode.to_uppercase() != "WAL" {
            return Err(GraphMemError::Config(format!("Journal mode is not WAL: {}", journal_mode)));
        }
        log::debug!("✓ Journal mode: WAL");

        let foreign_keys: i32 = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
        if foreign_keys != 1 {
            return Err(GraphMemError::Config("Foreign keys not enabled".to_string()));
        }
        log::debug!("✓ Foreign keys enabled");

        // Integrity check
        let integrity: String = conn.query_row("PRAGMA integrity_check", [], |row| row.get(0))?;
        if integrity != "ok" {
            return Err(GraphMemError::Config(format!("Database integrity check failed: {}", integrity)));
        }
        log::info!("✓ Database integrity: OK");

        Ok(())
    }).await?;

    log::info!("✓ Database schema verification complete");
    Ok(())
}
