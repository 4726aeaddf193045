//! Music catalog scanner.

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use music_catalog::config::ScannerConfig;
use music_catalog::db::{CatalogRepository, DbConfig, DbPool, LibraryRepository, run_migrations};
use music_catalog::models::catalog::NewLibrary;
use music_catalog::scanner::{AutoScanner, ScanRequest, ScanService, Scanner};

/// Scan music libraries into a catalog database.
#[derive(Parser)]
#[command(name = "music-catalog")]
#[command(about = "Scans music libraries into a relational catalog")]
struct Cli {
    /// Database file path
    #[arg(short, long, default_value = "catalog.db")]
    database: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Register a library
    AddLibrary {
        /// Name of the library
        #[arg(short, long)]
        name: String,

        /// Root directory of the library
        #[arg(short, long)]
        path: String,

        /// Mark the library as restricted
        #[arg(long)]
        restricted: bool,
    },

    /// List all libraries
    ListLibraries,

    /// Remove a library and everything cataloged under it
    RemoveLibrary {
        /// Name of the library to remove
        #[arg(short, long)]
        name: String,
    },

    /// Scan libraries
    Scan {
        /// Specific library to scan (scans all if not specified)
        #[arg(short, long)]
        library: Option<String>,

        /// Re-probe every file regardless of size and modification time
        #[arg(long)]
        force: bool,
    },

    /// Print catalog row counts as JSON
    Stats,

    /// Scan periodically until interrupted
    Serve {
        /// Scan interval in seconds (defaults to the configured interval)
        #[arg(long)]
        interval: Option<u64>,
    },
}

fn setup_database(database_url: &str) -> DbPool {
    let config = DbConfig::new(database_url);
    let pool = config.build_pool().expect("Failed to create database pool");

    let mut conn = pool.get().expect("Failed to get database connection");
    run_migrations(&mut conn).expect("Failed to run migrations");

    pool
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "music_catalog=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let pool = setup_database(&cli.database);
    let config = ScannerConfig::from_env();

    match cli.command {
        Commands::AddLibrary {
            name,
            path,
            restricted,
        } => {
            let repo = LibraryRepository::new(pool.clone());
            let new_library = NewLibrary {
                restricted,
                ..NewLibrary::new(&name, &path)
            };
            match repo.create(&new_library) {
                Ok(library) => {
                    println!("Added library '{}' (id: {})", library.name, library.id);
                    println!("  Path: {}", library.path);
                }
                Err(e) => {
                    eprintln!("Failed to add library: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::ListLibraries => {
            let repo = LibraryRepository::new(pool.clone());
            match repo.find_all() {
                Ok(libraries) if libraries.is_empty() => {
                    println!("No libraries configured. Add one with:");
                    println!("  music-catalog add-library --name \"Music\" --path /path/to/music");
                }
                Ok(libraries) => {
                    println!("Libraries:");
                    for library in libraries {
                        let access = if library.restricted { "restricted" } else { "open" };
                        println!(
                            "  [{}] {} - {} ({})",
                            library.id, library.name, library.path, access
                        );
                    }
                }
                Err(e) => {
                    eprintln!("Failed to list libraries: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::RemoveLibrary { name } => {
            let repo = LibraryRepository::new(pool.clone());
            let removed = repo
                .find_by_name(&name)
                .and_then(|library| match library {
                    Some(library) => repo.delete(library.id),
                    None => Ok(false),
                });
            match removed {
                Ok(true) => println!("Removed library '{}'", name),
                Ok(false) => {
                    eprintln!("Library '{}' not found", name);
                    std::process::exit(1);
                }
                Err(e) => {
                    eprintln!("Failed to remove library: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Scan { library, force } => {
            let service = ScanService::new(Scanner::with_ffmpeg(pool, config));
            let mut request = ScanRequest::new(force);
            request.library = library;

            match service.run(request).await {
                Ok(summary) => {
                    println!("\nScan complete:");
                    println!("  Directories added:   {}", summary.directories_added);
                    println!("  Directories removed: {}", summary.directories_removed);
                    println!("  Files added:         {}", summary.files_added);
                    println!("  Files updated:       {}", summary.files_updated);
                    println!("  Files skipped:       {}", summary.files_skipped);
                    println!("  Files removed:       {}", summary.files_removed);
                    println!("  Files failed:        {}", summary.files_failed);
                    println!("  Tracks added:        {}", summary.tracks_added);
                    println!("  Tracks updated:      {}", summary.tracks_updated);
                    println!("  Tracks removed:      {}", summary.tracks_removed);
                    println!("  Artists added:       {}", summary.artists_added);
                    println!("  Albums added:        {}", summary.albums_added);
                    println!("  Genres added:        {}", summary.genres_added);
                    println!("  Covers applied:      {}", summary.covers_applied);
                    println!("  Artists fixed:       {}", summary.artists_fixed);
                    println!("  Albums fixed:        {}", summary.albums_fixed);
                }
                Err(e) => {
                    eprintln!("Scan failed: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Stats => {
            let repo = CatalogRepository::new(pool.clone());
            match repo.counts() {
                Ok(counts) => match serde_json::to_string_pretty(&counts) {
                    Ok(json) => println!("{}", json),
                    Err(e) => {
                        eprintln!("Failed to encode counts: {}", e);
                        std::process::exit(1);
                    }
                },
                Err(e) => {
                    eprintln!("Failed to count catalog rows: {}", e);
                    std::process::exit(1);
                }
            }
        }
        Commands::Serve { interval } => {
            let interval = interval
                .map(Duration::from_secs)
                .unwrap_or(config.scan_interval);
            run_auto_scan(pool, config, interval).await;
        }
    }
}

async fn run_auto_scan(pool: DbPool, config: ScannerConfig, interval: Duration) {
    let service = Arc::new(ScanService::new(Scanner::with_ffmpeg(pool, config)));
    let mut auto_scanner = AutoScanner::new(service.clone(), interval);
    let handle = auto_scanner.start();

    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }

    tracing::info!("Shutting down");
    handle.stop();
    service.cancel().await;
}
