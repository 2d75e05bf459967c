//! Federation Signer CLI
//!
//! Entry point for running the signing service and for development tooling.

use clap::{Parser, Subcommand};
use federation_signer::clock::SystemClock;
use federation_signer::config::SignerConfig;
use federation_signer::dealer::TestFederation;
use federation_signer::logging::{self, LogLevel};
use federation_signer::publisher::{EventPublisher, HttpEventPublisher, LoggingPublisher};
use federation_signer::registry::StaticGuardianRegistry;
use federation_signer::shares;
use federation_signer::storage::{SessionStore, SqliteSessionStore};
use federation_signer::types::ShareSubmissionRequest;
use federation_signer::{create_router, recommend_method, service, AppState, UnifiedSigningService};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

#[derive(Parser)]
#[command(name = "federation-signer")]
#[command(about = "Federated threshold signing engine (FROST and guardian reconstruction)")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signing service
    Run {
        /// Bind address (overrides FEDSIGN_BIND)
        #[arg(short, long)]
        bind: Option<String>,

        /// SQLite database path, or ":memory:" (overrides FEDSIGN_DATABASE)
        #[arg(short, long)]
        database: Option<String>,

        /// Guardian registry TOML (overrides FEDSIGN_REGISTRY)
        #[arg(short, long)]
        registry: Option<String>,
    },

    /// Generate a federation with a trusted dealer (for development only)
    GenerateTestFederation {
        /// Output directory
        #[arg(short, long, default_value = "config")]
        output_dir: PathBuf,

        /// Federation identifier
        #[arg(short, long, default_value = "family")]
        federation_id: String,

        /// Threshold (t of n)
        #[arg(short, long, default_value = "3")]
        threshold: u16,

        /// Total guardians
        #[arg(short = 'n', long, default_value = "5")]
        total: u16,

        /// Secret each guardian's share is sealed under (suffixed with the guardian id)
        #[arg(short, long, env = "FEDSIGN_GUARDIAN_SECRET")]
        secret: String,
    },

    /// Open a sealed share and print it as a share submission
    OpenShare {
        /// Sealed shares file
        #[arg(short = 'f', long, default_value = "config/guardian_shares.json")]
        shares_file: PathBuf,

        /// Guardian whose share to open
        #[arg(short, long)]
        guardian_id: String,

        /// Guardian secret
        #[arg(short, long, env = "FEDSIGN_GUARDIAN_SECRET")]
        secret: String,
    },

    /// Show which method a use case selects
    Recommend {
        /// Use case (e.g. daily_operations, emergency_recovery)
        use_case: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            bind,
            database,
            registry,
        } => {
            let mut config = SignerConfig::from_env()?;
            if let Some(bind) = bind {
                config.bind = bind;
            }
            if let Some(database) = database {
                config.database = database;
            }
            if let Some(registry) = registry {
                config.registry_path = registry;
            }
            logging::init_from_config(&config)?;
            run_server(config).await?;
        }
        Commands::GenerateTestFederation {
            output_dir,
            federation_id,
            threshold,
            total,
            secret,
        } => {
            logging::init_logging(LogLevel::Info, false)?;
            generate_test_federation(output_dir, &federation_id, threshold, total, &secret)?;
        }
        Commands::OpenShare {
            shares_file,
            guardian_id,
            secret,
        } => {
            let sealed = shares::read_shares(&shares_file)?;
            let share = sealed
                .iter()
                .find(|s| s.guardian_id == guardian_id)
                .ok_or_else(|| format!("no share for guardian {}", guardian_id))?;
            let opened = share.open(&format!("{}-{}", secret, guardian_id))?;
            let submission = ShareSubmissionRequest {
                guardian_id,
                share_index: opened.index,
                share_value: opened.to_hex().to_string(),
            };
            println!("{}", serde_json::to_string_pretty(&submission)?);
        }
        Commands::Recommend { use_case } => {
            let use_case = service::parse_use_case(&use_case)?;
            println!("{}", serde_json::to_string_pretty(&recommend_method(use_case))?);
        }
    }

    Ok(())
}

/// Run the signing service with a background expiry sweeper
async fn run_server(config: SignerConfig) -> Result<(), Box<dyn std::error::Error>> {
    config.print_summary();

    let store: Arc<dyn SessionStore> = if config.database == ":memory:" {
        Arc::new(SqliteSessionStore::in_memory()?)
    } else {
        Arc::new(SqliteSessionStore::new(&config.database)?)
    };
    let registry = Arc::new(StaticGuardianRegistry::from_toml_file(&config.registry_path)?);
    let publisher: Arc<dyn EventPublisher> = match &config.publisher_url {
        Some(url) => Arc::new(HttpEventPublisher::new(url.clone(), Duration::from_secs(10))?),
        None => {
            tracing::warn!("No publisher configured, signed events are only logged");
            Arc::new(LoggingPublisher)
        }
    };

    let service = UnifiedSigningService::new(&config, store, registry, publisher, Arc::new(SystemClock));
    let health = service.health().await?;
    logging::log_system_event(
        "Starting federation signer",
        serde_json::json!({
            "federation_id": health.federation_id,
            "guardians": health.guardians,
            "threshold": health.threshold,
            "sweep_interval_secs": config.sweep_interval.as_secs(),
        }),
    );

    let state = Arc::new(AppState::new(service));

    let sweeper_state = state.clone();
    let sweep_interval = config.sweep_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(sweep_interval);
        loop {
            ticker.tick().await;
            if let Err(e) = sweeper_state.service.expire_old_sessions().await {
                tracing::warn!(error = %e, "Expiry sweep failed");
            }
        }
    });

    let app = create_router(state);
    let addr: SocketAddr = config.bind.parse()?;
    tracing::info!("Listening on {}", addr);

    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for shutdown signal");
            }
            logging::log_system_event("Shutting down", serde_json::json!({}));
        })
        .await?;

    Ok(())
}

/// Write the registry and sealed shares of a dealer-generated federation
fn generate_test_federation(
    output_dir: PathBuf,
    federation_id: &str,
    threshold: u16,
    total: u16,
    secret: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let federation = TestFederation::generate(federation_id, threshold, total)?;
    std::fs::create_dir_all(&output_dir)?;

    let registry_path = output_dir.join("registry.toml");
    std::fs::write(&registry_path, federation.registry().to_toml_string()?)?;
    tracing::info!(path = %registry_path.display(), "Saved guardian registry");

    let sealed = federation.seal_shares(|guardian_id| format!("{}-{}", secret, guardian_id))?;
    shares::write_shares(output_dir.join("guardian_shares.json"), &sealed)?;

    tracing::info!(
        group_public_key = %federation.record().group_public_key,
        guardians = ?federation.guardian_ids(),
        "Generated test federation"
    );
    Ok(())
}
