use anyhow::Result;
use axum::Router;
use sqlx::sqlite::SqlitePoolOptions;
use std::{fs, io::ErrorKind, path::Path, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;
use uplink::{
    config::AppConfig,
    services::{
        AppState, AssemblyConfig, AssemblyPipeline, ChunkStore, LoggingRecordCreator,
        SessionService, apply_migrations,
    },
    storage::{BlobStore, FsBlobStore},
};

/// How often the background sweep marks TTL-lapsed sessions expired.
const EXPIRY_SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    // --- Parse config + migrate flag ---
    let (cfg, migrate) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting uplink with config: {:?}", cfg);

    // --- Ensure storage directory exists ---
    if !Path::new(&cfg.storage_dir).exists() {
        fs::create_dir_all(&cfg.storage_dir)?;
        tracing::info!("Created storage directory at {}", cfg.storage_dir);
    }

    // --- Initialize SQLite connection ---
    let db_url = &cfg.database_url;
    tracing::debug!("Connecting using raw URL => {}", db_url);

    // Extract the local file path SQLx will use
    let db_path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("file:");

    // Create parent directory if needed
    if let Some(parent) = Path::new(db_path).parent() {
        if !parent.exists() {
            fs::create_dir_all(parent)?;
            tracing::info!("Created missing directory {:?}", parent);
        }
    }

    // SQLx will not create the database file on its own
    match fs::OpenOptions::new().create(true).write(true).open(db_path) {
        Ok(_) => tracing::debug!("Database file can be created/opened."),
        Err(e) => tracing::warn!("Failed to open database file: {}", e),
    }

    let db: Arc<sqlx::Pool<sqlx::Sqlite>> = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect(db_url)
            .await?,
    );

    // --- Handle migration mode ---
    if migrate {
        apply_migrations(&db).await?;
        tracing::info!("Database migration complete.");
        return Ok(()); // exit after migration
    }

    // --- Initialize core services ---
    let blobs: Arc<dyn BlobStore> = Arc::new(FsBlobStore::new(
        cfg.storage_dir.clone(),
        cfg.public_base_url.clone(),
    ));
    let sessions = SessionService::new(
        Arc::clone(&db),
        chrono::Duration::hours(cfg.session_ttl_hours),
    );
    let chunks = ChunkStore::new(Arc::clone(&blobs));
    let assembly = AssemblyPipeline::new(
        sessions.clone(),
        chunks.clone(),
        Arc::clone(&blobs),
        Arc::new(LoggingRecordCreator),
        AssemblyConfig {
            batch_size: cfg.assembly_batch_size,
            ..AssemblyConfig::default()
        },
    );

    let state = AppState {
        db,
        sessions: sessions.clone(),
        chunks,
        assembly,
        blobs,
        storage_dir: cfg.storage_dir.clone().into(),
        default_chunk_size_bytes: cfg.default_chunk_size_bytes,
    };

    // --- Background expiry sweep ---
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(EXPIRY_SWEEP_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(err) = sessions.expire_stale_sessions().await {
                tracing::warn!("expiry sweep failed: {}", err);
            }
        }
    });

    // --- Build router ---
    let app: Router = uplink::routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
