use anyhow::{Context, Result};
use clap::Parser;
use std::env;

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub storage_dir: String,
    pub database_url: String,
    /// Base URL under which assembled objects are served (final object URLs
    /// are formed as `{public_base_url}/{key}`).
    pub public_base_url: String,
    /// Chunk size assigned to sessions that do not request one.
    pub default_chunk_size_bytes: u64,
    /// Chunks fetched and appended per assembly batch.
    pub assembly_batch_size: u64,
    /// Hours of inactivity before a session stops being resumable.
    pub session_ttl_hours: i64,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Resumable chunked-upload service")]
pub struct Args {
    /// Host to bind to (overrides UPLINK_HOST)
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to (overrides UPLINK_PORT)
    #[arg(long)]
    pub port: Option<u16>,

    /// Directory where chunk and object payloads are stored (overrides UPLINK_STORAGE_DIR)
    #[arg(long)]
    pub storage_dir: Option<String>,

    /// Database URL (overrides UPLINK_DATABASE_URL)
    #[arg(long)]
    pub database_url: Option<String>,

    /// Public base URL for assembled objects (overrides UPLINK_PUBLIC_BASE_URL)
    #[arg(long)]
    pub public_base_url: Option<String>,

    /// Default chunk size in bytes (overrides UPLINK_CHUNK_SIZE_BYTES)
    #[arg(long)]
    pub chunk_size_bytes: Option<u64>,

    /// Assembly batch size in chunks (overrides UPLINK_ASSEMBLY_BATCH_SIZE)
    #[arg(long)]
    pub assembly_batch_size: Option<u64>,

    /// Session TTL in hours (overrides UPLINK_SESSION_TTL_HOURS)
    #[arg(long)]
    pub session_ttl_hours: Option<i64>,

    /// Run migrations and exit
    #[arg(long)]
    pub migrate: bool,
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and migrate flag.
    pub fn from_env_and_args() -> Result<(Self, bool)> {
        // Parse CLI once
        let args = Args::parse();

        // --- Environment fallback ---
        let env_host = env::var("UPLINK_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = match env::var("UPLINK_PORT") {
            Ok(value) => value
                .parse::<u16>()
                .with_context(|| format!("parsing UPLINK_PORT value `{}`", value))?,
            Err(env::VarError::NotPresent) => 3000,
            Err(err) => return Err(err).context("reading UPLINK_PORT"),
        };
        let env_storage = env::var("UPLINK_STORAGE_DIR").unwrap_or_else(|_| "./data/blobs".into());
        let env_db = env::var("UPLINK_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/uplink.db".into());
        let env_public_base =
            env::var("UPLINK_PUBLIC_BASE_URL").unwrap_or_else(|_| "/blobs".into());
        let env_chunk_size = parse_env_u64("UPLINK_CHUNK_SIZE_BYTES", 5 * 1024 * 1024)?;
        let env_batch_size = parse_env_u64("UPLINK_ASSEMBLY_BATCH_SIZE", 10)?;
        let env_ttl = match env::var("UPLINK_SESSION_TTL_HOURS") {
            Ok(value) => value
                .parse::<i64>()
                .with_context(|| format!("parsing UPLINK_SESSION_TTL_HOURS value `{}`", value))?,
            Err(env::VarError::NotPresent) => 24,
            Err(err) => return Err(err).context("reading UPLINK_SESSION_TTL_HOURS"),
        };

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            storage_dir: args.storage_dir.unwrap_or(env_storage),
            database_url: args.database_url.unwrap_or(env_db),
            public_base_url: args.public_base_url.unwrap_or(env_public_base),
            default_chunk_size_bytes: args.chunk_size_bytes.unwrap_or(env_chunk_size),
            assembly_batch_size: args.assembly_batch_size.unwrap_or(env_batch_size),
            session_ttl_hours: args.session_ttl_hours.unwrap_or(env_ttl),
        };

        Ok((cfg, args.migrate))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn parse_env_u64(name: &str, default: u64) -> Result<u64> {
    match env::var(name) {
        Ok(value) => value
            .parse::<u64>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).context(format!("reading {}", name)),
    }
}
