//! Server configuration and lifecycle.
//!
//! Wires the storage backend, auth gates, background reaper and HTTP
//! router together from environment configuration.

use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use axum::extract::State;
use axum::http::{HeaderValue, StatusCode};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::auth::{AuthorityConfig, AuthorityGate, HmacGate};
use crate::domain::CommandFilter;
use crate::infra::{
    AuthorityStore, CommandStore, PgAuthority, PgOutbox, Reaper, SqliteAuthority, SqliteOutbox,
};
use crate::migrations;

// ===== Configuration =====

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    Postgres,
    Sqlite,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub mode: String,
    pub database_url: Option<String>,
    pub sqlite_path: String,
    pub listen_addr: SocketAddr,
    pub max_connections: u32,
    pub lease_secs: i64,
    pub max_pull: u32,
    pub max_attempts: u32,
    pub reap_interval_secs: u64,
    pub hmac_secret: Option<String>,
    pub allow_unsigned: bool,
    pub require_hmac_pull: bool,
    pub require_hmac_ops: bool,
    pub authority: AuthorityConfig,
    pub migrate_on_startup: bool,
}

fn env_bool(name: &str, default: bool) -> bool {
    match std::env::var(name) {
        Ok(v) => matches!(v.trim(), "1" | "true" | "TRUE" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parse<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port: u16 = env_parse("PORT", 8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .with_context(|| format!("invalid listen address {host}:{port}"))?;

        Ok(Self {
            mode: std::env::var("OUTBOX_MODE").unwrap_or_else(|_| "auto".to_string()),
            database_url: std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty()),
            sqlite_path: std::env::var("OUTBOX_DB_PATH")
                .unwrap_or_else(|_| "./data/outbox.db".to_string()),
            listen_addr,
            max_connections: env_parse("MAX_DB_CONNECTIONS", 10),
            lease_secs: env_parse("OUTBOX_LEASE_SECS", 45),
            max_pull: env_parse::<u32>("OUTBOX_MAX_PULL", 25).max(1),
            max_attempts: env_parse("OUTBOX_MAX_ATTEMPTS", 5),
            reap_interval_secs: env_parse("OUTBOX_REAP_INTERVAL_SECS", 15),
            hmac_secret: std::env::var("OUTBOX_SECRET").ok(),
            allow_unsigned: env_bool("OUTBOX_ALLOW_UNSIGNED", false),
            require_hmac_pull: env_bool("REQUIRE_HMAC_PULL", true),
            require_hmac_ops: env_bool("REQUIRE_HMAC_OPS", true),
            authority: AuthorityConfig {
                enabled: env_bool("AUTHORITY_ENABLED", true),
                default_trusted: env_bool("AUTHORITY_DEFAULT_TRUSTED", true),
                fail_open: env_bool("AUTHORITY_FAIL_OPEN", false),
            },
            migrate_on_startup: env_bool("DB_MIGRATE_ON_STARTUP", true),
        })
    }

    pub fn storage_mode(&self) -> anyhow::Result<StorageMode> {
        match self.mode.trim() {
            "postgres" => Ok(StorageMode::Postgres),
            "sqlite" => Ok(StorageMode::Sqlite),
            "auto" | "" => Ok(if self.database_url.is_some() {
                StorageMode::Postgres
            } else {
                StorageMode::Sqlite
            }),
            other => anyhow::bail!("unknown OUTBOX_MODE: {other}"),
        }
    }
}

// ===== Application State =====

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn CommandStore>,
    pub authority: AuthorityGate,
    pub hmac: Arc<HmacGate>,
    pub lease_secs: i64,
    pub max_pull: u32,
    pub require_hmac_pull: bool,
    pub require_hmac_ops: bool,
}

/// Connect the configured backend and run migrations. Also used by the
/// admin binary so it sees exactly what the server sees.
pub async fn connect_stores(
    config: &Config,
) -> anyhow::Result<(Arc<dyn CommandStore>, Arc<dyn AuthorityStore>)> {
    match config.storage_mode()? {
        StorageMode::Postgres => {
            let url = config
                .database_url
                .as_deref()
                .context("DATABASE_URL is required in postgres mode")?;
            let pool = PgPoolOptions::new()
                .max_connections(config.max_connections)
                .connect(url)
                .await
                .context("failed to connect to postgres")?;
            if config.migrate_on_startup {
                migrations::postgres_migrator().run(&pool).await?;
            }
            info!("connected to postgres outbox");
            Ok((
                Arc::new(PgOutbox::new(pool.clone(), config.max_attempts)),
                Arc::new(PgAuthority::new(pool)),
            ))
        }
        StorageMode::Sqlite => {
            if let Some(parent) = Path::new(&config.sqlite_path).parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)
                        .with_context(|| format!("creating {}", parent.display()))?;
                }
            }
            let opts = SqliteConnectOptions::new()
                .filename(&config.sqlite_path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .foreign_keys(true);
            // Single writer connection; the store depends on it for lease
            // atomicity.
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .connect_with(opts)
                .await
                .context("failed to open sqlite outbox")?;
            if config.migrate_on_startup {
                migrations::sqlite_migrator().run(&pool).await?;
            }
            info!(path = %config.sqlite_path, "opened sqlite outbox");
            Ok((
                Arc::new(SqliteOutbox::new(pool.clone(), config.max_attempts)),
                Arc::new(SqliteAuthority::new(pool)),
            ))
        }
    }
}

pub fn build_state(
    config: &Config,
    store: Arc<dyn CommandStore>,
    authority_store: Arc<dyn AuthorityStore>,
) -> AppState {
    AppState {
        store,
        authority: AuthorityGate::new(authority_store, config.authority.clone()),
        hmac: Arc::new(HmacGate::new(
            config.hmac_secret.clone(),
            config.allow_unsigned,
        )),
        lease_secs: config.lease_secs,
        max_pull: config.max_pull,
        require_hmac_pull: config.require_hmac_pull,
        require_hmac_ops: config.require_hmac_ops,
    }
}

// ===== Router =====

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .merge(crate::api::router())
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer_from_env())
        .with_state(state)
}

fn cors_layer_from_env() -> CorsLayer {
    let origins = std::env::var("CORS_ALLOW_ORIGINS").unwrap_or_default();
    if origins.trim() == "*" {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .split(',')
        .filter_map(|o| o.trim().parse().ok())
        .collect();
    if parsed.is_empty() {
        CorsLayer::new()
    } else {
        CorsLayer::new()
            .allow_origin(parsed)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

async fn health_check() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "edgebus",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn readiness_check(
    State(state): State<AppState>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    match state.store.status_counts(CommandFilter::default()).await {
        Ok(counts) => {
            let mut by_status = serde_json::Map::new();
            for (status, n) in counts {
                by_status.insert(status, json!(n));
            }
            Ok(Json(json!({ "status": "ready", "commands": by_status })))
        }
        Err(e) => Err((
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "error": e.to_string() })),
        )),
    }
}

// ===== Lifecycle =====

pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("edgebus=info,tower_http=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
}

pub async fn run() -> anyhow::Result<()> {
    init_tracing();
    let config = Config::from_env()?;
    let (store, authority_store) = connect_stores(&config).await?;
    let state = build_state(&config, store.clone(), authority_store);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reaper = Reaper::new(store, Duration::from_secs(config.reap_interval_secs.max(1)));
    let reaper_task = tokio::spawn(reaper.run(shutdown_rx));

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(config.listen_addr).await?;
    info!(addr = %config.listen_addr, "edgebus listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let _ = shutdown_tx.send(true);
    let _ = reaper_task.await;
    Ok(())
}
