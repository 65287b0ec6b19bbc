use axum::middleware as axum_mw;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use towns_github_bot::config::Config;
use towns_github_bot::github::api::GitHubApi;
use towns_github_bot::github::client::GitHubApp;
use towns_github_bot::github::credentials::CredentialStore;
use towns_github_bot::state::AppState;
use towns_github_bot::subscriptions::tracker::PromptTracker;
use towns_github_bot::towns::TownsClient;
use towns_github_bot::{housekeeping, middleware, polling, routes};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    // Tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "towns_github_bot=debug,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Configuration; missing required options are fatal before we bind
    let config = Arc::new(Config::from_env()?);

    // Database
    let mut connect_opts = config
        .database_url
        .parse::<sqlx::postgres::PgConnectOptions>()?
        .statement_cache_capacity(0);
    if config.database_tls {
        connect_opts = connect_opts.ssl_mode(sqlx::postgres::PgSslMode::Require);
        if let Some(ca) = &config.database_ca_cert {
            connect_opts = connect_opts.ssl_root_cert(ca);
        }
    }
    let pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(10)
        .connect_with(connect_opts)
        .await?;

    tracing::info!("Connected to database");

    // ── Migration tracking ─────────────────────────────
    sqlx::raw_sql("CREATE TABLE IF NOT EXISTS _migrations (version INT PRIMARY KEY, applied_at TIMESTAMPTZ DEFAULT now())")
        .execute(&pool)
        .await?;

    let migrations: &[(i32, &str)] = &[(1, include_str!("../migrations/001_init.sql"))];

    for &(version, sql) in migrations {
        let applied: bool =
            sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM _migrations WHERE version = $1)")
                .bind(version)
                .fetch_one(&pool)
                .await
                .unwrap_or(false);
        if !applied {
            sqlx::raw_sql(sql).execute(&pool).await?;
            sqlx::query("INSERT INTO _migrations (version) VALUES ($1)")
                .bind(version)
                .execute(&pool)
                .await?;
            tracing::info!("Applied migration {}", version);
        }
    }
    tracing::info!("Migrations applied");

    // ── Shared state ───────────────────────────────────
    let api = GitHubApi::new();

    let app = match (config.github_app_id, config.github_private_key.clone()) {
        (Some(app_id), Some(pem)) => {
            let client = GitHubApp::new(app_id, pem)?;
            tracing::info!(app_id = app_id, "GitHub App configured, webhook mode available");
            Some(Arc::new(client))
        }
        _ => {
            tracing::warn!("GitHub App not configured, all subscriptions will poll");
            None
        }
    };

    let credentials = if config.user_auth_enabled() {
        let client_id = config
            .github_client_id
            .clone()
            .ok_or_else(|| anyhow::anyhow!("client id missing"))?;
        let client_secret = config
            .github_client_secret
            .clone()
            .ok_or_else(|| anyhow::anyhow!("client secret missing"))?;
        let encryption_secret = config
            .token_encryption_secret
            .clone()
            .ok_or_else(|| anyhow::anyhow!("encryption secret missing"))?;
        let redirect_url = config
            .redirect_url()
            .ok_or_else(|| anyhow::anyhow!("redirect URL missing"))?;
        tracing::info!(redirect_url = %redirect_url, "user auth configured");
        Some(Arc::new(CredentialStore::new(
            pool.clone(),
            api.clone(),
            &encryption_secret,
            client_id,
            client_secret,
            redirect_url,
            config.token_refresh_buffer_secs,
        )?))
    } else {
        tracing::warn!("OAuth app not configured, user auth disabled");
        None
    };

    let towns = TownsClient::from_config(
        config.towns_api_url.as_deref(),
        config.towns_bot_token.as_deref(),
    )
    .map(Arc::new);
    if towns.is_none() {
        tracing::warn!("Towns transport not configured, messages will be dropped");
    }

    let app_state = AppState {
        pool,
        config: config.clone(),
        api,
        app,
        credentials,
        towns,
        prompts: Arc::new(PromptTracker::new()),
    };

    // ── Background workers ─────────────────────────────
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    tokio::spawn(polling::run(app_state.clone(), shutdown_rx.clone()));
    housekeeping::spawn_all(app_state.clone(), shutdown_rx);

    // ── Router ─────────────────────────────────────────
    let app = routes::router(app_state)
        .layer(axum_mw::from_fn(middleware::security::security_headers))
        .layer(RequestBodyLimitLayer::new(5 * 1024 * 1024))
        .layer(TraceLayer::new_for_http());

    // Serve
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("towns-github-bot listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, draining");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    Ok(())
}
