mod auth;
mod backplane;
mod config;
mod db;
mod directory;
mod error;
mod fanout;
mod limiter;
mod reconnect;
mod rooms;
mod session;
mod stores;
mod ws;

use std::sync::Arc;

use anyhow::Context;
use axum::{http::StatusCode, routing::get, Router};
use tokio::net::TcpListener;
use tracing::{info, warn};
use uuid::Uuid;

use crate::auth::jwt::JwtVerifier;
use crate::backplane::Backplane;
use crate::config::GatewayConfig;
use crate::directory::PeerDirectory;
use crate::fanout::FanoutEngine;
use crate::limiter::{spawn_sweeper, RateLimiter, SWEEP_INTERVAL};
use crate::reconnect::ReconnectionCoordinator;
use crate::rooms::RoomIndex;
use crate::session::SessionRegistry;
use crate::stores::{MemoryRoom, MessageStore, RoomStore, UserStore};
use crate::ws::GatewayState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_new(&config.log_filter)
                .context("invalid PARLOR_GATEWAY_LOG_FILTER directive")?,
        )
        .init();

    let instance_id = Uuid::new_v4();
    let jwt =
        Arc::new(JwtVerifier::new(&config.jwt_secret).context("invalid gateway JWT secret")?);
    if config.is_dev_jwt_secret() {
        warn!("running with the development JWT secret; set PARLOR_GATEWAY_JWT_SECRET");
    }

    let (users, room_store, messages) = match &config.database_url {
        Some(database_url) => {
            let pool = db::create_pg_pool(database_url, db::PoolConfig::from_env())
                .await
                .context("failed to initialize gateway PostgreSQL pool")?;
            db::run_migrations(&pool).await?;
            db::check_pool_health(&pool).await?;
            info!("using postgres-backed stores");
            (
                UserStore::Postgres(pool.clone()),
                RoomStore::Postgres(pool.clone()),
                MessageStore::Postgres(pool),
            )
        }
        None => {
            let room_store = RoomStore::memory();
            let lobby = Uuid::new_v4();
            room_store.seed_room(lobby, MemoryRoom::open("lobby")).await;
            info!(%lobby, "no database configured, using in-memory stores with a seeded lobby");
            (UserStore::memory(), room_store, MessageStore::memory())
        }
    };

    let backplane = match &config.redis_url {
        Some(redis_url) => {
            info!("redis backplane enabled");
            Backplane::redis(redis_url)
        }
        None => {
            info!("no redis configured, running single-instance over the loopback backplane");
            Backplane::loopback()
        }
    };

    let registry = SessionRegistry::default();
    let rooms = RoomIndex::default();
    let limiter = Arc::new(RateLimiter::default());
    let fanout = Arc::new(FanoutEngine::new(
        instance_id,
        registry.clone(),
        rooms.clone(),
        PeerDirectory::default(),
        backplane.clone(),
    ));
    let apply_loop = FanoutEngine::spawn_apply_loop(Arc::clone(&fanout));
    let sweeper = spawn_sweeper(Arc::clone(&limiter), SWEEP_INTERVAL);

    let reconnect = Arc::new(ReconnectionCoordinator::new(
        Arc::clone(&fanout),
        users.clone(),
        room_store.clone(),
    ));

    let state = GatewayState {
        jwt,
        registry,
        rooms,
        limiter,
        fanout,
        reconnect,
        users,
        room_store,
        messages,
    };
    let app = build_router(state);

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind gateway listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, %instance_id, "starting chat gateway");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("gateway exited unexpectedly")?;

    sweeper.stop().await;
    backplane.shutdown();
    apply_loop.abort();
    Ok(())
}

fn build_router(state: GatewayState) -> Router {
    Router::new().route("/healthz", get(healthz)).merge(ws::router(state))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
