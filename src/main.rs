//! Gasless relay HTTP entrypoint.
//!
//! This binary launches an Axum-based HTTP server that accepts signed ERC-3009
//! `transferWithAuthorization` messages and submits them on-chain from the relay account.
//!
//! Endpoints:
//! - `POST /relay/transfer` – Submit a signed transfer authorization
//! - `GET /relay/facilitator[/{chainId}]` – Relay account per chain
//! - `POST /gas/sponsor` – Native gas drip for accounts without gas
//! - `GET /authorizations/...` – Ledger lookups and the attempt log
//! - `POST /authorizations/{chainId}/{nonce}/cancel` – Operator cancellation
//!
//! Environment:
//! - `.env` values loaded at startup
//! - `HOST`, `PORT` control binding address
//! - `RELAY_CONFIG_PATH`, `RPC_URL_<chainId>`, `SIGNER_TYPE`, `EVM_PRIVATE_KEY`
//! - `RELAY_LEDGER_PATH` persists the authorization ledger, otherwise it lives in memory
//! - `RELAY_ADMIN_TOKEN` enables operator cancellation
//! - `GAS_FAUCET_URL` enables top-ups of the relay account
//! - `OTEL_*` variables enable tracing to systems like Honeycomb

use axum::Router;
use axum::http::Method;
use dotenvy::dotenv;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tower_http::cors;

use gasless_relay::chain::ChainRegistry;
use gasless_relay::config::RelayConfig;
use gasless_relay::from_env::{self, SignerType};
use gasless_relay::gas::{FaucetSponsor, GasSponsor};
use gasless_relay::handlers;
use gasless_relay::relay_local::RelayLocal;
use gasless_relay::sig_down::SigDown;
use gasless_relay::store::AuthorizationStore;
use gasless_relay::telemetry::Telemetry;
use gasless_relay::timestamp::{Clock, SystemClock};

/// Initializes the relay server.
///
/// - Loads `.env` variables.
/// - Initializes OpenTelemetry tracing.
/// - Connects to every configured chain that has an RPC URL.
/// - Opens the authorization ledger.
/// - Starts an Axum HTTP server with the relay handlers.
///
/// Binds to the address specified by the `HOST` and `PORT` env vars.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load .env variables
    dotenv().ok();

    let telemetry = Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .register()?;

    let config = match RelayConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Failed to load relay config: {}", e);
            std::process::exit(1);
        }
    };

    let signer = SignerType::from_env()?.make_evm_signer()?;
    tracing::info!(relay = %signer.address(), "Relay account loaded");

    // Abort if we can't reach any chain early
    let chains = match ChainRegistry::from_config(&config, signer).await {
        Ok(chains) if !chains.is_empty() => chains,
        Ok(_) => {
            tracing::error!("No chain has an RPC URL configured");
            std::process::exit(1);
        }
        Err(e) => {
            tracing::error!("Failed to connect chain clients: {}", e);
            std::process::exit(1);
        }
    };
    tracing::info!(chains = ?chains.chain_ids(), "Chain clients ready");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let store = match from_env::optional(from_env::ENV_RELAY_LEDGER_PATH) {
        Some(path) => {
            let store = AuthorizationStore::open(&path, clock.clone()).await?;
            tracing::info!(path = %path, records = store.len(), "Authorization ledger replayed");
            store
        }
        None => {
            tracing::warn!("RELAY_LEDGER_PATH not set, authorization ledger is in memory only");
            AuthorizationStore::in_memory(clock.clone())
        }
    };

    let sponsor = FaucetSponsor::from_env(config.timeouts.rpc())?
        .map(|sponsor| Arc::new(sponsor) as Arc<dyn GasSponsor>);
    let admin_token = from_env::optional(from_env::ENV_RELAY_ADMIN_TOKEN);
    if admin_token.is_none() {
        tracing::info!("RELAY_ADMIN_TOKEN not set, operator cancellation is disabled");
    }

    let relay = RelayLocal::new(
        &config,
        chains,
        Arc::new(store),
        sponsor,
        clock,
        admin_token,
    );
    let axum_state = Arc::new(relay);

    let http_endpoints = Router::new()
        .merge(handlers::routes().with_state(axum_state))
        .layer(telemetry.http_tracing())
        .layer(
            cors::CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods([Method::GET, Method::POST])
                .allow_headers(cors::Any),
        );

    let host = std::env::var("HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
    let host: IpAddr = match host.parse() {
        Ok(host) => host,
        Err(e) => {
            tracing::error!("HOST must be a valid IP address, got {}: {}", host, e);
            std::process::exit(1);
        }
    };
    let port = std::env::var("PORT")
        .ok()
        .and_then(|s| s.parse::<u16>().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::new(host, port);
    tracing::info!("Starting server at http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| {
            tracing::error!("Failed to bind to {}: {}", addr, e);
            std::process::exit(1);
        });

    let sig_down = SigDown::try_new()?;
    let axum_cancellation_token = sig_down.cancellation_token();
    let axum_graceful_shutdown = async move { axum_cancellation_token.cancelled().await };
    axum::serve(listener, http_endpoints)
        .with_graceful_shutdown(axum_graceful_shutdown)
        .await?;

    Ok(())
}
