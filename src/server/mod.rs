//! HTTP/WebSocket surface
//!
//! One axum router carries the REST task lifecycle, the JSON-RPC envelope,
//! the WebSocket channel, the discovery/trust reverse-proxy, the sandbox,
//! and the discoverability endpoints. Security headers apply to every
//! response; the global rate limiter covers everything except /health and
//! /metrics. The bridge expects to sit behind a single trusted reverse
//! proxy, so the client IP is honored from `X-Forwarded-For`.

pub mod card;
pub mod error;
pub mod proxy;
pub mod rest;
pub mod rpc;
pub mod submit;
pub mod ws;

use axum::extract::connect_info::ConnectInfo;
use axum::http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use axum::http::Method;
use axum::routing::{get, post};
use axum::Router;
use eyre::{Result, WrapErr};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tower_governor::governor::GovernorConfigBuilder;
use tower_governor::GovernorLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::set_header::SetResponseHeaderLayer;
use tracing::info;

use crate::auth::{AuthContext, AuthRequest, Authenticator};
use crate::config::Config;
use crate::escrow::EscrowClient;
use crate::executor::Executor;
use crate::identity::ClientIdentity;
use crate::metrics;
use crate::payment::X402Validator;
use crate::ratelimit::FreeTierLimiter;
use crate::registry::TaskRegistry;
use crate::shutdown::ShutdownCoordinator;
use crate::trust::TrustStore;
use error::ApiError;

/// Maximum concurrently open WebSocket connections
pub const MAX_WS_CONNECTIONS: usize = 100;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub authenticator: Arc<Authenticator>,
    pub limiter: Arc<FreeTierLimiter>,
    pub trust: Arc<TrustStore>,
    pub registry: Arc<TaskRegistry>,
    pub executor: Arc<Executor>,
    pub escrow: Option<Arc<EscrowClient>>,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub http: reqwest::Client,
    pub card: Arc<serde_json::Value>,
    pub llms_txt: Arc<String>,
    pub started_at: Instant,
    pub ws_connections: Arc<AtomicUsize>,
    pub sandbox_limiter: Arc<SandboxLimiter>,
}

impl AppState {
    /// Construct every core component from one configuration snapshot
    pub fn build(mut config: Config) -> Result<Self> {
        // A zero-valued pay-to address resolves to the wallet's own address
        if let (Some(x402), Some(key)) = (&mut config.x402, &config.wallet_private_key) {
            if is_zero_address(&x402.pay_to) {
                let signer: alloy::signers::local::PrivateKeySigner =
                    key.parse().wrap_err("Invalid wallet private key")?;
                x402.pay_to = signer.address().to_string();
                info!(pay_to = %x402.pay_to, "Resolved x402 pay-to from wallet key");
            }
        }

        let receipt_validator = match &config.x402 {
            Some(x402) => Some(Arc::new(X402Validator::new(x402.clone())?)
                as Arc<dyn crate::auth::ReceiptValidator>),
            None => None,
        };
        let authenticator = Arc::new(Authenticator::new(
            config.auth.api_token.clone(),
            receipt_validator,
        ));

        let escrow = match (&config.escrow, &config.wallet_private_key) {
            (Some(escrow_config), Some(key)) => {
                Some(Arc::new(EscrowClient::new(escrow_config, key)?))
            }
            _ => None,
        };

        let executor = Arc::new(
            Executor::new(
                &config.executor.command,
                &config.executor.allowed_commands,
                config.executor.workspace_dir.clone(),
                config.executor.task_timeout,
            )
            .map_err(|e| eyre::eyre!("{}", e))?,
        );

        let limiter = Arc::new(FreeTierLimiter::load(config.rate_limit_file()));
        let trust = Arc::new(TrustStore::load(config.trust_store_file()));
        let registry = Arc::new(TaskRegistry::new(config.result_ttl_s));

        let snapshot = card::snapshot_timestamp();
        let card = Arc::new(card::build_card(&config, &snapshot));
        let llms_txt = Arc::new(card::build_llms_txt(&config));

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .wrap_err("building HTTP client")?;

        Ok(Self {
            config: Arc::new(config),
            authenticator,
            limiter,
            trust,
            registry,
            executor,
            escrow,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            http,
            card,
            llms_txt,
            started_at: Instant::now(),
            ws_connections: Arc::new(AtomicUsize::new(0)),
            sandbox_limiter: Arc::new(SandboxLimiter::new(
                rest::SANDBOX_REQUESTS_PER_HOUR,
                Duration::from_secs(3600),
            )),
        })
    }

    /// Spawn the periodic background work: registry sweeps and rate-limit
    /// persistence. Both stop once the coordinator leaves `accepting`.
    pub fn spawn_background_tasks(&self) {
        let registry = self.registry.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(crate::registry::SWEEP_INTERVAL_S));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !shutdown.is_accepting() {
                    break;
                }
                registry.sweep();
            }
        });

        let limiter = self.limiter.clone();
        let trust = self.trust.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(crate::ratelimit::SAVE_INTERVAL_SECS));
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if !shutdown.is_accepting() {
                    break;
                }
                limiter.cleanup();
                limiter.save();
                trust.save();
            }
        });
    }
}

/// Build the full router with middleware applied
pub fn build_router(state: AppState) -> Router {
    let config = state.config.clone();

    // Rate-limited application routes
    let mut app_routes = Router::new()
        .route("/task", post(rest::post_task))
        .route("/task/{id}", get(rest::get_task).delete(rest::delete_task))
        .route("/", post(rpc::handle_rpc))
        .route("/a2a", post(rpc::handle_rpc))
        .route("/ws", get(ws::ws_upgrade))
        .route("/sandbox", post(rest::post_sandbox))
        .route("/discovery/agents", get(proxy::discovery_agents))
        .route("/discovery/agents/{did}", get(proxy::discovery_agent))
        .route("/discovery/search", post(proxy::discovery_search))
        .route("/trust/{did}", get(proxy::trust_view))
        .route("/status", get(rest::get_status))
        .route("/llms.txt", get(rest::get_llms_txt))
        .route("/.well-known/agent.json", get(rest::get_card))
        .route("/.well-known/agent-card.json", get(rest::get_card))
        .route("/.well-known/a2a.json", get(rest::get_card));

    if config.server.rate_limit.enabled {
        let rate = &config.server.rate_limit;
        // Token refill spread over the window; burst carries the full budget
        let period_ms = (rate.window_ms / rate.max.max(1) as u64).max(1);
        let governor_config = Arc::new(
            GovernorConfigBuilder::default()
                .period(Duration::from_millis(period_ms))
                .burst_size(rate.max)
                .finish()
                .expect("static governor configuration is valid"),
        );
        app_routes = app_routes.layer(GovernorLayer::new(governor_config));
    }

    // Health and metrics stay outside the limiter
    let open_routes = Router::new()
        .route("/health", get(rest::get_health))
        .route("/metrics", get(rest::get_metrics));

    app_routes
        .merge(open_routes)
        .layer(RequestBodyLimitLayer::new(config.server.body_limit))
        .layer(cors_layer(&config))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-content-type-options"),
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("x-frame-options"),
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            HeaderName::from_static("referrer-policy"),
            HeaderValue::from_static("no-referrer"),
        ))
        .with_state(state)
}

fn cors_layer(config: &Config) -> CorsLayer {
    let origins = &config.server.cors_origins;
    if origins.iter().any(|o| o == "*") {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }
    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|o| o.parse().ok())
        .collect();
    CorsLayer::new()
        .allow_origin(tower_http::cors::AllowOrigin::list(parsed))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Serve the router until the coordinator leaves `accepting`
pub async fn serve(state: AppState) -> Result<()> {
    let addr: SocketAddr = format!("{}:{}", state.config.server.host, state.config.server.port)
        .parse()
        .wrap_err("invalid bind address")?;

    state.spawn_background_tasks();
    metrics::UP.set(1.0);

    let mut phase = state.shutdown.subscribe();
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "Bridge listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        // Stop accepting connections as soon as draining begins
        while phase.changed().await.is_ok() {
            if *phase.borrow() != crate::shutdown::Phase::Accepting {
                break;
            }
        }
    })
    .await?;

    Ok(())
}

/// Authenticate an HTTP request, honoring `require_auth`
pub(crate) async fn authenticate_http(
    state: &AppState,
    headers: &HeaderMap,
    method: &Method,
    path: &str,
) -> Result<AuthContext, ApiError> {
    if !state.config.auth.require_auth {
        return Ok(AuthContext {
            identity: ClientIdentity::anonymous(),
            method: crate::auth::AuthMethod::FreeTier,
        });
    }

    let req = AuthRequest {
        authorization: header_str(headers, AUTHORIZATION.as_str()),
        api_key: header_str(headers, "x-api-key"),
        payment: header_str(headers, "x-payment"),
        method: method.as_str(),
        path,
    };

    state.authenticator.authenticate(&req).await.map_err(|e| {
        metrics::AUTH_FAILURES
            .with_label_values(&[match &e {
                crate::auth::AuthError::PaymentRequired { .. } => "payment",
                crate::auth::AuthError::TimestampOutOfWindow => "timestamp",
                crate::auth::AuthError::InvalidSignature => "signature",
                _ => "credentials",
            }])
            .inc();
        e.into()
    })
}

pub(crate) fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

/// Client IP: first `X-Forwarded-For` hop from the trusted reverse proxy,
/// falling back to the socket peer
pub(crate) fn client_ip(headers: &HeaderMap, connect: &ConnectInfo<SocketAddr>) -> String {
    header_str(headers, "x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| connect.0.ip().to_string())
}

/// An address of all zeros (with or without the 0x prefix)
fn is_zero_address(addr: &str) -> bool {
    let hex = addr.strip_prefix("0x").unwrap_or(addr);
    !hex.is_empty() && hex.bytes().all(|b| b == b'0')
}

/// Fixed-window per-IP limiter for the sandbox path
pub struct SandboxLimiter {
    max: u32,
    window: Duration,
    hits: Mutex<HashMap<String, (u32, Instant)>>,
}

impl SandboxLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        Self {
            max,
            window,
            hits: Mutex::new(HashMap::new()),
        }
    }

    /// Record a hit for `ip`; returns whether it is within budget
    pub fn allow(&self, ip: &str) -> bool {
        let now = Instant::now();
        let mut hits = self.hits.lock().expect("sandbox lock poisoned");
        hits.retain(|_, (_, start)| now.duration_since(*start) < self.window);
        let entry = hits.entry(ip.to_string()).or_insert((0, now));
        if entry.0 >= self.max {
            return false;
        }
        entry.0 += 1;
        true
    }
}
