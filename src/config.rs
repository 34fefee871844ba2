#![allow(dead_code)]

use eyre::{eyre, Result, WrapErr};
use std::env;
use std::fmt;
use std::path::{Path, PathBuf};

/// Main configuration for the bridge
#[derive(Debug, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub executor: ExecutorConfig,
    pub auth: AuthConfig,
    pub agent: AgentConfig,
    /// Provider wallet key, hex with 0x prefix. Required whenever the
    /// escrow or x402 paths are enabled.
    pub wallet_private_key: Option<String>,
    /// Optional escrow settlement path
    pub escrow: Option<EscrowConfig>,
    /// Optional on-chain payment-receipt path
    pub x402: Option<X402Config>,
    /// Upstream P2P node for the discovery/trust reverse-proxy
    pub node_url: Option<String>,
    /// Directory holding rate-limits.json and trust-store.json
    pub state_dir: PathBuf,
    /// TTL for completed task results, seconds
    pub result_ttl_s: i64,
    /// Upper bound for `?wait=true` blocking, seconds
    pub sync_timeout_s: u64,
    /// Drain window on shutdown, seconds
    pub drain_timeout_s: u64,
}

/// HTTP/WebSocket bind and middleware configuration
#[derive(Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub body_limit: usize,
    pub rate_limit: RateLimitConfig,
    /// WebSocket handshake token; falls back to api_token when unset
    pub ws_auth_token: Option<String>,
    /// WebSocket Origin allowlist; empty means any
    pub ws_allowed_origins: Vec<String>,
}

/// Custom Debug that redacts the WS token to prevent accidental log leakage.
impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("cors_origins", &self.cors_origins)
            .field("body_limit", &self.body_limit)
            .field("rate_limit", &self.rate_limit)
            .field("ws_auth_token", &self.ws_auth_token.as_ref().map(|_| "<redacted>"))
            .field("ws_allowed_origins", &self.ws_allowed_origins)
            .finish()
    }
}

/// Global per-route request limiter
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub max: u32,
    pub window_ms: u64,
}

/// Subprocess execution configuration
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    pub workspace_dir: PathBuf,
    pub command: String,
    pub allowed_commands: Vec<String>,
    /// Per-task timeout ceiling, seconds
    pub task_timeout: u64,
}

/// Task-route authentication configuration
#[derive(Clone)]
pub struct AuthConfig {
    pub require_auth: bool,
    pub api_token: Option<String>,
}

/// Custom Debug that redacts the API token.
impl fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthConfig")
            .field("require_auth", &self.require_auth)
            .field("api_token", &self.api_token.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// Escrow contract configuration
#[derive(Debug, Clone)]
pub struct EscrowConfig {
    pub contract_address: String,
    pub rpc_url: String,
    pub chain_id: u64,
    /// The DID this bridge settles as; its keccak256 hash must match the
    /// escrow's provider commitment
    pub provider_did: String,
}

/// x402 payment-receipt configuration
#[derive(Debug, Clone)]
pub struct X402Config {
    pub pay_to: String,
    pub usdc_address: String,
    /// Price per task in token base units, decimal string
    pub price_usdc: String,
    pub network: String,
    /// Accepted receipt validity window, seconds
    pub validity_period: u64,
}

/// Capability-card content
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub name: String,
    pub description: String,
    pub version: String,
    pub skills: Vec<String>,
    pub url: Option<String>,
    pub did: Option<String>,
    /// Price per task, decimal string; "0" advertises a free agent
    pub price_per_task: String,
    /// Optional rich capability-card JSON file (<= 1 MiB)
    pub card_path: Option<PathBuf>,
}

/// Capability-card file size cap, bytes
pub const MAX_CARD_FILE_BYTES: u64 = 1024 * 1024;

/// Default functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8787
}

fn default_cors_origins() -> Vec<String> {
    vec!["http://localhost:3000".to_string()]
}

fn default_body_limit() -> usize {
    1024 * 1024
}

fn default_rate_limit_max() -> u32 {
    60
}

fn default_rate_limit_window_ms() -> u64 {
    60_000
}

fn default_command() -> String {
    "claude".to_string()
}

fn default_task_timeout() -> u64 {
    300
}

fn default_result_ttl_s() -> i64 {
    3600
}

fn default_sync_timeout_s() -> u64 {
    55
}

fn default_drain_timeout_s() -> u64 {
    30
}

fn default_x402_validity_period() -> u64 {
    600
}

fn default_state_dir() -> PathBuf {
    env::var("HOME")
        .map(|home| Path::new(&home).join(".agentmesh-bridge"))
        .unwrap_or_else(|_| PathBuf::from(".agentmesh-bridge"))
}

impl Config {
    /// Load configuration from environment variables
    /// Loads .env file if present, then reads from environment
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();
        Self::load_from_env()
    }

    /// Load configuration from environment variables
    pub fn load_from_env() -> Result<Self> {
        let server = ServerConfig {
            host: env_or("BRIDGE_HOST", default_host()),
            port: env_parse("BRIDGE_PORT").unwrap_or_else(default_port),
            cors_origins: env_list("BRIDGE_CORS_ORIGINS").unwrap_or_else(default_cors_origins),
            body_limit: env_parse("BRIDGE_BODY_LIMIT").unwrap_or_else(default_body_limit),
            rate_limit: RateLimitConfig {
                enabled: env_parse("BRIDGE_RATE_LIMIT_ENABLED").unwrap_or(true),
                max: env_parse("BRIDGE_RATE_LIMIT_MAX").unwrap_or_else(default_rate_limit_max),
                window_ms: env_parse("BRIDGE_RATE_LIMIT_WINDOW_MS")
                    .unwrap_or_else(default_rate_limit_window_ms),
            },
            ws_auth_token: env::var("BRIDGE_WS_AUTH_TOKEN").ok(),
            ws_allowed_origins: env_list("BRIDGE_WS_ALLOWED_ORIGINS").unwrap_or_default(),
        };

        let command = env_or("BRIDGE_COMMAND", default_command());
        let executor = ExecutorConfig {
            workspace_dir: PathBuf::from(env_or("BRIDGE_WORKSPACE_DIR", "./workspace".to_string())),
            allowed_commands: env_list("BRIDGE_ALLOWED_COMMANDS")
                .unwrap_or_else(|| vec![command.clone()]),
            command,
            task_timeout: env_parse("BRIDGE_TASK_TIMEOUT").unwrap_or_else(default_task_timeout),
        };

        let auth = AuthConfig {
            require_auth: env_parse("BRIDGE_REQUIRE_AUTH").unwrap_or(true),
            api_token: env::var("BRIDGE_API_TOKEN").ok(),
        };

        // Escrow is enabled only when every required field is present
        let escrow = match (
            env::var("ESCROW_CONTRACT_ADDRESS").ok(),
            env::var("ESCROW_RPC_URL").ok(),
            env::var("ESCROW_PROVIDER_DID").ok(),
        ) {
            (Some(contract_address), Some(rpc_url), Some(provider_did)) => Some(EscrowConfig {
                contract_address,
                rpc_url,
                chain_id: env_parse("ESCROW_CHAIN_ID").unwrap_or(1),
                provider_did,
            }),
            _ => None,
        };

        let x402 = match (env::var("X402_PAY_TO").ok(), env::var("X402_USDC_ADDRESS").ok()) {
            (Some(pay_to), Some(usdc_address)) => Some(X402Config {
                pay_to,
                usdc_address,
                price_usdc: env_or("X402_PRICE_USDC", "10000".to_string()),
                network: env_or("X402_NETWORK", "base-sepolia".to_string()),
                validity_period: env_parse("X402_VALIDITY_PERIOD")
                    .unwrap_or_else(default_x402_validity_period),
            }),
            _ => None,
        };

        let agent = AgentConfig {
            name: env_or("BRIDGE_AGENT_NAME", "AgentMesh Bridge".to_string()),
            description: env_or(
                "BRIDGE_AGENT_DESCRIPTION",
                "Bridge exposing a local AI coding worker to the AgentMesh marketplace".to_string(),
            ),
            version: env_or("BRIDGE_AGENT_VERSION", env!("CARGO_PKG_VERSION").to_string()),
            skills: env_list("BRIDGE_AGENT_SKILLS")
                .unwrap_or_else(|| vec!["prompt".to_string(), "code-review".to_string()]),
            url: env::var("BRIDGE_AGENT_URL").ok(),
            did: env::var("BRIDGE_AGENT_DID").ok(),
            price_per_task: env_or("BRIDGE_PRICE_PER_TASK", "0".to_string()),
            card_path: env::var("BRIDGE_AGENT_CARD_PATH").ok().map(PathBuf::from),
        };

        let config = Config {
            server,
            executor,
            auth,
            agent,
            wallet_private_key: env::var("BRIDGE_WALLET_PRIVATE_KEY").ok(),
            escrow,
            x402,
            node_url: env::var("BRIDGE_NODE_URL").ok(),
            state_dir: env::var("BRIDGE_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| default_state_dir()),
            result_ttl_s: env_parse("BRIDGE_RESULT_TTL").unwrap_or_else(default_result_ttl_s),
            sync_timeout_s: env_parse("BRIDGE_SYNC_TIMEOUT").unwrap_or_else(default_sync_timeout_s),
            drain_timeout_s: env_parse("BRIDGE_DRAIN_TIMEOUT")
                .unwrap_or_else(default_drain_timeout_s),
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(eyre!("BRIDGE_PORT cannot be 0"));
        }

        if self.executor.workspace_dir.as_os_str().is_empty() {
            return Err(eyre!("BRIDGE_WORKSPACE_DIR cannot be empty"));
        }

        if !self
            .executor
            .allowed_commands
            .iter()
            .any(|c| c == &self.executor.command)
        {
            return Err(eyre!(
                "BRIDGE_COMMAND '{}' must appear in BRIDGE_ALLOWED_COMMANDS",
                self.executor.command
            ));
        }

        if self.executor.task_timeout == 0 || self.executor.task_timeout > 3600 {
            return Err(eyre!("BRIDGE_TASK_TIMEOUT must be between 1 and 3600 seconds"));
        }

        // The wallet key is required as soon as a paid path is configured
        if (self.escrow.is_some() || self.x402.is_some()) && self.wallet_private_key.is_none() {
            return Err(eyre!(
                "BRIDGE_WALLET_PRIVATE_KEY is required when escrow or x402 is configured"
            ));
        }

        if let Some(ref key) = self.wallet_private_key {
            if key.len() != 66 || !key.starts_with("0x") {
                return Err(eyre!(
                    "BRIDGE_WALLET_PRIVATE_KEY must be 66 chars (0x + 64 hex chars)"
                ));
            }
        }

        if let Some(ref escrow) = self.escrow {
            if escrow.contract_address.len() != 42 || !escrow.contract_address.starts_with("0x") {
                return Err(eyre!(
                    "ESCROW_CONTRACT_ADDRESS must be a valid hex address (42 chars with 0x prefix)"
                ));
            }
            if escrow.rpc_url.is_empty() {
                return Err(eyre!("ESCROW_RPC_URL cannot be empty"));
            }
            if !crate::identity::is_valid_did(&escrow.provider_did) {
                return Err(eyre!("ESCROW_PROVIDER_DID must be a valid DID"));
            }
        }

        if let Some(ref x402) = self.x402 {
            if !x402.price_usdc.bytes().all(|b| b.is_ascii_digit()) {
                return Err(eyre!("X402_PRICE_USDC must be a base-unit integer"));
            }
        }

        if let Some(ref card_path) = self.agent.card_path {
            let meta = std::fs::metadata(card_path)
                .wrap_err_with(|| format!("BRIDGE_AGENT_CARD_PATH {} not readable", card_path.display()))?;
            if meta.len() > MAX_CARD_FILE_BYTES {
                return Err(eyre!(
                    "capability card file exceeds {} bytes",
                    MAX_CARD_FILE_BYTES
                ));
            }
            let raw = std::fs::read_to_string(card_path).wrap_err("reading capability card file")?;
            serde_json::from_str::<serde_json::Value>(&raw)
                .wrap_err("capability card file is not valid JSON")?;
        }

        Ok(())
    }

    /// WS handshake token: dedicated token when set, api token otherwise
    pub fn ws_token(&self) -> Option<&str> {
        self.server
            .ws_auth_token
            .as_deref()
            .or(self.auth.api_token.as_deref())
    }

    pub fn rate_limit_file(&self) -> PathBuf {
        self.state_dir.join("rate-limits.json")
    }

    pub fn trust_store_file(&self) -> PathBuf {
        self.state_dir.join("trust-store.json")
    }
}

fn env_or(name: &str, default: String) -> String {
    env::var(name).unwrap_or(default)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|v| v.parse().ok())
}

fn env_list(name: &str) -> Option<Vec<String>> {
    env::var(name).ok().map(|v| {
        v.split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()
    })
}
