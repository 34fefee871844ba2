//! Capability card and machine-readable agent reference
//!
//! The card is computed once per configuration snapshot at startup and
//! served verbatim from three well-known aliases (`agent.json`,
//! `agent-card.json`, `a2a.json` for historical compatibility). A
//! configured card file acts as the base document; computed fields are
//! written over it so the always-emitted set is never missing.

use chrono::{SecondsFormat, Utc};
use serde_json::{json, Value};
use tracing::warn;

use crate::config::Config;

/// Protocol revision the card advertises
const PROTOCOL_VERSION: &str = "0.3.0";

/// Build the capability card for one configuration snapshot.
///
/// Deterministic per snapshot: `updated_at` is stamped by the caller once
/// at startup, not per request.
pub fn build_card(config: &Config, updated_at: &str) -> Value {
    // A configured card file is the base document
    let mut card = config
        .agent
        .card_path
        .as_ref()
        .and_then(|path| match std::fs::read_to_string(path) {
            Ok(raw) => serde_json::from_str::<Value>(&raw).ok(),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to read capability card file");
                None
            }
        })
        .filter(Value::is_object)
        .unwrap_or_else(|| json!({}));

    let agent = &config.agent;

    // Always-emitted fields win over the file
    card["name"] = json!(agent.name);
    card["description"] = json!(agent.description);
    card["version"] = json!(agent.version);
    card["protocolVersion"] = json!(PROTOCOL_VERSION);
    card["skills"] = json!(agent
        .skills
        .iter()
        .map(|s| json!({"id": s, "name": s}))
        .collect::<Vec<_>>());
    card["payment"] = json!({
        "pricePerTask": agent.price_per_task,
        "methods": payment_methods(config),
    });
    card["metadata"] = json!({"updatedAt": updated_at});

    // Optional fields appear only when configured
    if let Some(ref did) = agent.did {
        card["id"] = json!(did);
    }
    if let Some(ref url) = agent.url {
        card["url"] = json!(url);
    }
    if config.auth.require_auth {
        card["authentication"] = json!({
            "schemes": ["bearer", "did-signature", "free-tier"],
        });
    }
    card["freeTier"] = json!({
        "enabled": true,
        "identityHeader": "Authorization: FreeTier <identifier>",
        "dailyLimitsByTrustTier": {
            "new": 10,
            "familiar": 25,
            "established": 50,
            "trusted": 100,
        },
    });
    if let Some(ref x402) = config.x402 {
        card["capabilities"] = json!({"x402": true});
        card["x402"] = json!({
            "network": x402.network,
            "payTo": x402.pay_to,
            "asset": x402.usdc_address,
            "priceUsdc": x402.price_usdc,
        });
    }
    if config.escrow.is_some() {
        card["trust"] = json!({"escrow": true});
    }

    card
}

fn payment_methods(config: &Config) -> Vec<&'static str> {
    let mut methods = vec!["free-tier"];
    if config.x402.is_some() {
        methods.push("x402");
    }
    if config.escrow.is_some() {
        methods.push("escrow");
    }
    methods
}

/// Timestamp for one configuration snapshot
pub fn snapshot_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Render the plain-text agent reference served at /llms.txt
pub fn build_llms_txt(config: &Config) -> String {
    let base_url = config
        .agent
        .url
        .clone()
        .unwrap_or_else(|| format!("http://{}:{}", config.server.host, config.server.port));
    let agent = &config.agent;

    format!(
        "# {name}\n\
         > {description}\n\
         \n\
         ## Endpoints\n\
         - POST /task - submit a task (202, or 200 with ?wait=true)\n\
         - GET /task/{{id}} - poll a task result\n\
         - DELETE /task/{{id}} - cancel a pending task\n\
         - POST / - JSON-RPC 2.0 (message/send, tasks/get, tasks/cancel, agent/describe, agent/status)\n\
         - GET /ws - WebSocket task channel\n\
         - POST /sandbox - unauthenticated trial (3 requests/hour)\n\
         - GET /health - liveness\n\
         - GET {card_path} - capability card\n\
         \n\
         ## Authentication\n\
         - Authorization: Bearer <token>\n\
         - Authorization: DID <did>:<unix_ts>:<base64url_sig> (Ed25519 over \"<ts>:<METHOD>:<path>\")\n\
         - Authorization: FreeTier <identifier>\n\
         - x-payment: <x402 receipt>\n\
         \n\
         ## Minimal Example\n\
         curl -X POST {base}/task?wait=true \\\n\
         \x20\x20-H 'Authorization: FreeTier my-agent' \\\n\
         \x20\x20-H 'Content-Type: application/json' \\\n\
         \x20\x20-d '{{\"type\": \"prompt\", \"prompt\": \"summarize this repository\"}}'\n",
        name = agent.name,
        description = agent.description,
        card_path = super::error::CARD_PATH,
        base = base_url,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        AgentConfig, AuthConfig, Config, EscrowConfig, ExecutorConfig, RateLimitConfig,
        ServerConfig, X402Config,
    };
    use std::path::PathBuf;

    fn config() -> Config {
        Config {
            server: ServerConfig {
                host: "127.0.0.1".to_string(),
                port: 8787,
                cors_origins: vec![],
                body_limit: 1024 * 1024,
                rate_limit: RateLimitConfig {
                    enabled: true,
                    max: 60,
                    window_ms: 60_000,
                },
                ws_auth_token: None,
                ws_allowed_origins: vec![],
            },
            executor: ExecutorConfig {
                workspace_dir: PathBuf::from("./workspace"),
                command: "claude".to_string(),
                allowed_commands: vec!["claude".to_string()],
                task_timeout: 300,
            },
            auth: AuthConfig {
                require_auth: true,
                api_token: None,
            },
            agent: AgentConfig {
                name: "Test Agent".to_string(),
                description: "An agent under test".to_string(),
                version: "1.2.3".to_string(),
                skills: vec!["prompt".to_string(), "refactor".to_string()],
                url: Some("https://agent.example".to_string()),
                did: Some("did:key:zAgent".to_string()),
                price_per_task: "0".to_string(),
                card_path: None,
            },
            wallet_private_key: None,
            escrow: None,
            x402: None,
            node_url: None,
            state_dir: PathBuf::from("/tmp"),
            result_ttl_s: 3600,
            sync_timeout_s: 55,
            drain_timeout_s: 30,
        }
    }

    #[test]
    fn test_always_emitted_fields_present() {
        let card = build_card(&config(), "2026-01-01T00:00:00Z");
        for field in [
            "name",
            "description",
            "version",
            "skills",
            "payment",
            "metadata",
            "protocolVersion",
        ] {
            assert!(card.get(field).is_some(), "missing field {}", field);
        }
        assert_eq!(card["metadata"]["updatedAt"], "2026-01-01T00:00:00Z");
        assert_eq!(card["id"], "did:key:zAgent");
        assert_eq!(card["url"], "https://agent.example");
    }

    #[test]
    fn test_card_is_deterministic_per_snapshot() {
        let cfg = config();
        let a = build_card(&cfg, "2026-01-01T00:00:00Z");
        let b = build_card(&cfg, "2026-01-01T00:00:00Z");
        assert_eq!(a, b);
    }

    #[test]
    fn test_optional_sections_follow_configuration() {
        let mut cfg = config();
        let card = build_card(&cfg, "t");
        assert!(card.get("x402").is_none());
        assert!(card.get("trust").is_none());

        cfg.x402 = Some(X402Config {
            pay_to: "0xAA".to_string(),
            usdc_address: "0xBB".to_string(),
            price_usdc: "10000".to_string(),
            network: "base-sepolia".to_string(),
            validity_period: 600,
        });
        cfg.escrow = Some(EscrowConfig {
            contract_address: "0x0000000000000000000000000000000000000001".to_string(),
            rpc_url: "http://localhost:8545".to_string(),
            chain_id: 31337,
            provider_did: "did:key:zProvider".to_string(),
        });
        let card = build_card(&cfg, "t");
        assert_eq!(card["x402"]["network"], "base-sepolia");
        assert_eq!(card["trust"]["escrow"], true);
        let methods = card["payment"]["methods"].as_array().unwrap();
        assert_eq!(methods.len(), 3);
    }

    #[test]
    fn test_card_file_is_base_document() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("card.json");
        std::fs::write(
            &path,
            r#"{"documentationUrl": "https://docs.example", "name": "overridden"}"#,
        )
        .unwrap();

        let mut cfg = config();
        cfg.agent.card_path = Some(path);
        let card = build_card(&cfg, "t");
        // Extra fields from the file survive; computed fields win
        assert_eq!(card["documentationUrl"], "https://docs.example");
        assert_eq!(card["name"], "Test Agent");
    }

    #[test]
    fn test_llms_txt_shape() {
        let text = build_llms_txt(&config());
        assert!(text.starts_with("# Test Agent\n> An agent under test\n"));
        assert!(text.contains("## Endpoints"));
        assert!(text.contains("## Authentication"));
        assert!(text.contains("## Minimal Example"));
        // Curl snippet templates the configured base URL
        assert!(text.contains("curl -X POST https://agent.example/task?wait=true"));
    }
}
