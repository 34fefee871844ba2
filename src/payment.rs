//! x402 payment-receipt validation
//!
//! The `x-payment` header carries a base64-encoded JSON receipt. The
//! validator checks the receipt against the configured payment terms and, on
//! success, attaches the payer as a paid identity. The 402 challenge document
//! advertises the terms a client must meet (`accepts` list), so an agent can
//! construct payment without out-of-band knowledge.

use alloy::primitives::U256;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use chrono::Utc;
use serde::Deserialize;
use std::str::FromStr;

use crate::auth::ReceiptValidator;
use crate::config::X402Config;
use crate::identity::ClientIdentity;

/// Wire shape of a decoded receipt
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Receipt {
    #[serde(default)]
    x402_version: u32,
    scheme: String,
    network: String,
    payload: ReceiptPayload,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReceiptPayload {
    payer: String,
    pay_to: String,
    asset: String,
    /// Token amount in base units, decimal string
    amount: String,
    /// Unix seconds after which the receipt is void
    valid_until: i64,
}

pub struct X402Validator {
    config: X402Config,
    price: U256,
}

impl X402Validator {
    pub fn new(config: X402Config) -> eyre::Result<Self> {
        let price = U256::from_str(&config.price_usdc)
            .map_err(|_| eyre::eyre!("x402 price must be a base-unit integer"))?;
        Ok(Self { config, price })
    }
}

#[async_trait]
impl ReceiptValidator for X402Validator {
    async fn validate(&self, receipt: &str) -> Result<ClientIdentity, String> {
        let decoded = STANDARD
            .decode(receipt.trim())
            .map_err(|_| "receipt is not valid base64".to_string())?;
        let receipt: Receipt = serde_json::from_slice(&decoded)
            .map_err(|_| "receipt is not valid JSON".to_string())?;

        if receipt.x402_version != 1 {
            return Err(format!(
                "unsupported x402 version {}",
                receipt.x402_version
            ));
        }
        if receipt.scheme != "exact" {
            return Err(format!("unsupported payment scheme '{}'", receipt.scheme));
        }
        if !receipt.network.eq_ignore_ascii_case(&self.config.network) {
            return Err(format!(
                "receipt network '{}' does not match '{}'",
                receipt.network, self.config.network
            ));
        }

        let payload = receipt.payload;
        if !payload.pay_to.eq_ignore_ascii_case(&self.config.pay_to) {
            return Err("receipt pays the wrong address".to_string());
        }
        if !payload.asset.eq_ignore_ascii_case(&self.config.usdc_address) {
            return Err("receipt uses the wrong asset".to_string());
        }

        let amount = U256::from_str(&payload.amount)
            .map_err(|_| "receipt amount is not a base-unit integer".to_string())?;
        if amount < self.price {
            return Err(format!(
                "receipt amount {} below required {}",
                amount, self.price
            ));
        }

        let now_s = Utc::now().timestamp();
        if payload.valid_until < now_s {
            return Err("receipt has expired".to_string());
        }
        if payload.valid_until > now_s + self.config.validity_period as i64 {
            return Err("receipt validity exceeds the accepted window".to_string());
        }

        Ok(ClientIdentity::paid(payload.payer))
    }

    fn challenge(&self) -> serde_json::Value {
        serde_json::json!({
            "x402Version": 1,
            "error": "X-PAYMENT header is required",
            "accepts": [{
                "scheme": "exact",
                "network": self.config.network,
                "maxAmountRequired": self.config.price_usdc,
                "payTo": self.config.pay_to,
                "asset": self.config.usdc_address,
                "resource": "/task",
                "description": "AgentMesh task execution",
                "maxTimeoutSeconds": self.config.validity_period,
            }]
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> X402Config {
        X402Config {
            pay_to: "0x00000000000000000000000000000000000000AA".to_string(),
            usdc_address: "0x00000000000000000000000000000000000000BB".to_string(),
            price_usdc: "10000".to_string(),
            network: "base-sepolia".to_string(),
            validity_period: 600,
        }
    }

    fn encode_receipt(
        pay_to: &str,
        asset: &str,
        amount: &str,
        valid_until: i64,
        network: &str,
    ) -> String {
        let json = serde_json::json!({
            "x402Version": 1,
            "scheme": "exact",
            "network": network,
            "payload": {
                "payer": "0x00000000000000000000000000000000000000CC",
                "payTo": pay_to,
                "asset": asset,
                "amount": amount,
                "validUntil": valid_until,
            }
        });
        STANDARD.encode(json.to_string())
    }

    #[tokio::test]
    async fn test_valid_receipt_accepted() {
        let validator = X402Validator::new(config()).unwrap();
        let receipt = encode_receipt(
            // Case differences in addresses are tolerated
            "0x00000000000000000000000000000000000000aa",
            "0x00000000000000000000000000000000000000bb",
            "10000",
            Utc::now().timestamp() + 60,
            "base-sepolia",
        );
        let identity = validator.validate(&receipt).await.unwrap();
        assert_eq!(identity.id, "0x00000000000000000000000000000000000000CC");
    }

    #[tokio::test]
    async fn test_underpaying_receipt_rejected() {
        let validator = X402Validator::new(config()).unwrap();
        let receipt = encode_receipt(
            "0x00000000000000000000000000000000000000AA",
            "0x00000000000000000000000000000000000000BB",
            "9999",
            Utc::now().timestamp() + 60,
            "base-sepolia",
        );
        let err = validator.validate(&receipt).await.unwrap_err();
        assert!(err.contains("below required"));
    }

    #[tokio::test]
    async fn test_expired_receipt_rejected() {
        let validator = X402Validator::new(config()).unwrap();
        let receipt = encode_receipt(
            "0x00000000000000000000000000000000000000AA",
            "0x00000000000000000000000000000000000000BB",
            "10000",
            Utc::now().timestamp() - 1,
            "base-sepolia",
        );
        assert!(validator.validate(&receipt).await.is_err());
    }

    #[tokio::test]
    async fn test_wrong_network_rejected() {
        let validator = X402Validator::new(config()).unwrap();
        let receipt = encode_receipt(
            "0x00000000000000000000000000000000000000AA",
            "0x00000000000000000000000000000000000000BB",
            "10000",
            Utc::now().timestamp() + 60,
            "mainnet",
        );
        assert!(validator.validate(&receipt).await.is_err());
    }

    #[tokio::test]
    async fn test_garbage_receipt_rejected() {
        let validator = X402Validator::new(config()).unwrap();
        assert!(validator.validate("%%%not-base64%%%").await.is_err());
        assert!(validator
            .validate(&STANDARD.encode("{\"not\": \"a receipt\"}"))
            .await
            .is_err());
    }

    #[test]
    fn test_challenge_advertises_terms() {
        let validator = X402Validator::new(config()).unwrap();
        let challenge = validator.challenge();
        assert_eq!(challenge["x402Version"], 1);
        let accepts = challenge["accepts"].as_array().unwrap();
        assert_eq!(accepts[0]["maxAmountRequired"], "10000");
        assert_eq!(accepts[0]["network"], "base-sepolia");
    }

    #[test]
    fn test_non_numeric_price_rejected_at_construction() {
        let mut cfg = config();
        cfg.price_usdc = "0.01".to_string();
        assert!(X402Validator::new(cfg).is_err());
    }
}
