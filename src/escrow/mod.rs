//! On-chain escrow client
//!
//! Read side: fetch and validate an escrow before a task executes. Write
//! side: confirm delivery with the keccak256 commitment of the produced
//! output after a task completes. Both sides go through the shared retry
//! policy (1 s base, x2, max 5 attempts).
//!
//! Delivery confirmation is best-effort: a failure is logged and surfaced to
//! the caller, but it never changes the task result already reported to the
//! client.

pub mod contract;
pub mod retry;

use alloy::network::EthereumWallet;
use alloy::primitives::{Address, FixedBytes, U256};
use alloy::providers::ProviderBuilder;
use alloy::signers::local::PrivateKeySigner;
use chrono::Utc;
use eyre::{eyre, Result, WrapErr};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, warn};

use crate::config::EscrowConfig;
use crate::hash::{hash_did, hash_output};
use contract::AgentEscrow;
use retry::{with_retry, RetryConfig};

/// Escrow lifecycle states as stored on chain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EscrowState {
    AwaitingDeposit,
    Funded,
    Delivered,
    Disputed,
    Released,
    Refunded,
}

impl EscrowState {
    pub fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            0 => Some(EscrowState::AwaitingDeposit),
            1 => Some(EscrowState::Funded),
            2 => Some(EscrowState::Delivered),
            3 => Some(EscrowState::Disputed),
            4 => Some(EscrowState::Released),
            5 => Some(EscrowState::Refunded),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EscrowState::AwaitingDeposit => "AWAITING_DEPOSIT",
            EscrowState::Funded => "FUNDED",
            EscrowState::Delivered => "DELIVERED",
            EscrowState::Disputed => "DISPUTED",
            EscrowState::Released => "RELEASED",
            EscrowState::Refunded => "REFUNDED",
        }
    }
}

impl fmt::Display for EscrowState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An escrow record read from the chain
#[derive(Debug, Clone)]
pub struct EscrowDescriptor {
    pub id: U256,
    pub client_did_hash: [u8; 32],
    pub provider_did_hash: [u8; 32],
    pub client_addr: Address,
    pub provider_addr: Address,
    pub amount: U256,
    pub token: Address,
    pub task_hash: [u8; 32],
    pub output_hash: [u8; 32],
    pub deadline: u64,
    pub state: EscrowState,
    pub created_at: u64,
    pub delivered_at: u64,
}

/// Outcome of pre-execution escrow validation
#[derive(Debug, Clone)]
pub struct EscrowValidation {
    pub valid: bool,
    pub error: Option<String>,
}

impl EscrowValidation {
    fn ok() -> Self {
        Self {
            valid: true,
            error: None,
        }
    }

    fn rejected(reason: impl Into<String>) -> Self {
        Self {
            valid: false,
            error: Some(reason.into()),
        }
    }
}

/// Client for the escrow contract, holding immutable RPC connection state
pub struct EscrowClient {
    rpc_url: String,
    contract_address: Address,
    signer: PrivateKeySigner,
    /// keccak256 of this bridge's provider DID
    provider_did_hash: [u8; 32],
    retry: RetryConfig,
}

impl EscrowClient {
    pub fn new(config: &EscrowConfig, private_key: &str) -> Result<Self> {
        let contract_address =
            Address::from_str(&config.contract_address).wrap_err("Invalid escrow contract address")?;
        let signer: PrivateKeySigner = private_key
            .parse()
            .wrap_err("Invalid wallet private key")?;

        info!(
            provider_address = %signer.address(),
            chain_id = config.chain_id,
            contract = %contract_address,
            "Escrow client initialized"
        );

        Ok(Self {
            rpc_url: config.rpc_url.clone(),
            contract_address,
            signer,
            provider_did_hash: hash_did(&config.provider_did),
            retry: RetryConfig::default(),
        })
    }

    /// Hash of the provider DID this bridge authenticates as
    pub fn provider_did_hash(&self) -> &[u8; 32] {
        &self.provider_did_hash
    }

    /// Read an escrow record. Returns `None` for ids unknown to the
    /// contract (zero id sentinel).
    pub async fn get_escrow(&self, escrow_id: U256) -> Result<Option<EscrowDescriptor>> {
        let record = with_retry(&self.retry, |_| async {
            let provider = ProviderBuilder::new()
                .on_http(self.rpc_url.parse().wrap_err("Invalid RPC URL")?);
            let contract = AgentEscrow::new(self.contract_address, provider);
            let record = contract
                .getEscrow(escrow_id)
                .call()
                .await
                .map_err(|e| eyre!("getEscrow failed: {}", e))?;
            Ok(record)
        })
        .await?;

        if record.id.is_zero() {
            return Ok(None);
        }

        let state = EscrowState::from_u8(record.state)
            .ok_or_else(|| eyre!("unknown escrow state {}", record.state))?;

        Ok(Some(EscrowDescriptor {
            id: record.id,
            client_did_hash: record.clientDidHash.0,
            provider_did_hash: record.providerDidHash.0,
            client_addr: record.client,
            provider_addr: record.provider,
            amount: record.amount,
            token: record.token,
            task_hash: record.taskHash.0,
            output_hash: record.outputHash.0,
            deadline: record.deadline,
            state,
            created_at: record.createdAt,
            delivered_at: record.deliveredAt,
        }))
    }

    /// Pre-execution validation of the escrow a task claims to be paid from.
    ///
    /// `Ok(invalid)` is a business-rule rejection the caller reports as a
    /// payment failure; `Err` is a chain lookup that failed after retries
    /// and must surface as a service-layer error, never a user error.
    pub async fn validate_for_task(&self, escrow_id: &str) -> Result<EscrowValidation> {
        let id = match U256::from_str(escrow_id) {
            Ok(id) if !id.is_zero() => id,
            _ => {
                return Ok(EscrowValidation::rejected(
                    "escrow id is not a positive integer",
                ))
            }
        };

        let descriptor = match self.get_escrow(id).await? {
            Some(d) => d,
            None => return Ok(EscrowValidation::rejected(format!("escrow {} not found", id))),
        };

        let validation =
            check_escrow_terms(&descriptor, &self.provider_did_hash, Utc::now().timestamp());
        if validation.valid {
            debug!(escrow_id = %id, amount = %descriptor.amount, "Escrow validated");
        } else {
            warn!(escrow_id = %id, reason = ?validation.error, "Escrow rejected");
        }
        Ok(validation)
    }

    /// Confirm delivery on chain with the keccak256 commitment of the
    /// produced output. Returns the transaction hash.
    pub async fn confirm_delivery(&self, escrow_id: &str, output: &str) -> Result<String> {
        let id = U256::from_str(escrow_id)
            .map_err(|_| eyre!("escrow id is not a positive integer"))?;
        let output_hash = FixedBytes::from(hash_output(output));

        let tx_hash = with_retry(&self.retry, |_| async {
            let wallet = EthereumWallet::from(self.signer.clone());
            let provider = ProviderBuilder::new()
                .wallet(wallet)
                .on_http(self.rpc_url.parse().wrap_err("Invalid RPC URL")?);
            let contract = AgentEscrow::new(self.contract_address, provider);

            let pending_tx = contract
                .confirmDelivery(id, output_hash)
                .send()
                .await
                .map_err(|e| eyre!("Failed to send confirmDelivery: {}", e))?;

            let tx_hash = *pending_tx.tx_hash();
            let receipt = pending_tx
                .get_receipt()
                .await
                .map_err(|e| eyre!("Failed to get receipt: {}", e))?;

            if !receipt.status() {
                return Err(eyre!("confirmDelivery transaction reverted"));
            }

            Ok(format!("0x{:x}", tx_hash))
        })
        .await?;

        info!(escrow_id = %id, tx_hash = %tx_hash, "Delivery confirmed on chain");
        Ok(tx_hash)
    }
}

/// Business-rule check of an escrow record against this bridge's terms:
/// FUNDED state, the configured provider commitment, and a live deadline.
/// Takes plain inputs so the rules test without a chain transport.
pub fn check_escrow_terms(
    descriptor: &EscrowDescriptor,
    provider_did_hash: &[u8; 32],
    now_s: i64,
) -> EscrowValidation {
    if descriptor.state != EscrowState::Funded {
        return EscrowValidation::rejected(format!(
            "escrow {} is {}, expected FUNDED",
            descriptor.id, descriptor.state
        ));
    }

    if descriptor.provider_did_hash != *provider_did_hash {
        return EscrowValidation::rejected(format!(
            "escrow {} names a different provider",
            descriptor.id
        ));
    }

    if (descriptor.deadline as i64) <= now_s {
        return EscrowValidation::rejected(format!(
            "escrow {} deadline has passed",
            descriptor.id
        ));
    }

    EscrowValidation::ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hash::hash_did;

    const PROVIDER_DID: &str = "did:key:zProvider";

    fn funded_descriptor(now_s: i64) -> EscrowDescriptor {
        EscrowDescriptor {
            id: U256::from(42u64),
            client_did_hash: hash_did("did:key:zClient"),
            provider_did_hash: hash_did(PROVIDER_DID),
            client_addr: Address::ZERO,
            provider_addr: Address::ZERO,
            amount: U256::from(1_000_000u64),
            token: Address::ZERO,
            task_hash: [0u8; 32],
            output_hash: [0u8; 32],
            deadline: (now_s + 3600) as u64,
            state: EscrowState::Funded,
            created_at: (now_s - 60) as u64,
            delivered_at: 0,
        }
    }

    #[test]
    fn test_funded_escrow_with_matching_terms_is_valid() {
        let now_s = Utc::now().timestamp();
        let descriptor = funded_descriptor(now_s);
        let validation = check_escrow_terms(&descriptor, &hash_did(PROVIDER_DID), now_s);
        assert!(validation.valid);
        assert!(validation.error.is_none());
    }

    #[test]
    fn test_non_funded_states_are_rejected() {
        let now_s = Utc::now().timestamp();
        for state in [
            EscrowState::AwaitingDeposit,
            EscrowState::Delivered,
            EscrowState::Disputed,
            EscrowState::Released,
            EscrowState::Refunded,
        ] {
            let mut descriptor = funded_descriptor(now_s);
            descriptor.state = state;
            let validation = check_escrow_terms(&descriptor, &hash_did(PROVIDER_DID), now_s);
            assert!(!validation.valid, "state {} must be rejected", state);
            assert!(validation.error.unwrap().contains("expected FUNDED"));
        }
    }

    #[test]
    fn test_wrong_provider_commitment_is_rejected() {
        let now_s = Utc::now().timestamp();
        let descriptor = funded_descriptor(now_s);
        let validation =
            check_escrow_terms(&descriptor, &hash_did("did:key:zSomeoneElse"), now_s);
        assert!(!validation.valid);
        assert!(validation.error.unwrap().contains("different provider"));
    }

    #[test]
    fn test_deadline_boundary() {
        let now_s = Utc::now().timestamp();
        let mut descriptor = funded_descriptor(now_s);

        // Deadline exactly now is already passed
        descriptor.deadline = now_s as u64;
        let validation = check_escrow_terms(&descriptor, &hash_did(PROVIDER_DID), now_s);
        assert!(!validation.valid);
        assert!(validation.error.unwrap().contains("deadline"));

        // One second of life left is accepted
        descriptor.deadline = (now_s + 1) as u64;
        let validation = check_escrow_terms(&descriptor, &hash_did(PROVIDER_DID), now_s);
        assert!(validation.valid);
    }

    #[test]
    fn test_state_mapping_roundtrip() {
        for (raw, state) in [
            (0u8, EscrowState::AwaitingDeposit),
            (1, EscrowState::Funded),
            (2, EscrowState::Delivered),
            (3, EscrowState::Disputed),
            (4, EscrowState::Released),
            (5, EscrowState::Refunded),
        ] {
            assert_eq!(EscrowState::from_u8(raw), Some(state));
        }
        assert_eq!(EscrowState::from_u8(6), None);
    }

    #[test]
    fn test_state_wire_names() {
        assert_eq!(EscrowState::Funded.as_str(), "FUNDED");
        assert_eq!(EscrowState::AwaitingDeposit.as_str(), "AWAITING_DEPOSIT");
    }

    #[test]
    fn test_client_rejects_bad_addresses() {
        let config = EscrowConfig {
            contract_address: "not-an-address".to_string(),
            rpc_url: "http://localhost:8545".to_string(),
            chain_id: 31337,
            provider_did: "did:key:zProvider".to_string(),
        };
        let key = "0x0000000000000000000000000000000000000000000000000000000000000001";
        assert!(EscrowClient::new(&config, key).is_err());
    }

    #[test]
    fn test_provider_did_hash_committed_at_construction() {
        let config = EscrowConfig {
            contract_address: "0x0000000000000000000000000000000000000001".to_string(),
            rpc_url: "http://localhost:8545".to_string(),
            chain_id: 31337,
            provider_did: "did:key:zProvider".to_string(),
        };
        let key = "0x0000000000000000000000000000000000000000000000000000000000000001";
        let client = EscrowClient::new(&config, key).unwrap();
        assert_eq!(client.provider_did_hash(), &hash_did("did:key:zProvider"));
    }
}
