//! Escrow contract ABI definitions
//!
//! Uses alloy's sol! macro to generate type-safe bindings for the escrow
//! contract the bridge settles against.

use alloy::sol;

sol! {
    /// Task escrow contract interface
    #[sol(rpc)]
    contract AgentEscrow {
        /// Full escrow record; `id` is zero for unknown escrows
        function getEscrow(uint256 escrowId) external view returns (
            uint256 id,
            bytes32 clientDidHash,
            bytes32 providerDidHash,
            address client,
            address provider,
            uint256 amount,
            address token,
            bytes32 taskHash,
            bytes32 outputHash,
            uint64 deadline,
            uint8 state,
            uint64 createdAt,
            uint64 deliveredAt
        );

        /// Provider marks the task delivered with the output commitment.
        /// Transitions FUNDED -> DELIVERED.
        function confirmDelivery(uint256 escrowId, bytes32 outputHash) external;

        /// Emitted when a provider confirms delivery
        event DeliveryConfirmed(
            uint256 indexed escrowId,
            bytes32 outputHash
        );
    }
}
