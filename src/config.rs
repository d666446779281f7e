use serde::Deserialize;

/// Runtime configuration for a [`crate::TransactionController`] instance.
#[derive(Debug, Clone, Deserialize)]
pub struct TellerConfig {
    /// Network the controller is scoped to. Records from other networks
    /// are invisible to default queries.
    pub network_id: u64,
    /// Chain id stamped onto every record and passed to the signer.
    pub chain_id: u64,
    /// Retention limit for finalized records on the current network.
    /// Unapproved records never count against it.
    #[serde(default = "default_tx_history_limit")]
    pub tx_history_limit: usize,
    /// Number of consecutive polling cycles a submitted transaction must
    /// be observed with its nonce slot consumed (and no receipt) before it
    /// is declared dropped. Nodes report nonces eventually-consistently,
    /// so a single observation is not trustworthy.
    #[serde(default = "default_dropped_buffer_blocks")]
    pub dropped_buffer_blocks: u32,
    /// Minimum fee bump, in percent, applied to cancel/speed-up
    /// replacements. Nodes reject same-nonce replacements below ~10%.
    #[serde(default = "default_gas_bump_percent")]
    pub gas_bump_percent: u64,
    /// Capacity of the lifecycle event channel.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

fn default_tx_history_limit() -> usize {
    40
}

fn default_dropped_buffer_blocks() -> u32 {
    3
}

fn default_gas_bump_percent() -> u64 {
    10
}

fn default_event_buffer() -> usize {
    256
}

impl Default for TellerConfig {
    fn default() -> Self {
        Self {
            network_id: 1,
            chain_id: 1,
            tx_history_limit: default_tx_history_limit(),
            dropped_buffer_blocks: default_dropped_buffer_blocks(),
            gas_bump_percent: default_gas_bump_percent(),
            event_buffer: default_event_buffer(),
        }
    }
}
