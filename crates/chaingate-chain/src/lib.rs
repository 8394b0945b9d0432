//! chaingate-chain: chain-aware services built on the provider pool.
//!
//! - [`ChainReader`]: typed `eth_*` queries (block height, blocks, nonces, fees)
//! - [`NonceTracker`]: lock-guarded per-account nonce allocation
//! - [`ReorgWatcher`]: block-hash cache and reorg depth detection
//! - [`GasPriceOracle`]: tiered gas estimates with caching and history

pub mod gas;
pub mod nonce;
pub mod reader;
pub mod reorg;
pub mod types;

pub use gas::{estimate_from, GasConfig, GasPriceOracle};
pub use nonce::{normalize_address, NonceConfig, NonceEvent, NonceTracker};
pub use reader::{ChainReader, PoolChainReader};
pub use reorg::{BlockCache, ReorgConfig, ReorgWatcher};
pub use types::{BlockRef, FeeData, GasEstimate, NonceRecord, ReorgEvent};
