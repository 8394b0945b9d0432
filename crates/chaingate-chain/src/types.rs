//! Records produced by the chain services.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ─── BlockRef ─────────────────────────────────────────────────────────────────

/// A block as cached by the reorg watcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockRef {
    pub chain_id: u64,
    pub number: u64,
    pub hash: String,
    pub parent_hash: String,
    /// Unix timestamp of the block (seconds since epoch).
    pub timestamp: i64,
    /// Transaction hashes (or ids) included in the block.
    #[serde(default)]
    pub transactions: Vec<String>,
}

impl BlockRef {
    /// Returns `true` if `parent` is the direct parent of `self`.
    pub fn extends(&self, parent: &BlockRef) -> bool {
        self.number == parent.number + 1 && self.parent_hash == parent.hash
    }

    /// Build from an `eth_getBlockByNumber` result object.
    pub fn from_json(chain_id: u64, v: &Value) -> Option<Self> {
        let transactions = v["transactions"]
            .as_array()
            .map(|txs| {
                txs.iter()
                    .filter_map(|tx| tx.as_str().or_else(|| tx["hash"].as_str()))
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();
        Some(Self {
            chain_id,
            number: parse_hex_u64(v["number"].as_str()?)?,
            hash: v["hash"].as_str()?.to_string(),
            parent_hash: v["parentHash"].as_str()?.to_string(),
            timestamp: v["timestamp"].as_str().and_then(parse_hex_u64).unwrap_or(0) as i64,
            transactions,
        })
    }
}

// ─── ReorgEvent ───────────────────────────────────────────────────────────────

/// A detected chain reorganization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReorgEvent {
    pub chain_id: u64,
    pub old_block_number: u64,
    pub old_block_hash: String,
    pub new_block_number: u64,
    pub new_block_hash: String,
    /// Number of invalidated ancestors, at least 1.
    pub depth: u64,
    pub detected_at: DateTime<Utc>,
}

// ─── GasEstimate ──────────────────────────────────────────────────────────────

/// Fee tiers for one chain, in wei.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GasEstimate {
    pub chain_id: u64,
    pub slow: u128,
    pub standard: u128,
    pub fast: u128,
    pub instant: u128,
    /// Present on fee-market chains only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_fee: Option<u128>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_priority_fee: Option<u128>,
    pub timestamp: DateTime<Utc>,
}

/// Raw fee inputs fetched from a chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeeData {
    /// Base fee plus priority fee (EIP-1559).
    FeeMarket { base_fee: u128, priority_fee: u128 },
    /// Single gas price.
    Legacy { gas_price: u128 },
}

// ─── NonceRecord ──────────────────────────────────────────────────────────────

/// Cached nonce state for one (chain, address).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NonceRecord {
    /// Last nonce floor known accepted on-chain.
    pub confirmed: u64,
    /// Next nonce to hand out.
    pub pending: u64,
    pub updated_at: DateTime<Utc>,
}

impl NonceRecord {
    pub fn seeded(value: u64) -> Self {
        Self {
            confirmed: value,
            pending: value,
            updated_at: Utc::now(),
        }
    }
}

// ─── Hex helpers ──────────────────────────────────────────────────────────────

/// Parse a hex quantity (with or without `0x`) to u64.
pub fn parse_hex_u64(s: &str) -> Option<u64> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return None;
    }
    u64::from_str_radix(digits, 16).ok()
}

/// Parse a hex quantity (with or without `0x`) to u128.
pub fn parse_hex_u128(s: &str) -> Option<u128> {
    let digits = s.strip_prefix("0x").unwrap_or(s);
    if digits.is_empty() {
        return None;
    }
    u128::from_str_radix(digits, 16).ok()
}

/// Encode a block number as a hex quantity.
pub fn to_hex(n: u64) -> String {
    format!("{n:#x}")
}
