//! Typed chain queries used by the nonce tracker, reorg watcher and gas oracle.

use std::sync::Arc;

use async_trait::async_trait;
use chaingate_core::{GatewayError, JsonRpcResponse, ProviderPool, TransportError};
use serde_json::{json, Value};

use crate::types::{parse_hex_u128, parse_hex_u64, to_hex, BlockRef, FeeData};

/// Read-only chain access. Implemented over the provider pool in production
/// and by in-memory mocks in tests.
#[async_trait]
pub trait ChainReader: Send + Sync + 'static {
    /// Current head block number.
    async fn block_number(&self, chain_id: u64) -> Result<u64, GatewayError>;

    /// Block at `number`, or `None` if the node does not have it.
    async fn block(&self, chain_id: u64, number: u64) -> Result<Option<BlockRef>, GatewayError>;

    /// Transaction count for `address` including pending transactions.
    async fn transaction_count(&self, chain_id: u64, address: &str) -> Result<u64, GatewayError>;

    /// Current fee inputs. `fee_market` selects EIP-1559 or legacy pricing.
    async fn fee_data(&self, chain_id: u64, fee_market: bool) -> Result<FeeData, GatewayError>;
}

/// [`ChainReader`] that issues load-balanced calls through a [`ProviderPool`].
pub struct PoolChainReader {
    pool: Arc<ProviderPool>,
}

impl PoolChainReader {
    pub fn new(pool: Arc<ProviderPool>) -> Self {
        Self { pool }
    }

    async fn call(&self, chain_id: u64, method: &str, params: Vec<Value>) -> Result<Value, GatewayError> {
        let resp = self.pool.execute_balanced(chain_id, method, params).await?;
        node_result(method, resp)
    }
}

fn node_result(method: &str, resp: JsonRpcResponse) -> Result<Value, GatewayError> {
    resp.into_result().map_err(|e| {
        GatewayError::Provider(TransportError::Other(format!(
            "{method} rejected by node ({}): {}",
            e.code, e.message
        )))
    })
}

fn bad_shape(method: &str, value: &Value) -> GatewayError {
    GatewayError::Provider(TransportError::Deserialization(format!(
        "unexpected {method} result: {value}"
    )))
}

fn quantity(method: &str, value: &Value) -> Result<u64, GatewayError> {
    value
        .as_str()
        .and_then(parse_hex_u64)
        .ok_or_else(|| bad_shape(method, value))
}

fn wide_quantity(method: &str, value: &Value) -> Result<u128, GatewayError> {
    value
        .as_str()
        .and_then(parse_hex_u128)
        .ok_or_else(|| bad_shape(method, value))
}

#[async_trait]
impl ChainReader for PoolChainReader {
    async fn block_number(&self, chain_id: u64) -> Result<u64, GatewayError> {
        let v = self.call(chain_id, "eth_blockNumber", vec![]).await?;
        quantity("eth_blockNumber", &v)
    }

    async fn block(&self, chain_id: u64, number: u64) -> Result<Option<BlockRef>, GatewayError> {
        let v = self
            .call(chain_id, "eth_getBlockByNumber", vec![json!(to_hex(number)), json!(false)])
            .await?;
        if v.is_null() {
            return Ok(None);
        }
        BlockRef::from_json(chain_id, &v)
            .map(Some)
            .ok_or_else(|| bad_shape("eth_getBlockByNumber", &v))
    }

    async fn transaction_count(&self, chain_id: u64, address: &str) -> Result<u64, GatewayError> {
        let v = self
            .call(chain_id, "eth_getTransactionCount", vec![json!(address), json!("pending")])
            .await?;
        quantity("eth_getTransactionCount", &v)
    }

    async fn fee_data(&self, chain_id: u64, fee_market: bool) -> Result<FeeData, GatewayError> {
        if !fee_market {
            let v = self.call(chain_id, "eth_gasPrice", vec![]).await?;
            return Ok(FeeData::Legacy {
                gas_price: wide_quantity("eth_gasPrice", &v)?,
            });
        }

        let (history, priority) = futures::future::join(
            self.call(chain_id, "eth_feeHistory", vec![json!("0x1"), json!("latest"), json!([])]),
            self.call(chain_id, "eth_maxPriorityFeePerGas", vec![]),
        )
        .await;
        let history = history?;
        // The last entry is the base fee of the next block.
        let base = history["baseFeePerGas"]
            .as_array()
            .and_then(|fees| fees.last())
            .ok_or_else(|| bad_shape("eth_feeHistory", &history))?;
        Ok(FeeData::FeeMarket {
            base_fee: wide_quantity("eth_feeHistory", base)?,
            priority_fee: wide_quantity("eth_maxPriorityFeePerGas", &priority?)?,
        })
    }
}
