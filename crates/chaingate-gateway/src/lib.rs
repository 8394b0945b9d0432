//! chaingate-gateway: wires the ChainGate components into one gateway.
//!
//! ```no_run
//! use chaingate_gateway::{init_tracing, Gateway, GatewayConfig};
//!
//! # async fn run() -> Result<(), chaingate_core::GatewayError> {
//! let config = GatewayConfig::load("chaingate.yaml")?;
//! init_tracing(&config.logging);
//! let gateway = Gateway::connect(config).await?;
//! gateway.start().await?;
//! let resp = gateway.execute_rpc(1, "eth_blockNumber", vec![], Some("my-app")).await;
//! println!("{:?}", resp.result);
//! gateway.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod gateway;
pub mod telemetry;

pub use config::{GatewayConfig, LockBackend, StoreBackend};
pub use gateway::{connect_store, Gateway, GatewayBuilder, ANONYMOUS_CALLER};
pub use telemetry::{init_tracing, LogConfig};
