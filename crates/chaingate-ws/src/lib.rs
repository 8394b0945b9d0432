//! chaingate-ws: WebSocket transport and subscription hub.
//!
//! # Features
//! - One connection per (chain, endpoint), multiplexing requests by id
//! - Push notifications demultiplexed by upstream subscription id
//! - Resubscribe on a freshly selected endpoint after a disconnect

pub mod connection;
pub mod hub;

pub use connection::{ConnectionEvent, WsConnection};
pub use hub::{HubConfig, SubscriptionConfig, SubscriptionData, SubscriptionHub, SubscriptionKind, SubscriptionRecord};
