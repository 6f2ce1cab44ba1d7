//! NetworkNeuron - a decentralized relay overlay
//!
//! This library implements the NetworkNeuron protocol: nodes discover
//! peers, negotiate authenticated sessions, route encrypted packets on
//! client-selected paths, account for forwarded bandwidth, and earn
//! stake-weighted rewards from a token ledger.

pub mod accounting;
pub mod api;
pub mod config;
pub mod coordinator;
pub mod crypto;
pub mod error;
pub mod ledger;
pub mod peer;
pub mod protocol;
pub mod reward;
pub mod routing;
pub mod session;
pub mod transport;

// Re-export commonly used types
pub use config::NodeConfig;
pub use coordinator::{NodeCoordinator, NodeEvent};
pub use error::{Error, Result};
pub use protocol::{NodeId, TokenAmount};
