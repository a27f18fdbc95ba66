//! Watershed Node - peer-funded micro-lending service
//!
//! Runs the watershed ledger over persistent storage and exposes it to
//! borrowers, funders and operators.
//!
//! # Architecture
//!
//! - **Storage**: RocksDB-backed records with atomic write batches
//! - **Locks**: keyed async locks serializing work per loan and account
//! - **Service**: origination, repayment, pledges and settlement as atomic units
//! - **Events**: post-commit notifications for the badge/streak system
//! - **API**: HTTP endpoints for borrowers and funders
//! - **Admin Socket**: Unix socket for operator commands (watershed-admin CLI)
//!
//! # Example
//!
//! ```no_run
//! use watershed_node::{NodeConfig, WatershedNode};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = NodeConfig::from_env()?;
//!     let node = WatershedNode::new(config).await?;
//!     node.run().await?;
//!     Ok(())
//! }
//! ```

pub mod admin_socket;
pub mod api;
pub mod error;
pub mod events;
pub mod locks;
pub mod node;
pub mod service;
pub mod storage;

pub use error::{Error, Result};
pub use events::{EventBus, LedgerEvent};
pub use node::{NodeConfig, WatershedNode};
pub use service::LendingService;
pub use storage::{LedgerBatch, Storage};
