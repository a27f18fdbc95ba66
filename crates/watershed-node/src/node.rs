//! Watershed Node - the main application entry point.
//!
//! Architecture:
//! - Single daemon process with shared RocksDB storage
//! - HTTP API for borrowers and funders
//! - Unix admin socket for operator commands (watershed-admin CLI)
//! - Badge hook consuming post-commit ledger events

use crate::admin_socket::AdminSocket;
use crate::api;
use crate::error::{Error, Result};
use crate::events::{run_badge_hook, EventBus};
use crate::service::LendingService;
use crate::storage::Storage;
use std::fmt::Display;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use watershed_ledger::{LendingPolicy, Money};

/// Admin socket override, read by both the node and `watershed-admin`.
pub const ADMIN_SOCKET_VAR: &str = "WATERSHED_ADMIN_SOCKET";

const DATA_DIR_VAR: &str = "WATERSHED_DATA_DIR";
const DEFAULT_DATA_DIR: &str = "./watershed-data";

/// Resolve the admin socket: the override if set, else `admin.sock` in the data dir.
pub fn admin_socket_path<F>(lookup: &F) -> PathBuf
where
    F: Fn(&str) -> Option<String>,
{
    lookup(ADMIN_SOCKET_VAR).map(PathBuf::from).unwrap_or_else(|| {
        PathBuf::from(lookup(DATA_DIR_VAR).unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()))
            .join("admin.sock")
    })
}

/// Configuration for a Watershed node.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// Data directory for storage
    pub data_dir: PathBuf,

    /// HTTP API listen address
    pub api_addr: SocketAddr,

    /// Admin socket path (for watershed-admin CLI)
    pub admin_socket: PathBuf,

    /// Buffered events per subscriber before it starts lagging
    pub event_capacity: usize,

    /// Lending thresholds
    pub policy: LendingPolicy,
}

impl NodeConfig {
    /// Create config from environment variables with sensible defaults.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build config from any variable source. Unset variables take defaults;
    /// unparseable ones are an error.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let data_dir =
            PathBuf::from(lookup(DATA_DIR_VAR).unwrap_or_else(|| DEFAULT_DATA_DIR.to_string()));
        let api_addr = parse_var(&lookup, "WATERSHED_API_ADDR", || {
            SocketAddr::from(([0, 0, 0, 0], 8080))
        })?;
        let admin_socket = admin_socket_path(&lookup);
        let event_capacity = parse_var(&lookup, "WATERSHED_EVENT_CAPACITY", || 256usize)?;

        let defaults = LendingPolicy::default();
        let mut policy = LendingPolicy {
            min_balance: dollars_var(&lookup, "WATERSHED_MIN_BALANCE", defaults.min_balance)?,
            min_amount: dollars_var(&lookup, "WATERSHED_MIN_AMOUNT", defaults.min_amount)?,
            max_amount: dollars_var(&lookup, "WATERSHED_MAX_AMOUNT", defaults.max_amount)?,
            fee_rate_bps: parse_var(&lookup, "WATERSHED_FEE_RATE_BPS", || defaults.fee_rate_bps)?,
            min_purpose_len: parse_var(&lookup, "WATERSHED_MIN_PURPOSE_LEN", || {
                defaults.min_purpose_len
            })?,
            recovery_payments_required: parse_var(&lookup, "WATERSHED_RECOVERY_PAYMENTS", || {
                defaults.recovery_payments_required
            })?,
            ..defaults.clone()
        };
        policy.term_tiers =
            parse_var(&lookup, "WATERSHED_TERM_TIERS", || defaults.term_tiers.clone())?;
        policy.deadline_tiers = parse_var(&lookup, "WATERSHED_DEADLINE_TIERS", || {
            defaults.deadline_tiers.clone()
        })?;
        policy.reserve_bands.healthy_bps = parse_var(&lookup, "WATERSHED_RESERVE_HEALTHY_BPS", || {
            defaults.reserve_bands.healthy_bps
        })?;
        policy.reserve_bands.watch_bps = parse_var(&lookup, "WATERSHED_RESERVE_WATCH_BPS", || {
            defaults.reserve_bands.watch_bps
        })?;
        policy
            .validate()
            .map_err(|e| Error::Config(format!("invalid lending policy: {}", e)))?;

        Ok(Self {
            data_dir,
            api_addr,
            admin_socket,
            event_capacity,
            policy,
        })
    }
}

fn parse_var<T, F>(lookup: &F, name: &str, default: impl FnOnce() -> T) -> Result<T>
where
    T: FromStr,
    T::Err: Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::Config(format!("invalid {}={:?}: {}", name, raw, e))),
        None => Ok(default()),
    }
}

fn dollars_var<F>(lookup: &F, name: &str, default: Money) -> Result<Money>
where
    F: Fn(&str) -> Option<String>,
{
    let dollars = parse_var(lookup, name, || default.to_dollars())?;
    Money::from_dollars(dollars)
        .ok_or_else(|| Error::Config(format!("invalid {}: {} is not an amount", name, dollars)))
}

/// A Watershed node instance.
pub struct WatershedNode {
    service: Arc<LendingService>,
    config: NodeConfig,
}

impl WatershedNode {
    /// Create a new node, opening storage under the data directory.
    pub async fn new(config: NodeConfig) -> Result<Self> {
        // Ensure data directory exists
        std::fs::create_dir_all(&config.data_dir)?;

        let storage = Arc::new(Storage::open(&config.data_dir)?);
        storage.init_reserve()?;

        let service = Arc::new(LendingService::new(
            storage,
            config.policy.clone(),
            EventBus::new(config.event_capacity),
        ));

        Ok(Self { service, config })
    }

    /// The lending service shared by the API and admin socket.
    pub fn service(&self) -> Arc<LendingService> {
        Arc::clone(&self.service)
    }

    /// Run the node (starts the badge hook, admin socket, and HTTP server).
    pub async fn run(self) -> Result<()> {
        tracing::info!("Watershed node starting");
        tracing::info!("  API: http://{}", self.config.api_addr);
        tracing::info!("  Admin: {:?}", self.config.admin_socket);
        tracing::info!("  Data: {:?}", self.config.data_dir);
        tracing::info!(
            "  Policy: min balance {}, fee {} bps, terms {}, deadlines {}",
            self.config.policy.min_balance,
            self.config.policy.fee_rate_bps,
            self.config.policy.term_tiers,
            self.config.policy.deadline_tiers
        );

        tokio::spawn(run_badge_hook(self.service.events().subscribe()));

        let admin_socket = AdminSocket::new(self.service(), self.config.admin_socket.clone());
        tokio::spawn(async move {
            if let Err(e) = admin_socket.run().await {
                tracing::error!("Admin socket error: {}", e);
            }
        });

        let app = api::build_router(self.service());

        let listener = tokio::net::TcpListener::bind(self.config.api_addr).await?;
        tracing::info!("HTTP server listening on {}", self.config.api_addr);

        axum::serve(listener, app).await?;

        Ok(())
    }
}
