//! Unix socket server for admin commands.
//!
//! Provides a local IPC interface for operator actions: crediting
//! watersheds from the giving platform, reserve bookkeeping, delinquency
//! status changes and pledge settlement.

use crate::error::Result;
use crate::service::{LendingService, ReserveSummary};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use watershed_ledger::{LoanStatus, Money};

/// Admin command sent over the socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum AdminCommand {
    /// Record giving inflow into a user's watershed
    CreditWatershed {
        user_id: String,
        amount: Money,
        description: Option<String>,
    },
    /// Recognise platform revenue into the reserve
    AccruePlatformCut {
        amount: Money,
        description: Option<String>,
    },
    /// Settle pending revenue into the reserve
    ClearRevenue {
        amount: Money,
        description: Option<String>,
    },
    /// Signed manual correction of the reserve
    AdjustReserve { amount: Money, description: String },
    /// Reserve summary
    ReserveStatus,
    /// Delinquency scan / funding reaper transition
    SetLoanStatus { loan_id: String, status: LoanStatus },
    /// Collect a loan's undisbursed pledges
    SettlePledges { loan_id: String },
    /// Ping (health check)
    Ping,
}

/// Response from admin command.
#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum AdminResponse {
    Ok { message: String },
    Error { error: String },
    Reserve(ReserveSummary),
    Pong,
}

/// Admin socket server.
pub struct AdminSocket {
    service: Arc<LendingService>,
    socket_path: PathBuf,
}

impl AdminSocket {
    /// Create a new admin socket server.
    pub fn new(service: Arc<LendingService>, socket_path: PathBuf) -> Self {
        Self {
            service,
            socket_path,
        }
    }

    /// Run the admin socket server.
    pub async fn run(&self) -> Result<()> {
        // Remove existing socket file if present
        let _ = std::fs::remove_file(&self.socket_path);

        let listener = UnixListener::bind(&self.socket_path)?;
        tracing::info!("Admin socket listening on {:?}", self.socket_path);

        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let service = Arc::clone(&self.service);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, service).await {
                            tracing::error!("Admin connection error: {}", e);
                        }
                    });
                }
                Err(e) => {
                    tracing::error!("Failed to accept admin connection: {}", e);
                }
            }
        }
    }

    /// Get the socket path.
    pub fn socket_path(&self) -> &PathBuf {
        &self.socket_path
    }
}

async fn handle_connection(stream: UnixStream, service: Arc<LendingService>) -> Result<()> {
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);
    let mut line = String::new();

    while reader.read_line(&mut line).await? > 0 {
        let response = match serde_json::from_str::<AdminCommand>(&line) {
            Ok(cmd) => execute_command(cmd, &service).await,
            Err(e) => AdminResponse::Error {
                error: format!("Invalid command: {}", e),
            },
        };

        let response_json = serde_json::to_string(&response)? + "\n";
        writer.write_all(response_json.as_bytes()).await?;
        line.clear();
    }

    Ok(())
}

/// Run one command against the service.
pub async fn execute_command(cmd: AdminCommand, service: &LendingService) -> AdminResponse {
    let result = match cmd {
        AdminCommand::CreditWatershed {
            user_id,
            amount,
            description,
        } => service
            .credit_watershed(&user_id, amount, description)
            .await
            .map(|tx| {
                format!(
                    "Credited {} to {} (balance {})",
                    tx.amount, user_id, tx.balance_after
                )
            }),

        AdminCommand::AccruePlatformCut {
            amount,
            description,
        } => service
            .accrue_platform_cut(amount, description)
            .await
            .map(|tx| format!("Accrued {} (reserve {})", tx.amount, tx.balance_after)),

        AdminCommand::ClearRevenue {
            amount,
            description,
        } => service
            .clear_revenue(amount, description)
            .await
            .map(|tx| format!("Cleared {} (reserve {})", tx.amount, tx.balance_after)),

        AdminCommand::AdjustReserve {
            amount,
            description,
        } => service
            .adjust_reserve(amount, &description)
            .await
            .map(|tx| format!("Adjusted by {} (reserve {})", tx.amount, tx.balance_after)),

        AdminCommand::ReserveStatus => {
            return match service.reserve_summary() {
                Ok(summary) => AdminResponse::Reserve(summary),
                Err(e) => AdminResponse::Error {
                    error: e.to_string(),
                },
            }
        }

        AdminCommand::SetLoanStatus { loan_id, status } => service
            .transition(&loan_id, status)
            .await
            .map(|loan| format!("Loan {} is now {}", loan.id, loan.status)),

        AdminCommand::SettlePledges { loan_id } => service
            .settle_pledges(&loan_id)
            .await
            .map(|s| format!("Settled {} pledges totalling {}", s.pledges, s.total)),

        AdminCommand::Ping => return AdminResponse::Pong,
    };

    match result {
        Ok(message) => AdminResponse::Ok { message },
        Err(e) => AdminResponse::Error {
            error: e.to_string(),
        },
    }
}
