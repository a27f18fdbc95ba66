//! watershed-admin CLI tool
//!
//! Operator commands for a running watershed node.
//!
//! Usage:
//!   watershed-admin credit <user_id> <amount> [description]
//!   watershed-admin accrue <amount> [description]
//!   watershed-admin clear-revenue <amount> [description]
//!   watershed-admin adjust <amount> <description>
//!   watershed-admin reserve
//!   watershed-admin set-status <loan_id> <status>
//!   watershed-admin settle <loan_id>
//!   watershed-admin ping

use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use watershed_node::node::admin_socket_path;

/// Admin command sent over the socket.
#[derive(Debug, Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum AdminCommand {
    CreditWatershed {
        user_id: String,
        amount: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    AccruePlatformCut {
        amount: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    ClearRevenue {
        amount: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    AdjustReserve {
        amount: f64,
        description: String,
    },
    ReserveStatus,
    SetLoanStatus {
        loan_id: String,
        status: String,
    },
    SettlePledges {
        loan_id: String,
    },
    Ping,
}

/// Reserve summary as reported by the node.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReserveReport {
    balance: f64,
    total_inflow: f64,
    total_outflow: f64,
    total_replenished: f64,
    pending_disbursements: f64,
    coverage_ratio: Option<f64>,
    health: String,
}

/// Response from admin command.
#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum AdminResponse {
    Ok { message: String },
    Error { error: String },
    Reserve(ReserveReport),
    Pong,
}

fn print_usage() {
    eprintln!("watershed-admin - Operate a Watershed lending node");
    eprintln!();
    eprintln!("Usage:");
    eprintln!("  watershed-admin credit <user_id> <amount> [description]  Credit giving inflow");
    eprintln!("  watershed-admin accrue <amount> [description]            Accrue platform revenue");
    eprintln!("  watershed-admin clear-revenue <amount> [description]     Clear pending revenue");
    eprintln!("  watershed-admin adjust <amount> <description>            Manual reserve correction");
    eprintln!("  watershed-admin reserve                                  Show reserve health");
    eprintln!("  watershed-admin set-status <loan_id> <status>            Change loan status");
    eprintln!("  watershed-admin settle <loan_id>                         Collect loan pledges");
    eprintln!("  watershed-admin ping                                     Check if node is running");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  WATERSHED_ADMIN_SOCKET  Path to admin socket (default: $WATERSHED_DATA_DIR/admin.sock)");
    eprintln!("  WATERSHED_DATA_DIR      Node data directory (default: ./watershed-data)");
}

fn get_socket_path() -> PathBuf {
    admin_socket_path(&|name: &str| std::env::var(name).ok())
}

fn send_command(cmd: AdminCommand) -> Result<AdminResponse, String> {
    let socket_path = get_socket_path();

    let mut stream = UnixStream::connect(&socket_path).map_err(|e| {
        format!(
            "Failed to connect to watershed-node at {:?}: {}\n\
             Is the watershed-node running?",
            socket_path, e
        )
    })?;

    // Send command
    let cmd_json = serde_json::to_string(&cmd).map_err(|e| e.to_string())?;
    writeln!(stream, "{}", cmd_json).map_err(|e| e.to_string())?;

    // Read response
    let mut reader = BufReader::new(&stream);
    let mut response_line = String::new();
    reader
        .read_line(&mut response_line)
        .map_err(|e| e.to_string())?;

    serde_json::from_str(&response_line).map_err(|e| format!("Invalid response: {}", e))
}

fn fail(message: &str) -> ! {
    eprintln!("Error: {}", message);
    std::process::exit(1);
}

fn arg(args: &[String], index: usize, command: &str, name: &str) -> String {
    match args.get(index) {
        Some(value) => value.clone(),
        None => fail(&format!("{} requires a {} argument", command, name)),
    }
}

fn amount(args: &[String], index: usize, command: &str) -> f64 {
    let raw = arg(args, index, command, "amount");
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() => value,
        _ => fail(&format!("'{}' is not an amount", raw)),
    }
}

/// Remaining arguments joined as free text.
fn rest(args: &[String], from: usize) -> Option<String> {
    let text = args.get(from..).unwrap_or_default().join(" ");
    if text.trim().is_empty() {
        None
    } else {
        Some(text)
    }
}

fn main() {
    let args: Vec<String> = std::env::args().collect();

    if args.len() < 2 {
        print_usage();
        std::process::exit(1);
    }

    let cmd = match args[1].as_str() {
        "credit" => AdminCommand::CreditWatershed {
            user_id: arg(&args, 2, "credit", "user_id"),
            amount: amount(&args, 3, "credit"),
            description: rest(&args, 4),
        },
        "accrue" => AdminCommand::AccruePlatformCut {
            amount: amount(&args, 2, "accrue"),
            description: rest(&args, 3),
        },
        "clear-revenue" => AdminCommand::ClearRevenue {
            amount: amount(&args, 2, "clear-revenue"),
            description: rest(&args, 3),
        },
        "adjust" => AdminCommand::AdjustReserve {
            amount: amount(&args, 2, "adjust"),
            description: rest(&args, 3)
                .unwrap_or_else(|| fail("adjust requires a description")),
        },
        "reserve" => AdminCommand::ReserveStatus,
        "set-status" => AdminCommand::SetLoanStatus {
            loan_id: arg(&args, 2, "set-status", "loan_id"),
            status: arg(&args, 3, "set-status", "status"),
        },
        "settle" => AdminCommand::SettlePledges {
            loan_id: arg(&args, 2, "settle", "loan_id"),
        },
        "ping" => AdminCommand::Ping,
        "-h" | "--help" | "help" => {
            print_usage();
            std::process::exit(0);
        }
        other => {
            eprintln!("Unknown command: {}", other);
            print_usage();
            std::process::exit(1);
        }
    };

    match send_command(cmd) {
        Ok(response) => match response {
            AdminResponse::Ok { message } => {
                println!("{}", message);
            }
            AdminResponse::Error { error } => fail(&error),
            AdminResponse::Reserve(report) => {
                println!("health:                {}", report.health);
                println!("balance:               ${:.2}", report.balance);
                println!("pending disbursements: ${:.2}", report.pending_disbursements);
                match report.coverage_ratio {
                    Some(ratio) => println!("coverage:              {:.1}%", ratio * 100.0),
                    None => println!("coverage:              n/a"),
                }
                println!("total inflow:          ${:.2}", report.total_inflow);
                println!("total outflow:         ${:.2}", report.total_outflow);
                println!("total replenished:     ${:.2}", report.total_replenished);
            }
            AdminResponse::Pong => {
                println!("pong - watershed-node is running");
            }
        },
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(1);
        }
    }
}
