use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

use hotspot_engine::ledger::VoucherState;

/// Hotspot Session & Quota Accounting Engine
///
/// Issues and redeems Wi-Fi vouchers, keeps subscriber balances and runs
/// metered access sessions against a network-access controller.
#[derive(Parser, Debug)]
#[command(name = "hotspot-engine")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the engine configuration file [default: platform config path]
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    pub json: bool,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write an example configuration and plan catalog
    Init {
        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },
    /// List the plan catalog
    Plans,
    /// Manage vouchers
    Vouchers {
        #[command(subcommand)]
        command: VoucherCommands,
    },
    /// Redeem a voucher for a subscriber
    Redeem {
        /// Voucher code
        code: String,

        /// Subscriber to credit
        #[arg(long)]
        subscriber: String,
    },
    /// Show a subscriber's remaining balance
    Balance {
        /// Subscriber ID
        subscriber: String,
    },
    /// Start, stop or revoke a subscriber's session through the running daemon
    Session {
        #[command(subcommand)]
        command: SessionCommands,
    },
    /// Show live and ended sessions
    Sessions {
        /// Only sessions of this subscriber
        #[arg(long)]
        subscriber: Option<String>,

        /// Only sessions that are starting, active or stopping
        #[arg(long)]
        active: bool,

        /// Print CSV instead of text
        #[arg(long)]
        csv: bool,
    },
    /// List subscribers with their balances
    Subscribers {
        /// Print CSV instead of text
        #[arg(long)]
        csv: bool,
    },
    /// Show dashboard statistics
    Stats,
    /// Run the engine in the foreground until Ctrl+C
    Serve,
}

#[derive(Subcommand, Debug)]
pub enum SessionCommands {
    /// Start a session and wait for the access grant
    Start {
        #[arg(long)]
        subscriber: String,
    },
    /// Stop a session at the subscriber's request
    Stop {
        #[arg(long)]
        subscriber: String,
    },
    /// Terminate a session administratively
    Revoke {
        #[arg(long)]
        subscriber: String,
    },
}

#[derive(Subcommand, Debug)]
pub enum VoucherCommands {
    /// Generate new vouchers for a plan
    Issue {
        /// Plan ID from the catalog
        #[arg(long)]
        plan: String,

        /// Number of vouchers to generate
        #[arg(long, default_value = "1")]
        count: usize,
    },
    /// List vouchers, newest first
    List {
        /// Only vouchers in this state
        #[arg(long)]
        state: Option<VoucherFilter>,
    },
    /// Withdraw an unredeemed voucher
    Revoke {
        /// Voucher code
        code: String,
    },
    /// Delete a voucher that was never redeemed
    Delete {
        /// Voucher code
        code: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum VoucherFilter {
    Unredeemed,
    Redeemed,
    Revoked,
}

impl VoucherFilter {
    pub fn matches(self, state: VoucherState) -> bool {
        matches!(
            (self, state),
            (VoucherFilter::Unredeemed, VoucherState::Unredeemed)
                | (VoucherFilter::Redeemed, VoucherState::Redeemed)
                | (VoucherFilter::Revoked, VoucherState::Revoked)
        )
    }
}
