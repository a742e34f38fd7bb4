use clap::{Parser, Subcommand};
use std::path::PathBuf;

pub mod commands;

#[derive(Parser)]
#[command(name = "simpa-bend")]
#[command(about = "SPM/SP2D verification workflow and document numbering for BKAD")]
#[command(long_about = "SIMPA BEND moves payment orders (SPM) through receptionist, budget, accounting, \
                       treasury and head-of-agency review, issues SP2D disbursement orders and keeps \
                       the queue, file and SP2D number sequences. Start with 'simpa-bend init-db'.")]
pub struct Cli {
    /// Configuration file (defaults to simpa-bend.toml / .simpa-bend-rc)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// User the command acts as
    #[arg(long = "as", global = true, value_name = "USER")]
    pub user: Option<String>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create the database and run migrations
    InitDb,
    /// Grant the first superadmin (only while none exists)
    BootstrapAdmin {
        user_id: String,
    },
    /// Grant a role to a user
    AssignRole {
        user_id: String,
        /// superadmin, admin, bendahara_opd, resepsionis, pbmd, akuntansi, perbendaharaan, kepala_bkad
        role: String,
        /// Spending unit, required for bendahara_opd
        #[arg(long)]
        opd: Option<String>,
    },
    /// Revoke an active role
    RevokeRole {
        user_id: String,
        role: String,
    },
    /// Create an SPM draft
    Create {
        #[arg(long)]
        opd: String,
        /// up, gu, tu, ls_gaji, ls_barang_jasa, ls_pihak_ketiga
        #[arg(long)]
        jenis: String,
        #[arg(long)]
        nilai: i64,
        #[arg(long)]
        uraian: String,
        #[arg(long)]
        program: String,
        #[arg(long)]
        kegiatan: String,
        #[arg(long)]
        sub_kegiatan: String,
        #[arg(long)]
        vendor: Option<String>,
        /// Tax line as JENIS:DASAR[:RATE_BPS], repeatable
        #[arg(long = "tax")]
        taxes: Vec<String>,
        /// Add the default tax lines for the SPM kind
        #[arg(long, help = "Prefill the tax lines suggested for this kind of SPM")]
        suggest_taxes: bool,
    },
    /// Apply a workflow action to an SPM
    Transition {
        id: String,
        /// submit, receive, approve, request_revision, reject, resubmit
        action: String,
        /// Version last read (optimistic lock)
        #[arg(long)]
        version: i64,
        #[arg(long)]
        note: Option<String>,
        /// One-time code for gated actions
        #[arg(long)]
        otp: Option<String>,
    },
    /// Send a one-time code to the acting user
    RequestOtp {
        /// submission or disbursement
        purpose: String,
    },
    /// Mark an SP2D as sent to the bank
    Dispatch {
        sp2d_id: String,
        #[arg(long)]
        version: i64,
        #[arg(long)]
        nomor_penguji: String,
    },
    /// Record the bank's disbursement confirmation
    RecordExecution {
        sp2d_id: String,
        #[arg(long)]
        version: i64,
        #[arg(long)]
        bank_reference: String,
        /// YYYY-MM-DD
        #[arg(long)]
        date: String,
    },
    /// Attach a file to an SPM
    Attach {
        id: String,
        file: PathBuf,
    },
    /// Soft-archive a submitted SPM
    Archive {
        id: String,
        #[arg(long)]
        version: i64,
        #[arg(long)]
        note: Option<String>,
    },
    /// Show the audit trail of an SPM
    History {
        id: String,
        #[arg(long, help = "Print the trail as JSON")]
        json: bool,
    },
    /// List SPMs with optional filters
    List {
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        opd: Option<String>,
        #[arg(long)]
        jenis: Option<String>,
        #[arg(long)]
        year: Option<i32>,
        #[arg(long)]
        include_archived: bool,
        #[arg(long, help = "Only print the count per status")]
        summary: bool,
    },
    /// Mint a number outside a transition
    Allocate {
        /// antrian, berkas or sp2d
        series: String,
        /// Issue date YYYY-MM-DD (defaults to today)
        #[arg(long)]
        date: Option<String>,
    },
    /// Reset a numbering counter to zero
    ResetCounter {
        series: String,
        #[arg(long)]
        year: i32,
        /// Required for monthly series
        #[arg(long)]
        month: Option<u32>,
    },
    /// Store the number format for a series and year
    SetTemplate {
        series: String,
        #[arg(long)]
        year: i32,
        template: String,
    },
    /// Turn emergency mode (OTP bypass) on or off
    Emergency {
        #[arg(value_parser = ["on", "off", "status"])]
        mode: String,
        #[arg(long)]
        reason: Option<String>,
    },
}
