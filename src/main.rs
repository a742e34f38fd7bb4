use anyhow::Result;
use clap::Parser;

mod cli;

use cli::commands::admin::{AssignRoleCommand, BootstrapAdminCommand, EmergencyCommand, InitDbCommand, RevokeRoleCommand};
use cli::commands::document::{
    ArchiveCommand, AttachCommand, CreateCommand, HistoryCommand, ListCommand, RequestOtpCommand, TransitionCommand,
};
use cli::commands::numbering::{AllocateCommand, ResetCounterCommand, SetTemplateCommand};
use cli::commands::sp2d::{DispatchCommand, RecordExecutionCommand};
use cli::commands::{AppContext, Command};
use cli::{Cli, Commands};
use simpa_bend::{init_telemetry, shutdown_database, shutdown_telemetry, SimpaBendConfig};

fn main() -> Result<()> {
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        show_getting_started();
        return Ok(());
    };

    SimpaBendConfig::load_env_file()?;
    let config = SimpaBendConfig::load(cli.config.as_deref())?;
    init_telemetry(&config.observability)?;
    let metrics_enabled = config.observability.metrics_enabled;

    let result = tokio::runtime::Runtime::new()?.block_on(async {
        let ctx = AppContext::open(config, cli.user).await?;
        let outcome = run(&ctx, command).await;
        shutdown_database().await;
        outcome
    });

    shutdown_telemetry(metrics_enabled);
    result
}

async fn run(ctx: &AppContext, command: Commands) -> Result<()> {
    match command {
        Commands::InitDb => InitDbCommand::new(ctx).execute().await,
        Commands::BootstrapAdmin { user_id } => BootstrapAdminCommand::new(ctx, user_id).execute().await,
        Commands::AssignRole { user_id, role, opd } => {
            AssignRoleCommand::new(ctx, user_id, role).with_opd(opd).execute().await
        }
        Commands::RevokeRole { user_id, role } => RevokeRoleCommand::new(ctx, user_id, role).execute().await,
        Commands::Create {
            opd,
            jenis,
            nilai,
            uraian,
            program,
            kegiatan,
            sub_kegiatan,
            vendor,
            taxes,
            suggest_taxes,
        } => {
            CreateCommand::new(ctx, opd, &jenis, nilai, uraian)?
                .with_budget_codes(program, kegiatan, sub_kegiatan)
                .with_vendor(vendor)
                .with_taxes(&taxes)?
                .with_suggested_taxes(suggest_taxes)
                .execute()
                .await
        }
        Commands::Transition {
            id,
            action,
            version,
            note,
            otp,
        } => {
            TransitionCommand::new(ctx, id, action, version)
                .with_note(note)
                .with_otp(otp)
                .execute()
                .await
        }
        Commands::RequestOtp { purpose } => RequestOtpCommand::new(ctx, purpose).execute().await,
        Commands::Dispatch {
            sp2d_id,
            version,
            nomor_penguji,
        } => DispatchCommand::new(ctx, sp2d_id, version, nomor_penguji).execute().await,
        Commands::RecordExecution {
            sp2d_id,
            version,
            bank_reference,
            date,
        } => {
            RecordExecutionCommand::new(ctx, sp2d_id, version, bank_reference, date)
                .execute()
                .await
        }
        Commands::Attach { id, file } => AttachCommand::new(ctx, id, file).execute().await,
        Commands::Archive { id, version, note } => {
            ArchiveCommand::new(ctx, id, version).with_note(note).execute().await
        }
        Commands::History { id, json } => HistoryCommand::new(ctx, id).with_json(json).execute().await,
        Commands::List {
            status,
            opd,
            jenis,
            year,
            include_archived,
            summary,
        } => {
            ListCommand::new(ctx)
                .with_status(status.as_deref())?
                .with_jenis(jenis.as_deref())?
                .with_opd(opd)
                .with_year(year)
                .with_archived(include_archived)
                .with_summary(summary)
                .execute()
                .await
        }
        Commands::Allocate { series, date } => AllocateCommand::new(ctx, series).with_date(date).execute().await,
        Commands::ResetCounter { series, year, month } => {
            ResetCounterCommand::new(ctx, series, year).with_month(month).execute().await
        }
        Commands::SetTemplate { series, year, template } => {
            SetTemplateCommand::new(ctx, series, year, template).execute().await
        }
        Commands::Emergency { mode, reason } => EmergencyCommand::new(ctx, mode).with_reason(reason).execute().await,
    }
}

fn show_getting_started() {
    println!("🏛️  SIMPA BEND: SPM/SP2D verification workflow");
    println!();
    println!("   First run:");
    println!("     simpa-bend init-db");
    println!("     simpa-bend bootstrap-admin <USER>");
    println!("     simpa-bend --as <ADMIN> assign-role <USER> bendahara_opd --opd <OPD>");
    println!();
    println!("   Daily work:");
    println!("     simpa-bend --as <USER> list --status diajukan");
    println!("     simpa-bend --as <USER> transition <SPM_ID> approve --version <N>");
    println!();
    println!("   💡 Run 'simpa-bend --help' for every command");
}
