use anyhow::Result;

use super::{parse_date, parse_id, rupiah, AppContext, Command};
use simpa_bend::Sp2d;

fn print_sp2d(sp2d: &Sp2d) {
    println!("🏦 SP2D {} ({})", sp2d.nomor_sp2d, sp2d.id);
    println!("   SPM: {}  |  Nilai: {}  |  Status: {}  |  Versi: {}", sp2d.spm_id, rupiah(sp2d.nilai), sp2d.status, sp2d.version);
    if let Some(penguji) = &sp2d.nomor_penguji {
        println!("   Nomor penguji: {penguji}");
    }
    if let (Some(reference), Some(date)) = (&sp2d.bank_reference, sp2d.tanggal_cair) {
        println!("   Cair {date} (ref {reference})");
    }
}

pub struct DispatchCommand<'a> {
    ctx: &'a AppContext,
    sp2d_id: String,
    version: i64,
    nomor_penguji: String,
}

impl<'a> DispatchCommand<'a> {
    pub fn new(ctx: &'a AppContext, sp2d_id: String, version: i64, nomor_penguji: String) -> Self {
        Self {
            ctx,
            sp2d_id,
            version,
            nomor_penguji,
        }
    }
}

impl Command for DispatchCommand<'_> {
    async fn execute(&self) -> Result<()> {
        let id = parse_id(&self.sp2d_id)?;
        let actor = self.ctx.actor().await?;
        let sp2d = self
            .ctx
            .engine
            .dispatch_sp2d(&actor, id, self.version, &self.nomor_penguji)
            .await?;
        println!("📤 Sent to bank");
        print_sp2d(&sp2d);
        Ok(())
    }
}

pub struct RecordExecutionCommand<'a> {
    ctx: &'a AppContext,
    sp2d_id: String,
    version: i64,
    bank_reference: String,
    date: String,
}

impl<'a> RecordExecutionCommand<'a> {
    pub fn new(ctx: &'a AppContext, sp2d_id: String, version: i64, bank_reference: String, date: String) -> Self {
        Self {
            ctx,
            sp2d_id,
            version,
            bank_reference,
            date,
        }
    }
}

impl Command for RecordExecutionCommand<'_> {
    async fn execute(&self) -> Result<()> {
        let id = parse_id(&self.sp2d_id)?;
        let tanggal_cair = parse_date(&self.date)?;
        let actor = self.ctx.actor().await?;
        let sp2d = self
            .ctx
            .engine
            .record_execution(&actor, id, self.version, &self.bank_reference, tanggal_cair)
            .await?;
        println!("💸 Disbursement recorded");
        print_sp2d(&sp2d);
        Ok(())
    }
}
