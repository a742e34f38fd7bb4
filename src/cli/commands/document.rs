use anyhow::{bail, Context, Result};
use std::path::PathBuf;
use std::str::FromStr;

use super::{parse_id, rupiah, AppContext, Command};
use simpa_bend::{
    Action, Document, DocumentFilter, DraftContent, JenisPajak, JenisSpm, OtpPurpose, SpmStatus, TaxLineInput,
    TransitionInput,
};

/// Parse `JENIS:DASAR[:RATE_BPS]` as given on the command line.
pub(crate) fn parse_tax_line(raw: &str) -> Result<TaxLineInput> {
    let mut parts = raw.split(':').map(str::trim);
    let jenis = parts.next().filter(|p| !p.is_empty()).context("tax line needs a kind")?;
    let dasar = parts
        .next()
        .context("tax line needs a base amount, e.g. pph21:5000000")?
        .parse::<i64>()
        .with_context(|| format!("invalid base amount in '{raw}'"))?;
    let mut line = TaxLineInput::new(JenisPajak::from_str(jenis)?, dasar);
    if let Some(rate) = parts.next() {
        line.rate_bps = Some(rate.parse().with_context(|| format!("invalid rate in '{raw}'"))?);
    }
    if parts.next().is_some() {
        bail!("too many fields in tax line '{raw}'");
    }
    Ok(line)
}

fn print_document(doc: &Document) {
    println!("📄 SPM {}", doc.id);
    println!("   OPD: {}  |  Jenis: {}  |  Versi: {}", doc.opd_id, doc.jenis.label(), doc.version);
    println!("   Status: {}{}", doc.status.label(), if doc.archived { " (diarsipkan)" } else { "" });
    println!("   Nilai: {}  |  Pajak: {}  |  Bersih: {}", rupiah(doc.nilai), rupiah(doc.total_pajak()), rupiah(doc.nilai_bersih()));
    if let Some(vendor) = &doc.vendor_id {
        println!("   Vendor: {vendor}");
    }
    if let Some(n) = &doc.nomor_antrian {
        println!("   Nomor antrian: {n}");
    }
    if let Some(n) = &doc.nomor_berkas {
        println!("   Nomor berkas: {n}");
    }
    if let Some(n) = &doc.nomor_sp2d {
        println!("   Nomor SP2D: {n}");
    }
}

pub struct CreateCommand<'a> {
    ctx: &'a AppContext,
    opd: String,
    content: DraftContent,
    suggest_taxes: bool,
}

impl<'a> CreateCommand<'a> {
    pub fn new(ctx: &'a AppContext, opd: String, jenis: &str, nilai: i64, uraian: String) -> Result<Self> {
        Ok(Self {
            ctx,
            opd,
            content: DraftContent {
                program_id: String::new(),
                kegiatan_id: String::new(),
                sub_kegiatan_id: String::new(),
                jenis: JenisSpm::from_str(jenis)?,
                nilai,
                uraian,
                vendor_id: None,
                tax_lines: Vec::new(),
            },
            suggest_taxes: false,
        })
    }

    pub fn with_budget_codes(mut self, program: String, kegiatan: String, sub_kegiatan: String) -> Self {
        self.content.program_id = program;
        self.content.kegiatan_id = kegiatan;
        self.content.sub_kegiatan_id = sub_kegiatan;
        self
    }

    pub fn with_vendor(mut self, vendor: Option<String>) -> Self {
        self.content.vendor_id = vendor;
        self
    }

    pub fn with_taxes(mut self, raw: &[String]) -> Result<Self> {
        for line in raw {
            self.content.tax_lines.push(parse_tax_line(line)?);
        }
        Ok(self)
    }

    pub fn with_suggested_taxes(mut self, suggest: bool) -> Self {
        self.suggest_taxes = suggest;
        self
    }
}

impl Command for CreateCommand<'_> {
    async fn execute(&self) -> Result<()> {
        let actor = self.ctx.actor().await?;
        let mut content = self.content.clone();
        if self.suggest_taxes {
            for suggested in self.ctx.engine.suggested_lines(content.jenis, content.nilai) {
                if !content.tax_lines.iter().any(|line| line.jenis == suggested.jenis) {
                    content.tax_lines.push(suggested);
                }
            }
        }
        let doc = self.ctx.engine.create_draft(&actor, &self.opd, content).await?;
        println!("✅ Draft created");
        print_document(&doc);
        println!("   💡 Submit with: simpa-bend --as {} transition {} submit --version {} --otp <CODE>", actor.user_id, doc.id, doc.version);
        Ok(())
    }
}

pub struct TransitionCommand<'a> {
    ctx: &'a AppContext,
    id: String,
    action: String,
    input: TransitionInput,
}

impl<'a> TransitionCommand<'a> {
    pub fn new(ctx: &'a AppContext, id: String, action: String, version: i64) -> Self {
        Self {
            ctx,
            id,
            action,
            input: TransitionInput::new(version),
        }
    }

    pub fn with_note(mut self, note: Option<String>) -> Self {
        self.input.note = note;
        self
    }

    pub fn with_otp(mut self, otp: Option<String>) -> Self {
        self.input.otp_code = otp;
        self
    }
}

impl Command for TransitionCommand<'_> {
    async fn execute(&self) -> Result<()> {
        let id = parse_id(&self.id)?;
        let action = Action::from_str(&self.action)?;
        let actor = self.ctx.actor().await?;
        let result = self.ctx.engine.transition(&actor, id, action, self.input.clone()).await?;

        println!("🔀 {} → {}", result.previous.label(), result.document.status.label());
        if result.emergency_bypass {
            println!("   🚨 One-time code bypassed (emergency mode)");
        }
        for number in &result.allocated {
            println!("   🔢 {}: {}", number.scope.series, number.number);
        }
        if let Some(sp2d) = &result.sp2d {
            println!("   🏦 SP2D {} ({}) {} [id {}, versi {}]", sp2d.nomor_sp2d, rupiah(sp2d.nilai), sp2d.status, sp2d.id, sp2d.version);
        }
        println!("   Version is now {}", result.document.version);
        let next = self.ctx.engine.allowed_actions(&result.document);
        if !next.is_empty() {
            let names: Vec<_> = next.iter().map(Action::as_str).collect();
            println!("   Next: {}", names.join(", "));
        }
        Ok(())
    }
}

pub struct RequestOtpCommand<'a> {
    ctx: &'a AppContext,
    purpose: String,
}

impl<'a> RequestOtpCommand<'a> {
    pub fn new(ctx: &'a AppContext, purpose: String) -> Self {
        Self { ctx, purpose }
    }
}

impl Command for RequestOtpCommand<'_> {
    async fn execute(&self) -> Result<()> {
        let purpose = OtpPurpose::from_str(&self.purpose)?;
        let actor = self.ctx.actor().await?;
        let issued = self.ctx.engine.request_otp(&actor, purpose).await?;
        println!(
            "📨 One-time code for {} sent over {} channel(s), valid until {}",
            issued.purpose.label(),
            issued.channels_delivered,
            issued.expires_at.format("%H:%M:%S UTC")
        );
        if self.ctx.config.notifications.log_message_bodies {
            println!("   📝 No gateway configured: the code is in the log output");
        } else {
            println!("   💡 Without a gateway, set notifications.log_message_bodies = true to read codes from the log");
        }
        Ok(())
    }
}

pub struct AttachCommand<'a> {
    ctx: &'a AppContext,
    id: String,
    file: PathBuf,
}

impl<'a> AttachCommand<'a> {
    pub fn new(ctx: &'a AppContext, id: String, file: PathBuf) -> Self {
        Self { ctx, id, file }
    }
}

impl Command for AttachCommand<'_> {
    async fn execute(&self) -> Result<()> {
        let id = parse_id(&self.id)?;
        let file_name = self
            .file
            .file_name()
            .and_then(|n| n.to_str())
            .context("attachment path has no usable file name")?;
        let content = tokio::fs::read(&self.file)
            .await
            .with_context(|| format!("Failed to read {}", self.file.display()))?;
        let actor = self.ctx.actor().await?;
        let attachment = self.ctx.engine.attach(&actor, id, file_name, &content).await?;
        println!("📎 Attached {} as {}", attachment.file_name, attachment.reference);
        Ok(())
    }
}

pub struct ArchiveCommand<'a> {
    ctx: &'a AppContext,
    id: String,
    version: i64,
    note: Option<String>,
}

impl<'a> ArchiveCommand<'a> {
    pub fn new(ctx: &'a AppContext, id: String, version: i64) -> Self {
        Self {
            ctx,
            id,
            version,
            note: None,
        }
    }

    pub fn with_note(mut self, note: Option<String>) -> Self {
        self.note = note;
        self
    }
}

impl Command for ArchiveCommand<'_> {
    async fn execute(&self) -> Result<()> {
        let id = parse_id(&self.id)?;
        let actor = self.ctx.actor().await?;
        let doc = self
            .ctx
            .engine
            .archive(&actor, id, self.version, self.note.as_deref())
            .await?;
        println!("🗃️  SPM {} archived at status {}", doc.id, doc.status.label());
        Ok(())
    }
}

pub struct HistoryCommand<'a> {
    ctx: &'a AppContext,
    id: String,
    json: bool,
}

impl<'a> HistoryCommand<'a> {
    pub fn new(ctx: &'a AppContext, id: String) -> Self {
        Self { ctx, id, json: false }
    }

    pub fn with_json(mut self, json: bool) -> Self {
        self.json = json;
        self
    }
}

impl Command for HistoryCommand<'_> {
    async fn execute(&self) -> Result<()> {
        let id = parse_id(&self.id)?;
        let doc = self.ctx.engine.document(id).await?;
        let trail = self.ctx.engine.history(id).await?;
        if self.json {
            println!("{}", serde_json::to_string_pretty(&trail)?);
            return Ok(());
        }

        print_document(&doc);
        println!();
        println!("📜 Audit trail ({} entries):", trail.len());
        for record in &trail {
            let from = record.from_state.as_deref().unwrap_or("-");
            println!(
                "   {} [{}] {} {}: {from} → {}",
                record.at.format("%Y-%m-%d %H:%M:%S"),
                record.doc_type,
                record.actor,
                record.action,
                record.to_state
            );
            if let Some(note) = &record.note {
                println!("      📝 {note}");
            }
        }
        Ok(())
    }
}

pub struct ListCommand<'a> {
    ctx: &'a AppContext,
    filter: DocumentFilter,
    summary: bool,
}

impl<'a> ListCommand<'a> {
    pub fn new(ctx: &'a AppContext) -> Self {
        Self {
            ctx,
            filter: DocumentFilter::default(),
            summary: false,
        }
    }

    pub fn with_status(mut self, status: Option<&str>) -> Result<Self> {
        self.filter.status = status.map(SpmStatus::from_str).transpose()?;
        Ok(self)
    }

    pub fn with_jenis(mut self, jenis: Option<&str>) -> Result<Self> {
        self.filter.jenis = jenis.map(JenisSpm::from_str).transpose()?;
        Ok(self)
    }

    pub fn with_opd(mut self, opd: Option<String>) -> Self {
        self.filter.opd_id = opd;
        self
    }

    pub fn with_year(mut self, year: Option<i32>) -> Self {
        self.filter.year = year;
        self
    }

    pub fn with_archived(mut self, include_archived: bool) -> Self {
        self.filter.include_archived = include_archived;
        self
    }

    pub fn with_summary(mut self, summary: bool) -> Self {
        self.summary = summary;
        self
    }
}

impl Command for ListCommand<'_> {
    async fn execute(&self) -> Result<()> {
        if self.summary {
            println!("📊 SPM per status:");
            for (status, count) in self.ctx.engine.status_summary(&self.filter).await? {
                if count > 0 {
                    println!("   {:<28} {count}", status.label());
                }
            }
            return Ok(());
        }

        let docs = self.ctx.engine.list_documents(&self.filter).await?;
        if docs.is_empty() {
            println!("📋 No SPM matches the filter");
            return Ok(());
        }
        println!("📋 {} SPM(s):", docs.len());
        for doc in &docs {
            println!(
                "   {}  v{:<3} {:<8} {:<26} {:>20}  {}",
                doc.id,
                doc.version,
                doc.opd_id,
                doc.status.label(),
                rupiah(doc.nilai),
                doc.nomor_berkas.as_deref().unwrap_or("-")
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tax_line_with_default_rate() {
        let line = parse_tax_line("pph21:5000000").unwrap();
        assert_eq!(line.jenis, JenisPajak::from_str("pph21").unwrap());
        assert_eq!(line.dasar, 5_000_000);
        assert_eq!(line.rate_bps, None);
    }

    #[test]
    fn tax_line_with_explicit_rate() {
        let line = parse_tax_line("ppn:10000000:1100").unwrap();
        assert_eq!(line.rate_bps, Some(1100));
    }

    #[test]
    fn malformed_tax_lines_are_rejected() {
        assert!(parse_tax_line("pph21").is_err());
        assert!(parse_tax_line("pph21:abc").is_err());
        assert!(parse_tax_line("pph21:1:2:3").is_err());
        assert!(parse_tax_line("zakat:1000").is_err());
    }
}
