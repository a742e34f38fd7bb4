use anyhow::{bail, Result};
use chrono::Utc;
use std::str::FromStr;

use super::{parse_date, AppContext, Command};
use simpa_bend::clock::local_date;
use simpa_bend::{NumberSeries, ScopeKey};

/// Mint a number outside the workflow, e.g. for a paper register.
pub struct AllocateCommand<'a> {
    ctx: &'a AppContext,
    series: String,
    date: Option<String>,
}

impl<'a> AllocateCommand<'a> {
    pub fn new(ctx: &'a AppContext, series: String) -> Self {
        Self { ctx, series, date: None }
    }

    pub fn with_date(mut self, date: Option<String>) -> Self {
        self.date = date;
        self
    }
}

impl Command for AllocateCommand<'_> {
    async fn execute(&self) -> Result<()> {
        let series = NumberSeries::from_str(&self.series)?;
        let actor = self.ctx.actor().await?;
        if !actor.is_administrator() {
            bail!("Only an administrator may mint numbers outside the workflow");
        }
        let issued_on = match &self.date {
            Some(raw) => parse_date(raw)?,
            None => local_date(Utc::now(), self.ctx.config.utc_offset()?),
        };
        let allocated = self.ctx.engine.allocator().allocate(series, issued_on, None).await?;
        println!("🔢 {}", allocated.number);
        println!("   Scope {} | counter {} | epoch {}", allocated.scope, allocated.counter, allocated.epoch);
        Ok(())
    }
}

pub struct ResetCounterCommand<'a> {
    ctx: &'a AppContext,
    series: String,
    year: i32,
    month: Option<u32>,
}

impl<'a> ResetCounterCommand<'a> {
    pub fn new(ctx: &'a AppContext, series: String, year: i32) -> Self {
        Self {
            ctx,
            series,
            year,
            month: None,
        }
    }

    pub fn with_month(mut self, month: Option<u32>) -> Self {
        self.month = month;
        self
    }
}

impl Command for ResetCounterCommand<'_> {
    async fn execute(&self) -> Result<()> {
        let series = NumberSeries::from_str(&self.series)?;
        let month = match (series.is_monthly(), self.month) {
            (true, Some(m)) if (1..=12).contains(&m) => Some(m),
            (true, Some(m)) => bail!("Month {m} is out of range"),
            (true, None) => bail!("Series {series} is counted per month; pass --month"),
            (false, Some(_)) => bail!("Series {series} is counted per year; drop --month"),
            (false, None) => None,
        };
        let scope = ScopeKey::new(series, self.year, month);
        let actor = self.ctx.actor().await?;
        let allocator = self.ctx.engine.allocator();
        let before = allocator.current_counter(scope).await?;
        allocator.reset(&actor, scope).await?;
        match before {
            Some(counter) => println!("🔄 {scope} reset (was at {counter}); next number starts again at 1"),
            None => println!("🔄 {scope} reset; next number starts at 1"),
        }
        Ok(())
    }
}

pub struct SetTemplateCommand<'a> {
    ctx: &'a AppContext,
    series: String,
    year: i32,
    template: String,
}

impl<'a> SetTemplateCommand<'a> {
    pub fn new(ctx: &'a AppContext, series: String, year: i32, template: String) -> Self {
        Self {
            ctx,
            series,
            year,
            template,
        }
    }
}

impl Command for SetTemplateCommand<'_> {
    async fn execute(&self) -> Result<()> {
        let series = NumberSeries::from_str(&self.series)?;
        let actor = self.ctx.actor().await?;
        let template = self
            .ctx
            .engine
            .allocator()
            .set_template(&actor, series, self.year, &self.template)
            .await?;
        println!("🧾 {series} numbers for {} now follow {template}", self.year);
        Ok(())
    }
}
