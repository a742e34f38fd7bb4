use chrono::{Datelike, NaiveDate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use super::template::{NumberSeries, ScopeKey, Template, TemplateError};
use crate::errors::{WorkflowError, WorkflowResult};
use crate::observability::workflow_metrics;
use crate::roles::Actor;
use crate::storage::WorkflowStore;

/// Everything the store needs to mint one number inside its own atomic
/// increment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationRequest {
    pub scope: ScopeKey,
    /// Date the number is issued on; supplies the month placeholders.
    pub issued_on: NaiveDate,
    /// Used when no format was configured for (series, year).
    pub fallback_template: Template,
    pub document_id: Option<Uuid>,
}

impl AllocationRequest {
    pub fn render(&self, template: &Template, counter: u64) -> String {
        template.render(
            counter,
            self.scope.series.counter_width(),
            self.scope.year,
            self.issued_on.month(),
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocatedNumber {
    pub scope: ScopeKey,
    pub epoch: u32,
    pub counter: u64,
    pub number: String,
}

/// Per-series templates used when the administrator has not stored a
/// format for a given year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeriesTemplates {
    pub antrian: Template,
    pub berkas: Template,
    pub sp2d: Template,
}

impl Default for SeriesTemplates {
    fn default() -> Self {
        Self {
            antrian: NumberSeries::Antrian.default_template(),
            berkas: NumberSeries::Berkas.default_template(),
            sp2d: NumberSeries::Sp2d.default_template(),
        }
    }
}

impl SeriesTemplates {
    /// Build from raw configured strings; missing entries keep the default.
    pub fn from_raw(
        antrian: Option<&str>,
        berkas: Option<&str>,
        sp2d: Option<&str>,
    ) -> Result<Self, TemplateError> {
        let defaults = Self::default();
        let pick = |raw: Option<&str>, fallback: Template| match raw {
            Some(raw) => Template::parse(raw),
            None => Ok(fallback),
        };
        Ok(Self {
            antrian: pick(antrian, defaults.antrian)?,
            berkas: pick(berkas, defaults.berkas)?,
            sp2d: pick(sp2d, defaults.sp2d)?,
        })
    }

    pub fn for_series(&self, series: NumberSeries) -> &Template {
        match series {
            NumberSeries::Antrian => &self.antrian,
            NumberSeries::Berkas => &self.berkas,
            NumberSeries::Sp2d => &self.sp2d,
        }
    }
}

/// Issues sequential document numbers. The counter itself lives in the
/// store; this type never caches counter values between calls.
#[derive(Clone)]
pub struct NumberingAllocator {
    store: Arc<dyn WorkflowStore>,
    templates: SeriesTemplates,
}

impl NumberingAllocator {
    pub fn new(store: Arc<dyn WorkflowStore>, templates: SeriesTemplates) -> Self {
        Self { store, templates }
    }

    pub fn templates(&self) -> &SeriesTemplates {
        &self.templates
    }

    pub fn request(
        &self,
        series: NumberSeries,
        issued_on: NaiveDate,
        document_id: Option<Uuid>,
    ) -> AllocationRequest {
        AllocationRequest {
            scope: series.scope_for(issued_on),
            issued_on,
            fallback_template: self.templates.for_series(series).clone(),
            document_id,
        }
    }

    /// Mint the next number of `series` for a number issued on `issued_on`.
    pub async fn allocate(
        &self,
        series: NumberSeries,
        issued_on: NaiveDate,
        document_id: Option<Uuid>,
    ) -> WorkflowResult<AllocatedNumber> {
        let request = self.request(series, issued_on, document_id);
        let allocated = self.store.allocate_number(&request).await.map_err(|e| {
            if !e.is_recoverable() {
                warn!(scope = %request.scope, error = %e, "Number allocation hit an integrity failure");
            }
            e
        })?;
        workflow_metrics().record_allocation();
        info!(
            scope = %allocated.scope,
            counter = allocated.counter,
            number = %allocated.number,
            "Allocated document number"
        );
        Ok(allocated)
    }

    /// Zero the counter of `scope`. The store serializes this against
    /// allocations for the same scope.
    pub async fn reset(&self, actor: &Actor, scope: ScopeKey) -> WorkflowResult<()> {
        require_admin(actor, "reset a numbering counter")?;
        self.store.reset_counter(&scope).await?;
        warn!(scope = %scope, actor = %actor.user_id, "Numbering counter reset");
        Ok(())
    }

    pub async fn set_template(
        &self,
        actor: &Actor,
        series: NumberSeries,
        year: i32,
        raw: &str,
    ) -> WorkflowResult<Template> {
        require_admin(actor, "change a number format")?;
        let template = Template::parse(raw)?;
        self.store.set_number_format(series, year, &template).await?;
        info!(series = %series, year, template = %template, "Number format updated");
        Ok(template)
    }

    /// Template that the next allocation for (series, year) would use.
    pub async fn effective_template(&self, series: NumberSeries, year: i32) -> WorkflowResult<Template> {
        Ok(self
            .store
            .number_format(series, year)
            .await?
            .unwrap_or_else(|| self.templates.for_series(series).clone()))
    }

    pub async fn current_counter(&self, scope: ScopeKey) -> WorkflowResult<Option<u64>> {
        self.store.counter(&scope).await
    }

    /// Whether `number` is already held by something in the current epoch of
    /// `scope`.
    pub async fn is_issued(&self, scope: ScopeKey, number: &str) -> WorkflowResult<bool> {
        self.store.is_number_issued(&scope, number).await
    }
}

fn require_admin(actor: &Actor, what: &str) -> WorkflowResult<()> {
    if actor.is_administrator() {
        Ok(())
    } else {
        Err(WorkflowError::unauthorized(format!(
            "user `{}` may not {what}",
            actor.user_id
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::{Role, RoleAssignment};
    use crate::storage::MemoryStore;

    fn june(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2025, 6, day).unwrap()
    }

    fn admin() -> Actor {
        Actor::new("admin", vec![RoleAssignment::new("admin", Role::Admin, None, "system")])
    }

    fn allocator() -> NumberingAllocator {
        NumberingAllocator::new(Arc::new(MemoryStore::new()), SeriesTemplates::default())
    }

    #[tokio::test]
    async fn queue_numbers_count_up_within_a_month() {
        let allocator = allocator();
        let first = allocator.allocate(NumberSeries::Antrian, june(2), None).await.unwrap();
        let second = allocator.allocate(NumberSeries::Antrian, june(20), None).await.unwrap();
        assert_eq!(first.number, "ANTRIAN/2025/06/001");
        assert_eq!(second.number, "ANTRIAN/2025/06/002");

        let july = NaiveDate::from_ymd_opt(2025, 7, 1).unwrap();
        let next_month = allocator.allocate(NumberSeries::Antrian, july, None).await.unwrap();
        assert_eq!(next_month.number, "ANTRIAN/2025/07/001");
    }

    #[tokio::test]
    async fn reset_restarts_the_sequence() {
        let allocator = allocator();
        allocator.allocate(NumberSeries::Antrian, june(2), None).await.unwrap();
        allocator.allocate(NumberSeries::Antrian, june(3), None).await.unwrap();

        let scope = NumberSeries::Antrian.scope_for(june(3));
        allocator.reset(&admin(), scope).await.unwrap();
        assert_eq!(allocator.current_counter(scope).await.unwrap(), Some(0));

        let again = allocator.allocate(NumberSeries::Antrian, june(4), None).await.unwrap();
        assert_eq!(again.number, "ANTRIAN/2025/06/001");
        assert_eq!(again.epoch, 1);
    }

    #[tokio::test]
    async fn reset_requires_an_administrator() {
        let allocator = allocator();
        let clerk = Actor::new(
            "clerk",
            vec![RoleAssignment::new("clerk", Role::Resepsionis, None, "admin")],
        );
        let scope = NumberSeries::Sp2d.scope_for(june(1));
        let err = allocator.reset(&clerk, scope).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Unauthorized { .. }));
    }

    #[tokio::test]
    async fn stored_format_overrides_the_default() {
        let allocator = allocator();
        allocator
            .set_template(&admin(), NumberSeries::Sp2d, 2025, "SP2D-{COUNTER}/{TAHUN}")
            .await
            .unwrap();
        let number = allocator.allocate(NumberSeries::Sp2d, june(9), None).await.unwrap();
        assert_eq!(number.number, "SP2D-001/2025");

        let other_year = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        let number = allocator.allocate(NumberSeries::Sp2d, other_year, None).await.unwrap();
        assert_eq!(number.number, "001/SP2D-BKAD/I/2026");
    }

    #[tokio::test]
    async fn invalid_format_is_rejected_before_storage() {
        let allocator = allocator();
        let err = allocator
            .set_template(&admin(), NumberSeries::Berkas, 2025, "BERKAS/{TAHUN}")
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::Template(TemplateError::MissingCounter { .. })));
        assert_eq!(
            allocator.effective_template(NumberSeries::Berkas, 2025).await.unwrap(),
            NumberSeries::Berkas.default_template()
        );
    }

    #[test]
    fn configured_templates_are_validated() {
        assert!(SeriesTemplates::from_raw(Some("Q-{COUNTER}"), None, None).is_ok());
        assert!(SeriesTemplates::from_raw(None, Some("no counter"), None).is_err());
    }
}
