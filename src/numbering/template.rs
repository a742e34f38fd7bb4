use chrono::{Datelike, NaiveDate};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;
use thiserror::Error;

use crate::documents::DocumentType;

pub const COUNTER_TOKEN: &str = "{COUNTER}";
pub const ROMAN_MONTH_TOKEN: &str = "{BULAN_ROMAWI}";
pub const YEAR_TOKEN: &str = "{TAHUN}";
pub const MONTH_TOKEN: &str = "{BULAN}";

const KNOWN_TOKENS: [&str; 4] = [COUNTER_TOKEN, ROMAN_MONTH_TOKEN, YEAR_TOKEN, MONTH_TOKEN];

static PLACEHOLDER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\{[^{}]*\}").expect("placeholder pattern is valid"));

const ROMAN_MONTHS: [&str; 12] = [
    "I", "II", "III", "IV", "V", "VI", "VII", "VIII", "IX", "X", "XI", "XII",
];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TemplateError {
    #[error("Number template is empty")]
    Empty,
    #[error("Number template `{template}` has no {{COUNTER}} placeholder")]
    MissingCounter { template: String },
    #[error("Number template `{template}` uses unknown placeholder `{placeholder}`")]
    UnknownPlaceholder { template: String, placeholder: String },
    #[error("Unknown number series `{0}`")]
    UnknownSeries(String),
}

/// The independent number sequences the office keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NumberSeries {
    /// Queue number handed out when an SPM is submitted, restarts every month.
    Antrian,
    /// File (berkas) number for a submitted SPM, restarts every year.
    Berkas,
    /// Disbursement order number, restarts every year.
    Sp2d,
}

impl NumberSeries {
    pub const ALL: [NumberSeries; 3] = [NumberSeries::Antrian, NumberSeries::Berkas, NumberSeries::Sp2d];

    pub fn as_str(&self) -> &'static str {
        match self {
            NumberSeries::Antrian => "antrian",
            NumberSeries::Berkas => "berkas",
            NumberSeries::Sp2d => "sp2d",
        }
    }

    pub fn document_type(&self) -> DocumentType {
        match self {
            NumberSeries::Antrian | NumberSeries::Berkas => DocumentType::Spm,
            NumberSeries::Sp2d => DocumentType::Sp2d,
        }
    }

    pub fn counter_width(&self) -> usize {
        match self {
            NumberSeries::Berkas => 4,
            NumberSeries::Antrian | NumberSeries::Sp2d => 3,
        }
    }

    pub fn is_monthly(&self) -> bool {
        matches!(self, NumberSeries::Antrian)
    }

    pub fn default_template(&self) -> Template {
        let raw = match self {
            NumberSeries::Antrian => "ANTRIAN/{TAHUN}/{BULAN}/{COUNTER}",
            NumberSeries::Berkas => "{COUNTER}/BERKAS-SPM/{TAHUN}",
            NumberSeries::Sp2d => "{COUNTER}/SP2D-BKAD/{BULAN_ROMAWI}/{TAHUN}",
        };
        Template(raw.to_string())
    }

    /// Scope a number issued on `date` belongs to.
    pub fn scope_for(&self, date: NaiveDate) -> ScopeKey {
        let month = self.is_monthly().then(|| date.month());
        ScopeKey::new(*self, date.year(), month)
    }
}

impl fmt::Display for NumberSeries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NumberSeries {
    type Err = TemplateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "antrian" | "queue" => Ok(NumberSeries::Antrian),
            "berkas" | "file" => Ok(NumberSeries::Berkas),
            "sp2d" => Ok(NumberSeries::Sp2d),
            other => Err(TemplateError::UnknownSeries(other.to_string())),
        }
    }
}

/// (series, year, optional month): the unit a counter is kept for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ScopeKey {
    pub series: NumberSeries,
    pub year: i32,
    pub month: Option<u32>,
}

impl ScopeKey {
    pub fn new(series: NumberSeries, year: i32, month: Option<u32>) -> Self {
        Self {
            series,
            year,
            month,
        }
    }

    /// Stable string form used as the storage primary key.
    pub fn storage_key(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for ScopeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.month {
            Some(month) => write!(f, "{}:{}-{:02}", self.series, self.year, month),
            None => write!(f, "{}:{}", self.series, self.year),
        }
    }
}

/// A validated number format. Construction guarantees a `{COUNTER}`
/// placeholder and no unknown placeholders.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Template(String);

impl Template {
    pub fn parse(raw: &str) -> Result<Self, TemplateError> {
        let raw = raw.trim();
        if raw.is_empty() {
            return Err(TemplateError::Empty);
        }
        if let Some(unknown) = PLACEHOLDER
            .find_iter(raw)
            .map(|m| m.as_str())
            .find(|token| !KNOWN_TOKENS.contains(token))
        {
            return Err(TemplateError::UnknownPlaceholder {
                template: raw.to_string(),
                placeholder: unknown.to_string(),
            });
        }
        if !raw.contains(COUNTER_TOKEN) {
            return Err(TemplateError::MissingCounter {
                template: raw.to_string(),
            });
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn render(&self, counter: u64, width: usize, year: i32, month: u32) -> String {
        let roman = roman_month(month).unwrap_or("?");
        self.0
            .replace(COUNTER_TOKEN, &format!("{counter:0width$}"))
            .replace(ROMAN_MONTH_TOKEN, roman)
            .replace(YEAR_TOKEN, &format!("{year:04}"))
            .replace(MONTH_TOKEN, &format!("{month:02}"))
    }
}

impl TryFrom<String> for Template {
    type Error = TemplateError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Template::parse(&value)
    }
}

impl From<Template> for String {
    fn from(value: Template) -> Self {
        value.0
    }
}

impl fmt::Display for Template {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// I..XII for months 1..12.
pub fn roman_month(month: u32) -> Option<&'static str> {
    month
        .checked_sub(1)
        .and_then(|idx| ROMAN_MONTHS.get(idx as usize))
        .copied()
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn distinct_counters_render_distinct_numbers(
            a in 1u64..100_000,
            b in 1u64..100_000,
            month in 1u32..=12,
        ) {
            prop_assume!(a != b);
            for series in NumberSeries::ALL {
                let template = series.default_template();
                let width = series.counter_width();
                prop_assert_ne!(
                    template.render(a, width, 2025, month),
                    template.render(b, width, 2025, month)
                );
            }
        }

        #[test]
        fn every_month_has_a_roman_numeral(month in 1u32..=12) {
            prop_assert!(roman_month(month).is_some());
        }
    }

    #[test]
    fn renders_sp2d_number() {
        let template = Template::parse("{COUNTER}/SP2D-BKAD/{BULAN_ROMAWI}/{TAHUN}").unwrap();
        assert_eq!(template.render(7, 3, 2025, 9), "007/SP2D-BKAD/IX/2025");
    }

    #[test]
    fn renders_queue_number_with_numeric_month() {
        let template = NumberSeries::Antrian.default_template();
        assert_eq!(template.render(1, 3, 2025, 6), "ANTRIAN/2025/06/001");
    }

    #[test]
    fn counter_wider_than_padding_is_not_truncated() {
        let template = NumberSeries::Berkas.default_template();
        assert_eq!(template.render(12345, 4, 2025, 1), "12345/BERKAS-SPM/2025");
        assert_eq!(template.render(3, 4, 2025, 1), "0003/BERKAS-SPM/2025");
    }

    #[test]
    fn rejects_template_without_counter() {
        assert_eq!(
            Template::parse("SP2D/{TAHUN}"),
            Err(TemplateError::MissingCounter {
                template: "SP2D/{TAHUN}".to_string()
            })
        );
        assert_eq!(Template::parse("   "), Err(TemplateError::Empty));
    }

    #[test]
    fn rejects_unknown_placeholder() {
        let err = Template::parse("{COUNTER}/{OPD}/{TAHUN}").unwrap_err();
        assert!(matches!(
            err,
            TemplateError::UnknownPlaceholder { ref placeholder, .. } if placeholder == "{OPD}"
        ));
    }

    #[test]
    fn roman_months_cover_the_year() {
        assert_eq!(roman_month(1), Some("I"));
        assert_eq!(roman_month(4), Some("IV"));
        assert_eq!(roman_month(12), Some("XII"));
        assert_eq!(roman_month(0), None);
        assert_eq!(roman_month(13), None);
    }

    #[test]
    fn scope_granularity_follows_series() {
        let date = NaiveDate::from_ymd_opt(2025, 6, 14).unwrap();
        assert_eq!(
            NumberSeries::Antrian.scope_for(date),
            ScopeKey::new(NumberSeries::Antrian, 2025, Some(6))
        );
        assert_eq!(
            NumberSeries::Sp2d.scope_for(date),
            ScopeKey::new(NumberSeries::Sp2d, 2025, None)
        );
        assert_eq!(NumberSeries::Antrian.scope_for(date).storage_key(), "antrian:2025-06");
        assert_eq!(NumberSeries::Berkas.scope_for(date).storage_key(), "berkas:2025");
    }

    #[test]
    fn templates_deserialize_through_validation() {
        let ok: Result<Template, _> = serde_json::from_str("\"{COUNTER}/X/{TAHUN}\"");
        assert!(ok.is_ok());
        let bad: Result<Template, _> = serde_json::from_str("\"X/{TAHUN}\"");
        assert!(bad.is_err());
    }
}
