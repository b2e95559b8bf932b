//! Spreadsheet ingestion: uploaded tabular bytes → metric points plus a
//! validation report.
//!
//! File-level problems (unreadable content, no `value` column) fail the whole
//! call. Row-level problems skip the row, bump `ignored_rows` and append a
//! warning; they never abort the parse.

pub mod columns;
pub mod reader;

use crate::errors::AppResult;
use crate::models::{ColumnMapping, MetricKind, MetricPoint, PointSource, ResolvedColumn, ValidationReport};
use crate::period::{normalize_period, Period};
use chrono::Utc;
use std::collections::{BTreeSet, HashSet};
use uuid::Uuid;

use self::columns::resolve_columns;
use self::reader::{read_sheet, SheetRow};

/// Row warnings beyond this are summarized into a single trailing line.
pub const MAX_ROW_WARNINGS: usize = 100;

#[derive(Debug, Clone)]
pub struct ParseOutcome {
    pub metric_points: Vec<MetricPoint>,
    pub validation_report: ValidationReport,
}

#[derive(Debug, Clone)]
pub struct SpreadsheetIngestor {
    metric: MetricKind,
    fallback_period: Option<Period>,
}

enum RowOutcome {
    Valid(MetricPoint, Vec<String>),
    Skipped(String),
}

impl SpreadsheetIngestor {
    pub fn new(metric: MetricKind) -> Self {
        Self {
            metric,
            fallback_period: None,
        }
    }

    /// Period applied to rows when the sheet has no period column or the cell
    /// is blank.
    pub fn with_fallback_period(mut self, period: Option<Period>) -> Self {
        self.fallback_period = period;
        self
    }

    pub fn metric(&self) -> MetricKind {
        self.metric
    }

    pub fn parse(&self, bytes: &[u8], file_id: &str, kind: PointSource) -> AppResult<ParseOutcome> {
        let sheet = read_sheet(bytes)?;
        let resolution = resolve_columns(&sheet.headers)?;
        let mapping = resolution.mapping;

        let mut warnings = resolution.warnings;
        let mut row_warnings: Vec<String> = Vec::new();

        match kind {
            PointSource::Aggregated if mapping.has_groups() => {
                warnings.push("group columns are ignored for AGGREGATED uploads".to_string());
            }
            PointSource::Breakdown if !mapping.has_groups() => {
                warnings.push("BREAKDOWN upload has no group columns; rows carry no dimensions".to_string());
            }
            _ => {}
        }
        if mapping.period.is_none() && self.fallback_period.is_none() {
            warnings.push("no period column found and no fallback period given".to_string());
        }

        let row_count = sheet.rows.len();
        let mut ignored_rows = 0usize;
        let mut points = Vec::with_capacity(row_count);
        let mut periods = BTreeSet::new();
        let mut seen_keys = HashSet::new();

        for row in &sheet.rows {
            match self.parse_row(row, &mapping, file_id, kind) {
                RowOutcome::Valid(point, extra) => {
                    row_warnings.extend(extra);
                    if kind == PointSource::Breakdown {
                        let key = (
                            point.period.clone(),
                            point.group_a.clone(),
                            point.group_b.clone(),
                            point.group_c.clone(),
                        );
                        if !seen_keys.insert(key) {
                            row_warnings.push(format!(
                                "row {}: duplicate breakdown key for {}",
                                row.line, point.period
                            ));
                        }
                    }
                    periods.insert(point.period.clone());
                    points.push(point);
                }
                RowOutcome::Skipped(reason) => {
                    ignored_rows += 1;
                    row_warnings.push(reason);
                }
            }
        }

        if periods.len() > 1 {
            warnings.push(format!(
                "file mixes {} periods: {}",
                periods.len(),
                periods.iter().cloned().collect::<Vec<_>>().join(", ")
            ));
        }

        let overflow = row_warnings.len().saturating_sub(MAX_ROW_WARNINGS);
        row_warnings.truncate(MAX_ROW_WARNINGS);
        warnings.extend(row_warnings);
        if overflow > 0 {
            warnings.push(format!("{} further row warnings omitted", overflow));
        }

        tracing::debug!(
            file_id,
            metric = self.metric.as_str(),
            kind = kind.as_str(),
            row_count,
            ignored_rows,
            "parsed upload"
        );

        Ok(ParseOutcome {
            validation_report: ValidationReport {
                detected_periods: periods.into_iter().collect(),
                row_count,
                ignored_rows,
                valid_rows: points.len(),
                column_mapping: mapping,
                warnings,
            },
            metric_points: points,
        })
    }

    fn parse_row(&self, row: &SheetRow, mapping: &ColumnMapping, file_id: &str, kind: PointSource) -> RowOutcome {
        let line = row.line;
        let cell = |column: &Option<ResolvedColumn>| column.as_ref().and_then(|column| row.cell(column.index));

        let period = match cell(&mapping.period) {
            Some(raw) => match normalize_period(raw) {
                Some(period) => period,
                None => {
                    return RowOutcome::Skipped(format!(
                        "row {}: period '{}' is not a valid quarter; row skipped",
                        line, raw
                    ))
                }
            },
            None => match self.fallback_period {
                Some(period) => period.to_string(),
                None => return RowOutcome::Skipped(format!("row {}: no period; row skipped", line)),
            },
        };

        let value = match cell(&mapping.value) {
            None => return RowOutcome::Skipped(format!("row {}: empty value; row skipped", line)),
            Some(raw) => match parse_number(raw) {
                Some(value) => value,
                None => {
                    return RowOutcome::Skipped(format!(
                        "row {}: value '{}' is not numeric; row skipped",
                        line, raw
                    ))
                }
            },
        };

        let mut extra = Vec::new();
        let weight = cell(&mapping.weight).and_then(|raw| {
            let parsed = parse_number(raw);
            if parsed.is_none() {
                extra.push(format!("row {}: weight '{}' is not numeric; weight ignored", line, raw));
            }
            parsed
        });

        let group = |column: &Option<ResolvedColumn>| match kind {
            PointSource::Aggregated => None,
            PointSource::Breakdown => cell(column).map(ToString::to_string),
        };

        RowOutcome::Valid(
            MetricPoint {
                id: Uuid::new_v4().to_string(),
                period,
                metric: self.metric,
                source: kind,
                group_a: group(&mapping.group_a),
                group_b: group(&mapping.group_b),
                group_c: group(&mapping.group_c),
                value,
                weight,
                upload_id: Some(file_id.to_string()),
                created_at: Utc::now(),
            },
            extra,
        )
    }
}

/// Parses spreadsheet-formatted numbers: thousands separators, decimal comma,
/// surrounding whitespace and a trailing percent sign. Non-finite results are
/// rejected.
pub fn parse_number(raw: &str) -> Option<f64> {
    let trimmed = raw.trim().trim_end_matches('%').trim();
    if trimmed.is_empty() {
        return None;
    }
    let compact: String = trimmed
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '\u{a0}' && *c != '\'')
        .collect();

    let last_comma = compact.rfind(',');
    let last_dot = compact.rfind('.');
    let cleaned = match (last_comma, last_dot) {
        (Some(comma), Some(dot)) if comma > dot => compact.replace('.', "").replace(',', "."),
        (Some(_), Some(_)) => compact.replace(',', ""),
        (Some(comma), None) => {
            let decimals = compact.len() - comma - 1;
            if compact.matches(',').count() == 1 && decimals != 3 {
                compact.replace(',', ".")
            } else {
                compact.replace(',', "")
            }
        }
        _ => compact,
    };

    cleaned.parse::<f64>().ok().filter(|value| value.is_finite())
}
