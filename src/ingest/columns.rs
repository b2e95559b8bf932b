//! Header → logical field resolution.
//!
//! Matching is tiered: the canonical field name verbatim, then the canonical
//! name ignoring case, then the alias table below compared on a normalized
//! form (lowercase, ASCII alphanumerics only). A header is claimed by at most
//! one field and fields are resolved in [`RESOLUTION_ORDER`].

use crate::errors::{AppError, AppResult};
use crate::models::{ColumnMapping, MatchTier, ResolvedColumn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicalField {
    GroupA,
    GroupB,
    GroupC,
    Value,
    Weight,
    Period,
}

impl LogicalField {
    pub fn canonical_name(self) -> &'static str {
        match self {
            Self::GroupA => "groupA",
            Self::GroupB => "groupB",
            Self::GroupC => "groupC",
            Self::Value => "value",
            Self::Weight => "weight",
            Self::Period => "period",
        }
    }

    pub fn is_required(self) -> bool {
        matches!(self, Self::Value)
    }
}

pub const RESOLUTION_ORDER: [LogicalField; 6] = [
    LogicalField::Value,
    LogicalField::Period,
    LogicalField::Weight,
    LogicalField::GroupA,
    LogicalField::GroupB,
    LogicalField::GroupC,
];

/// Accepted header spellings per field, already in normalized form.
pub const COLUMN_ALIASES: &[(LogicalField, &[&str])] = &[
    (
        LogicalField::Value,
        &[
            "value", "score", "ndi", "ndiscore", "ndiwert", "wert", "mean", "mittelwert", "average", "avg",
            "kpi", "kpivalue", "result",
        ],
    ),
    (
        LogicalField::Period,
        &["period", "quarter", "quartal", "zeitraum", "fiscalquarter", "fiscalperiod", "periode", "qtr"],
    ),
    (
        LogicalField::Weight,
        &["weight", "gewicht", "n", "count", "responses", "respondents", "anzahl", "samplesize"],
    ),
    (
        LogicalField::GroupA,
        &["groupa", "group", "gruppe", "segment", "bereich", "category", "kategorie", "dimension1", "level1"],
    ),
    (
        LogicalField::GroupB,
        &["groupb", "subgroup", "untergruppe", "subsegment", "subcategory", "dimension2", "level2"],
    ),
    (
        LogicalField::GroupC,
        &["groupc", "item", "detail", "frage", "question", "dimension3", "level3"],
    ),
];

#[derive(Debug, Clone, Default)]
pub struct ColumnResolution {
    pub mapping: ColumnMapping,
    pub warnings: Vec<String>,
}

pub fn normalize_header(raw: &str) -> String {
    raw.chars()
        .filter(char::is_ascii_alphanumeric)
        .collect::<String>()
        .to_ascii_lowercase()
}

fn aliases_for(field: LogicalField) -> &'static [&'static str] {
    COLUMN_ALIASES
        .iter()
        .find(|(candidate, _)| *candidate == field)
        .map(|(_, aliases)| *aliases)
        .unwrap_or(&[])
}

fn tier_matches(field: LogicalField, header: &str, tier: MatchTier) -> bool {
    let trimmed = header.trim();
    match tier {
        MatchTier::Exact => trimmed == field.canonical_name(),
        MatchTier::CaseInsensitive => trimmed.eq_ignore_ascii_case(field.canonical_name()),
        MatchTier::Alias => {
            let normalized = normalize_header(trimmed);
            !normalized.is_empty() && aliases_for(field).contains(&normalized.as_str())
        }
    }
}

/// Resolves the sheet headers into a [`ColumnMapping`].
///
/// Fails with `MissingRequiredColumn` when `value` cannot be matched.
pub fn resolve_columns(headers: &[String]) -> AppResult<ColumnResolution> {
    let mut claimed = vec![false; headers.len()];
    let mut resolution = ColumnResolution::default();

    for field in RESOLUTION_ORDER {
        let mut resolved = None;
        for tier in [MatchTier::Exact, MatchTier::CaseInsensitive, MatchTier::Alias] {
            let candidates: Vec<usize> = headers
                .iter()
                .enumerate()
                .filter(|(index, header)| !claimed[*index] && tier_matches(field, header, tier))
                .map(|(index, _)| index)
                .collect();
            let Some(&first) = candidates.first() else {
                continue;
            };
            if candidates.len() > 1 {
                let names: Vec<&str> = candidates.iter().map(|index| headers[*index].trim()).collect();
                resolution.warnings.push(format!(
                    "ambiguous column mapping for '{}': {} all match, using '{}'",
                    field.canonical_name(),
                    names.join(", "),
                    headers[first].trim()
                ));
            }
            claimed[first] = true;
            resolved = Some(ResolvedColumn {
                header: headers[first].trim().to_string(),
                index: first,
                tier,
            });
            break;
        }

        if resolved.is_none() && field.is_required() {
            return Err(AppError::MissingRequiredColumn(format!(
                "no column matches '{}' (headers: {})",
                field.canonical_name(),
                headers.iter().map(|header| header.trim()).collect::<Vec<_>>().join(", ")
            )));
        }

        let slot = match field {
            LogicalField::GroupA => &mut resolution.mapping.group_a,
            LogicalField::GroupB => &mut resolution.mapping.group_b,
            LogicalField::GroupC => &mut resolution.mapping.group_c,
            LogicalField::Value => &mut resolution.mapping.value,
            LogicalField::Weight => &mut resolution.mapping.weight,
            LogicalField::Period => &mut resolution.mapping.period,
        };
        *slot = resolved;
    }

    Ok(resolution)
}
