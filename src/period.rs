//! Fiscal quarter identifiers.
//!
//! The canonical form is `YYYYQn`: a four digit year, a literal `Q` and a
//! single quarter digit. Because the year is always four digits and the
//! quarter a single digit, lexicographic order on the canonical string equals
//! chronological order. The store relies on that for `ORDER BY period DESC`.

use crate::errors::{AppError, AppResult};
use chrono::{Datelike, NaiveDate, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

static YEAR_FIRST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^(\d{4})[\s\-_/.]*q(?:uarter|tr)?[\s\-_/.]*([1-4])$").expect("valid regex")
});

static QUARTER_FIRST: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^q(?:uarter|tr)?[\s\-_/.]*([1-4])[\s\-_/.]*(\d{4})$").expect("valid regex")
});

/// Canonicalizes a loosely formatted period string into `YYYYQn`.
///
/// Returns `None` when no four digit year or no quarter number 1-4 can be
/// extracted. Already canonical input is returned unchanged.
pub fn normalize_period(raw: &str) -> Option<String> {
    extract(raw).map(|period| period.to_string())
}

/// Same as [`normalize_period`] but yields a typed [`Period`] or
/// `InvalidPeriodFormat`.
pub fn parse_period(raw: &str) -> AppResult<Period> {
    extract(raw).ok_or_else(|| AppError::InvalidPeriodFormat(format!("'{}' is not a quarter like 2024Q4", raw.trim())))
}

fn extract(raw: &str) -> Option<Period> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }

    let (year, quarter) = if let Some(caps) = YEAR_FIRST.captures(trimmed) {
        (caps.get(1)?.as_str(), caps.get(2)?.as_str())
    } else if let Some(caps) = QUARTER_FIRST.captures(trimmed) {
        (caps.get(2)?.as_str(), caps.get(1)?.as_str())
    } else {
        return None;
    };

    Period::new(year.parse().ok()?, quarter.parse().ok()?).ok()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Period {
    year: u16,
    quarter: u8,
}

impl Period {
    pub fn new(year: u16, quarter: u8) -> AppResult<Self> {
        if year > 9999 {
            return Err(AppError::InvalidPeriodFormat(format!("year {} is not four digits", year)));
        }
        if !(1..=4).contains(&quarter) {
            return Err(AppError::InvalidPeriodFormat(format!("quarter {} is outside 1-4", quarter)));
        }
        Ok(Self { year, quarter })
    }

    /// Quarter a calendar date falls in. Out-of-range years clamp to the
    /// nearest four digit year.
    pub fn containing(date: NaiveDate) -> Self {
        let year = u16::try_from(date.year().clamp(0, 9999)).unwrap_or(0);
        let quarter = u8::try_from((date.month0() / 3) + 1).unwrap_or(1);
        Self { year, quarter }
    }

    pub fn current() -> Self {
        Self::containing(Utc::now().date_naive())
    }

    pub fn year(self) -> u16 {
        self.year
    }

    pub fn quarter(self) -> u8 {
        self.quarter
    }

    /// Moves by `quarters` (negative goes back). `None` once the year leaves
    /// the four digit range.
    pub fn shift(self, quarters: i32) -> Option<Self> {
        let index = i32::from(self.year) * 4 + i32::from(self.quarter) - 1 + quarters;
        if index < 0 {
            return None;
        }
        let year = u16::try_from(index / 4).ok()?;
        let quarter = u8::try_from(index % 4 + 1).ok()?;
        Self::new(year, quarter).ok()
    }

    pub fn previous(self) -> Option<Self> {
        self.shift(-1)
    }

    pub fn year_ago(self) -> Option<Self> {
        self.shift(-4)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}Q{}", self.year, self.quarter)
    }
}

impl FromStr for Period {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        parse_period(raw)
    }
}

impl TryFrom<String> for Period {
    type Error = AppError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        parse_period(&value)
    }
}

impl From<Period> for String {
    fn from(value: Period) -> Self {
        value.to_string()
    }
}

/// Inclusive range of quarters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeriodRange {
    from: Period,
    to: Period,
}

impl PeriodRange {
    pub fn new(from: Period, to: Period) -> AppResult<Self> {
        if from > to {
            return Err(AppError::InvalidPeriodFormat(format!(
                "range start {} is after range end {}",
                from, to
            )));
        }
        Ok(Self { from, to })
    }

    pub fn single(period: Period) -> Self {
        Self { from: period, to: period }
    }

    pub fn from(&self) -> Period {
        self.from
    }

    pub fn to(&self) -> Period {
        self.to
    }

    pub fn contains(&self, period: Period) -> bool {
        self.from <= period && period <= self.to
    }

    pub fn periods(&self) -> Vec<Period> {
        let mut periods = Vec::new();
        let mut current = Some(self.from);
        while let Some(period) = current {
            if period > self.to {
                break;
            }
            periods.push(period);
            current = period.shift(1);
        }
        periods
    }

    pub fn shift(&self, quarters: i32) -> Option<Self> {
        Some(Self {
            from: self.from.shift(quarters)?,
            to: self.to.shift(quarters)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::{normalize_period, parse_period, Period, PeriodRange};
    use chrono::NaiveDate;

    #[test]
    fn normalizes_loose_spellings() {
        for raw in [
            "2024Q4", "2024 Q4", "2024-Q4", "2024q4", " 2024 / q 4 ", "Q4 2024", "q4-2024", "Q4/2024",
            "2024 Quarter 4", "2024_QTR_4",
        ] {
            assert_eq!(normalize_period(raw).as_deref(), Some("2024Q4"), "input {:?}", raw);
        }
    }

    #[test]
    fn rejects_input_without_year_or_quarter() {
        for raw in ["", "2024", "Q4", "2024Q5", "2024Q0", "24Q4", "Q4 24", "20245Q1", "fourth quarter"] {
            assert_eq!(normalize_period(raw), None, "input {:?}", raw);
        }
        assert!(parse_period("2024Q9").is_err());
    }

    #[test]
    fn leading_zero_years_are_four_digit_years() {
        assert_eq!(normalize_period("0999 Q1").as_deref(), Some("0999Q1"));
        assert_eq!(normalize_period("Q3 0000").as_deref(), Some("0000Q3"));
        let early: Period = "0999Q4".parse().expect("period");
        assert_eq!(early.shift(1).map(|p| p.to_string()).as_deref(), Some("1000Q1"));
        assert!(early < "1000Q1".parse::<Period>().expect("period"));
    }

    #[test]
    fn normalization_is_idempotent() {
        for raw in ["2023 q1", "Q2-2022", "1999Q3", "2024 quarter 4"] {
            let once = normalize_period(raw).expect("valid period");
            assert_eq!(normalize_period(&once).as_deref(), Some(once.as_str()));
        }
    }

    #[test]
    fn string_order_matches_chronological_order() {
        let mut periods = vec!["2023Q4", "2024Q1", "2019Q2", "2024Q3", "2023Q1"];
        periods.sort_unstable_by(|a, b| b.cmp(a));
        let typed: Vec<Period> = periods.iter().map(|raw| raw.parse().expect("period")).collect();
        let mut sorted = typed.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(typed, sorted);
    }

    #[test]
    fn shifting_crosses_year_boundaries() {
        let period: Period = "2024Q1".parse().expect("period");
        assert_eq!(period.previous().map(|p| p.to_string()).as_deref(), Some("2023Q4"));
        assert_eq!(period.year_ago().map(|p| p.to_string()).as_deref(), Some("2023Q1"));
        assert_eq!(period.shift(7).map(|p| p.to_string()).as_deref(), Some("2025Q4"));
        assert!(Period::new(0, 1).expect("period").previous().is_none());
        assert!(Period::new(9999, 4).expect("period").shift(1).is_none());
    }

    #[test]
    fn range_lists_quarters_inclusive() {
        let range = PeriodRange::new(
            "2023Q3".parse().expect("from"),
            "2024Q2".parse().expect("to"),
        )
        .expect("range");
        let listed: Vec<String> = range.periods().iter().map(ToString::to_string).collect();
        assert_eq!(listed, vec!["2023Q3", "2023Q4", "2024Q1", "2024Q2"]);
        assert!(PeriodRange::new(range.to(), range.from()).is_err());
    }

    #[test]
    fn serializes_as_canonical_string() {
        let period: Period = "q2 2021".parse().expect("period");
        assert_eq!(serde_json::to_string(&period).expect("json"), "\"2021Q2\"");
        let back: Period = serde_json::from_str("\"2021-Q2\"").expect("parse");
        assert_eq!(back, period);
    }

    #[test]
    fn dates_map_to_their_quarter() {
        let date = NaiveDate::from_ymd_opt(2024, 3, 31).expect("date");
        assert_eq!(Period::containing(date).to_string(), "2024Q1");
        let date = NaiveDate::from_ymd_opt(2024, 10, 1).expect("date");
        assert_eq!(Period::containing(date).to_string(), "2024Q4");
    }
}
