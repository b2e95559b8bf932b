use crate::errors::{AppError, AppResult};
use crate::period::{Period, PeriodRange};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MetricKind {
    Ndi,
    Clarity,
    CoreWebVitals,
    PageViews,
}

/// How values of a metric combine across periods and rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Aggregation {
    WeightedMean,
    Sum,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DashboardSection {
    Ndi,
    Clarity,
    CoreWebVitals,
    PageViews,
}

impl MetricKind {
    pub const ALL: [MetricKind; 4] = [Self::Ndi, Self::Clarity, Self::CoreWebVitals, Self::PageViews];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ndi => "NDI",
            Self::Clarity => "CLARITY",
            Self::CoreWebVitals => "CORE_WEB_VITALS",
            Self::PageViews => "PAGE_VIEWS",
        }
    }

    pub fn aggregation(self) -> Aggregation {
        match self {
            Self::Ndi | Self::Clarity | Self::CoreWebVitals => Aggregation::WeightedMean,
            Self::PageViews => Aggregation::Sum,
        }
    }

    pub fn section(self) -> DashboardSection {
        match self {
            Self::Ndi => DashboardSection::Ndi,
            Self::Clarity => DashboardSection::Clarity,
            Self::CoreWebVitals => DashboardSection::CoreWebVitals,
            Self::PageViews => DashboardSection::PageViews,
        }
    }
}

impl FromStr for MetricKind {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let key: String = raw
            .trim()
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        match key.as_str() {
            "NDI" => Ok(Self::Ndi),
            "CLARITY" => Ok(Self::Clarity),
            "COREWEBVITALS" | "CWV" => Ok(Self::CoreWebVitals),
            "PAGEVIEWS" => Ok(Self::PageViews),
            _ => Err(AppError::UnsupportedMetric(format!("'{}' is not a known metric", raw.trim()))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PointSource {
    Aggregated,
    Breakdown,
}

impl PointSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aggregated => "AGGREGATED",
            Self::Breakdown => "BREAKDOWN",
        }
    }
}

impl FromStr for PointSource {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "AGGREGATED" => Ok(Self::Aggregated),
            "BREAKDOWN" => Ok(Self::Breakdown),
            other => Err(AppError::InvalidRequest(format!(
                "upload kind '{}' must be AGGREGATED or BREAKDOWN",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricPoint {
    pub id: String,
    pub period: String,
    pub metric: MetricKind,
    pub source: PointSource,
    pub group_a: Option<String>,
    pub group_b: Option<String>,
    pub group_c: Option<String>,
    pub value: f64,
    pub weight: Option<f64>,
    pub upload_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl MetricPoint {
    pub fn group(&self, dimension: GroupDimension) -> Option<&str> {
        match dimension {
            GroupDimension::GroupA => self.group_a.as_deref(),
            GroupDimension::GroupB => self.group_b.as_deref(),
            GroupDimension::GroupC => self.group_c.as_deref(),
        }
    }

    pub fn breakdown_key(&self) -> (Option<&str>, Option<&str>, Option<&str>) {
        (self.group_a.as_deref(), self.group_b.as_deref(), self.group_c.as_deref())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum GroupDimension {
    #[default]
    GroupA,
    GroupB,
    GroupC,
}

impl FromStr for GroupDimension {
    type Err = AppError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "groupa" | "a" => Ok(Self::GroupA),
            "groupb" | "b" => Ok(Self::GroupB),
            "groupc" | "c" => Ok(Self::GroupC),
            other => Err(AppError::InvalidRequest(format!("unknown breakdown dimension '{}'", other))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileUpload {
    pub id: String,
    pub kind: PointSource,
    pub metric: MetricKind,
    pub original_name: String,
    pub uploaded_at: DateTime<Utc>,
    pub period: Option<String>,
    pub active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MatchTier {
    Exact,
    CaseInsensitive,
    Alias,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedColumn {
    pub header: String,
    pub index: usize,
    pub tier: MatchTier,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnMapping {
    pub group_a: Option<ResolvedColumn>,
    pub group_b: Option<ResolvedColumn>,
    pub group_c: Option<ResolvedColumn>,
    pub value: Option<ResolvedColumn>,
    pub weight: Option<ResolvedColumn>,
    pub period: Option<ResolvedColumn>,
}

impl ColumnMapping {
    pub fn has_groups(&self) -> bool {
        self.group_a.is_some() || self.group_b.is_some() || self.group_c.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidationReport {
    pub detected_periods: Vec<String>,
    pub row_count: usize,
    pub ignored_rows: usize,
    pub valid_rows: usize,
    pub column_mapping: ColumnMapping,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestResponse {
    pub success: bool,
    pub file_id: String,
    pub metric_points_count: usize,
    pub validation_report: ValidationReport,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClearResponse {
    pub success: bool,
    pub deleted_rows: usize,
    pub period: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BooleanResponse {
    pub success: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiFilters {
    pub group_a: Option<String>,
    pub group_b: Option<String>,
    pub group_c: Option<String>,
}

impl KpiFilters {
    pub fn is_empty(&self) -> bool {
        self.group_a.is_none() && self.group_b.is_none() && self.group_c.is_none()
    }

    pub fn matches(&self, point: &MetricPoint) -> bool {
        let check = |wanted: &Option<String>, actual: Option<&str>| match wanted {
            Some(wanted) => actual == Some(wanted.as_str()),
            None => true,
        };
        check(&self.group_a, point.group_a.as_deref())
            && check(&self.group_b, point.group_b.as_deref())
            && check(&self.group_c, point.group_c.as_deref())
    }
}

#[derive(Debug, Clone)]
pub struct KpiRequest {
    pub metric: MetricKind,
    pub range: PeriodRange,
    pub filters: KpiFilters,
    pub dimension: GroupDimension,
}

impl KpiRequest {
    pub fn for_period(metric: MetricKind, period: Period) -> Self {
        Self {
            metric,
            range: PeriodRange::single(period),
            filters: KpiFilters::default(),
            dimension: GroupDimension::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiSummary {
    pub current: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yoy_pct: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qoq_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeseriesPoint {
    pub period: String,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakdownEntry {
    pub key: String,
    pub value: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub yoy_pct: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KpiResponse {
    pub metric: MetricKind,
    pub summary: KpiSummary,
    pub timeseries: Vec<TimeseriesPoint>,
    pub breakdown: Vec<BreakdownEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub database_path: String,
    pub active_uploads: usize,
}

/// Section toggles exposed to the dashboard front end.
pub type FeatureMap = BTreeMap<DashboardSection, bool>;

pub fn parse_metric(raw: Option<&str>) -> AppResult<MetricKind> {
    match raw {
        Some(raw) if !raw.trim().is_empty() => raw.parse(),
        _ => Ok(MetricKind::Ndi),
    }
}
