//! KPI summaries, time series and breakdowns over a [`MetricSource`].
//!
//! The resolver never talks to storage directly. `Database` implements
//! [`MetricSource`] for uploaded data; [`MockMetricSource`] stands in for
//! metrics whose external feeds (Clarity, Core Web Vitals) are stubbed.

use crate::db::Database;
use crate::errors::AppResult;
use crate::models::{
    Aggregation, BreakdownEntry, KpiFilters, KpiRequest, KpiResponse, KpiSummary, MetricKind, MetricPoint,
    PointSource, TimeseriesPoint,
};
use crate::period::{Period, PeriodRange};
use chrono::Utc;
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

pub trait MetricSource: Send + Sync {
    /// Points of one source whose period lies inside `range`.
    fn points(&self, metric: MetricKind, source: PointSource, range: &PeriodRange) -> AppResult<Vec<MetricPoint>>;
}

impl MetricSource for Database {
    fn points(&self, metric: MetricKind, source: PointSource, range: &PeriodRange) -> AppResult<Vec<MetricPoint>> {
        self.points_in_range(metric, source, &range.from().to_string(), &range.to().to_string())
    }
}

/// Deterministic stand-in data, derived from metric and period only.
#[derive(Debug, Clone, Default)]
pub struct MockMetricSource;

impl MockMetricSource {
    fn groups(metric: MetricKind) -> [&'static str; 3] {
        match metric {
            MetricKind::Ndi => ["Branch", "Customer Service", "Online Banking"],
            MetricKind::Clarity => ["Dead clicks", "Quick backs", "Rage clicks"],
            MetricKind::CoreWebVitals => ["CLS", "INP", "LCP"],
            MetricKind::PageViews => ["Desktop", "Mobile", "Tablet"],
        }
    }

    fn base_value(metric: MetricKind, period: Period) -> f64 {
        let index = f64::from(period.year().saturating_sub(2020)) * 4.0 + f64::from(period.quarter());
        match metric {
            MetricKind::Ndi => 62.0 + index * 0.75,
            MetricKind::Clarity => 48.0 + index * 0.5,
            MetricKind::CoreWebVitals => 71.0 + index * 0.4,
            MetricKind::PageViews => 120_000.0 * (1.0 + index * 0.03),
        }
    }

    fn point(metric: MetricKind, source: PointSource, period: Period, group: Option<&str>, value: f64) -> MetricPoint {
        MetricPoint {
            id: format!("mock-{}-{}-{}", metric.as_str(), period, group.unwrap_or("all")),
            period: period.to_string(),
            metric,
            source,
            group_a: group.map(ToString::to_string),
            group_b: None,
            group_c: None,
            value,
            weight: None,
            upload_id: None,
            created_at: Utc::now(),
        }
    }
}

impl MetricSource for MockMetricSource {
    fn points(&self, metric: MetricKind, source: PointSource, range: &PeriodRange) -> AppResult<Vec<MetricPoint>> {
        let factors = match metric.aggregation() {
            Aggregation::WeightedMean => [0.92, 1.0, 1.08],
            Aggregation::Sum => [0.25, 0.6, 0.15],
        };
        let mut points = Vec::new();
        for period in range.periods() {
            let base = Self::base_value(metric, period);
            match source {
                PointSource::Aggregated => points.push(Self::point(metric, source, period, None, base)),
                PointSource::Breakdown => {
                    for (group, factor) in Self::groups(metric).into_iter().zip(factors) {
                        points.push(Self::point(metric, source, period, Some(group), base * factor));
                    }
                }
            }
        }
        Ok(points)
    }
}

/// Sends stubbed metrics to the mock and everything else to `primary`.
pub struct RoutedMetricSource {
    primary: Arc<dyn MetricSource>,
    stub: MockMetricSource,
    stubbed: HashSet<MetricKind>,
}

impl RoutedMetricSource {
    pub fn new(primary: Arc<dyn MetricSource>, stubbed: impl IntoIterator<Item = MetricKind>) -> Self {
        Self {
            primary,
            stub: MockMetricSource,
            stubbed: stubbed.into_iter().collect(),
        }
    }
}

impl MetricSource for RoutedMetricSource {
    fn points(&self, metric: MetricKind, source: PointSource, range: &PeriodRange) -> AppResult<Vec<MetricPoint>> {
        if self.stubbed.contains(&metric) {
            self.stub.points(metric, source, range)
        } else {
            self.primary.points(metric, source, range)
        }
    }
}

struct RangeData {
    aggregated: Vec<MetricPoint>,
    breakdown: Vec<MetricPoint>,
}

impl RangeData {
    /// Points that define the value of one period: breakdown rows matching
    /// the filters when filters are set, otherwise the aggregated rows, and
    /// the breakdown rows when the period has no aggregated row.
    fn period_points<'a>(&'a self, period: &str, filters: &'a KpiFilters) -> Vec<&'a MetricPoint> {
        if !filters.is_empty() {
            return self
                .breakdown
                .iter()
                .filter(|point| point.period == period && filters.matches(point))
                .collect();
        }
        let aggregated: Vec<&MetricPoint> = self.aggregated.iter().filter(|point| point.period == period).collect();
        if !aggregated.is_empty() {
            return aggregated;
        }
        self.breakdown.iter().filter(|point| point.period == period).collect()
    }
}

pub struct KpiResolver {
    source: Arc<dyn MetricSource>,
}

impl KpiResolver {
    pub fn new(source: Arc<dyn MetricSource>) -> Self {
        Self { source }
    }

    pub fn get_kpi(&self, request: &KpiRequest) -> AppResult<KpiResponse> {
        let metric = request.metric;
        let current_data = self.load(metric, &request.range)?;
        let year_ago = request.range.shift(-4);
        let prior_year_data = year_ago.as_ref().map(|range| self.load(metric, range)).transpose()?;
        let quarter_ago = request.range.shift(-1);
        let prior_quarter_data = quarter_ago.as_ref().map(|range| self.load(metric, range)).transpose()?;

        let current = range_value(metric, &request.range, &current_data, &request.filters);
        let prior_year = year_ago
            .as_ref()
            .zip(prior_year_data.as_ref())
            .and_then(|(range, data)| range_value(metric, range, data, &request.filters));
        let prior_quarter = quarter_ago
            .as_ref()
            .zip(prior_quarter_data.as_ref())
            .and_then(|(range, data)| range_value(metric, range, data, &request.filters));

        let timeseries = request
            .range
            .periods()
            .into_iter()
            .filter_map(|period| {
                let label = period.to_string();
                aggregate(metric, current_data.period_points(&label, &request.filters)).map(|value| TimeseriesPoint {
                    period: label,
                    value,
                })
            })
            .collect();

        let current_groups = group_values(metric, &current_data.breakdown, request);
        let prior_groups = prior_year_data
            .as_ref()
            .map(|data| group_values(metric, &data.breakdown, request))
            .unwrap_or_default();
        let mut breakdown: Vec<BreakdownEntry> = current_groups
            .into_iter()
            .map(|(key, value)| BreakdownEntry {
                yoy_pct: pct_change(Some(value), prior_groups.get(&key).copied()),
                key,
                value,
            })
            .collect();
        sort_breakdown(&mut breakdown);

        tracing::debug!(
            metric = metric.as_str(),
            from = %request.range.from(),
            to = %request.range.to(),
            breakdown_rows = breakdown.len(),
            "resolved kpi"
        );

        Ok(KpiResponse {
            metric,
            summary: KpiSummary {
                current,
                yoy_pct: pct_change(current, prior_year),
                qoq_pct: pct_change(current, prior_quarter),
            },
            timeseries,
            breakdown,
        })
    }

    fn load(&self, metric: MetricKind, range: &PeriodRange) -> AppResult<RangeData> {
        Ok(RangeData {
            aggregated: self.source.points(metric, PointSource::Aggregated, range)?,
            breakdown: self.source.points(metric, PointSource::Breakdown, range)?,
        })
    }
}

fn range_value(metric: MetricKind, range: &PeriodRange, data: &RangeData, filters: &KpiFilters) -> Option<f64> {
    let points: Vec<&MetricPoint> = range
        .periods()
        .iter()
        .flat_map(|period| data.period_points(&period.to_string(), filters))
        .collect();
    aggregate(metric, points)
}

fn group_values(metric: MetricKind, breakdown: &[MetricPoint], request: &KpiRequest) -> BTreeMap<String, f64> {
    let mut grouped: BTreeMap<String, Vec<&MetricPoint>> = BTreeMap::new();
    for point in breakdown.iter().filter(|point| request.filters.matches(point)) {
        if let Some(key) = point.group(request.dimension) {
            grouped.entry(key.to_string()).or_default().push(point);
        }
    }
    grouped
        .into_iter()
        .filter_map(|(key, points)| aggregate(metric, points).map(|value| (key, value)))
        .collect()
}

/// Combines points per the metric's aggregation rule. `None` when empty.
pub fn aggregate<'a>(metric: MetricKind, points: impl IntoIterator<Item = &'a MetricPoint>) -> Option<f64> {
    let points: Vec<&MetricPoint> = points.into_iter().collect();
    if points.is_empty() {
        return None;
    }
    match metric.aggregation() {
        Aggregation::Sum => Some(points.iter().map(|point| point.value).sum()),
        Aggregation::WeightedMean => {
            let total_weight: f64 = points.iter().map(|point| point.weight.unwrap_or(1.0)).sum();
            if total_weight > 0.0 {
                let weighted: f64 = points
                    .iter()
                    .map(|point| point.value * point.weight.unwrap_or(1.0))
                    .sum();
                Some(weighted / total_weight)
            } else {
                Some(points.iter().map(|point| point.value).sum::<f64>() / points.len() as f64)
            }
        }
    }
}

/// Percentage change against a baseline. `None` when there is no baseline or
/// it is zero.
pub fn pct_change(current: Option<f64>, prior: Option<f64>) -> Option<f64> {
    let (current, prior) = (current?, prior?);
    if prior == 0.0 || !prior.is_finite() {
        return None;
    }
    Some((current - prior) / prior * 100.0)
}

/// Descending by value, ties by key ascending.
pub fn sort_breakdown(entries: &mut [BreakdownEntry]) {
    entries.sort_by(|a, b| {
        b.value
            .partial_cmp(&a.value)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.key.cmp(&b.key))
    });
}

#[cfg(test)]
mod tests {
    use super::{pct_change, sort_breakdown, KpiResolver, MetricSource, MockMetricSource, RoutedMetricSource};
    use crate::db::Database;
    use crate::models::{
        BreakdownEntry, GroupDimension, KpiFilters, KpiRequest, MetricKind, MetricPoint, PointSource,
    };
    use crate::period::{Period, PeriodRange};
    use chrono::Utc;
    use std::sync::Arc;

    fn period(raw: &str) -> Period {
        raw.parse().expect("period")
    }

    fn point(period: &str, source: PointSource, group: Option<&str>, value: f64, weight: Option<f64>) -> MetricPoint {
        MetricPoint {
            id: uuid::Uuid::new_v4().to_string(),
            period: period.to_string(),
            metric: MetricKind::Ndi,
            source,
            group_a: group.map(ToString::to_string),
            group_b: None,
            group_c: None,
            value,
            weight,
            upload_id: None,
            created_at: Utc::now(),
        }
    }

    fn store(points: &[MetricPoint]) -> (tempfile::TempDir, Arc<Database>) {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Database::new(&dir.path().join("kpi.db")).expect("db");
        db.upsert_metric_points(points).expect("insert");
        (dir, Arc::new(db))
    }

    #[test]
    fn yoy_and_qoq_follow_formula() {
        let (_dir, db) = store(&[
            point("2023Q4", PointSource::Aggregated, None, 60.0, None),
            point("2024Q3", PointSource::Aggregated, None, 64.0, None),
            point("2024Q4", PointSource::Aggregated, None, 66.0, None),
        ]);
        let resolver = KpiResolver::new(db);
        let response = resolver
            .get_kpi(&KpiRequest::for_period(MetricKind::Ndi, period("2024Q4")))
            .expect("kpi");
        assert_eq!(response.summary.current, Some(66.0));
        let yoy = response.summary.yoy_pct.expect("yoy");
        assert!((yoy - 10.0).abs() < 1e-9);
        let qoq = response.summary.qoq_pct.expect("qoq");
        assert!((qoq - 3.125).abs() < 1e-9);
    }

    #[test]
    fn yoy_is_absent_for_zero_or_missing_baseline() {
        let (_dir, db) = store(&[
            point("2023Q1", PointSource::Aggregated, None, 0.0, None),
            point("2024Q1", PointSource::Aggregated, None, 5.0, None),
            point("2024Q2", PointSource::Aggregated, None, 6.0, None),
        ]);
        let resolver = KpiResolver::new(db);
        let zero_base = resolver
            .get_kpi(&KpiRequest::for_period(MetricKind::Ndi, period("2024Q1")))
            .expect("kpi");
        assert_eq!(zero_base.summary.yoy_pct, None);
        let missing_base = resolver
            .get_kpi(&KpiRequest::for_period(MetricKind::Ndi, period("2024Q2")))
            .expect("kpi");
        assert_eq!(missing_base.summary.yoy_pct, None);
        assert!(missing_base.summary.qoq_pct.is_some());
        assert_eq!(pct_change(Some(1.0), Some(0.0)), None);
        assert_eq!(pct_change(None, Some(2.0)), None);
    }

    #[test]
    fn breakdown_is_sorted_by_value_then_key() {
        let (_dir, db) = store(&[
            point("2024Q4", PointSource::Breakdown, Some("Support"), 70.0, None),
            point("2024Q4", PointSource::Breakdown, Some("IT"), 80.0, None),
            point("2024Q4", PointSource::Breakdown, Some("Sales"), 70.0, None),
            point("2023Q4", PointSource::Breakdown, Some("IT"), 64.0, None),
        ]);
        let resolver = KpiResolver::new(db);
        let response = resolver
            .get_kpi(&KpiRequest::for_period(MetricKind::Ndi, period("2024Q4")))
            .expect("kpi");
        let keys: Vec<&str> = response.breakdown.iter().map(|entry| entry.key.as_str()).collect();
        assert_eq!(keys, vec!["IT", "Sales", "Support"]);
        let it_yoy = response.breakdown[0].yoy_pct.expect("it yoy");
        assert!((it_yoy - 25.0).abs() < 1e-9);
        assert_eq!(response.breakdown[1].yoy_pct, None);
        // no aggregated row, so the summary falls back to the breakdown mean
        let current = response.summary.current.expect("current");
        assert!((current - 220.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn filters_restrict_to_matching_breakdown_rows() {
        let (_dir, db) = store(&[
            point("2024Q1", PointSource::Aggregated, None, 50.0, None),
            point("2024Q1", PointSource::Breakdown, Some("Sales"), 40.0, Some(3.0)),
            point("2024Q1", PointSource::Breakdown, Some("IT"), 60.0, Some(1.0)),
        ]);
        let resolver = KpiResolver::new(db);
        let request = KpiRequest {
            metric: MetricKind::Ndi,
            range: PeriodRange::single(period("2024Q1")),
            filters: KpiFilters {
                group_a: Some("Sales".to_string()),
                ..KpiFilters::default()
            },
            dimension: GroupDimension::GroupA,
        };
        let response = resolver.get_kpi(&request).expect("kpi");
        assert_eq!(response.summary.current, Some(40.0));
        assert_eq!(response.breakdown.len(), 1);

        let unfiltered = resolver
            .get_kpi(&KpiRequest::for_period(MetricKind::Ndi, period("2024Q1")))
            .expect("kpi");
        assert_eq!(unfiltered.summary.current, Some(50.0));
    }

    #[test]
    fn timeseries_lists_periods_with_data() {
        let (_dir, db) = store(&[
            point("2024Q1", PointSource::Aggregated, None, 1.0, None),
            point("2024Q3", PointSource::Aggregated, None, 3.0, None),
        ]);
        let resolver = KpiResolver::new(db);
        let request = KpiRequest {
            range: PeriodRange::new(period("2024Q1"), period("2024Q4")).expect("range"),
            ..KpiRequest::for_period(MetricKind::Ndi, period("2024Q1"))
        };
        let response = resolver.get_kpi(&request).expect("kpi");
        let labels: Vec<&str> = response.timeseries.iter().map(|p| p.period.as_str()).collect();
        assert_eq!(labels, vec!["2024Q1", "2024Q3"]);
        assert_eq!(response.summary.current, Some(2.0));
    }

    #[test]
    fn sum_metrics_add_up_across_the_range() {
        let source = MockMetricSource;
        let range = PeriodRange::new(period("2024Q1"), period("2024Q2")).expect("range");
        let points = source
            .points(MetricKind::PageViews, PointSource::Aggregated, &range)
            .expect("points");
        let expected: f64 = points.iter().map(|p| p.value).sum();
        let resolver = KpiResolver::new(Arc::new(MockMetricSource));
        let request = KpiRequest {
            range,
            ..KpiRequest::for_period(MetricKind::PageViews, period("2024Q1"))
        };
        let response = resolver.get_kpi(&request).expect("kpi");
        let current = response.summary.current.expect("current");
        assert!((current - expected).abs() < 1e-6);
        assert_eq!(response.breakdown.len(), 3);
    }

    #[test]
    fn routed_source_only_stubs_listed_metrics() {
        let (_dir, db) = store(&[point("2024Q1", PointSource::Aggregated, None, 9.0, None)]);
        let routed = RoutedMetricSource::new(db, [MetricKind::Clarity]);
        let range = PeriodRange::single(period("2024Q1"));
        let ndi = routed.points(MetricKind::Ndi, PointSource::Aggregated, &range).expect("ndi");
        assert_eq!(ndi.len(), 1);
        assert_eq!(ndi[0].value, 9.0);
        let clarity = routed
            .points(MetricKind::Clarity, PointSource::Breakdown, &range)
            .expect("clarity");
        assert_eq!(clarity.len(), 3);
        assert!(routed
            .points(MetricKind::CoreWebVitals, PointSource::Aggregated, &range)
            .expect("cwv")
            .is_empty());
    }

    #[test]
    fn sort_breaks_ties_by_key() {
        let mut entries = vec![
            BreakdownEntry { key: "b".to_string(), value: 1.0, yoy_pct: None },
            BreakdownEntry { key: "a".to_string(), value: 1.0, yoy_pct: None },
            BreakdownEntry { key: "c".to_string(), value: 2.0, yoy_pct: None },
        ];
        sort_breakdown(&mut entries);
        let keys: Vec<&str> = entries.iter().map(|entry| entry.key.as_str()).collect();
        assert_eq!(keys, vec!["c", "a", "b"]);
    }
}
