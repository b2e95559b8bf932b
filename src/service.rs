use crate::config::{AppConfig, ResolverBackend};
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::ingest::{ParseOutcome, SpreadsheetIngestor};
use crate::models::{
    BooleanResponse, ClearResponse, FeatureMap, FileUpload, HealthResponse, IngestResponse, KpiRequest, KpiResponse,
    MetricKind, MetricPoint, PointSource,
};
use crate::period::{parse_period, Period};
use crate::resolver::{KpiResolver, MetricSource, MockMetricSource, RoutedMetricSource};
use chrono::Utc;
use std::sync::Arc;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub file_name: String,
    pub bytes: Vec<u8>,
    pub kind: PointSource,
    pub metric: MetricKind,
    pub fallback_period: Option<Period>,
}

pub struct DashboardCore {
    db: Arc<Database>,
    resolver: KpiResolver,
    parse_budget: Duration,
    config: AppConfig,
}

impl DashboardCore {
    pub fn new(config: AppConfig) -> AppResult<Self> {
        let db = Arc::new(Database::new(&config.database_path)?);
        Ok(Self::with_database(config, db))
    }

    pub fn with_database(config: AppConfig, db: Arc<Database>) -> Self {
        let source: Arc<dyn MetricSource> = match config.resolver_backend {
            ResolverBackend::Mock => Arc::new(MockMetricSource),
            ResolverBackend::Store => Arc::new(RoutedMetricSource::new(
                db.clone(),
                config.stubbed_metrics.iter().copied(),
            )),
        };
        Self {
            db,
            resolver: KpiResolver::new(source),
            parse_budget: Duration::from_secs(config.parse_timeout_secs),
            config,
        }
    }

    /// Overrides the parse time budget taken from `parse_timeout_secs`.
    pub fn with_parse_budget(mut self, budget: Duration) -> Self {
        self.parse_budget = budget;
        self
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    fn ensure_enabled(&self, metric: MetricKind) -> AppResult<()> {
        if self.config.features.is_enabled(metric.section()) {
            Ok(())
        } else {
            Err(AppError::FeatureDisabled(format!(
                "the {} section is disabled",
                metric.as_str()
            )))
        }
    }

    /// Parses the upload under the configured time budget, then replaces the
    /// detected periods in one store transaction. Nothing is written unless
    /// the parse finished in time and produced at least one valid row.
    pub async fn ingest_upload(&self, request: UploadRequest) -> AppResult<IngestResponse> {
        self.ensure_enabled(request.metric)?;

        let file_id = Uuid::new_v4().to_string();
        let ingestor = SpreadsheetIngestor::new(request.metric).with_fallback_period(request.fallback_period);
        let budget = self.parse_budget;
        let outcome: ParseOutcome = {
            let job_file_id = file_id.clone();
            let bytes = request.bytes;
            let kind = request.kind;
            run_with_budget(budget, move || ingestor.parse(&bytes, &job_file_id, kind))
                .await
                .inspect_err(|error| {
                    tracing::warn!(file_id = %file_id, file_name = %request.file_name, error = %error, "ingestion rejected");
                })?
        };

        let report = outcome.validation_report;
        if outcome.metric_points.is_empty() {
            return Err(AppError::UnreadableFile(format!(
                "no valid rows in '{}' ({} rows ignored)",
                request.file_name, report.ignored_rows
            )));
        }

        let upload = FileUpload {
            id: file_id.clone(),
            kind: request.kind,
            metric: request.metric,
            original_name: request.file_name.clone(),
            uploaded_at: Utc::now(),
            period: match report.detected_periods.as_slice() {
                [single] => Some(single.clone()),
                _ => None,
            },
            active: true,
        };

        let db = self.db.clone();
        let periods = report.detected_periods.clone();
        let points = outcome.metric_points;
        let summary = tokio::task::spawn_blocking(move || db.replace_period_points(&upload, &periods, &points))
            .await
            .map_err(|error| AppError::Internal(format!("store task failed: {}", error)))??;

        tracing::info!(
            file_id = %file_id,
            file_name = %request.file_name,
            metric = request.metric.as_str(),
            kind = request.kind.as_str(),
            periods = ?report.detected_periods,
            inserted = summary.inserted_rows,
            cleared = summary.cleared_rows,
            ignored = report.ignored_rows,
            "ingested upload"
        );

        Ok(IngestResponse {
            success: true,
            file_id,
            metric_points_count: summary.inserted_rows,
            validation_report: report,
        })
    }

    pub fn latest_period(&self, metric: MetricKind) -> AppResult<Option<String>> {
        self.ensure_enabled(metric)?;
        self.db.latest_period(metric)
    }

    pub fn list_periods(&self, metric: MetricKind) -> AppResult<Vec<String>> {
        self.ensure_enabled(metric)?;
        self.db.list_periods(metric)
    }

    pub fn breakdown(&self, period: &str, metric: MetricKind) -> AppResult<Vec<MetricPoint>> {
        self.ensure_enabled(metric)?;
        let period = parse_period(period)?;
        self.db.breakdown(&period.to_string(), metric)
    }

    pub fn clear_period(&self, period: &str, metric: MetricKind) -> AppResult<ClearResponse> {
        self.ensure_enabled(metric)?;
        let period = parse_period(period)?.to_string();
        let deleted_rows = self.db.clear_period(&period, metric)?;
        tracing::info!(period = %period, metric = metric.as_str(), deleted_rows, "cleared period");
        Ok(ClearResponse {
            success: true,
            deleted_rows,
            period,
        })
    }

    /// Removes the period's points and the upload records behind them.
    pub fn purge_period(&self, period: &str, metric: MetricKind) -> AppResult<ClearResponse> {
        self.ensure_enabled(metric)?;
        let period = parse_period(period)?.to_string();
        let deleted_rows = self.db.purge_period(&period, metric)?;
        tracing::info!(period = %period, metric = metric.as_str(), deleted_rows, "purged period");
        Ok(ClearResponse {
            success: true,
            deleted_rows,
            period,
        })
    }

    pub fn get_kpi(&self, request: &KpiRequest) -> AppResult<KpiResponse> {
        self.ensure_enabled(request.metric)?;
        self.resolver.get_kpi(request)
    }

    pub fn list_uploads(&self, include_inactive: bool) -> AppResult<Vec<FileUpload>> {
        self.db.list_file_uploads(include_inactive)
    }

    pub fn delete_upload(&self, id: &str) -> AppResult<BooleanResponse> {
        if self.db.get_file_upload(id)?.is_none() {
            return Err(AppError::NotFound(format!("upload {} does not exist", id)));
        }
        let success = self.db.deactivate_file_upload(id)?;
        tracing::info!(upload_id = id, deactivated = success, "soft deleted upload");
        Ok(BooleanResponse { success })
    }

    pub fn features(&self) -> FeatureMap {
        self.config.features.as_map()
    }

    pub fn health(&self) -> AppResult<HealthResponse> {
        Ok(HealthResponse {
            status: "ok".to_string(),
            database_path: self.db.path().display().to_string(),
            active_uploads: self.db.count_active_uploads()?,
        })
    }
}

/// Runs a blocking job on the blocking pool and races it against `budget`.
/// When the timer wins the job's eventual result is dropped unseen.
pub async fn run_with_budget<T, F>(budget: Duration, job: F) -> AppResult<T>
where
    T: Send + 'static,
    F: FnOnce() -> AppResult<T> + Send + 'static,
{
    match timeout(budget, tokio::task::spawn_blocking(job)).await {
        Ok(Ok(result)) => result,
        Ok(Err(error)) => Err(AppError::Internal(format!("parse task failed: {}", error))),
        Err(_) => Err(AppError::ParseTimeout(budget.as_millis())),
    }
}

#[cfg(test)]
mod tests {
    use super::{run_with_budget, DashboardCore, UploadRequest};
    use crate::config::AppConfig;
    use crate::errors::AppError;
    use crate::models::{KpiRequest, MetricKind, PointSource};
    use std::time::Duration;

    fn core() -> (tempfile::TempDir, DashboardCore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = AppConfig {
            database_path: dir.path().join("core.db"),
            ..AppConfig::default()
        };
        let core = DashboardCore::new(config).expect("core");
        (dir, core)
    }

    fn upload(csv: &str, kind: PointSource) -> UploadRequest {
        UploadRequest {
            file_name: "ndi.csv".to_string(),
            bytes: csv.as_bytes().to_vec(),
            kind,
            metric: MetricKind::Ndi,
            fallback_period: None,
        }
    }

    #[tokio::test]
    async fn ingest_persists_valid_rows_and_reports_skips() {
        let (_dir, core) = core();
        let response = core
            .ingest_upload(upload(
                "period,groupA,value\n2024Q4,Sales,72\n2024Q4,Support,N/A\n2024Q4,IT,64\n",
                PointSource::Breakdown,
            ))
            .await
            .expect("ingest");
        assert!(response.success);
        assert_eq!(response.metric_points_count, 2);
        assert_eq!(response.validation_report.ignored_rows, 1);

        let rows = core.breakdown("2024 Q4", MetricKind::Ndi).expect("breakdown");
        let groups: Vec<_> = rows.iter().map(|row| row.group_a.as_deref()).collect();
        assert_eq!(groups, vec![Some("IT"), Some("Sales")]);
        assert_eq!(core.latest_period(MetricKind::Ndi).expect("latest").as_deref(), Some("2024Q4"));
    }

    #[tokio::test]
    async fn reingesting_a_period_replaces_previous_rows() {
        let (_dir, core) = core();
        core.ingest_upload(upload("period,groupA,value\n2024Q1,Sales,1\n2024Q1,IT,2\n", PointSource::Breakdown))
            .await
            .expect("first");
        core.ingest_upload(upload("period,groupA,value\n2024Q1,Sales,5\n", PointSource::Breakdown))
            .await
            .expect("second");
        let rows = core.breakdown("2024Q1", MetricKind::Ndi).expect("rows");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 5.0);
        assert_eq!(core.list_uploads(false).expect("uploads").len(), 1);
        assert_eq!(core.list_uploads(true).expect("uploads").len(), 2);
    }

    #[tokio::test]
    async fn file_without_valid_rows_writes_nothing() {
        let (_dir, core) = core();
        let error = core
            .ingest_upload(upload("period,value\n2024Q1,N/A\n", PointSource::Aggregated))
            .await
            .expect_err("must fail");
        assert!(matches!(error, AppError::UnreadableFile(_)));
        assert!(core.list_uploads(true).expect("uploads").is_empty());
    }

    #[tokio::test]
    async fn clear_then_query_is_empty() {
        let (_dir, core) = core();
        core.ingest_upload(upload("period,value\n2024Q2,70\n", PointSource::Aggregated))
            .await
            .expect("ingest");
        let cleared = core.clear_period("2024-Q2", MetricKind::Ndi).expect("clear");
        assert_eq!(cleared.deleted_rows, 1);
        assert_eq!(cleared.period, "2024Q2");
        assert!(core
            .database()
            .query_by_period_and_metric("2024Q2", MetricKind::Ndi, None)
            .expect("query")
            .is_empty());
        assert!(matches!(
            core.clear_period("someday", MetricKind::Ndi),
            Err(AppError::InvalidPeriodFormat(_))
        ));
    }

    #[tokio::test]
    async fn slow_job_loses_the_race() {
        let result: Result<(), AppError> = run_with_budget(Duration::from_millis(20), || {
            std::thread::sleep(Duration::from_millis(300));
            Ok(())
        })
        .await;
        assert!(matches!(result, Err(AppError::ParseTimeout(_))));

        let fast = run_with_budget(Duration::from_secs(5), || Ok(7)).await.expect("fast job");
        assert_eq!(fast, 7);
    }

    #[tokio::test]
    async fn timed_out_ingest_leaves_store_untouched() {
        let (_dir, core) = core();
        let core = core.with_parse_budget(Duration::from_nanos(1));
        let mut csv = String::from("period,groupA,value\n");
        for index in 0..50_000 {
            csv.push_str(&format!("2024Q3,group-{},{}\n", index, index % 100));
        }
        let error = core
            .ingest_upload(upload(&csv, PointSource::Breakdown))
            .await
            .expect_err("budget exceeded");
        assert!(matches!(error, AppError::ParseTimeout(_)));
        assert!(core.list_uploads(true).expect("uploads").is_empty());
        assert!(core
            .database()
            .query_by_period_and_metric("2024Q3", MetricKind::Ndi, None)
            .expect("query")
            .is_empty());
        assert_eq!(core.latest_period(MetricKind::Ndi).expect("latest"), None);
    }

    #[tokio::test]
    async fn aggregated_and_breakdown_uploads_coexist_per_quarter() {
        let (_dir, core) = core();
        core.ingest_upload(upload("period,value\n2024Q4,71\n", PointSource::Aggregated))
            .await
            .expect("aggregated");
        core.ingest_upload(upload(
            "period,groupA,value\n2024Q4,Sales,60\n2024Q4,IT,80\n",
            PointSource::Breakdown,
        ))
        .await
        .expect("breakdown");

        let response = core
            .get_kpi(&KpiRequest::for_period(MetricKind::Ndi, "2024Q4".parse().expect("period")))
            .expect("kpi");
        assert_eq!(response.summary.current, Some(71.0));
        assert_eq!(response.breakdown.len(), 2);
        assert_eq!(core.list_uploads(false).expect("uploads").len(), 2);

        core.ingest_upload(upload("period,value\n2024Q4,73\n", PointSource::Aggregated))
            .await
            .expect("aggregated again");
        assert_eq!(core.breakdown("2024Q4", MetricKind::Ndi).expect("rows").len(), 2);
        let active = core.list_uploads(false).expect("uploads");
        assert_eq!(active.len(), 2);
        assert_eq!(active.iter().filter(|upload| upload.kind == PointSource::Breakdown).count(), 1);

        let cleared = core.clear_period("2024Q4", MetricKind::Ndi).expect("clear");
        assert_eq!(cleared.deleted_rows, 3);
        assert!(core.list_uploads(false).expect("uploads").is_empty());
    }

    #[tokio::test]
    async fn disabled_sections_are_rejected() {
        let dir = tempfile::tempdir().expect("tempdir");
        let mut config = AppConfig {
            database_path: dir.path().join("core.db"),
            ..AppConfig::default()
        };
        config.features.ndi = false;
        let core = DashboardCore::new(config).expect("core");
        let error = core
            .ingest_upload(upload("period,value\n2024Q2,70\n", PointSource::Aggregated))
            .await
            .expect_err("disabled");
        assert!(matches!(error, AppError::FeatureDisabled(_)));
        assert!(core
            .get_kpi(&KpiRequest::for_period(MetricKind::Ndi, "2024Q2".parse().expect("period")))
            .is_err());
    }

    #[tokio::test]
    async fn stubbed_metrics_resolve_from_mock_data() {
        let (_dir, core) = core();
        let response = core
            .get_kpi(&KpiRequest::for_period(MetricKind::Clarity, "2024Q2".parse().expect("period")))
            .expect("kpi");
        assert!(response.summary.current.is_some());
        assert!(response.summary.yoy_pct.is_some());
        assert_eq!(response.breakdown.len(), 3);
    }

    #[tokio::test]
    async fn soft_deleting_unknown_upload_is_not_found() {
        let (_dir, core) = core();
        assert!(matches!(core.delete_upload("missing"), Err(AppError::NotFound(_))));
        let health = core.health().expect("health");
        assert_eq!(health.active_uploads, 0);
    }
}
