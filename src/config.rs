use crate::errors::{AppError, AppResult};
use crate::models::{DashboardSection, FeatureMap, MetricKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "KPI_DASHBOARD_CONFIG";
pub const BIND_ENV: &str = "KPI_DASHBOARD_BIND";
pub const DB_ENV: &str = "KPI_DASHBOARD_DB";
const DEFAULT_CONFIG_FILE: &str = "kpi-dashboard.yaml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolverBackend {
    Store,
    Mock,
}

/// Dashboard sections the front end may render.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct FeatureToggles {
    pub ndi: bool,
    pub clarity: bool,
    pub core_web_vitals: bool,
    pub page_views: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            ndi: true,
            clarity: true,
            core_web_vitals: true,
            page_views: false,
        }
    }
}

impl FeatureToggles {
    pub fn is_enabled(&self, section: DashboardSection) -> bool {
        match section {
            DashboardSection::Ndi => self.ndi,
            DashboardSection::Clarity => self.clarity,
            DashboardSection::CoreWebVitals => self.core_web_vitals,
            DashboardSection::PageViews => self.page_views,
        }
    }

    pub fn as_map(&self) -> FeatureMap {
        MetricKind::ALL
            .iter()
            .map(|metric| (metric.section(), self.is_enabled(metric.section())))
            .collect()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct AppConfig {
    pub bind_address: String,
    pub database_path: PathBuf,
    pub log_dir: PathBuf,
    pub parse_timeout_secs: u64,
    pub max_upload_bytes: usize,
    pub resolver_backend: ResolverBackend,
    /// Metrics whose external feed is not wired up yet; served from mock data.
    pub stubbed_metrics: Vec<MetricKind>,
    pub features: FeatureToggles,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:8080".to_string(),
            database_path: PathBuf::from("data/kpi-dashboard.db"),
            log_dir: PathBuf::from("logs"),
            parse_timeout_secs: 30,
            max_upload_bytes: 20 * 1024 * 1024,
            resolver_backend: ResolverBackend::Store,
            stubbed_metrics: vec![MetricKind::Clarity, MetricKind::CoreWebVitals],
            features: FeatureToggles::default(),
        }
    }
}

impl AppConfig {
    /// Reads the YAML file named by `KPI_DASHBOARD_CONFIG` (or
    /// `kpi-dashboard.yaml` when present), then applies env overrides.
    pub fn load() -> AppResult<Self> {
        let explicit = std::env::var(CONFIG_ENV).ok().map(PathBuf::from);
        let mut config = match explicit {
            Some(path) => Self::from_file(&path)?,
            None if Path::new(DEFAULT_CONFIG_FILE).is_file() => Self::from_file(Path::new(DEFAULT_CONFIG_FILE))?,
            None => Self::default(),
        };
        config.apply_overrides(std::env::var(BIND_ENV).ok(), std::env::var(DB_ENV).ok());
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> AppResult<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|error| AppError::Io(format!("failed to read config {}: {}", path.display(), error)))?;
        Self::from_yaml(&raw)
    }

    pub fn from_yaml(raw: &str) -> AppResult<Self> {
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_yaml::from_str(raw).map_err(|error| AppError::Internal(format!("invalid config: {}", error)))
    }

    pub fn apply_overrides(&mut self, bind_address: Option<String>, database_path: Option<String>) {
        if let Some(bind_address) = bind_address.filter(|value| !value.trim().is_empty()) {
            self.bind_address = bind_address;
        }
        if let Some(database_path) = database_path.filter(|value| !value.trim().is_empty()) {
            self.database_path = PathBuf::from(database_path);
        }
    }

    pub fn validate(&self) -> AppResult<()> {
        if self.parse_timeout_secs == 0 {
            return Err(AppError::Internal("parse_timeout_secs must be greater than zero".to_string()));
        }
        if self.max_upload_bytes == 0 {
            return Err(AppError::Internal("max_upload_bytes must be greater than zero".to_string()));
        }
        Ok(())
    }
}
