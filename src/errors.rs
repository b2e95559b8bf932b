use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("INVALID_PERIOD_FORMAT: {0}")]
    InvalidPeriodFormat(String),
    #[error("MISSING_REQUIRED_COLUMN: {0}")]
    MissingRequiredColumn(String),
    #[error("UNREADABLE_FILE: {0}")]
    UnreadableFile(String),
    #[error("PARSE_TIMEOUT: ingestion exceeded {0}ms")]
    ParseTimeout(u128),
    #[error("UNSUPPORTED_METRIC: {0}")]
    UnsupportedMetric(String),
    #[error("INVALID_REQUEST: {0}")]
    InvalidRequest(String),
    #[error("FEATURE_DISABLED: {0}")]
    FeatureDisabled(String),
    #[error("STORAGE_ERROR: {0}")]
    Storage(String),
    #[error("IO_FAILURE: {0}")]
    Io(String),
    #[error("NOT_FOUND: {0}")]
    NotFound(String),
    #[error("INTERNAL: {0}")]
    Internal(String),
}

impl AppError {
    /// True for errors caused by caller input rather than server state.
    pub fn is_client_input(&self) -> bool {
        matches!(
            self,
            Self::InvalidPeriodFormat(_) | Self::UnsupportedMetric(_) | Self::InvalidRequest(_)
        )
    }
}

impl From<std::io::Error> for AppError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<rusqlite::Error> for AppError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Storage(value.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(value: serde_json::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

impl From<csv::Error> for AppError {
    fn from(value: csv::Error) -> Self {
        Self::UnreadableFile(value.to_string())
    }
}

impl From<anyhow::Error> for AppError {
    fn from(value: anyhow::Error) -> Self {
        Self::Internal(value.to_string())
    }
}

pub type AppResult<T> = Result<T, AppError>;
