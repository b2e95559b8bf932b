use crate::errors::{AppError, AppResult};
use crate::models::{FileUpload, MetricKind, MetricPoint, PointSource};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");

const POINT_COLUMNS: &str =
    "id, period, metric, source, group_a, group_b, group_c, value, weight, upload_id, created_at";
const UPLOAD_COLUMNS: &str = "id, kind, metric, original_name, uploaded_at, period, active";

/// Rows removed and written by [`Database::replace_period_points`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplaceSummary {
    pub cleared_rows: usize,
    pub inserted_rows: usize,
}

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
            }
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        Ok(Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    pub fn insert_file_upload(&self, upload: &FileUpload) -> AppResult<()> {
        let conn = self.lock()?;
        insert_upload_in(&conn, upload)
    }

    pub fn get_file_upload(&self, id: &str) -> AppResult<Option<FileUpload>> {
        let conn = self.lock()?;
        conn.query_row(
            &format!("SELECT {} FROM file_uploads WHERE id = ?1", UPLOAD_COLUMNS),
            [id],
            parse_upload_row,
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_file_uploads(&self, include_inactive: bool) -> AppResult<Vec<FileUpload>> {
        let conn = self.lock()?;
        let query = if include_inactive {
            format!("SELECT {} FROM file_uploads ORDER BY uploaded_at DESC", UPLOAD_COLUMNS)
        } else {
            format!(
                "SELECT {} FROM file_uploads WHERE active = 1 ORDER BY uploaded_at DESC",
                UPLOAD_COLUMNS
            )
        };
        let mut statement = conn.prepare(&query)?;
        let rows = statement
            .query_map([], parse_upload_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn count_active_uploads(&self) -> AppResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM file_uploads WHERE active = 1", [], |row| {
            row.get(0)
        })?;
        Ok(usize::try_from(count).unwrap_or_default())
    }

    /// Soft delete: the upload stays on record but is no longer active.
    pub fn deactivate_file_upload(&self, id: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let changed = conn.execute("UPDATE file_uploads SET active = 0 WHERE id = ?1 AND active = 1", [id])?;
        Ok(changed > 0)
    }

    /// Inserts points as given. Callers clear conflicting rows first; no
    /// deduplication by key happens here.
    pub fn upsert_metric_points(&self, points: &[MetricPoint]) -> AppResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let inserted = insert_points_in(&tx, points)?;
        tx.commit()?;
        Ok(inserted)
    }

    /// Clears the upload's kind of rows for every listed period, then writes
    /// the upload record and its points, all in one transaction. Rows of the
    /// other kind for the same periods stay in place.
    pub fn replace_period_points(
        &self,
        upload: &FileUpload,
        periods: &[String],
        points: &[MetricPoint],
    ) -> AppResult<ReplaceSummary> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut cleared_rows = 0;
        for period in periods {
            cleared_rows += clear_period_in(&tx, period, upload.metric, Some(upload.kind))?;
        }
        insert_upload_in(&tx, upload)?;
        let inserted_rows = insert_points_in(&tx, points)?;
        tx.commit()?;

        Ok(ReplaceSummary {
            cleared_rows,
            inserted_rows,
        })
    }

    /// Points for one period, ordered by (group_a, group_b, group_c).
    pub fn query_by_period_and_metric(
        &self,
        period: &str,
        metric: MetricKind,
        source: Option<PointSource>,
    ) -> AppResult<Vec<MetricPoint>> {
        let conn = self.lock()?;
        let mut query = format!(
            "SELECT {} FROM metric_points WHERE period = ?1 AND metric = ?2",
            POINT_COLUMNS
        );
        let mut params_vec: Vec<String> = vec![period.to_string(), metric.as_str().to_string()];
        if let Some(source) = source {
            query.push_str(" AND source = ?3");
            params_vec.push(source.as_str().to_string());
        }
        query.push_str(" ORDER BY group_a ASC, group_b ASC, group_c ASC, created_at ASC");

        let mut statement = conn.prepare(&query)?;
        let rows = statement
            .query_map(rusqlite::params_from_iter(params_vec.iter()), parse_point_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn breakdown(&self, period: &str, metric: MetricKind) -> AppResult<Vec<MetricPoint>> {
        self.query_by_period_and_metric(period, metric, Some(PointSource::Breakdown))
    }

    /// Most recent period holding data for the metric. The canonical
    /// `YYYYQn` form makes a plain string sort chronological.
    pub fn latest_period(&self, metric: MetricKind) -> AppResult<Option<String>> {
        let conn = self.lock()?;
        conn.query_row(
            "SELECT period FROM metric_points WHERE metric = ?1 ORDER BY period DESC LIMIT 1",
            [metric.as_str()],
            |row| row.get(0),
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn list_periods(&self, metric: MetricKind) -> AppResult<Vec<String>> {
        let conn = self.lock()?;
        let mut statement =
            conn.prepare("SELECT DISTINCT period FROM metric_points WHERE metric = ?1 ORDER BY period ASC")?;
        let rows = statement
            .query_map([metric.as_str()], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Points with `from <= period <= to`, ordered by period then groups.
    pub fn points_in_range(
        &self,
        metric: MetricKind,
        source: PointSource,
        from: &str,
        to: &str,
    ) -> AppResult<Vec<MetricPoint>> {
        let conn = self.lock()?;
        let mut statement = conn.prepare(&format!(
            "SELECT {} FROM metric_points
             WHERE metric = ?1 AND source = ?2 AND period >= ?3 AND period <= ?4
             ORDER BY period ASC, group_a ASC, group_b ASC, group_c ASC",
            POINT_COLUMNS
        ))?;
        let rows = statement
            .query_map(params![metric.as_str(), source.as_str(), from, to], parse_point_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Deletes all points for (period, metric) and marks the uploads that fed
    /// them inactive. Returns the number of deleted points.
    pub fn clear_period(&self, period: &str, metric: MetricKind) -> AppResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let deleted = clear_period_in(&tx, period, metric, None)?;
        tx.commit()?;
        Ok(deleted)
    }

    /// Hard delete of a period: its points and the upload records left with
    /// no points elsewhere.
    pub fn purge_period(&self, period: &str, metric: MetricKind) -> AppResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM file_uploads
             WHERE metric = ?2 AND (period = ?1 OR id IN (
               SELECT DISTINCT upload_id FROM metric_points
               WHERE period = ?1 AND metric = ?2 AND upload_id IS NOT NULL
             ))
             AND NOT EXISTS (
               SELECT 1 FROM metric_points AS kept
               WHERE kept.upload_id = file_uploads.id AND NOT (kept.period = ?1 AND kept.metric = ?2)
             )",
            params![period, metric.as_str()],
        )?;
        let deleted = tx.execute(
            "DELETE FROM metric_points WHERE period = ?1 AND metric = ?2",
            params![period, metric.as_str()],
        )?;
        tx.commit()?;
        Ok(deleted)
    }
}

/// Deletes the points of (period, metric), or only those of `source` when
/// given. Uploads that fed the slice are marked inactive once none of their
/// points survive it.
fn clear_period_in(
    conn: &Connection,
    period: &str,
    metric: MetricKind,
    source: Option<PointSource>,
) -> AppResult<usize> {
    let source = source.map(PointSource::as_str);
    conn.execute(
        "UPDATE file_uploads SET active = 0
         WHERE metric = ?2 AND active = 1 AND (?3 IS NULL OR kind = ?3)
           AND (period = ?1 OR id IN (
             SELECT DISTINCT upload_id FROM metric_points
             WHERE period = ?1 AND metric = ?2 AND (?3 IS NULL OR source = ?3) AND upload_id IS NOT NULL
           ))
           AND NOT EXISTS (
             SELECT 1 FROM metric_points AS kept
             WHERE kept.upload_id = file_uploads.id
               AND NOT (kept.period = ?1 AND kept.metric = ?2 AND (?3 IS NULL OR kept.source = ?3))
           )",
        params![period, metric.as_str(), source],
    )?;
    let deleted = conn.execute(
        "DELETE FROM metric_points WHERE period = ?1 AND metric = ?2 AND (?3 IS NULL OR source = ?3)",
        params![period, metric.as_str(), source],
    )?;
    Ok(deleted)
}

fn insert_upload_in(conn: &Connection, upload: &FileUpload) -> AppResult<()> {
    conn.execute(
        "INSERT INTO file_uploads (id, kind, metric, original_name, uploaded_at, period, active)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            upload.id,
            upload.kind.as_str(),
            upload.metric.as_str(),
            upload.original_name,
            upload.uploaded_at.to_rfc3339(),
            upload.period,
            i32::from(upload.active),
        ],
    )?;
    Ok(())
}

fn insert_points_in(conn: &Connection, points: &[MetricPoint]) -> AppResult<usize> {
    let mut statement = conn.prepare_cached(
        "INSERT INTO metric_points (
           id, period, metric, source, group_a, group_b, group_c, value, weight, upload_id, created_at
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?;
    let mut inserted = 0;
    for point in points {
        inserted += statement.execute(params![
            point.id,
            point.period,
            point.metric.as_str(),
            point.source.as_str(),
            point.group_a,
            point.group_b,
            point.group_c,
            point.value,
            point.weight,
            point.upload_id,
            point.created_at.to_rfc3339(),
        ])?;
    }
    Ok(inserted)
}

fn parse_point_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricPoint> {
    Ok(MetricPoint {
        id: row.get(0)?,
        period: row.get(1)?,
        metric: parse_metric(&row.get::<_, String>(2)?)?,
        source: parse_source(&row.get::<_, String>(3)?)?,
        group_a: row.get(4)?,
        group_b: row.get(5)?,
        group_c: row.get(6)?,
        value: row.get(7)?,
        weight: row.get(8)?,
        upload_id: row.get(9)?,
        created_at: parse_time(&row.get::<_, String>(10)?)?,
    })
}

fn parse_upload_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<FileUpload> {
    Ok(FileUpload {
        id: row.get(0)?,
        kind: parse_source(&row.get::<_, String>(1)?)?,
        metric: parse_metric(&row.get::<_, String>(2)?)?,
        original_name: row.get(3)?,
        uploaded_at: parse_time(&row.get::<_, String>(4)?)?,
        period: row.get(5)?,
        active: row.get::<_, i32>(6)? != 0,
    })
}

fn conversion_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn parse_metric(raw: &str) -> rusqlite::Result<MetricKind> {
    raw.parse::<MetricKind>()
        .map_err(|error| conversion_error(error.to_string()))
}

fn parse_source(raw: &str) -> rusqlite::Result<PointSource> {
    raw.parse::<PointSource>()
        .map_err(|error| conversion_error(error.to_string()))
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| conversion_error(error.to_string()))
}
