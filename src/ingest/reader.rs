//! Loading uploaded bytes into header + row cells.

use crate::errors::{AppError, AppResult};

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];
const DELIMITER_CANDIDATES: [u8; 3] = [b';', b'\t', b','];

#[derive(Debug, Clone)]
pub struct SheetRow {
    /// 1-based line in the source file, used in warnings.
    pub line: u64,
    pub cells: Vec<String>,
}

impl SheetRow {
    pub fn cell(&self, index: usize) -> Option<&str> {
        self.cells.get(index).map(|cell| cell.trim()).filter(|cell| !cell.is_empty())
    }
}

#[derive(Debug, Clone)]
pub struct Sheet {
    pub headers: Vec<String>,
    pub rows: Vec<SheetRow>,
}

/// Decodes the upload as UTF-8 delimited text. Blank rows are dropped.
pub fn read_sheet(bytes: &[u8]) -> AppResult<Sheet> {
    if bytes.starts_with(&[0xFF, 0xFE]) || bytes.starts_with(&[0xFE, 0xFF]) {
        return Err(AppError::UnreadableFile("UTF-16 encoded files are not supported".to_string()));
    }
    let bytes = bytes.strip_prefix(UTF8_BOM).unwrap_or(bytes);
    let text = std::str::from_utf8(bytes)
        .map_err(|error| AppError::UnreadableFile(format!("file is not valid UTF-8 text: {}", error)))?;
    if text.trim().is_empty() {
        return Err(AppError::UnreadableFile("file is empty".to_string()));
    }

    let header_line = text.lines().find(|line| !line.trim().is_empty()).unwrap_or_default();
    let delimiter = sniff_delimiter(header_line);

    let mut reader = csv::ReaderBuilder::new()
        .delimiter(delimiter)
        .flexible(true)
        .has_headers(true)
        .from_reader(text.as_bytes());

    let headers: Vec<String> = reader.headers()?.iter().map(|header| header.trim().to_string()).collect();
    if headers.iter().all(String::is_empty) {
        return Err(AppError::UnreadableFile("no header row found".to_string()));
    }

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        if record.iter().all(|cell| cell.trim().is_empty()) {
            continue;
        }
        let line = record.position().map(|position| position.line()).unwrap_or_default();
        rows.push(SheetRow {
            line,
            cells: record.iter().map(ToString::to_string).collect(),
        });
    }

    Ok(Sheet { headers, rows })
}

fn sniff_delimiter(header_line: &str) -> u8 {
    DELIMITER_CANDIDATES
        .iter()
        .copied()
        .max_by_key(|candidate| header_line.bytes().filter(|byte| byte == candidate).count())
        .filter(|candidate| header_line.as_bytes().contains(candidate))
        .unwrap_or(b',')
}
