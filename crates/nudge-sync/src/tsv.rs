//! Tab-separated tables and atomic file writes.
//!
//! Tables have a header row naming the columns. Cells escape tab, newline,
//! carriage return and backslash so any title or description round-trips.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use tempfile::NamedTempFile;

use crate::SyncError;

/// One parsed row, looked up by column name.
#[derive(Debug, Clone, Default)]
pub(crate) struct Row(HashMap<String, String>);

impl Row {
    /// Cell text, or `default` if the column is missing.
    pub fn text(&self, column: &str, default: &str) -> String {
        self.0
            .get(column)
            .cloned()
            .unwrap_or_else(|| default.to_string())
    }

    /// Integer cell, or `default` if missing or unparsable.
    pub fn int(&self, column: &str, default: i64) -> i64 {
        self.0
            .get(column)
            .and_then(|cell| cell.trim().parse().ok())
            .unwrap_or(default)
    }

    /// Boolean cell; anything but a true spelling is false.
    pub fn flag(&self, column: &str) -> bool {
        self.0
            .get(column)
            .is_some_and(|cell| matches!(cell.trim(), "true" | "True" | "1"))
    }
}

/// Read a table. A missing file is an empty table.
pub(crate) fn read_table(path: &Path) -> Result<Vec<Row>, std::io::Error> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut lines = content.lines().filter(|line| !line.is_empty());
    let Some(header) = lines.next() else {
        return Ok(Vec::new());
    };
    let columns: Vec<String> = header.split('\t').map(unescape).collect();

    Ok(lines
        .map(|line| {
            Row(columns
                .iter()
                .cloned()
                .zip(line.split('\t').map(unescape))
                .collect())
        })
        .collect())
}

/// Render a table with `columns` as the header.
pub(crate) fn render_table(columns: &[&str], rows: impl IntoIterator<Item = Vec<String>>) -> String {
    let mut out = columns.join("\t");
    out.push('\n');
    for row in rows {
        let cells: Vec<String> = row.iter().map(|cell| escape(cell)).collect();
        out.push_str(&cells.join("\t"));
        out.push('\n');
    }
    out
}

/// Replace `path` with `contents` so readers never observe a partial file.
pub(crate) fn write_atomic(path: &Path, contents: &str) -> Result<(), SyncError> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut file = NamedTempFile::new_in(dir).map_err(|e| SyncError::persistence(path, e))?;
    file.write_all(contents.as_bytes())
        .map_err(|e| SyncError::persistence(path, e))?;
    file.persist(path)
        .map_err(|e| SyncError::persistence(path, e.error))?;
    Ok(())
}

fn escape(cell: &str) -> String {
    let mut out = String::with_capacity(cell.len());
    for c in cell.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '\t' => out.push_str("\\t"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            c => out.push(c),
        }
    }
    out
}

fn unescape(cell: &str) -> String {
    let mut out = String::with_capacity(cell.len());
    let mut chars = cell.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('t') => out.push('\t'),
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some(other) => out.push(other),
            None => out.push('\\'),
        }
    }
    out
}
