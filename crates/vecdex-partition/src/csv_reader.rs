//! The CSV reader (§4.1, §4.2): a lazy, finite, non-restartable sequence of
//! rows over one file or an ordered series, with malformed-row recovery.

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;

use csv::{Position, ReaderBuilder, StringRecord};
use vecdex_core::digest::row_digest;

use crate::error::PartitionError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderRowPolicy {
    /// Every file in the series has its own header row.
    All,
    /// Only the first file in the series has a header row.
    FirstOnly,
}

impl HeaderRowPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "all" => Some(Self::All),
            "first-only" => Some(Self::FirstOnly),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CsvSourceConfig {
    pub delimiter: u8,
    pub header_row: HeaderRowPolicy,
    /// 1-based index of the column malformed rows should be re-joined
    /// around, if configured.
    pub malformed_column: Option<usize>,
}

impl Default for CsvSourceConfig {
    fn default() -> Self {
        Self {
            delimiter: b',',
            header_row: HeaderRowPolicy::All,
            malformed_column: None,
        }
    }
}

/// A fully materialised row: cells aligned 1:1 with the header, blanks
/// normalised to `None`.
#[derive(Debug, Clone)]
pub struct Row {
    pub cells: Vec<Option<String>>,
}

impl Row {
    pub fn get<'a>(&'a self, header: &[String], name: &str) -> Option<&'a str> {
        let idx = header.iter().position(|h| h == name)?;
        self.cells.get(idx).and_then(|c| c.as_deref())
    }

    pub fn digest(&self) -> String {
        row_digest(self.cells.iter().map(|c| c.as_deref()))
    }
}

/// Position in the logical row stream after a row was read, suitable for
/// persisting as resume state (§4.6).
#[derive(Debug, Clone, Copy)]
pub struct StreamCursor {
    pub byte_offset: u64,
    pub row_index: u64,
}

fn normalise_cell(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn synthetic_header(width: usize) -> Vec<String> {
    (1..=width).map(|i| format!("column_{i}")).collect()
}

/// Re-join a too-wide row around `malformed_column` (1-based) so its width
/// matches `expected_width`. Returns `None` if the result still doesn't
/// match exactly.
fn rejoin_malformed(
    record: &StringRecord,
    malformed_column: usize,
    expected_width: usize,
    delimiter: char,
) -> Option<Vec<String>> {
    if record.len() <= expected_width || malformed_column == 0 || malformed_column > expected_width {
        return None;
    }
    let excess = record.len() - expected_width;
    let anchor = malformed_column - 1;
    if anchor >= record.len() {
        return None;
    }
    let merge_end = (anchor + 1 + excess).min(record.len());
    let mut cells: Vec<String> = Vec::with_capacity(expected_width);
    cells.extend(record.iter().take(anchor).map(str::to_string));
    let merged = record
        .iter()
        .skip(anchor)
        .take(merge_end - anchor)
        .collect::<Vec<_>>()
        .join(&delimiter.to_string());
    cells.push(merged);
    cells.extend(record.iter().skip(merge_end).map(str::to_string));
    if cells.len() == expected_width {
        Some(cells)
    } else {
        None
    }
}

/// One open file in a series, tracking byte position for resume seeking.
struct FileCursor {
    path: PathBuf,
    reader: csv::Reader<BufReader<File>>,
}

/// Reads a single file or an ordered series of files as one logical row
/// stream, applying the header policy and row-recovery passes.
pub struct SeriesReader {
    files: Vec<PathBuf>,
    file_idx: usize,
    config: CsvSourceConfig,
    header: Vec<String>,
    cursor: Option<FileCursor>,
    physical_row_number: u64,
    row_index: u64,
}

impl SeriesReader {
    pub fn open(files: Vec<PathBuf>, config: CsvSourceConfig) -> Result<Self, PartitionError> {
        let mut reader = Self {
            files,
            file_idx: 0,
            config,
            header: Vec::new(),
            cursor: None,
            physical_row_number: 0,
            row_index: 0,
        };
        reader.open_next_file(true)?;
        Ok(reader)
    }

    /// Resume reading a single already-partially-consumed file at a known
    /// byte offset, using externally recorded field names rather than
    /// re-reading a header row (§4.6 offset mode).
    pub fn resume_at_offset(
        path: PathBuf,
        fieldnames: Vec<String>,
        byte_offset: u64,
        row_index: u64,
        delimiter: u8,
    ) -> std::io::Result<Self> {
        let file = File::open(&path)?;
        let mut csv_reader = ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(BufReader::new(file));
        let mut pos = Position::new();
        pos.set_byte(byte_offset);
        csv_reader.seek(pos)?;
        Ok(Self {
            files: vec![path.clone()],
            file_idx: 0,
            config: CsvSourceConfig {
                delimiter,
                header_row: HeaderRowPolicy::All,
                malformed_column: None,
            },
            header: fieldnames,
            cursor: Some(FileCursor {
                path,
                reader: csv_reader,
            }),
            physical_row_number: 0,
            row_index,
        })
    }

    pub fn header(&self) -> &[String] {
        &self.header
    }

    fn open_next_file(&mut self, is_first: bool) -> Result<bool, PartitionError> {
        if self.file_idx >= self.files.len() {
            return Ok(false);
        }
        let path = self.files[self.file_idx].clone();
        self.file_idx += 1;
        let file = File::open(&path).map_err(|e| PartitionError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        let mut reader = ReaderBuilder::new()
            .delimiter(self.config.delimiter)
            .has_headers(false)
            .flexible(true)
            .from_reader(BufReader::new(file));

        let should_read_header = match self.config.header_row {
            HeaderRowPolicy::All => true,
            HeaderRowPolicy::FirstOnly => is_first,
        };

        if should_read_header {
            let mut record = StringRecord::new();
            let has_row = reader
                .read_record(&mut record)
                .map_err(|e| PartitionError::Io {
                    path: path.display().to_string(),
                    source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
                })?;
            if has_row {
                let header: Vec<String> = record.iter().map(str::to_string).collect();
                if is_first {
                    self.header = header;
                }
                // first-only: subsequent files' header rows are read to
                // advance the cursor, then discarded; the series keeps the
                // first file's header width (see SPEC_FULL.md open question).
            } else if is_first {
                // empty first file: header is derived from the first data
                // row's width once it's read (synthetic headers below).
            }
        }

        self.cursor = Some(FileCursor { path, reader });
        Ok(true)
    }

    fn next_physical_record(&mut self) -> Result<Option<StringRecord>, PartitionError> {
        loop {
            let Some(cursor) = self.cursor.as_mut() else {
                return Ok(None);
            };
            let mut record = StringRecord::new();
            let has_row = cursor.reader.read_record(&mut record).map_err(|e| PartitionError::Io {
                path: cursor.path.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::InvalidData, e),
            })?;
            if has_row {
                self.physical_row_number += 1;
                return Ok(Some(record));
            }
            if !self.open_next_file(false)? {
                return Ok(None);
            }
        }
    }

    /// Current byte position in the active file, for resume-state
    /// persistence (§4.6).
    pub fn cursor_position(&self) -> u64 {
        self.cursor
            .as_ref()
            .map(|c| c.reader.position().byte())
            .unwrap_or(0)
    }

    pub fn row_index(&self) -> u64 {
        self.row_index
    }

    pub fn stream_cursor(&self) -> StreamCursor {
        StreamCursor {
            byte_offset: self.cursor_position(),
            row_index: self.row_index,
        }
    }

    /// Read and recover the next logical row, applying the two-pass
    /// malformed-row recovery of §4.1. Returns `Ok(None)` at end of stream;
    /// a row that cannot be recovered to the header's width is dropped and
    /// reported via the returned `DropReason`, not surfaced as `Row`.
    pub fn next_row(&mut self) -> Result<Option<RowOutcome>, PartitionError> {
        let Some(mut record) = self.next_physical_record()? else {
            return Ok(None);
        };
        if self.header.is_empty() {
            self.header = synthetic_header(record.len());
        }
        let expected = self.header.len();
        let delimiter = self.config.delimiter as char;

        let first_physical_row = self.physical_row_number;
        let mut last_physical_row = self.physical_row_number;

        let cells = loop {
            if record.len() == expected {
                break Some(record.iter().map(str::to_string).collect::<Vec<_>>());
            }
            if record.len() > expected {
                if let Some(column) = self.config.malformed_column {
                    if let Some(rejoined) = rejoin_malformed(&record, column, expected, delimiter) {
                        break Some(rejoined);
                    }
                }
                break None;
            }
            // record.len() < expected: multi-line stitch. Fold one more
            // physical row in: its first cell continues the last stitched
            // cell (joined by a literal newline), and any further cells of
            // that physical row extend the array as new trailing cells —
            // this is how a short row grows back up towards `expected`.
            let Some(next) = self.next_physical_record()? else {
                break None;
            };
            last_physical_row = self.physical_row_number;
            let mut merged: Vec<String> = record.iter().map(str::to_string).collect();
            let extra: Vec<String> = next.iter().map(str::to_string).collect();
            if merged.is_empty() {
                merged = extra;
            } else if let Some((first_extra, rest_extra)) = extra.split_first() {
                if let Some(last) = merged.last_mut() {
                    last.push('\n');
                    last.push_str(first_extra);
                }
                merged.extend_from_slice(rest_extra);
            } else if let Some(last) = merged.last_mut() {
                last.push('\n');
            }
            if merged.len() > expected {
                if let Some(column) = self.config.malformed_column {
                    let wide = StringRecord::from(merged.clone());
                    if let Some(rejoined) = rejoin_malformed(&wide, column, expected, delimiter) {
                        merged = rejoined;
                    }
                }
            }
            record = StringRecord::from(merged);
        };

        match cells {
            Some(cells) => {
                self.row_index += 1;
                let padded = pad_to_width(cells, self.header.len());
                let normalised = padded.into_iter().map(|c| normalise_cell(&c)).collect();
                Ok(Some(RowOutcome::Row(Row { cells: normalised })))
            }
            None => Ok(Some(RowOutcome::Dropped {
                first_physical_row,
                last_physical_row,
            })),
        }
    }
}

fn pad_to_width(mut cells: Vec<String>, width: usize) -> Vec<String> {
    while cells.len() < width {
        cells.push(String::new());
    }
    cells.truncate(width);
    cells
}

pub enum RowOutcome {
    Row(Row),
    /// The row could not be recovered to the expected width and was
    /// dropped; `first_physical_row`/`last_physical_row` identify the
    /// physical lines consumed while attempting recovery (§4.1, §7
    /// *MalformedRow*).
    Dropped {
        first_physical_row: u64,
        last_physical_row: u64,
    },
}

/// Resolve a source template (§3) to an opened [`SeriesReader`].
pub fn open_source(template: &str, config: CsvSourceConfig) -> Result<SeriesReader, PartitionError> {
    let files = crate::source_template::expand(template)
        .map_err(|e| PartitionError::Io {
            path: template.to_string(),
            source: std::io::Error::new(std::io::ErrorKind::NotFound, e.to_string()),
        })?;
    SeriesReader::open(files, config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::path::Path;

    fn write_file(dir: &Path, name: &str, content: &str) -> PathBuf {
        let path = dir.join(name);
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn reads_simple_rows_with_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "t.csv", "id,name\n1,alice\n2,bob\n");
        let mut reader = SeriesReader::open(vec![path], CsvSourceConfig::default()).unwrap();
        assert_eq!(reader.header(), &["id".to_string(), "name".to_string()]);
        let mut rows = Vec::new();
        while let Some(RowOutcome::Row(row)) = reader.next_row().unwrap() {
            rows.push(row);
        }
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].get(reader.header(), "name"), Some("alice"));
    }

    #[test]
    fn blank_cells_become_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "t.csv", "id,name\n1,\n");
        let mut reader = SeriesReader::open(vec![path], CsvSourceConfig::default()).unwrap();
        let RowOutcome::Row(row) = reader.next_row().unwrap().unwrap() else {
            panic!("expected row");
        };
        assert_eq!(row.get(reader.header(), "name"), None);
    }

    #[test]
    fn no_header_generates_synthetic_columns() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "t.csv", "1,alice\n2,bob\n");
        let config = CsvSourceConfig {
            delimiter: b',',
            header_row: HeaderRowPolicy::All,
            malformed_column: None,
        };
        // Simulate "no header": treat the whole file as data by reading
        // with has_headers already disabled via FirstOnly + a manual first
        // row workaround is out of scope here; this test instead verifies
        // the synthetic-header path when the header vector starts empty.
        let mut reader = SeriesReader::open(vec![path], config).unwrap();
        // Header was consumed as "1,alice" under the default policy; the
        // synthetic-header path is exercised directly:
        assert_eq!(synthetic_header(3), vec!["column_1", "column_2", "column_3"]);
        let _ = reader.next_row();
    }

    #[test]
    fn multi_line_stitch_rejoins_short_rows() {
        let dir = tempfile::tempdir().unwrap();
        // Row for id=1 has only 2 cells (missing `note` entirely) because a
        // raw newline split the export mid-row; the continuation physical
        // line supplies the rest: its first cell extends `name`, its second
        // becomes `note`, bringing the row back up to the expected width.
        let content = "id,name,note\n1,alice\nJohn,extra detail\n2,bob,ok\n";
        let path = write_file(dir.path(), "t.csv", content);
        let mut reader = SeriesReader::open(vec![path], CsvSourceConfig::default()).unwrap();
        let RowOutcome::Row(first) = reader.next_row().unwrap().unwrap() else {
            panic!("expected row");
        };
        assert_eq!(first.get(reader.header(), "id"), Some("1"));
        assert_eq!(first.get(reader.header(), "name"), Some("alice\nJohn"));
        assert_eq!(first.get(reader.header(), "note"), Some("extra detail"));

        let RowOutcome::Row(second) = reader.next_row().unwrap().unwrap() else {
            panic!("expected row");
        };
        assert_eq!(second.get(reader.header(), "id"), Some("2"));
        assert_eq!(second.get(reader.header(), "name"), Some("bob"));
        assert_eq!(second.get(reader.header(), "note"), Some("ok"));
    }

    #[test]
    fn malformed_column_rejoin_handles_wide_rows() {
        let dir = tempfile::tempdir().unwrap();
        // An unescaped comma inside the 2nd column widens the row by one.
        let content = "id,name,age\n1,doe, john,30\n";
        let path = write_file(dir.path(), "t.csv", content);
        let config = CsvSourceConfig {
            delimiter: b',',
            header_row: HeaderRowPolicy::All,
            malformed_column: Some(2),
        };
        let mut reader = SeriesReader::open(vec![path], config).unwrap();
        let RowOutcome::Row(row) = reader.next_row().unwrap().unwrap() else {
            panic!("expected recovered row");
        };
        assert_eq!(row.get(reader.header(), "name"), Some("doe, john"));
        assert_eq!(row.get(reader.header(), "age"), Some("30"));
    }
}
