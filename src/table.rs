//! The table module defines the flat dataset shared by every stage and its
//! persisted text form: BOM-prefixed, comma-separated, RFC4180 quoting.

use std::collections::HashMap;

use anyhow::{Context, Result};

use crate::constants::UTF8_BOM;

/// One flat record: column name to value.
pub type Record = HashMap<String, String>;

/// Value of `column` in `record`, empty when absent.
pub fn field<'a>(record: &'a Record, column: &str) -> &'a str {
    record.get(column).map(String::as_str).unwrap_or_default()
}

/// Ordered records sharing one header row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Dataset {
    pub headers: Vec<String>,
    pub records: Vec<Record>,
}

impl Dataset {
    pub fn new(headers: Vec<String>) -> Self {
        Self {
            headers,
            records: Vec::new(),
        }
    }

    /// Builds a dataset from positional rows. Short rows are padded with empty
    /// values, extra cells are ignored.
    pub fn from_rows(headers: Vec<String>, rows: Vec<Vec<String>>) -> Self {
        let records = rows
            .into_iter()
            .map(|row| {
                let mut cells = row.into_iter();
                headers
                    .iter()
                    .map(|header| (header.clone(), cells.next().unwrap_or_default()))
                    .collect()
            })
            .collect();
        Self { headers, records }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Adds a record, projected onto the header row.
    pub fn push(&mut self, record: &Record) {
        let projected = self.project(record);
        self.records.push(projected);
    }

    /// Copy of `record` holding exactly this dataset's columns.
    pub fn project(&self, record: &Record) -> Record {
        self.headers
            .iter()
            .map(|header| (header.clone(), field(record, header).to_string()))
            .collect()
    }

    /// Records as positional rows in header order.
    pub fn rows(&self) -> Vec<Vec<String>> {
        self.records
            .iter()
            .map(|record| {
                self.headers
                    .iter()
                    .map(|header| field(record, header).to_string())
                    .collect()
            })
            .collect()
    }

    /// Serializes to the persisted blob format (BOM, header line, one line per record).
    ///
    /// # Errors
    ///
    /// Returns an error if the CSV writer fails.
    pub fn to_blob(&self) -> Result<String> {
        let mut blob = String::from(UTF8_BOM);
        blob.push_str(&self.to_csv()?);
        Ok(blob)
    }

    /// Serializes as plain CSV without the BOM.
    ///
    /// # Errors
    ///
    /// Returns an error if the CSV writer fails.
    pub fn to_csv(&self) -> Result<String> {
        if self.headers.is_empty() {
            return Ok(String::new());
        }

        let mut writer = csv::WriterBuilder::new()
            .terminator(csv::Terminator::CRLF)
            .from_writer(Vec::new());
        writer
            .write_record(&self.headers)
            .context("Unable to write header row")?;
        for row in self.rows() {
            writer.write_record(&row).context("Unable to write record")?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| anyhow::anyhow!("Unable to flush CSV writer: {e}"))?;

        String::from_utf8(bytes).context("CSV writer produced invalid UTF-8")
    }

    /// Parses a persisted blob. The BOM is optional; ragged rows are tolerated.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not readable as CSV.
    pub fn from_blob(blob: &str) -> Result<Self> {
        let text = blob.strip_prefix(UTF8_BOM).unwrap_or(blob);
        if text.trim().is_empty() {
            return Ok(Self::default());
        }

        let mut reader = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(text.as_bytes());
        let headers: Vec<String> = reader
            .headers()
            .context("Unable to read header row")?
            .iter()
            .map(str::to_string)
            .collect();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.context("Unable to read record")?;
            rows.push(record.iter().map(str::to_string).collect());
        }

        Ok(Self::from_rows(headers, rows))
    }
}
