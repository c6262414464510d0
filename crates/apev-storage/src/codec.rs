//! CSV and Parquet renderings of a record sequence.
//!
//! Both encoders are deterministic: the same records in the same order always
//! produce the same bytes, which is what makes re-publishing idempotent.

use std::fs::File;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use apev_core::{format_timestamp, parse_canonical_timestamp, IncompatibleSchemaError, Record};
use arrow_array::{Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};

pub const COLUMNS: [&str; 8] = [
    "id",
    "last_updated",
    "category",
    "location",
    "occurred_at",
    "status",
    "geometry",
    "fetched_at",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CsvRow {
    id: String,
    last_updated: String,
    category: Option<String>,
    location: Option<String>,
    occurred_at: Option<String>,
    status: Option<String>,
    geometry: Option<String>,
    fetched_at: String,
}

impl From<&Record> for CsvRow {
    fn from(record: &Record) -> Self {
        Self {
            id: record.id.clone(),
            last_updated: format_timestamp(record.last_updated),
            category: record.category.clone(),
            location: record.location.clone(),
            occurred_at: record.occurred_at.map(format_timestamp),
            status: record.status.clone(),
            geometry: record.geometry.clone(),
            fetched_at: format_timestamp(record.fetched_at),
        }
    }
}

impl TryFrom<CsvRow> for Record {
    type Error = IncompatibleSchemaError;

    fn try_from(row: CsvRow) -> Result<Self, Self::Error> {
        Ok(Record {
            last_updated: required_timestamp(&row.id, "last_updated", &row.last_updated)?,
            occurred_at: optional_timestamp(&row.id, "occurred_at", row.occurred_at.as_deref())?,
            fetched_at: required_timestamp(&row.id, "fetched_at", &row.fetched_at)?,
            id: row.id,
            category: row.category,
            location: row.location,
            status: row.status,
            geometry: row.geometry,
        })
    }
}

fn required_timestamp(
    id: &str,
    column: &str,
    value: &str,
) -> Result<chrono::DateTime<chrono::Utc>, IncompatibleSchemaError> {
    parse_canonical_timestamp(value).ok_or_else(|| {
        IncompatibleSchemaError::new(format!(
            "record {id:?} has unparseable `{column}` value {value:?}"
        ))
    })
}

fn optional_timestamp(
    id: &str,
    column: &str,
    value: Option<&str>,
) -> Result<Option<chrono::DateTime<chrono::Utc>>, IncompatibleSchemaError> {
    match value {
        None | Some("") => Ok(None),
        Some(text) => required_timestamp(id, column, text).map(Some),
    }
}

pub fn encode_csv(records: &[Record]) -> Result<Vec<u8>> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer
        .write_record(COLUMNS)
        .context("writing csv header")?;
    for record in records {
        writer
            .serialize(CsvRow::from(record))
            .with_context(|| format!("serializing csv row for {}", record.id))?;
    }
    writer
        .into_inner()
        .map_err(|err| anyhow!("flushing csv buffer: {}", err.error()))
}

pub fn decode_csv(bytes: &[u8]) -> Result<Vec<Record>> {
    let mut reader = csv::Reader::from_reader(bytes);
    let mut records = Vec::new();
    for row in reader.deserialize::<CsvRow>() {
        let row = row.context("deserializing csv row")?;
        records.push(Record::try_from(row)?);
    }
    Ok(records)
}

pub fn record_schema() -> Schema {
    Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, false),
        ArrowField::new("last_updated", DataType::Utf8, false),
        ArrowField::new("category", DataType::Utf8, true),
        ArrowField::new("location", DataType::Utf8, true),
        ArrowField::new("occurred_at", DataType::Utf8, true),
        ArrowField::new("status", DataType::Utf8, true),
        ArrowField::new("geometry", DataType::Utf8, true),
        ArrowField::new("fetched_at", DataType::Utf8, false),
    ])
}

pub fn encode_parquet(records: &[Record]) -> Result<Vec<u8>> {
    let schema = Arc::new(record_schema());

    let ids = StringArray::from(records.iter().map(|r| Some(r.id.as_str())).collect::<Vec<_>>());
    let last_updated = StringArray::from(
        records
            .iter()
            .map(|r| Some(format_timestamp(r.last_updated)))
            .collect::<Vec<_>>(),
    );
    let categories = StringArray::from(
        records
            .iter()
            .map(|r| r.category.as_deref())
            .collect::<Vec<_>>(),
    );
    let locations = StringArray::from(
        records
            .iter()
            .map(|r| r.location.as_deref())
            .collect::<Vec<_>>(),
    );
    let occurred_at = StringArray::from(
        records
            .iter()
            .map(|r| r.occurred_at.map(format_timestamp))
            .collect::<Vec<_>>(),
    );
    let statuses = StringArray::from(
        records
            .iter()
            .map(|r| r.status.as_deref())
            .collect::<Vec<_>>(),
    );
    let geometries = StringArray::from(
        records
            .iter()
            .map(|r| r.geometry.as_deref())
            .collect::<Vec<_>>(),
    );
    let fetched_at = StringArray::from(
        records
            .iter()
            .map(|r| Some(format_timestamp(r.fetched_at)))
            .collect::<Vec<_>>(),
    );

    let batch = RecordBatch::try_new(
        schema.clone(),
        vec![
            Arc::new(ids),
            Arc::new(last_updated),
            Arc::new(categories),
            Arc::new(locations),
            Arc::new(occurred_at),
            Arc::new(statuses),
            Arc::new(geometries),
            Arc::new(fetched_at),
        ],
    )
    .context("building records batch")?;

    let mut buffer = Vec::new();
    let mut writer =
        ArrowWriter::try_new(&mut buffer, schema, None).context("opening parquet writer")?;
    writer.write(&batch).context("writing record batch")?;
    writer.close().context("closing parquet writer")?;
    Ok(buffer)
}

/// Read records back from a Parquet file. Missing or mistyped columns surface
/// as [`IncompatibleSchemaError`] at the root of the returned error.
pub fn decode_parquet_file(path: &Path) -> Result<Vec<Record>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet metadata {}", path.display()))?
        .build()
        .with_context(|| format!("building parquet reader {}", path.display()))?;

    let mut records = Vec::new();
    for batch in reader {
        let batch = batch.with_context(|| format!("reading record batch {}", path.display()))?;
        records.extend(
            records_from_batch(&batch).with_context(|| format!("decoding {}", path.display()))?,
        );
    }
    Ok(records)
}

/// Row count from the Parquet footer, without decoding any pages.
pub fn parquet_row_count(path: &Path) -> Result<usize> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let builder = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet metadata {}", path.display()))?;
    let rows = builder.metadata().file_metadata().num_rows();
    usize::try_from(rows).map_err(|_| anyhow!("{} reports {rows} rows", path.display()))
}

fn string_column<'a>(
    batch: &'a RecordBatch,
    name: &str,
) -> Result<&'a StringArray, IncompatibleSchemaError> {
    batch
        .column_by_name(name)
        .and_then(|column| column.as_any().downcast_ref::<StringArray>())
        .ok_or_else(|| IncompatibleSchemaError::new(format!("column `{name}` missing or not utf8")))
}

fn cell(column: &StringArray, row: usize) -> Option<String> {
    if column.is_null(row) {
        None
    } else {
        Some(column.value(row).to_string())
    }
}

fn records_from_batch(batch: &RecordBatch) -> Result<Vec<Record>, IncompatibleSchemaError> {
    let columns = COLUMNS
        .iter()
        .map(|name| string_column(batch, name))
        .collect::<Result<Vec<_>, _>>()?;

    (0..batch.num_rows())
        .map(|row| {
            let id = cell(columns[0], row)
                .filter(|id| !id.trim().is_empty())
                .ok_or_else(|| IncompatibleSchemaError::new(format!("row {row} has no identifier")))?;
            Record::try_from(CsvRow {
                last_updated: cell(columns[1], row).unwrap_or_default(),
                category: cell(columns[2], row),
                location: cell(columns[3], row),
                occurred_at: cell(columns[4], row),
                status: cell(columns[5], row),
                geometry: cell(columns[6], row),
                fetched_at: cell(columns[7], row).unwrap_or_default(),
                id,
            })
        })
        .collect()
}
