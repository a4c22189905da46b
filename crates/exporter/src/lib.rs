//! Serializes a drained query result to disk in one of the four formats the
//! dispatcher supports.
//!
//! Row chunks are drained into memory first, then handed to a blocking task
//! for the actual write: `csv`, `rust_xlsxwriter`, and `arrow`'s IPC writer
//! all expose synchronous `std::io::Write`-based APIs, and none of this
//! codebase's format libraries have an async variant.

use async_trait::async_trait;
use dispatcher_core::{CellValue, DispatchError, ExportFormat, ExportOutcome, Exporter, QueryResult, Row};
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::instrument;

fn cell_to_string(cell: &CellValue) -> String {
    match cell {
        CellValue::Null => String::new(),
        CellValue::Bool(b) => b.to_string(),
        CellValue::Int(i) => i.to_string(),
        CellValue::Float(f) => f.to_string(),
        CellValue::Text(s) => s.clone(),
        CellValue::Bytes(b) => format!("0x{}", hex_encode(b)),
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn cell_to_json(cell: &CellValue) -> serde_json::Value {
    match cell {
        CellValue::Null => serde_json::Value::Null,
        CellValue::Bool(b) => serde_json::Value::Bool(*b),
        CellValue::Int(i) => serde_json::Value::from(*i),
        CellValue::Float(f) => serde_json::json!(f),
        CellValue::Text(s) => serde_json::Value::String(s.clone()),
        CellValue::Bytes(b) => serde_json::Value::String(format!("0x{}", hex_encode(b))),
    }
}

/// Drain every chunk from `result`, honoring cancellation between chunks.
async fn drain_rows(
    mut result: QueryResult,
    cancel: &CancellationToken,
) -> Result<(Vec<String>, Vec<Row>), DispatchError> {
    let columns = result.columns;
    let mut rows = Vec::new();
    while let Some(chunk) = result.chunks.next().await {
        if cancel.is_cancelled() {
            return Err(DispatchError::Canceled("canceled while draining rows for export".into()));
        }
        rows.extend(chunk?);
    }
    Ok((columns, rows))
}

fn write_csv(path: &Path, columns: &[String], rows: &[Row]) -> Result<u64, DispatchError> {
    let mut writer = csv::WriterBuilder::new()
        .quote_style(csv::QuoteStyle::Always)
        .from_path(path)
        .map_err(|e| DispatchError::ExportIo(e.to_string()))?;
    writer
        .write_record(columns)
        .map_err(|e| DispatchError::ExportFormat(e.to_string()))?;
    for row in rows {
        let record: Vec<String> = row.iter().map(cell_to_string).collect();
        writer
            .write_record(&record)
            .map_err(|e| DispatchError::ExportFormat(e.to_string()))?;
    }
    writer.flush().map_err(|e| DispatchError::ExportIo(e.to_string()))?;
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| DispatchError::ExportIo(e.to_string()))
}

fn write_json(path: &Path, columns: &[String], rows: &[Row]) -> Result<u64, DispatchError> {
    let records: Vec<serde_json::Value> = rows
        .iter()
        .map(|row| {
            let map: serde_json::Map<String, serde_json::Value> = columns
                .iter()
                .cloned()
                .zip(row.iter().map(cell_to_json))
                .collect();
            serde_json::Value::Object(map)
        })
        .collect();

    let file = std::fs::File::create(path).map_err(|e| DispatchError::ExportIo(e.to_string()))?;
    serde_json::to_writer_pretty(file, &records)
        .map_err(|e| DispatchError::ExportFormat(e.to_string()))?;
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| DispatchError::ExportIo(e.to_string()))
}

fn write_excel(path: &Path, columns: &[String], rows: &[Row]) -> Result<u64, DispatchError> {
    use rust_xlsxwriter::Workbook;

    let mut workbook = Workbook::new();
    let sheet = workbook.add_worksheet();

    for (col_idx, name) in columns.iter().enumerate() {
        sheet
            .write_string(0, col_idx as u16, name)
            .map_err(|e| DispatchError::ExportFormat(e.to_string()))?;
    }

    for (row_idx, row) in rows.iter().enumerate() {
        let excel_row = (row_idx + 1) as u32;
        for (col_idx, cell) in row.iter().enumerate() {
            let col_idx = col_idx as u16;
            if matches!(cell, CellValue::Null) {
                continue;
            }
            match cell {
                CellValue::Null => unreachable!(),
                CellValue::Bool(b) => sheet.write_boolean(excel_row, col_idx, *b),
                CellValue::Int(i) => sheet.write_number(excel_row, col_idx, *i as f64),
                CellValue::Float(f) => sheet.write_number(excel_row, col_idx, *f),
                CellValue::Text(s) => sheet.write_string(excel_row, col_idx, s),
                CellValue::Bytes(b) => sheet.write_string(excel_row, col_idx, format!("0x{}", hex_encode(b))),
            }
            .map_err(|e| DispatchError::ExportFormat(e.to_string()))?;
        }
    }

    workbook
        .save(path)
        .map_err(|e| DispatchError::ExportIo(e.to_string()))?;
    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| DispatchError::ExportIo(e.to_string()))
}

/// All columns are written as UTF-8 strings: the result set's schema is
/// dynamic and unknown until query time, and a uniform string column type
/// is the only representation every possible cell value fits without a
/// per-query schema inference pass.
fn write_feather(path: &Path, columns: &[String], rows: &[Row]) -> Result<u64, DispatchError> {
    use arrow::array::StringArray;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::ipc::writer::FileWriter;
    use arrow::record_batch::RecordBatch;

    let fields: Vec<Field> = columns
        .iter()
        .map(|name| Field::new(name, DataType::Utf8, true))
        .collect();
    let schema = Arc::new(Schema::new(fields));

    let arrays: Vec<Arc<dyn arrow::array::Array>> = (0..columns.len())
        .map(|col_idx| {
            let values: Vec<Option<String>> = rows
                .iter()
                .map(|row| match row.get(col_idx) {
                    Some(CellValue::Null) | None => None,
                    Some(other) => Some(cell_to_string(other)),
                })
                .collect();
            Arc::new(StringArray::from(values)) as Arc<dyn arrow::array::Array>
        })
        .collect();

    let batch = RecordBatch::try_new(schema.clone(), arrays)
        .map_err(|e| DispatchError::ExportFormat(e.to_string()))?;

    let file = std::fs::File::create(path).map_err(|e| DispatchError::ExportIo(e.to_string()))?;
    let mut writer =
        FileWriter::try_new(file, &schema).map_err(|e| DispatchError::ExportFormat(e.to_string()))?;
    writer
        .write(&batch)
        .map_err(|e| DispatchError::ExportFormat(e.to_string()))?;
    writer
        .finish()
        .map_err(|e| DispatchError::ExportFormat(e.to_string()))?;

    std::fs::metadata(path)
        .map(|m| m.len())
        .map_err(|e| DispatchError::ExportIo(e.to_string()))
}

/// Writes a drained result set to a local file under the dispatcher's spool
/// directory. On any error, removes whatever partial file it left behind.
pub struct FileExporter;

#[async_trait]
impl Exporter for FileExporter {
    #[instrument(skip(self, result, cancel), fields(format = ?format))]
    async fn export(
        &self,
        result: QueryResult,
        format: ExportFormat,
        target_path: &Path,
        cancel: CancellationToken,
    ) -> Result<ExportOutcome, DispatchError> {
        let (columns, rows) = drain_rows(result, &cancel).await?;

        let column_count = columns.len() as u64;
        let row_count = rows.len() as u64;
        let path: PathBuf = target_path.to_path_buf();

        let write_result = tokio::task::spawn_blocking({
            let path = path.clone();
            move || match format {
                ExportFormat::Csv => write_csv(&path, &columns, &rows),
                ExportFormat::Json => write_json(&path, &columns, &rows),
                ExportFormat::Excel => write_excel(&path, &columns, &rows),
                ExportFormat::Feather => write_feather(&path, &columns, &rows),
            }
        })
        .await
        .map_err(|e| DispatchError::Internal(format!("export task panicked: {e}")))?;

        match write_result {
            Ok(byte_size) => Ok(ExportOutcome {
                local_path: path,
                row_count,
                column_count,
                byte_size,
            }),
            Err(err) => {
                let _ = std::fs::remove_file(&path);
                Err(err)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dispatcher_core::CellValue;

    #[test]
    fn csv_export_writes_header_and_rows() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.csv");
        let columns = vec!["id".to_string(), "name".to_string()];
        let rows = vec![
            vec![CellValue::Int(1), CellValue::Text("alice".into())],
            vec![CellValue::Int(2), CellValue::Null],
        ];

        let size = write_csv(&path, &columns, &rows).unwrap();
        assert!(size > 0);

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("\"id\",\"name\""));
        assert!(contents.contains("\"1\",\"alice\""));
    }

    #[test]
    fn json_export_produces_one_object_per_row() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.json");
        let columns = vec!["id".to_string()];
        let rows = vec![vec![CellValue::Int(7)]];

        write_json(&path, &columns, &rows).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&contents).unwrap();
        assert_eq!(parsed[0]["id"], 7);
    }

    #[tokio::test]
    async fn export_removes_partial_file_on_format_failure() {
        // Feather export with mismatched row/column shape still succeeds in
        // practice (columns are padded with None), so this exercises the
        // cleanup path via a write target that cannot be created instead.
        let exporter = FileExporter;
        let bad_path = PathBuf::from("/nonexistent-directory-for-export-test/out.csv");
        let result = QueryResult {
            columns: vec!["id".to_string()],
            chunks: Box::pin(futures::stream::iter(vec![Ok(vec![vec![CellValue::Int(1)]])])),
        };

        let outcome = exporter
            .export(result, ExportFormat::Csv, &bad_path, CancellationToken::new())
            .await;
        assert!(outcome.is_err());
        assert!(!bad_path.exists());
    }
}
