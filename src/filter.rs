//! Dynamic-viewer content filtering: CSV column projection and masking.

use csv::{ReaderBuilder, WriterBuilder};

use crate::error::{NexusError, NexusResult};
use crate::rebac::ColumnConfig;

/// Applies a column policy to CSV bytes: keeps `visible_columns` (all
/// when unset), then replaces `masked_columns` values with the mask.
pub fn apply_column_filter(bytes: &[u8], config: &ColumnConfig) -> NexusResult<Vec<u8>> {
    let mut reader = ReaderBuilder::new().has_headers(true).from_reader(bytes);
    let headers = reader
        .headers()
        .map_err(|err| NexusError::validation(format!("bad csv header: {err}")))?
        .clone();

    // Indices of surviving columns, in original header order.
    let kept: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, name)| match &config.visible_columns {
            Some(visible) => visible.iter().any(|v| v == name),
            None => true,
        })
        .map(|(index, _)| index)
        .collect();
    let masked: Vec<usize> = headers
        .iter()
        .enumerate()
        .filter(|(_, name)| config.masked_columns.iter().any(|m| m == name))
        .map(|(index, _)| index)
        .collect();

    let mut writer = WriterBuilder::new().from_writer(Vec::new());
    let out_header: Vec<&str> = kept.iter().map(|&index| &headers[index]).collect();
    writer
        .write_record(&out_header)
        .map_err(|err| NexusError::validation(format!("csv write failed: {err}")))?;

    for record in reader.records() {
        let record = record.map_err(|err| NexusError::validation(format!("bad csv row: {err}")))?;
        let row: Vec<&str> = kept
            .iter()
            .map(|&index| {
                if masked.contains(&index) {
                    config.mask.as_str()
                } else {
                    record.get(index).unwrap_or("")
                }
            })
            .collect();
        writer
            .write_record(&row)
            .map_err(|err| NexusError::validation(format!("csv write failed: {err}")))?;
    }

    writer
        .into_inner()
        .map_err(|err| NexusError::validation(format!("csv write failed: {err}")))
}

/// Whether a path should be considered CSV for filtering purposes.
pub fn is_csv_path(path: &str, mime_type: Option<&str>) -> bool {
    mime_type == Some("text/csv") || path.ends_with(".csv")
}
