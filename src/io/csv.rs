//! Tab-separated reading and writing of results tables

use std::path::Path;

use super::results::{ColumnKind, ResultsTable};
use crate::error::{Result, ShrinkError};

const ID_HEADER: &str = "feature_id";

fn format_value(v: f64) -> String {
    if v.is_nan() {
        "NA".to_string()
    } else {
        format!("{:.6e}", v)
    }
}

fn parse_value(field: &str) -> Result<f64> {
    let field = field.trim().trim_matches('"');
    match field {
        "NA" | "NaN" | "" => Ok(f64::NAN),
        _ => field.parse::<f64>().map_err(|_| ShrinkError::InvalidInput {
            reason: format!("Invalid numeric value in results: {}", field),
        }),
    }
}

/// Write a results table as TSV: `feature_id` followed by one column per result column
pub fn write_results<P: AsRef<Path>>(path: P, table: &ResultsTable) -> Result<()> {
    let mut writer = csv::WriterBuilder::new().delimiter(b'\t').from_path(path)?;

    let mut header = vec![ID_HEADER.to_string()];
    header.extend(table.columns().iter().map(|c| c.kind.header().to_string()));
    writer.write_record(&header)?;

    for (i, id) in table.feature_ids().iter().enumerate() {
        let mut record = vec![id.clone()];
        record.extend(table.columns().iter().map(|c| format_value(c.values[i])));
        writer.write_record(&record)?;
    }
    writer.flush()?;
    Ok(())
}

/// Read a results TSV. The first column holds feature ids; recognised headers
/// become columns with their default descriptions, anything else is skipped.
pub fn read_results<P: AsRef<Path>>(path: P) -> Result<ResultsTable> {
    let mut reader = csv::ReaderBuilder::new()
        .delimiter(b'\t')
        .has_headers(true)
        .from_path(path)?;

    let headers = reader.headers()?.clone();
    let mut mapped: Vec<(usize, ColumnKind)> = Vec::new();
    for (idx, name) in headers.iter().enumerate().skip(1) {
        match ColumnKind::from_header(name.trim()) {
            Some(kind) => mapped.push((idx, kind)),
            None => log::warn!("Ignoring unrecognised results column '{}'", name),
        }
    }

    let mut ids = Vec::new();
    let mut values: Vec<Vec<f64>> = vec![Vec::new(); mapped.len()];
    for record in reader.records() {
        let record = record?;
        let id = record.get(0).ok_or_else(|| ShrinkError::InvalidInput {
            reason: "results row without a feature id".to_string(),
        })?;
        ids.push(id.trim().trim_matches('"').to_string());
        for (slot, &(idx, _)) in mapped.iter().enumerate() {
            values[slot].push(parse_value(record.get(idx).unwrap_or("NA"))?);
        }
    }

    if ids.is_empty() {
        return Err(ShrinkError::InvalidInput {
            reason: "results file has no rows".to_string(),
        });
    }

    let mut table = ResultsTable::new(ids);
    for ((_, kind), column) in mapped.into_iter().zip(values) {
        table = table.with_column(kind, kind.default_description(), column)?;
    }
    Ok(table)
}
