use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use calamine::{Data, DataType, Reader};
use chrono::NaiveTime;
use serde_json::Value;

use crate::error::NotifyError;
use crate::models::{CellValue, Dataset, Record};

/// Loads the first sheet of an uploaded file. The first row supplies the headers.
pub fn load_dataset(path: &Path) -> Result<Dataset, NotifyError> {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let dataset = match extension.as_str() {
        "csv" => read_csv(path)?,
        "json" => read_json(path)?,
        "xlsx" | "xlsm" | "xls" | "ods" => read_workbook(path)?,
        other => {
            return Err(unreadable(
                path,
                format!("unsupported file type `{other}`, expected xlsx, xls, csv or json"),
            ))
        }
    };

    if dataset.records.is_empty() {
        return Err(NotifyError::EmptyDataset {
            path: path.to_path_buf(),
        });
    }

    tracing::info!(
        file = %path.display(),
        rows = dataset.records.len(),
        columns = dataset.headers.len(),
        "dataset loaded"
    );
    Ok(dataset)
}

fn read_csv(path: &Path) -> Result<Dataset, NotifyError> {
    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|err| unreadable(path, err.to_string()))?;

    let raw_headers: Vec<String> = reader
        .headers()
        .map_err(|err| unreadable(path, err.to_string()))?
        .iter()
        .map(str::to_string)
        .collect();
    let headers = disambiguate_headers(raw_headers);

    let mut records = Vec::new();
    for row in reader.records() {
        let row = row.map_err(|err| unreadable(path, err.to_string()))?;
        if row.iter().all(|field| field.is_empty()) {
            continue;
        }

        let cells = headers
            .iter()
            .enumerate()
            .map(|(index, header)| {
                let value = match row.get(index) {
                    Some(text) if !text.is_empty() => CellValue::Text(text.to_string()),
                    _ => CellValue::Empty,
                };
                (header.clone(), value)
            })
            .collect();
        records.push(Record::new(cells));
    }

    Ok(Dataset { headers, records })
}

fn read_json(path: &Path) -> Result<Dataset, NotifyError> {
    let file = File::open(path).map_err(|err| unreadable(path, err.to_string()))?;
    let value: Value = serde_json::from_reader(BufReader::new(file))
        .map_err(|err| unreadable(path, err.to_string()))?;

    let Value::Array(rows) = value else {
        return Err(unreadable(path, "expected an array of row objects".to_string()));
    };

    // Headers are every key seen, in first-seen order.
    let mut headers: Vec<String> = Vec::new();
    let mut objects = Vec::new();
    for (index, row) in rows.into_iter().enumerate() {
        let Value::Object(fields) = row else {
            return Err(unreadable(path, format!("row {} is not an object", index + 1)));
        };
        if fields.is_empty() {
            continue;
        }
        for key in fields.keys() {
            if !headers.contains(key) {
                headers.push(key.clone());
            }
        }
        objects.push(fields);
    }

    let records = objects
        .into_iter()
        .map(|mut fields| {
            let cells = headers
                .iter()
                .map(|header| {
                    let value = fields.remove(header).map_or(CellValue::Empty, json_cell);
                    (header.clone(), value)
                })
                .collect();
            Record::new(cells)
        })
        .collect();

    Ok(Dataset { headers, records })
}

/// First worksheet of an Excel or OpenDocument workbook.
fn read_workbook(path: &Path) -> Result<Dataset, NotifyError> {
    let mut workbook =
        calamine::open_workbook_auto(path).map_err(|err| unreadable(path, err.to_string()))?;
    let range = workbook
        .worksheet_range_at(0)
        .ok_or_else(|| unreadable(path, "workbook has no sheets".to_string()))?
        .map_err(|err| unreadable(path, err.to_string()))?;

    let mut rows = range.rows();
    let Some(header_row) = rows.next() else {
        return Ok(Dataset {
            headers: Vec::new(),
            records: Vec::new(),
        });
    };
    let headers = disambiguate_headers(
        header_row
            .iter()
            .map(|cell| cell.to_string().trim().to_string())
            .collect(),
    );

    let mut records = Vec::new();
    for row in rows {
        let values: Vec<CellValue> = row.iter().map(workbook_cell).collect();
        if values.iter().all(|value| *value == CellValue::Empty) {
            continue;
        }

        let cells = headers
            .iter()
            .enumerate()
            .map(|(index, header)| {
                let value = values.get(index).cloned().unwrap_or(CellValue::Empty);
                (header.clone(), value)
            })
            .collect();
        records.push(Record::new(cells));
    }

    Ok(Dataset { headers, records })
}

fn workbook_cell(cell: &Data) -> CellValue {
    match cell {
        Data::Empty | Data::Error(_) => CellValue::Empty,
        Data::Int(n) => CellValue::Number(*n as f64),
        Data::Float(n) => CellValue::Number(*n),
        Data::String(text) | Data::DateTimeIso(text) | Data::DurationIso(text) => {
            match text.trim() {
                "" => CellValue::Empty,
                trimmed => CellValue::Text(trimmed.to_string()),
            }
        }
        Data::Bool(flag) => CellValue::Text(flag.to_string()),
        Data::DateTime(_) => match cell.as_datetime() {
            Some(stamp) if stamp.time() == NaiveTime::MIN => {
                CellValue::Text(stamp.date().format("%Y-%m-%d").to_string())
            }
            Some(stamp) => CellValue::Text(stamp.format("%Y-%m-%d %H:%M:%S").to_string()),
            None => CellValue::Text(cell.to_string()),
        },
    }
}

fn json_cell(value: Value) -> CellValue {
    match value {
        Value::Null => CellValue::Empty,
        Value::String(text) if text.is_empty() => CellValue::Empty,
        Value::String(text) => CellValue::Text(text),
        Value::Number(number) => match number.as_f64() {
            Some(n) => CellValue::Number(n),
            None => CellValue::Text(number.to_string()),
        },
        other => CellValue::Text(other.to_string()),
    }
}

/// Blank headers become `__EMPTY`; repeats get `_1`, `_2`, ... suffixes.
fn disambiguate_headers(raw: Vec<String>) -> Vec<String> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    raw.into_iter()
        .map(|header| {
            let base = if header.is_empty() {
                "__EMPTY".to_string()
            } else {
                header
            };
            let count = seen.entry(base.clone()).or_insert(0);
            let name = if *count == 0 {
                base
            } else {
                format!("{base}_{count}")
            };
            *count += 1;
            name
        })
        .collect()
}

fn unreadable(path: &Path, reason: String) -> NotifyError {
    NotifyError::FileUnreadable {
        path: path.to_path_buf(),
        reason,
    }
}
