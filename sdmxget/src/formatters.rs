//! Serialisation of result tables for files and stdout.

use std::io::Write;

use anyhow::Result;
use enum_dispatch::enum_dispatch;
use polars::prelude::*;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// JSON values of one column. Non-finite floats become null; types other than strings,
/// numbers and booleans are written in their string form.
fn column_to_json(series: &Series) -> Result<Vec<Value>> {
    let values = match series.dtype() {
        DataType::String => series
            .str()?
            .into_iter()
            .map(|v| v.map_or(Value::Null, Value::from))
            .collect(),
        DataType::Float32 | DataType::Float64 => series
            .cast(&DataType::Float64)?
            .f64()?
            .into_iter()
            .map(|v| v.and_then(Number::from_f64).map_or(Value::Null, Value::Number))
            .collect(),
        DataType::Boolean => series
            .bool()?
            .into_iter()
            .map(|v| v.map_or(Value::Null, Value::Bool))
            .collect(),
        dtype if dtype.is_integer() => series
            .cast(&DataType::Int64)?
            .i64()?
            .into_iter()
            .map(|v| v.map_or(Value::Null, Value::from))
            .collect(),
        _ => series
            .cast(&DataType::String)?
            .str()?
            .into_iter()
            .map(|v| v.map_or(Value::Null, Value::from))
            .collect(),
    };
    Ok(values)
}

/// One JSON object per row.
fn records(df: &DataFrame) -> Result<Vec<Value>> {
    let columns = df
        .get_columns()
        .iter()
        .map(|series| Ok((series.name().to_string(), column_to_json(series)?)))
        .collect::<Result<Vec<_>>>()?;
    Ok((0..df.height())
        .map(|row| {
            Value::Object(
                columns
                    .iter()
                    .map(|(name, values)| (name.clone(), values[row].clone()))
                    .collect::<Map<_, _>>(),
            )
        })
        .collect())
}

/// Writes a result table in one serialisation. `format` renders to a string via `save`.
#[enum_dispatch]
pub trait OutputGenerator {
    fn save(&self, writer: &mut impl Write, df: &mut DataFrame) -> Result<()>;

    fn format(&self, df: &mut DataFrame) -> Result<String> {
        let mut buffer: Vec<u8> = vec![];
        self.save(&mut buffer, df)?;
        Ok(String::from_utf8(buffer)?)
    }
}

/// Every supported output serialisation
#[enum_dispatch(OutputGenerator)]
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormatter {
    Csv(CsvFormatter),
    Json(JsonFormatter),
    JsonLines(JsonLinesFormatter),
}

/// Comma-separated values with a header row; nulls are empty fields.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CsvFormatter;

impl OutputGenerator for CsvFormatter {
    fn save(&self, writer: &mut impl Write, df: &mut DataFrame) -> Result<()> {
        CsvWriter::new(writer).include_header(true).finish(df)?;
        Ok(())
    }
}

/// A single JSON array of row objects.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JsonFormatter;

impl OutputGenerator for JsonFormatter {
    fn save(&self, writer: &mut impl Write, df: &mut DataFrame) -> Result<()> {
        serde_json::to_writer(writer, &Value::Array(records(df)?))?;
        Ok(())
    }
}

/// One JSON object per line.
#[derive(Serialize, Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct JsonLinesFormatter;

impl OutputGenerator for JsonLinesFormatter {
    fn save(&self, writer: &mut impl Write, df: &mut DataFrame) -> Result<()> {
        for record in records(df)? {
            serde_json::to_writer(&mut *writer, &record)?;
            writeln!(writer)?;
        }
        Ok(())
    }
}
