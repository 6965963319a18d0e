//! Reshaping of the long observation table into its wide variants.

use std::collections::HashMap;
use std::fmt::Display;
use std::str::FromStr;

use log::{debug, warn};
use polars::prelude::*;
use serde::{Deserialize, Serialize};

use crate::{
    error::{SdmxError, SdmxResult, Warning},
    observation::Dimension,
    COL,
};

/// Shape of the returned table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OutputMode {
    /// One row per observation
    #[default]
    Long,
    /// One column per period
    WideByPeriod,
    /// One column per indicator
    WideByIndicator,
    /// One column per value of a disaggregation dimension
    WideByDimension(Dimension),
}

impl OutputMode {
    /// Column whose values become the new column headers, `None` for the long form.
    pub fn pivot_column(&self) -> Option<&'static str> {
        match self {
            OutputMode::Long => None,
            OutputMode::WideByPeriod => Some(COL::PERIOD),
            OutputMode::WideByIndicator => Some(COL::INDICATOR),
            OutputMode::WideByDimension(dimension) => Some(dimension.column()),
        }
    }

    /// Columns left out of the identifying key: the pivoted measure and fields describing the
    /// pivot column rather than the row.
    fn excluded_columns(&self) -> Vec<&'static str> {
        let mut excluded = vec![
            COL::VALUE,
            COL::LOWER_BOUND,
            COL::UPPER_BOUND,
            COL::STATUS,
        ];
        if *self == OutputMode::WideByIndicator {
            excluded.extend([COL::INDICATOR_NAME, COL::UNIT, COL::SOURCE_DATASET]);
        }
        excluded.extend(self.pivot_column());
        excluded
    }
}

impl Display for OutputMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputMode::Long => write!(f, "long"),
            OutputMode::WideByPeriod => write!(f, "wide-by-period"),
            OutputMode::WideByIndicator => write!(f, "wide-by-indicator"),
            OutputMode::WideByDimension(dimension) => write!(f, "wide-by-{dimension}"),
        }
    }
}

impl FromStr for OutputMode {
    type Err = SdmxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalised = s.trim().to_ascii_lowercase().replace('_', "-");
        match normalised.as_str() {
            "long" => Ok(OutputMode::Long),
            "wide" | "wide-by-period" | "wide-by-year" => Ok(OutputMode::WideByPeriod),
            "wide-by-indicator" => Ok(OutputMode::WideByIndicator),
            other => other
                .strip_prefix("wide-by-")
                .and_then(|dimension| {
                    Dimension::from_str(dimension)
                        .or_else(|_| Dimension::from_str(&dimension.replace('-', "_")))
                        .ok()
                })
                .map(OutputMode::WideByDimension)
                .ok_or_else(|| SdmxError::InvalidRequest(format!("unknown output mode `{s}`"))),
        }
    }
}

/// Column header for a period: whole years print without a fractional part.
fn period_header(period: f64) -> String {
    if period.fract() == 0.0 {
        format!("{}", period as i64)
    } else {
        period.to_string()
    }
}

fn as_strings(series: &Series) -> SdmxResult<Vec<Option<String>>> {
    if series.dtype() == &DataType::Float64 {
        return Ok(series
            .f64()?
            .into_iter()
            .map(|v| v.map(period_header))
            .collect());
    }
    Ok(series
        .cast(&DataType::String)?
        .str()?
        .into_iter()
        .map(|v| v.map(str::to_string))
        .collect())
}

/// Pivot `df` so each distinct value of `pivot_column` becomes a column of `value`s, keyed by
/// every column not in `excluded`. Two rows landing in the same cell are an error.
fn pivot(df: &DataFrame, pivot_column: &str, excluded: &[&str]) -> SdmxResult<DataFrame> {
    let id_columns: Vec<&str> = df
        .get_column_names()
        .into_iter()
        .filter(|name| !excluded.contains(name))
        .collect();
    let headers = as_strings(df.column(pivot_column)?)?;
    let values: Vec<Option<f64>> = df
        .column(COL::VALUE)?
        .cast(&DataType::Float64)?
        .f64()?
        .into_iter()
        .collect();
    let keys = id_columns
        .iter()
        .map(|name| as_strings(df.column(name)?))
        .collect::<SdmxResult<Vec<_>>>()?;

    let mut groups: HashMap<Vec<Option<&str>>, usize> = HashMap::new();
    let mut first_rows: Vec<IdxSize> = vec![];
    let mut header_names: Vec<String> = vec![];
    let mut cells: HashMap<(usize, String), Option<f64>> = HashMap::new();
    let mut collisions = 0;
    for row in 0..df.height() {
        let key = keys.iter().map(|column| column[row].as_deref()).collect();
        let group = *groups.entry(key).or_insert_with(|| {
            first_rows.push(row as IdxSize);
            first_rows.len() - 1
        });
        let header = headers[row].clone().unwrap_or_else(|| "null".into());
        if !header_names.contains(&header) {
            header_names.push(header.clone());
        }
        if cells.insert((group, header), values[row]).is_some() {
            collisions += 1;
        }
    }
    if collisions > 0 {
        return Err(SdmxError::AmbiguousPivot {
            column: pivot_column.to_string(),
            count: collisions,
        });
    }
    if df.column(pivot_column)?.dtype() == &DataType::Float64 {
        header_names.sort_by(|a, b| {
            let (a, b) = (a.parse::<f64>().ok(), b.parse::<f64>().ok());
            a.is_none()
                .cmp(&b.is_none())
                .then(a.partial_cmp(&b).unwrap_or(std::cmp::Ordering::Equal))
        });
    } else {
        header_names.sort();
    }

    let mut wide = df
        .select(id_columns)?
        .take(&IdxCa::from_vec("rows", first_rows))?;
    for header in header_names {
        let column: Vec<Option<f64>> = (0..groups.len())
            .map(|group| cells.get(&(group, header.clone())).copied().flatten())
            .collect();
        wide.with_column(Series::new(&header, column))?;
    }
    debug!("Pivoted {} rows into {:?}", df.height(), wide.shape());
    Ok(wide)
}

/// Reshape a long table into `mode`.
pub fn format(df: DataFrame, mode: OutputMode) -> SdmxResult<(DataFrame, Vec<Warning>)> {
    let Some(pivot_column) = mode.pivot_column() else {
        return Ok((df, vec![]));
    };
    let mut warnings = vec![];
    if mode == OutputMode::WideByIndicator && df.column(COL::INDICATOR)?.n_unique()? <= 1 {
        warn!("Wide-by-indicator output for a single indicator");
        warnings.push(Warning::SingleIndicatorWide);
    }
    let wide = pivot(&df, pivot_column, &mode.excluded_columns())?;
    Ok((wide, warnings))
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::observation::{observations_to_df, tests::obs, Observation};

    fn long() -> Vec<Observation> {
        let mut observations = vec![];
        for (geo, offset) in [("ALB", 0.0), ("USA", 10.0)] {
            for year in [2015.0, 2016.0, 2016.5] {
                let mut o = obs(geo, year, Some(year - 2000.0 + offset));
                o.lower_bound = Some(0.0);
                observations.push(o);
            }
        }
        observations
    }

    #[test]
    fn output_mode_should_parse() {
        assert_eq!("LONG".parse::<OutputMode>().unwrap(), OutputMode::Long);
        assert_eq!("wide".parse::<OutputMode>().unwrap(), OutputMode::WideByPeriod);
        assert_eq!(
            "wide_by_indicator".parse::<OutputMode>().unwrap(),
            OutputMode::WideByIndicator
        );
        assert_eq!(
            "wide-by-maternal-edu".parse::<OutputMode>().unwrap(),
            OutputMode::WideByDimension(Dimension::MaternalEdu)
        );
        assert_eq!(
            OutputMode::WideByDimension(Dimension::Wealth).to_string(),
            "wide-by-wealth"
        );
        assert!("wide-by-colour".parse::<OutputMode>().is_err());
        let mode: OutputMode = serde_json::from_str(r#"{"wideByDimension": "sex"}"#).unwrap();
        assert_eq!(mode, OutputMode::WideByDimension(Dimension::Sex));
    }

    #[test]
    fn long_should_be_identity() {
        let df = observations_to_df(&long()).unwrap();
        let (formatted, warnings) = format(df.clone(), OutputMode::Long).unwrap();
        assert!(formatted.equals_missing(&df));
        assert!(warnings.is_empty());
    }

    #[test]
    fn wide_by_period_should_round_trip() {
        let observations = long();
        let df = observations_to_df(&observations).unwrap();
        let (wide, _) = format(df, OutputMode::WideByPeriod).unwrap();
        assert_eq!(wide.height(), 2);
        let period_columns = ["2015", "2016", "2016.5"];
        assert!(period_columns.iter().all(|c| wide.column(c).is_ok()));
        assert!(wide.column(COL::LOWER_BOUND).is_err());

        // Un-pivot and compare value sets
        let geo_codes = wide.column(COL::GEO_CODE).unwrap().str().unwrap().clone();
        let mut recovered = BTreeSet::new();
        for period in period_columns {
            let values = wide.column(period).unwrap().f64().unwrap().clone();
            for (geo, value) in (&geo_codes).into_iter().zip(&values) {
                recovered.insert((
                    geo.unwrap().to_string(),
                    period.to_string(),
                    value.unwrap().to_string(),
                ));
            }
        }
        let original: BTreeSet<_> = observations
            .iter()
            .map(|o| {
                (
                    o.geo_code.clone(),
                    period_header(o.period.unwrap()),
                    o.value.unwrap().to_string(),
                )
            })
            .collect();
        assert_eq!(recovered, original);
    }

    #[test]
    fn colliding_rows_should_not_pivot() {
        let mut observations = long();
        let mut duplicate = observations[0].clone();
        duplicate.value = Some(99.0);
        observations.push(duplicate);
        let df = observations_to_df(&observations).unwrap();
        let result = format(df, OutputMode::WideByPeriod);
        assert!(matches!(
            result,
            Err(SdmxError::AmbiguousPivot { count: 1, .. })
        ));
    }

    #[test]
    fn wide_by_indicator_should_warn_for_single_indicator() {
        let df = observations_to_df(&long()).unwrap();
        let (wide, warnings) = format(df, OutputMode::WideByIndicator).unwrap();
        assert_eq!(warnings, vec![Warning::SingleIndicatorWide]);
        assert_eq!(wide.height(), 6);
        assert!(wide.column("CME_MRY0T4").is_ok());
    }

    #[test]
    fn wide_by_indicator_should_align_indicators() {
        let mut observations = long();
        for o in observations.clone() {
            let mut other = o;
            other.indicator = "CME_MRM0".into();
            other.source_dataset = "GLOBAL_DATAFLOW".into();
            observations.push(other);
        }
        let df = observations_to_df(&observations).unwrap();
        let (wide, warnings) = format(df, OutputMode::WideByIndicator).unwrap();
        assert!(warnings.is_empty());
        assert_eq!(wide.height(), 6);
        assert_eq!(wide.column("CME_MRM0").unwrap().null_count(), 0);
    }

    #[test]
    fn wide_by_dimension_should_pivot_on_dimension() {
        let mut observations = vec![];
        for sex in ["F", "M", "_T"] {
            let mut o = obs("ALB", 2015.0, Some(1.0));
            o.sex = Some(sex.into());
            observations.push(o);
        }
        observations.pop();
        let df = observations_to_df(&observations).unwrap();
        let (wide, _) = format(df, OutputMode::WideByDimension(Dimension::Sex)).unwrap();
        assert_eq!(wide.height(), 1);
        assert!(wide.column("F").is_ok());
        assert!(wide.column("M").is_ok());
        assert!(wide.column(COL::SEX).is_err());
    }
}
