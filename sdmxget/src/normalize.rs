//! Conversion of raw SDMX-CSV frames into canonical `Observation`s.

use std::sync::OnceLock;

use log::debug;
use polars::prelude::*;
use regex::Regex;
use strum::IntoEnumIterator;

use crate::{
    error::{SdmxError, SdmxResult},
    metadata::ReferenceData,
    observation::{Dimension, Observation},
    COL,
};

fn period_regex() -> &'static Regex {
    static PERIOD: OnceLock<Regex> = OnceLock::new();
    // Unwrap: the pattern is a literal
    PERIOD.get_or_init(|| Regex::new(r"^(\d{4})(?:-(\d{1,2}))?(?:-\d{1,2})?$").unwrap())
}

/// Numeric year for an SDMX time period. `YYYY` maps to the year itself, `YYYY-MM` (and
/// `YYYY-MM-DD`) to `year + month/12`. Anything else is unparseable.
pub fn parse_period(period: &str) -> Option<f64> {
    let captures = period_regex().captures(period.trim())?;
    let year: f64 = captures.get(1)?.as_str().parse().ok()?;
    match captures.get(2) {
        Some(month) => {
            let month: u32 = month.as_str().parse().ok()?;
            (1..=12)
                .contains(&month)
                .then(|| year + f64::from(month) / 12.0)
        }
        None => Some(year),
    }
}

/// Numeric observation value. Missing-data markers and other non-numeric text become null.
pub fn parse_value(value: &str) -> Option<f64> {
    value
        .trim()
        .parse::<f64>()
        .ok()
        .filter(|value| value.is_finite())
}

/// Column `name` as owned strings, `None` when the frame has no such column. Blank cells are
/// null.
fn strings(raw: &DataFrame, name: &str) -> SdmxResult<Option<Vec<Option<String>>>> {
    let Ok(column) = raw.column(name) else {
        return Ok(None);
    };
    let column = column.cast(&DataType::String)?;
    Ok(Some(
        column
            .str()?
            .into_iter()
            .map(|cell| {
                cell.map(str::trim)
                    .filter(|cell| !cell.is_empty())
                    .map(str::to_string)
            })
            .collect(),
    ))
}

fn required(raw: &DataFrame, name: &str) -> SdmxResult<Vec<Option<String>>> {
    strings(raw, name)?.ok_or_else(|| SdmxError::MissingColumn(name.to_string()))
}

fn cell(column: &Option<Vec<Option<String>>>, idx: usize) -> Option<String> {
    column.as_ref().and_then(|values| values[idx].clone())
}

/// Normalise one dataset's raw rows.
///
/// The indicator column may be absent when a single indicator was requested, in which case
/// every row belongs to it. Geography names and kinds come from `reference`; codes it does not
/// know keep a null name and count as countries.
pub fn normalize(
    raw: &DataFrame,
    requested_indicators: &[String],
    dataset: &str,
    reference: &ReferenceData,
) -> SdmxResult<Vec<Observation>> {
    if raw.height() == 0 {
        return Ok(vec![]);
    }
    let geo_codes = required(raw, COL::SDMX_REF_AREA)?;
    let periods = required(raw, COL::SDMX_TIME_PERIOD)?;
    let values = required(raw, COL::SDMX_OBS_VALUE)?;
    let indicators = match (strings(raw, COL::SDMX_INDICATOR)?, requested_indicators) {
        (Some(indicators), _) => indicators,
        (None, [single]) => vec![Some(single.clone()); raw.height()],
        (None, _) => return Err(SdmxError::MissingColumn(COL::SDMX_INDICATOR.into())),
    };
    let labels = strings(raw, COL::SDMX_INDICATOR_LABEL)?;
    let dimensions = Dimension::iter()
        .map(|dimension| strings(raw, dimension.sdmx_column()))
        .collect::<SdmxResult<Vec<_>>>()?;
    let lower_bounds = strings(raw, COL::SDMX_LOWER_BOUND)?;
    let upper_bounds = strings(raw, COL::SDMX_UPPER_BOUND)?;
    let units = strings(raw, COL::SDMX_UNIT_MEASURE)?;
    let statuses = strings(raw, COL::SDMX_OBS_STATUS)?;

    let number = |column: &Option<Vec<Option<String>>>, idx: usize| {
        cell(column, idx).as_deref().and_then(parse_value)
    };

    let mut observations = Vec::with_capacity(raw.height());
    for idx in 0..raw.height() {
        let (Some(indicator), Some(geo_code)) = (indicators[idx].clone(), geo_codes[idx].clone())
        else {
            debug!("Skipping row {idx} of `{dataset}` with no indicator or geography");
            continue;
        };
        let indicator_name = reference
            .indicator_name(&indicator)
            .map(str::to_string)
            .or_else(|| cell(&labels, idx));
        observations.push(Observation {
            indicator_name,
            geo_name: reference.geo_name(&geo_code).map(str::to_string),
            geo_kind: reference.geo_kind(&geo_code),
            period: periods[idx].as_deref().and_then(parse_period),
            value: values[idx].as_deref().and_then(parse_value),
            sex: cell(&dimensions[0], idx),
            age: cell(&dimensions[1], idx),
            wealth: cell(&dimensions[2], idx),
            residence: cell(&dimensions[3], idx),
            maternal_edu: cell(&dimensions[4], idx),
            lower_bound: number(&lower_bounds, idx),
            upper_bound: number(&upper_bounds, idx),
            unit: cell(&units, idx),
            status: cell(&statuses, idx),
            source_dataset: dataset.to_string(),
            indicator,
            geo_code,
        });
    }
    debug!(
        "Normalised {} of {} rows from `{dataset}`",
        observations.len(),
        raw.height()
    );
    Ok(observations)
}

/// Raw mode: rename the identifying columns and pass everything else through untouched.
pub fn normalize_raw(mut raw: DataFrame) -> SdmxResult<DataFrame> {
    let present = raw
        .get_column_names()
        .into_iter()
        .map(str::to_string)
        .collect::<Vec<_>>();
    for (from, to) in COL::RAW_RENAMES {
        if present.iter().any(|name| name == from) {
            raw.rename(from, to)?;
        }
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{metadata::tests::test_reference, observation::GeoKind};

    fn raw() -> DataFrame {
        df!(
            "DATAFLOW" => ["UNICEF:CME(1.0)"; 4],
            "REF_AREA" => ["ALB", "UNICEF_WORLD", "XKX", "USA"],
            "INDICATOR" => ["CME_MRY0T4"; 4],
            "SEX" => ["_T", "_T", "F", "_T"],
            "TIME_PERIOD" => ["2015", "2016-06", "2017", "2018"],
            "OBS_VALUE" => ["10.1", "37.2", "", "<0.1"],
            "LOWER_BOUND" => [Some("9.0"), None, None, None],
            "OBS_FOOTNOTE" => ["a", "b", "c", "d"]
        )
        .unwrap()
    }

    #[test]
    fn periods_should_be_fractional_years() {
        assert_eq!(parse_period("2015"), Some(2015.0));
        assert_eq!(parse_period("2016-06"), Some(2016.5));
        assert_eq!(parse_period("2016-12-31"), Some(2017.0));
        assert_eq!(parse_period("2016-13"), None);
        assert_eq!(parse_period("2015-2016"), None);
        assert_eq!(parse_period("unknown"), None);
    }

    #[test]
    fn non_numeric_values_should_be_null() {
        assert_eq!(parse_value(" 12.5 "), Some(12.5));
        assert_eq!(parse_value("<0.1"), None);
        assert_eq!(parse_value("NaN"), None);
        assert_eq!(parse_value(""), None);
    }

    #[test]
    fn test_normalize() {
        let reference = test_reference();
        let observations =
            normalize(&raw(), &["CME_MRY0T4".into()], "CME", &reference).unwrap();
        assert_eq!(observations.len(), 4, "Null values should not drop rows");

        let albania = &observations[0];
        assert_eq!(albania.geo_name.as_deref(), Some("Albania"));
        assert_eq!(albania.geo_kind, GeoKind::Country);
        assert_eq!(
            albania.indicator_name.as_deref(),
            Some("Under-five mortality rate")
        );
        assert_eq!(albania.lower_bound, Some(9.0));
        assert_eq!(albania.source_dataset, "CME");

        let world = &observations[1];
        assert_eq!(world.geo_kind, GeoKind::Aggregate);
        assert_eq!(world.geo_name.as_deref(), Some("World"));
        assert_eq!(world.period, Some(2016.5));

        let kosovo = &observations[2];
        assert_eq!(kosovo.geo_name, None, "Unknown codes keep a null name");
        assert_eq!(kosovo.value, None);
        assert_eq!(kosovo.sex.as_deref(), Some("F"));
        assert_eq!(kosovo.age, None);

        assert_eq!(observations[3].value, None);
    }

    #[test]
    fn empty_input_should_normalize_to_nothing() {
        let reference = test_reference();
        let observations =
            normalize(&DataFrame::empty(), &["CME_MRY0T4".into()], "CME", &reference).unwrap();
        assert!(observations.is_empty());
    }

    #[test]
    fn missing_indicator_column_should_use_requested_indicator() {
        let reference = test_reference();
        let raw = df!(
            "REF_AREA" => ["BRA"],
            "TIME_PERIOD" => ["2020"],
            "OBS_VALUE" => ["14.4"]
        )
        .unwrap();
        let observations = normalize(&raw, &["CME_MRY0T4".into()], "CME", &reference).unwrap();
        assert_eq!(observations[0].indicator, "CME_MRY0T4");
        assert_eq!(observations[0].value, Some(14.4));

        let result = normalize(
            &raw,
            &["CME_MRY0T4".into(), "CME_MRM0".into()],
            "CME",
            &reference,
        );
        assert!(matches!(result, Err(SdmxError::MissingColumn(_))));
    }

    #[test]
    fn missing_value_column_should_fail() {
        let reference = test_reference();
        let raw = df!("REF_AREA" => ["BRA"], "TIME_PERIOD" => ["2020"]).unwrap();
        let result = normalize(&raw, &["CME_MRY0T4".into()], "CME", &reference);
        assert!(matches!(result, Err(SdmxError::MissingColumn(col)) if col == "OBS_VALUE"));
    }

    #[test]
    fn raw_mode_should_only_rename_identifying_columns() {
        let df = normalize_raw(raw()).unwrap();
        assert_eq!(
            df.get_column_names(),
            vec![
                "DATAFLOW",
                COL::GEO_CODE,
                COL::INDICATOR,
                "SEX",
                COL::PERIOD,
                COL::VALUE,
                "LOWER_BOUND",
                "OBS_FOOTNOTE"
            ]
        );
        assert_eq!(
            df.column(COL::PERIOD).unwrap().str().unwrap().get(1),
            Some("2016-06")
        );
    }
}
