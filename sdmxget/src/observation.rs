//! The canonical observation record and its long-table representation.

use polars::prelude::*;
use serde::{Deserialize, Serialize};
use strum_macros::{Display, EnumIter, EnumString};

use crate::COL;

/// Disaggregation dimensions an indicator can be broken down by.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(ascii_case_insensitive)]
pub enum Dimension {
    #[strum(to_string = "sex")]
    Sex,
    #[strum(to_string = "age")]
    Age,
    #[strum(to_string = "wealth", serialize = "wealth_quintile")]
    Wealth,
    #[strum(to_string = "residence")]
    Residence,
    #[strum(
        to_string = "maternal_edu",
        serialize = "maternal_education",
        serialize = "maternal_edu_lvl"
    )]
    MaternalEdu,
}

impl Dimension {
    /// Canonical column holding this dimension
    pub fn column(&self) -> &'static str {
        match self {
            Dimension::Sex => COL::SEX,
            Dimension::Age => COL::AGE,
            Dimension::Wealth => COL::WEALTH,
            Dimension::Residence => COL::RESIDENCE,
            Dimension::MaternalEdu => COL::MATERNAL_EDU,
        }
    }

    /// Column holding this dimension in an SDMX-CSV response
    pub fn sdmx_column(&self) -> &'static str {
        match self {
            Dimension::Sex => COL::SDMX_SEX,
            Dimension::Age => COL::SDMX_AGE,
            Dimension::Wealth => COL::SDMX_WEALTH_QUINTILE,
            Dimension::Residence => COL::SDMX_RESIDENCE,
            Dimension::MaternalEdu => COL::SDMX_MATERNAL_EDU_LVL,
        }
    }
}

/// Whether a geography code denotes a single country or an aggregate region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum GeoKind {
    Country,
    Aggregate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub indicator: String,
    pub indicator_name: Option<String>,
    pub geo_code: String,
    pub geo_name: Option<String>,
    pub geo_kind: GeoKind,
    /// Numeric year; sub-year periods carry a fractional part
    pub period: Option<f64>,
    pub value: Option<f64>,
    pub sex: Option<String>,
    pub age: Option<String>,
    pub wealth: Option<String>,
    pub residence: Option<String>,
    pub maternal_edu: Option<String>,
    pub lower_bound: Option<f64>,
    pub upper_bound: Option<f64>,
    pub unit: Option<String>,
    pub status: Option<String>,
    pub source_dataset: String,
}

/// Grouping used by the per-series transforms: indicator, geography and every disaggregation.
pub type SeriesKey<'a> = (&'a str, &'a str, [Option<&'a str>; 5]);

/// Hashable image of every field of an `Observation`, floats compared bitwise.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct RowKey<'a> {
    strings: [Option<&'a str>; 12],
    numbers: [Option<u64>; 4],
    geo_kind: GeoKind,
}

impl Observation {
    pub fn dimension(&self, dimension: Dimension) -> Option<&str> {
        match dimension {
            Dimension::Sex => self.sex.as_deref(),
            Dimension::Age => self.age.as_deref(),
            Dimension::Wealth => self.wealth.as_deref(),
            Dimension::Residence => self.residence.as_deref(),
            Dimension::MaternalEdu => self.maternal_edu.as_deref(),
        }
    }

    pub fn series_key(&self) -> SeriesKey<'_> {
        (
            &self.indicator,
            &self.geo_code,
            [
                self.sex.as_deref(),
                self.age.as_deref(),
                self.wealth.as_deref(),
                self.residence.as_deref(),
                self.maternal_edu.as_deref(),
            ],
        )
    }

    pub fn row_key(&self) -> RowKey<'_> {
        RowKey {
            strings: [
                Some(self.indicator.as_str()),
                self.indicator_name.as_deref(),
                Some(self.geo_code.as_str()),
                self.geo_name.as_deref(),
                self.sex.as_deref(),
                self.age.as_deref(),
                self.wealth.as_deref(),
                self.residence.as_deref(),
                self.maternal_edu.as_deref(),
                self.unit.as_deref(),
                self.status.as_deref(),
                Some(self.source_dataset.as_str()),
            ],
            numbers: [
                self.period.map(f64::to_bits),
                self.value.map(f64::to_bits),
                self.lower_bound.map(f64::to_bits),
                self.upper_bound.map(f64::to_bits),
            ],
            geo_kind: self.geo_kind,
        }
    }

    /// Calendar year the period falls in
    pub fn year(&self) -> Option<i32> {
        self.period.map(|p| p.floor() as i32)
    }
}

fn str_series<'a>(
    name: &str,
    observations: &'a [Observation],
    f: impl Fn(&'a Observation) -> Option<&'a str>,
) -> Series {
    Series::new(name, observations.iter().map(f).collect::<Vec<_>>())
}

fn f64_series(
    name: &str,
    observations: &[Observation],
    f: impl Fn(&Observation) -> Option<f64>,
) -> Series {
    Series::new(name, observations.iter().map(f).collect::<Vec<_>>())
}

/// Build the long table: one row per observation, columns in `COL::OBSERVATION_COLUMNS` order.
pub fn observations_to_df(observations: &[Observation]) -> PolarsResult<DataFrame> {
    let geo_kinds: Vec<String> = observations
        .iter()
        .map(|o| o.geo_kind.to_string())
        .collect();
    DataFrame::new(vec![
        str_series(COL::INDICATOR, observations, |o| Some(o.indicator.as_str())),
        str_series(COL::INDICATOR_NAME, observations, |o| {
            o.indicator_name.as_deref()
        }),
        str_series(COL::GEO_CODE, observations, |o| Some(o.geo_code.as_str())),
        str_series(COL::GEO_NAME, observations, |o| o.geo_name.as_deref()),
        Series::new(COL::GEO_KIND, geo_kinds),
        f64_series(COL::PERIOD, observations, |o| o.period),
        f64_series(COL::VALUE, observations, |o| o.value),
        str_series(COL::SEX, observations, |o| o.sex.as_deref()),
        str_series(COL::AGE, observations, |o| o.age.as_deref()),
        str_series(COL::WEALTH, observations, |o| o.wealth.as_deref()),
        str_series(COL::RESIDENCE, observations, |o| o.residence.as_deref()),
        str_series(COL::MATERNAL_EDU, observations, |o| o.maternal_edu.as_deref()),
        f64_series(COL::LOWER_BOUND, observations, |o| o.lower_bound),
        f64_series(COL::UPPER_BOUND, observations, |o| o.upper_bound),
        str_series(COL::UNIT, observations, |o| o.unit.as_deref()),
        str_series(COL::STATUS, observations, |o| o.status.as_deref()),
        str_series(COL::SOURCE_DATASET, observations, |o| {
            Some(o.source_dataset.as_str())
        }),
    ])
}
