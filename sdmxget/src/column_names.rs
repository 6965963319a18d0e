//! This module stores the column names used on both sides of normalisation: the canonical
//! observation columns produced by this crate, and the SDMX-CSV columns returned by the
//! warehouse. Note that the SDMX names must be kept in sync with the data structure definitions
//! of the upstream dataflows!

// Canonical observation columns
pub const INDICATOR: &str = "indicator";
pub const INDICATOR_NAME: &str = "indicator_name";
pub const GEO_CODE: &str = "geo_code";
pub const GEO_NAME: &str = "geo_name";
pub const GEO_KIND: &str = "geo_kind";
pub const PERIOD: &str = "period";
pub const VALUE: &str = "value";
pub const SEX: &str = "sex";
pub const AGE: &str = "age";
pub const WEALTH: &str = "wealth";
pub const RESIDENCE: &str = "residence";
pub const MATERNAL_EDU: &str = "maternal_edu";
pub const LOWER_BOUND: &str = "lower_bound";
pub const UPPER_BOUND: &str = "upper_bound";
pub const UNIT: &str = "unit";
pub const STATUS: &str = "status";
pub const SOURCE_DATASET: &str = "source_dataset";

/// All canonical observation columns in output order.
pub const OBSERVATION_COLUMNS: [&str; 17] = [
    INDICATOR,
    INDICATOR_NAME,
    GEO_CODE,
    GEO_NAME,
    GEO_KIND,
    PERIOD,
    VALUE,
    SEX,
    AGE,
    WEALTH,
    RESIDENCE,
    MATERNAL_EDU,
    LOWER_BOUND,
    UPPER_BOUND,
    UNIT,
    STATUS,
    SOURCE_DATASET,
];

// Enrichment columns joined from the country reference data
pub const REGION: &str = "region";
pub const INCOME_GROUP: &str = "income_group";
pub const CONTINENT: &str = "continent";

// SDMX-CSV columns (`labels=id`)
pub const SDMX_DATAFLOW: &str = "DATAFLOW";
pub const SDMX_REF_AREA: &str = "REF_AREA";
pub const SDMX_INDICATOR: &str = "INDICATOR";
pub const SDMX_INDICATOR_LABEL: &str = "Indicator";
pub const SDMX_TIME_PERIOD: &str = "TIME_PERIOD";
pub const SDMX_OBS_VALUE: &str = "OBS_VALUE";
pub const SDMX_SEX: &str = "SEX";
pub const SDMX_AGE: &str = "AGE";
pub const SDMX_WEALTH_QUINTILE: &str = "WEALTH_QUINTILE";
pub const SDMX_RESIDENCE: &str = "RESIDENCE";
pub const SDMX_MATERNAL_EDU_LVL: &str = "MATERNAL_EDU_LVL";
pub const SDMX_LOWER_BOUND: &str = "LOWER_BOUND";
pub const SDMX_UPPER_BOUND: &str = "UPPER_BOUND";
pub const SDMX_UNIT_MEASURE: &str = "UNIT_MEASURE";
pub const SDMX_OBS_STATUS: &str = "OBS_STATUS";

/// Renames applied to the core identifying columns in raw mode.
pub const RAW_RENAMES: [(&str, &str); 4] = [
    (SDMX_REF_AREA, GEO_CODE),
    (SDMX_INDICATOR, INDICATOR),
    (SDMX_TIME_PERIOD, PERIOD),
    (SDMX_OBS_VALUE, VALUE),
];
