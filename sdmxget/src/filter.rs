//! Types and functions to narrow observations by disaggregation dimension

use std::collections::{BTreeMap, BTreeSet};

use log::{debug, warn};
use polars::lazy::dsl::{col, lit, Expr};
use polars::prelude::{DataFrame, IntoLazy, NamedFrom, Series};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;

use crate::{
    error::{SdmxResult, Warning},
    metadata::DimensionInfo,
    observation::{Dimension, Observation},
};

/// Reserved aggregate value used when a dataset does not declare its own
pub const DEFAULT_TOTAL: &str = "_T";
/// Requested value standing for the dataset's aggregate value
pub const TOTAL_KEYWORD: &str = "total";
/// Requested value disabling the filter on a dimension
pub const ALL_KEYWORD: &str = "all";

/// Combine multiple queries with AND. If there are no queries in the input list, returns None.
fn combine_exprs_with_and(exprs: Vec<Expr>) -> Option<Expr> {
    let mut query: Option<Expr> = None;
    for expr in exprs {
        query = if let Some(partial_query) = query {
            Some(partial_query.and(expr))
        } else {
            Some(expr)
        };
    }
    query
}

/// Requested values per dimension. An empty value list means "no value given".
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DimensionFilterSpec(BTreeMap<Dimension, Vec<String>>);

impl DimensionFilterSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, dimension: Dimension, values: &[&str]) -> Self {
        self.0
            .entry(dimension)
            .or_default()
            .extend(values.iter().map(|v| v.to_string()));
        self
    }

    pub fn insert(&mut self, dimension: Dimension, values: Vec<String>) {
        self.0.entry(dimension).or_default().extend(values);
    }

    pub fn get(&self, dimension: Dimension) -> Option<&[String]> {
        self.0.get(&dimension).map(Vec::as_slice)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (Dimension, &[String])> {
        self.0.iter().map(|(d, v)| (*d, v.as_slice()))
    }
}

/// The dimensions one dataset can be disaggregated by.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SupportedDimensions(BTreeMap<Dimension, DimensionInfo>);

impl SupportedDimensions {
    pub fn new(dimensions: impl IntoIterator<Item = DimensionInfo>) -> Self {
        Self(
            dimensions
                .into_iter()
                .map(|info| (info.dimension, info))
                .collect(),
        )
    }

    fn unknown_values(dimensions: impl Iterator<Item = Dimension>) -> Self {
        Self::new(dimensions.map(|dimension| DimensionInfo {
            dimension,
            values: vec![],
            total: DEFAULT_TOTAL.into(),
        }))
    }

    /// Dimensions whose SDMX column is present in a raw frame.
    pub fn from_frame(raw: &DataFrame) -> Self {
        let columns = raw.get_column_names();
        Self::unknown_values(Dimension::iter().filter(|d| columns.contains(&d.sdmx_column())))
    }

    /// Declared dimensions whose column the response in `present` also carries.
    pub fn intersect(self, present: &SupportedDimensions, dataset: &str) -> Self {
        Self(
            self.0
                .into_iter()
                .filter(|(dimension, _)| {
                    let found = present.contains(*dimension);
                    if !found {
                        debug!("`{dataset}` declares `{dimension}` but returned no such column");
                    }
                    found
                })
                .collect(),
        )
    }

    pub fn contains(&self, dimension: Dimension) -> bool {
        self.0.contains_key(&dimension)
    }

    pub fn get(&self, dimension: Dimension) -> Option<&DimensionInfo> {
        self.0.get(&dimension)
    }

    pub fn dimensions(&self) -> impl Iterator<Item = Dimension> + '_ {
        self.0.keys().copied()
    }
}

/// A filter that will actually be applied: rows pass when the dimension's value is in `values`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ActiveFilter {
    pub dimension: Dimension,
    pub values: BTreeSet<String>,
}

impl ActiveFilter {
    fn matches(&self, observation: &Observation) -> bool {
        observation
            .dimension(self.dimension)
            .is_some_and(|value| self.values.contains(value))
    }

    fn expr(&self, column: &str) -> Expr {
        let values = Series::new("values", self.values.iter().cloned().collect::<Vec<_>>());
        col(column).is_in(lit(values))
    }
}

/// Decide which filters apply to `dataset`.
///
/// Filters on dimensions the dataset lacks are dropped with a warning. A supported dimension
/// with no requested value filters to the dataset's total for sex and is left open otherwise.
/// Sex is total-filtered even when not named at all. The `total` and `all` keywords stand for
/// the dataset's total value and for no filter.
pub fn plan(
    spec: &DimensionFilterSpec,
    supported: &SupportedDimensions,
    dataset: &str,
) -> (Vec<ActiveFilter>, Vec<Warning>) {
    let mut filters = vec![];
    let mut warnings = vec![];
    for dimension in Dimension::iter() {
        let requested = spec.get(dimension);
        let Some(info) = supported.get(dimension) else {
            if requested.is_some() {
                warn!("`{dataset}` has no `{dimension}` dimension; ignoring filter");
                warnings.push(Warning::UnsupportedFilter {
                    dimension,
                    dataset: dataset.to_string(),
                });
            }
            continue;
        };
        let requested = requested.unwrap_or_default();
        if requested.iter().any(|v| v.eq_ignore_ascii_case(ALL_KEYWORD)) {
            continue;
        }
        if requested.is_empty() {
            if dimension == Dimension::Sex {
                filters.push(ActiveFilter {
                    dimension,
                    values: BTreeSet::from([info.total.clone()]),
                });
            }
            continue;
        }
        let mut values = BTreeSet::new();
        for value in requested {
            let value = if value.eq_ignore_ascii_case(TOTAL_KEYWORD) {
                info.total.clone()
            } else {
                value.clone()
            };
            if !info.values.is_empty() && !info.values.contains(&value) {
                warn!("`{value}` is not a known `{dimension}` value in `{dataset}`");
                warnings.push(Warning::UnknownFilterValue {
                    dimension,
                    dataset: dataset.to_string(),
                    value: value.clone(),
                });
            }
            values.insert(value);
        }
        filters.push(ActiveFilter { dimension, values });
    }
    debug!("Filters for `{dataset}`: {filters:?}");
    (filters, warnings)
}

/// Keep observations passing every filter: values of one dimension OR together, dimensions
/// AND together.
pub fn filter_observations(
    observations: Vec<Observation>,
    filters: &[ActiveFilter],
) -> Vec<Observation> {
    observations
        .into_iter()
        .filter(|o| filters.iter().all(|f| f.matches(o)))
        .collect()
}

/// Apply filters to a raw frame, whose dimensions still carry their SDMX column names.
pub fn filter_frame(raw: DataFrame, filters: &[ActiveFilter]) -> SdmxResult<DataFrame> {
    let exprs = filters
        .iter()
        .map(|f| f.expr(f.dimension.sdmx_column()))
        .collect();
    match combine_exprs_with_and(exprs) {
        Some(expr) => Ok(raw.lazy().filter(expr).collect()?),
        None => Ok(raw),
    }
}
