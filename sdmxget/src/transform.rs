use std::collections::{HashMap, HashSet};

use enum_dispatch::enum_dispatch;
use itertools::Itertools;
use log::debug;
use polars::lazy::dsl::col;
use polars::prelude::{DataFrame, IntoLazy, JoinArgs, JoinType};
use serde::{Deserialize, Serialize};

use crate::{
    error::{SdmxError, SdmxResult},
    metadata::ReferenceData,
    observation::{Observation, SeriesKey},
    COL,
};

#[enum_dispatch]
pub trait Transform {
    fn transform(&self, observations: Vec<Observation>) -> SdmxResult<Vec<Observation>>;
}

/// Observation-level post-processing steps. Applied in the order listed when requested.
#[enum_dispatch(Transform)]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PostProcess {
    DropNa(DropNa),
    DuplicateCheck(DuplicateCheck),
    Latest(Latest),
    MostRecentValues(MostRecentValues),
    Circa(Circa),
}

/// Remove rows with a null value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DropNa;

/// Detect rows identical in every field. Fails unless `deduplicate`, in which case the first
/// copy of each row is kept.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DuplicateCheck {
    pub deduplicate: bool,
}

/// Per series, keep the row with the greatest period.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Latest;

/// Per series, keep the `n` rows with the greatest periods.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MostRecentValues {
    pub n: usize,
}

/// Per series and requested year, keep the rows for that year or else the row nearest to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Circa {
    pub years: Vec<i32>,
}

/// Row indices of each series, in first-seen order.
fn series_indices(observations: &[Observation]) -> Vec<Vec<usize>> {
    let mut groups: HashMap<SeriesKey, usize> = HashMap::new();
    let mut indices: Vec<Vec<usize>> = vec![];
    for (idx, observation) in observations.iter().enumerate() {
        let group = *groups.entry(observation.series_key()).or_insert_with(|| {
            indices.push(vec![]);
            indices.len() - 1
        });
        indices[group].push(idx);
    }
    indices
}

/// Keep the rows at `keep`, preserving their original order.
fn retain_indices(observations: Vec<Observation>, keep: HashSet<usize>) -> Vec<Observation> {
    observations
        .into_iter()
        .enumerate()
        .filter_map(|(idx, o)| keep.contains(&idx).then_some(o))
        .collect()
}

impl Transform for DropNa {
    fn transform(&self, mut observations: Vec<Observation>) -> SdmxResult<Vec<Observation>> {
        observations.retain(|o| o.value.is_some());
        Ok(observations)
    }
}

impl Transform for DuplicateCheck {
    fn transform(&self, observations: Vec<Observation>) -> SdmxResult<Vec<Observation>> {
        let mut seen = HashSet::new();
        let mut keep = HashSet::new();
        for (idx, observation) in observations.iter().enumerate() {
            if seen.insert(observation.row_key()) {
                keep.insert(idx);
            }
        }
        let count = observations.len() - keep.len();
        if count == 0 {
            return Ok(observations);
        }
        if !self.deduplicate {
            return Err(SdmxError::DuplicateRows { count });
        }
        debug!("Dropping {count} duplicate rows");
        Ok(retain_indices(observations, keep))
    }
}

impl Transform for Latest {
    fn transform(&self, observations: Vec<Observation>) -> SdmxResult<Vec<Observation>> {
        let keep = series_indices(&observations)
            .into_iter()
            .filter_map(|group| {
                // First occurrence wins a tie
                group
                    .into_iter()
                    .filter_map(|idx| observations[idx].period.map(|p| (idx, p)))
                    .fold(None, |best: Option<(usize, f64)>, (idx, p)| match best {
                        Some((_, best_p)) if best_p >= p => best,
                        _ => Some((idx, p)),
                    })
                    .map(|(idx, _)| idx)
            })
            .collect();
        Ok(retain_indices(observations, keep))
    }
}

impl Transform for MostRecentValues {
    fn transform(&self, observations: Vec<Observation>) -> SdmxResult<Vec<Observation>> {
        let keep = series_indices(&observations)
            .into_iter()
            .flat_map(|group| {
                group
                    .into_iter()
                    // Null periods rank last; the sort is stable so ties keep their order
                    .sorted_by(|a, b| {
                        let (a, b) = (observations[*a].period, observations[*b].period);
                        b.partial_cmp(&a).unwrap_or(std::cmp::Ordering::Equal)
                    })
                    .take(self.n)
            })
            .collect();
        Ok(retain_indices(observations, keep))
    }
}

impl Transform for Circa {
    fn transform(&self, observations: Vec<Observation>) -> SdmxResult<Vec<Observation>> {
        let mut keep = HashSet::new();
        for group in series_indices(&observations) {
            for year in &self.years {
                let exact = group
                    .iter()
                    .copied()
                    .filter(|idx| observations[*idx].year() == Some(*year))
                    .collect_vec();
                if !exact.is_empty() {
                    keep.extend(exact);
                    continue;
                }
                let target = f64::from(*year);
                let nearest = group
                    .iter()
                    .copied()
                    .filter_map(|idx| observations[idx].period.map(|p| (idx, p)))
                    .min_by(|(_, a), (_, b)| {
                        (a - target)
                            .abs()
                            .total_cmp(&(b - target).abs())
                            .then(a.total_cmp(b))
                    });
                if let Some((idx, period)) = nearest {
                    debug!("No {year} value for a series; using {period}");
                    keep.insert(idx);
                }
            }
        }
        Ok(retain_indices(observations, keep))
    }
}

/// Left-join country attributes onto a long table. Rows without a matching country keep null
/// attributes.
pub fn enrich(df: DataFrame, reference: &ReferenceData) -> SdmxResult<DataFrame> {
    let countries = reference.countries_df()?;
    Ok(df
        .lazy()
        .join(
            countries.lazy(),
            [col(COL::GEO_CODE)],
            [col(COL::GEO_CODE)],
            JoinArgs::new(JoinType::Left),
        )
        .collect()?)
}

/// Project a long table down to geography, indicator, period and value, plus the bounds when
/// any row has one.
pub fn simplify(df: DataFrame) -> SdmxResult<DataFrame> {
    let mut columns = vec![
        COL::GEO_CODE,
        COL::GEO_NAME,
        COL::INDICATOR,
        COL::PERIOD,
        COL::VALUE,
    ];
    for bound in [COL::LOWER_BOUND, COL::UPPER_BOUND] {
        if let Ok(series) = df.column(bound) {
            if series.null_count() < series.len() {
                columns.push(bound);
            }
        }
    }
    Ok(df.select(columns)?)
}
