//! Resolution of an indicator code to the ordered list of datasets that may hold it.
//!
//! Three sources are consulted in order:
//! 1. the override table, an exact match on the full indicator code;
//! 2. the fallback sequences, keyed by code prefix (longest matching prefix wins);
//! 3. the catch-all [`GLOBAL_DATAFLOW`].
//!
//! Resolution performs no I/O: it only reads an already loaded [`ReferenceData`].

use std::collections::{BTreeMap, HashSet};

use itertools::Itertools;
use log::debug;
use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};

use crate::{
    error::{SdmxError, SdmxResult},
    metadata::ReferenceData,
};

/// Dataset queried when nothing more specific is known about an indicator
pub const GLOBAL_DATAFLOW: &str = "GLOBAL_DATAFLOW";

/// Separates the prefix segments of an indicator code
pub const PREFIX_DELIMITER: char = '_';

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FallbackEntry {
    pub prefix: String,
    pub dataflows: Vec<String>,
}

/// Ordered prefix → dataset sequence table. Prefixes are unique ignoring case.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FallbackSequences {
    entries: Vec<FallbackEntry>,
}

impl FallbackSequences {
    /// Validates the table, rejecting prefixes that appear more than once (ignoring case) and
    /// prefixes with no datasets, since either would make resolution depend on load order.
    pub fn new(entries: Vec<FallbackEntry>) -> SdmxResult<Self> {
        let mut seen = HashSet::new();
        for entry in &entries {
            let prefix = entry.prefix.trim().to_ascii_uppercase();
            if prefix.is_empty() {
                return Err(SdmxError::AmbiguousPrefix(
                    "empty prefix in fallback sequences".into(),
                ));
            }
            if entry.dataflows.is_empty() {
                return Err(SdmxError::AmbiguousPrefix(format!(
                    "prefix `{}` has no datasets",
                    entry.prefix
                )));
            }
            if !seen.insert(prefix) {
                return Err(SdmxError::AmbiguousPrefix(format!(
                    "prefix `{}` is registered more than once",
                    entry.prefix
                )));
            }
        }
        Ok(Self { entries })
    }

    pub fn get(&self, prefix: &str) -> Option<&FallbackEntry> {
        self.entries
            .iter()
            .find(|entry| entry.prefix.trim().eq_ignore_ascii_case(prefix))
    }

    /// The entry whose prefix covers the most leading segments of `code`.
    pub fn longest_match(&self, code: &str) -> Option<&FallbackEntry> {
        candidate_prefixes(code)
            .into_iter()
            .find_map(|prefix| self.get(prefix))
    }
}

/// Leading segments of `code` that end at a delimiter, longest first. A code with no delimiter
/// is its own prefix.
fn candidate_prefixes(code: &str) -> Vec<&str> {
    let cuts = code
        .char_indices()
        .filter(|(_, c)| *c == PREFIX_DELIMITER)
        .map(|(idx, _)| &code[..idx])
        .filter(|prefix| !prefix.is_empty())
        .collect_vec();
    if cuts.is_empty() {
        vec![code]
    } else {
        cuts.into_iter().rev().collect()
    }
}

/// Resolves indicator codes against one snapshot of reference data.
pub struct Resolver<'a> {
    overrides: &'a BTreeMap<String, String>,
    sequences: &'a FallbackSequences,
}

impl<'a> Resolver<'a> {
    pub fn new(reference: &'a ReferenceData) -> Self {
        Self {
            overrides: &reference.overrides,
            sequences: &reference.fallback_sequences,
        }
    }

    /// Ordered, non-empty list of datasets to query for `indicator_code`.
    pub fn resolve(&self, indicator_code: &str) -> NonEmpty<String> {
        let code = indicator_code.trim();
        if let Some(dataset) = self.overrides.get(code) {
            debug!("{code}: override → {dataset}");
            return NonEmpty::new(dataset.clone());
        }
        let matched = self
            .sequences
            .longest_match(code)
            .and_then(|entry| NonEmpty::from_vec(entry.dataflows.clone()));
        if let Some(candidates) = matched {
            debug!("{code}: prefix sequence {candidates:?}");
            return candidates;
        }
        debug!("{code}: no mapping, using {GLOBAL_DATAFLOW}");
        NonEmpty::new(GLOBAL_DATAFLOW.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(prefix: &str, dataflows: &[&str]) -> FallbackEntry {
        FallbackEntry {
            prefix: prefix.into(),
            dataflows: dataflows.iter().map(|d| d.to_string()).collect(),
        }
    }

    fn reference() -> ReferenceData {
        ReferenceData {
            fallback_sequences: FallbackSequences::new(vec![
                entry("CME", &["CME", "GLOBAL_DATAFLOW"]),
                entry("ED", &["EDUCATION", "GLOBAL_DATAFLOW"]),
                entry("PT", &["PT", "GLOBAL_DATAFLOW"]),
                entry("PT_F", &["PT_CM", "PT", "GLOBAL_DATAFLOW"]),
            ])
            .unwrap(),
            overrides: BTreeMap::from([
                ("ED_CR_L1_UIS_MOD".to_string(), "EDUCATION_UIS_SDG".to_string()),
                ("CME_SBR".to_string(), "CME_SUBNATIONAL".to_string()),
            ]),
            ..Default::default()
        }
    }

    #[test]
    fn override_should_win_over_prefix() {
        let reference = reference();
        let resolver = Resolver::new(&reference);
        let candidates = resolver.resolve("ED_CR_L1_UIS_MOD");
        assert_eq!(candidates, NonEmpty::new("EDUCATION_UIS_SDG".to_string()));
        // Every override resolves to exactly its dataset
        for (code, dataset) in &reference.overrides {
            assert_eq!(resolver.resolve(code).into_iter().collect_vec(), vec![
                dataset.clone()
            ]);
        }
    }

    #[test]
    fn prefix_should_return_sequence_in_order() {
        let reference = reference();
        let resolver = Resolver::new(&reference);
        assert_eq!(
            resolver.resolve("CME_MRY0T4").into_iter().collect_vec(),
            vec!["CME", "GLOBAL_DATAFLOW"]
        );
        assert_eq!(
            resolver.resolve("ED_ANAR_L02").into_iter().collect_vec(),
            vec!["EDUCATION", "GLOBAL_DATAFLOW"]
        );
    }

    #[test]
    fn longest_prefix_should_win() {
        let reference = reference();
        let resolver = Resolver::new(&reference);
        assert_eq!(
            resolver
                .resolve("PT_F_20-24_MRD_U18_TOT")
                .into_iter()
                .collect_vec(),
            vec!["PT_CM", "PT", "GLOBAL_DATAFLOW"]
        );
        assert_eq!(
            resolver.resolve("PT_CHLD_Y0T4_REG").head,
            "PT".to_string()
        );
    }

    #[test]
    fn unknown_code_should_fall_back_to_global() {
        let reference = reference();
        let resolver = Resolver::new(&reference);
        assert_eq!(
            resolver.resolve("XYZ_UNKNOWN"),
            NonEmpty::new(GLOBAL_DATAFLOW.to_string())
        );
        assert_eq!(
            resolver.resolve("NODELIMITER"),
            NonEmpty::new(GLOBAL_DATAFLOW.to_string())
        );
    }

    #[test]
    fn code_without_delimiter_is_its_own_prefix() {
        assert_eq!(candidate_prefixes("CME"), vec!["CME"]);
        assert_eq!(candidate_prefixes("A_B_C"), vec!["A_B", "A"]);
        assert_eq!(candidate_prefixes("_A"), vec!["_A"]);
    }

    #[test]
    fn duplicate_prefixes_should_be_rejected() {
        let result = FallbackSequences::new(vec![entry("CME", &["CME"]), entry("cme", &["X"])]);
        assert!(matches!(result, Err(SdmxError::AmbiguousPrefix(_))));
        let result = FallbackSequences::new(vec![entry("NT", &[])]);
        assert!(matches!(result, Err(SdmxError::AmbiguousPrefix(_))));
    }
}
