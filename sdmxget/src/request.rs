use std::str::FromStr;

use anyhow::bail;
use itertools::Itertools;
use nonempty::NonEmpty;
use serde::{Deserialize, Serialize};

use crate::{
    error::{SdmxError, SdmxResult},
    fetcher::DataQuery,
    filter::DimensionFilterSpec,
    format::OutputMode,
    observation::Observation,
    transform::{Circa, DropNa, DuplicateCheck, Latest, MostRecentValues, PostProcess},
};

/// Requested periods, in whole years.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum PeriodSpec {
    /// Inclusive range; either end may be open
    Range {
        start: Option<i32>,
        end: Option<i32>,
    },
    /// Specific years
    Years(Vec<i32>),
}

impl FromStr for PeriodSpec {
    type Err = anyhow::Error;

    /// Parses `2015`, `2015...2023`, `2015...`, `...2023` and `2015,2018,2020`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        fn str_to_option_i32(value: &str) -> Result<Option<i32>, anyhow::Error> {
            let value = value.trim();
            if value.is_empty() {
                return Ok(None);
            }
            match value.parse::<i32>() {
                Ok(value) => Ok(Some(value)),
                Err(_) => bail!("Invalid period `{value}`"),
            }
        }
        if s.contains(',') {
            let years = s
                .split(',')
                .map(|year| str_to_option_i32(year)?.ok_or_else(|| anyhow::anyhow!("Empty year")))
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(PeriodSpec::Years(years));
        }
        let parts: Vec<Option<i32>> = s
            .split("...")
            .map(str_to_option_i32)
            .collect::<Result<Vec<Option<i32>>, _>>()?;
        match parts.as_slice() {
            [Some(a)] => Ok(PeriodSpec::Years(vec![*a])),
            [None, Some(b)] => Ok(PeriodSpec::Range {
                start: None,
                end: Some(*b),
            }),
            [Some(a), None] => Ok(PeriodSpec::Range {
                start: Some(*a),
                end: None,
            }),
            [Some(a), Some(b)] => {
                if a > b {
                    bail!("Invalid period range `{s}`")
                } else {
                    Ok(PeriodSpec::Range {
                        start: Some(*a),
                        end: Some(*b),
                    })
                }
            }
            _ => bail!("Invalid period `{s}`"),
        }
    }
}

impl PeriodSpec {
    /// Bounds to send to the warehouse.
    pub fn bounds(&self) -> (Option<i32>, Option<i32>) {
        match self {
            PeriodSpec::Range { start, end } => (*start, *end),
            PeriodSpec::Years(years) => (years.iter().min().copied(), years.iter().max().copied()),
        }
    }

    pub fn contains_year(&self, year: i32) -> bool {
        match self {
            PeriodSpec::Range { start, end } => {
                start.map_or(true, |start| year >= start) && end.map_or(true, |end| year <= end)
            }
            PeriodSpec::Years(years) => years.contains(&year),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct PostProcessOptions {
    /// Remove rows with a null value
    pub dropna: bool,
    /// Drop exact duplicate rows instead of failing
    pub deduplicate: bool,
    /// Keep only the latest period per series
    pub latest: bool,
    /// Keep the N most recent periods per series
    pub mrv: Option<usize>,
    /// Substitute the nearest year when a requested year is missing
    pub circa: bool,
    /// Join region, income group and continent
    pub add_metadata: bool,
    /// Reduce to geography, indicator, period, value and bounds
    pub simplify: bool,
    /// Rename identifying columns only and pass the warehouse columns through
    pub raw: bool,
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct DataRequest {
    pub indicators: NonEmpty<String>,
    #[serde(default)]
    pub geo: Option<Vec<String>>,
    #[serde(default)]
    pub period: Option<PeriodSpec>,
    #[serde(default)]
    pub filters: DimensionFilterSpec,
    #[serde(default)]
    pub output: OutputMode,
    #[serde(default)]
    pub options: PostProcessOptions,
}

impl DataRequest {
    pub fn new(indicators: NonEmpty<String>) -> Self {
        Self {
            indicators,
            geo: None,
            period: None,
            filters: DimensionFilterSpec::default(),
            output: OutputMode::default(),
            options: PostProcessOptions::default(),
        }
    }

    pub fn validate(&self) -> SdmxResult<()> {
        if self.indicators.iter().any(|code| code.trim().is_empty()) {
            return Err(SdmxError::InvalidRequest("empty indicator code".into()));
        }
        if self.options.mrv == Some(0) {
            return Err(SdmxError::InvalidRequest("mrv must be at least 1".into()));
        }
        if self.options.latest && self.options.mrv.is_some() {
            return Err(SdmxError::InvalidRequest(
                "latest and mrv cannot be combined".into(),
            ));
        }
        if self.options.circa && !matches!(self.period, Some(PeriodSpec::Years(_))) {
            return Err(SdmxError::InvalidRequest(
                "circa needs one or more specific years".into(),
            ));
        }
        if let Some(PeriodSpec::Range {
            start: Some(start),
            end: Some(end),
        }) = self.period
        {
            if start > end {
                return Err(SdmxError::InvalidRequest(format!(
                    "period range {start}...{end} is empty"
                )));
            }
        }
        Ok(())
    }

    /// Query for one indicator. With `circa` the period is left unbounded so the nearest years
    /// are available.
    pub fn data_query(&self, indicator: &str) -> DataQuery {
        let (start_period, end_period) = match &self.period {
            Some(period) if !self.options.circa => period.bounds(),
            _ => (None, None),
        };
        DataQuery {
            indicators: vec![indicator.to_string()],
            geo_codes: self.geo.clone(),
            start_period,
            end_period,
        }
    }

    /// Whether an observation falls inside the requested geographies and periods.
    pub fn in_scope(&self, observation: &Observation) -> bool {
        let geo_ok = self
            .geo
            .as_ref()
            .map_or(true, |geo| geo.contains(&observation.geo_code));
        let period_ok = match &self.period {
            Some(period) if !self.options.circa => observation
                .year()
                .is_some_and(|year| period.contains_year(year)),
            _ => true,
        };
        geo_ok && period_ok
    }

    /// Post-processing steps in application order. Duplicate detection always runs.
    pub fn transforms(&self) -> Vec<PostProcess> {
        let mut steps: Vec<PostProcess> = vec![];
        if self.options.dropna {
            steps.push(DropNa.into());
        }
        steps.push(
            DuplicateCheck {
                deduplicate: self.options.deduplicate,
            }
            .into(),
        );
        if self.options.latest {
            steps.push(Latest.into());
        }
        if let Some(n) = self.options.mrv {
            steps.push(MostRecentValues { n }.into());
        }
        if self.options.circa {
            if let Some(PeriodSpec::Years(years)) = &self.period {
                steps.push(Circa {
                    years: years.clone(),
                }
                .into());
            }
        }
        steps
    }

    /// Options that raw mode does not apply.
    pub fn raw_ignored_options(&self) -> Vec<String> {
        let options = &self.options;
        [
            (options.dropna, "dropna"),
            (options.deduplicate, "deduplicate"),
            (options.latest, "latest"),
            (options.mrv.is_some(), "mrv"),
            (options.circa, "circa"),
            (options.add_metadata, "addMetadata"),
            (options.simplify, "simplify"),
            (self.output != OutputMode::Long, "output"),
        ]
        .into_iter()
        .filter_map(|(set, name)| set.then(|| name.to_string()))
        .collect_vec()
    }
}

#[cfg(test)]
mod tests {
    use nonempty::nonempty;

    use super::*;
    use crate::observation::{tests::obs, Dimension};

    fn request() -> DataRequest {
        DataRequest::new(nonempty!["CME_MRY0T4".to_string()])
    }

    #[test]
    fn period_spec_should_parse() {
        assert_eq!(
            "2015".parse::<PeriodSpec>().unwrap(),
            PeriodSpec::Years(vec![2015])
        );
        assert_eq!(
            "2015...2023".parse::<PeriodSpec>().unwrap(),
            PeriodSpec::Range {
                start: Some(2015),
                end: Some(2023)
            }
        );
        assert_eq!(
            "...2023".parse::<PeriodSpec>().unwrap(),
            PeriodSpec::Range {
                start: None,
                end: Some(2023)
            }
        );
        assert_eq!(
            "2015, 2018,2020".parse::<PeriodSpec>().unwrap(),
            PeriodSpec::Years(vec![2015, 2018, 2020])
        );
        assert!("2023...2015".parse::<PeriodSpec>().is_err());
        assert!("recent".parse::<PeriodSpec>().is_err());
        assert!("2015,,2016".parse::<PeriodSpec>().is_err());
    }

    #[test]
    fn test_validate() {
        assert!(request().validate().is_ok());

        let mut invalid = request();
        invalid.options.mrv = Some(0);
        assert!(matches!(invalid.validate(), Err(SdmxError::InvalidRequest(_))));

        let mut invalid = request();
        invalid.options.latest = true;
        invalid.options.mrv = Some(2);
        assert!(invalid.validate().is_err());

        let mut invalid = request();
        invalid.options.circa = true;
        invalid.period = Some("2015...2020".parse().unwrap());
        assert!(invalid.validate().is_err());
        invalid.period = Some("2015,2020".parse().unwrap());
        assert!(invalid.validate().is_ok());
    }

    #[test]
    fn test_data_query() {
        let mut request = request();
        request.geo = Some(vec!["ALB".into(), "USA".into()]);
        request.period = Some("2018,2015".parse().unwrap());
        let query = request.data_query("CME_MRY0T4");
        assert_eq!(query.indicators, vec!["CME_MRY0T4"]);
        assert_eq!((query.start_period, query.end_period), (Some(2015), Some(2018)));

        request.options.circa = true;
        let query = request.data_query("CME_MRY0T4");
        assert_eq!((query.start_period, query.end_period), (None, None));
    }

    #[test]
    fn in_scope_should_apply_geo_and_period() {
        let mut request = request();
        request.geo = Some(vec!["ALB".into()]);
        request.period = Some("2015...2016".parse().unwrap());
        assert!(request.in_scope(&obs("ALB", 2016.5, Some(1.0))));
        assert!(!request.in_scope(&obs("ALB", 2017.0, Some(1.0))));
        assert!(!request.in_scope(&obs("USA", 2015.0, Some(1.0))));

        request.period = Some("2015,2017".parse().unwrap());
        assert!(!request.in_scope(&obs("ALB", 2016.0, Some(1.0))));
        request.options.circa = true;
        assert!(request.in_scope(&obs("ALB", 2016.0, Some(1.0))));
    }

    #[test]
    fn transforms_should_follow_fixed_order() {
        let mut request = request();
        request.options.dropna = true;
        request.options.mrv = Some(3);
        request.options.circa = true;
        request.period = Some(PeriodSpec::Years(vec![2020]));
        let expected: Vec<PostProcess> = vec![
            DropNa.into(),
            DuplicateCheck { deduplicate: false }.into(),
            MostRecentValues { n: 3 }.into(),
            Circa { years: vec![2020] }.into(),
        ];
        assert_eq!(request.transforms(), expected);
    }

    #[test]
    fn recipe_should_deserialize_from_camel_case() {
        let request: DataRequest = serde_json::from_str(
            r#"{
                "indicators": ["CME_MRY0T4", "ED_CR_L1_UIS_MOD"],
                "geo": ["ALB", "USA", "BRA"],
                "period": {"range": {"start": 2015, "end": 2023}},
                "filters": {"sex": ["F"]},
                "output": "wideByPeriod",
                "options": {"dropna": true, "addMetadata": true}
            }"#,
        )
        .unwrap();
        assert_eq!(request.indicators.len(), 2);
        assert_eq!(request.output, OutputMode::WideByPeriod);
        assert!(request.options.add_metadata);
        assert_eq!(
            request.filters.get(Dimension::Sex),
            Some(&["F".to_string()][..])
        );
        assert_eq!(request.raw_ignored_options(), vec!["dropna", "addMetadata", "output"]);

        let empty: Result<DataRequest, _> = serde_json::from_str(r#"{"indicators": []}"#);
        assert!(empty.is_err(), "At least one indicator is required");
    }
}
