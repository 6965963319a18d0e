use std::collections::BTreeMap;

use log::{debug, info};
use nonempty::NonEmpty;
use polars::frame::DataFrame;

use crate::{
    config::Config,
    error::{PipelineError, SdmxResult, Stage, Warning},
    fetcher::{concat_pages, fetch_with_fallback, Fetcher, RetryPolicy, SdmxClient},
    filter::SupportedDimensions,
    metadata::{Clock, MemoryStore, MetadataCache, MetadataSource, MetadataStore, ReferenceData, SystemClock},
    observation::{observations_to_df, Observation},
    request::DataRequest,
    resolver::Resolver,
    transform::Transform,
};

// Re-exports
pub use column_names as COL;

// Modules
pub mod column_names;
pub mod config;
pub mod error;
pub mod fetcher;
pub mod filter;
pub mod format;
#[cfg(feature = "formatters")]
pub mod formatters;
pub mod metadata;
pub mod normalize;
pub mod observation;
pub mod request;
pub mod resolver;
pub mod transform;

/// Formatted table plus everything learned while producing it
#[derive(Debug)]
pub struct DataResult {
    pub data: DataFrame,
    pub warnings: Vec<Warning>,
    /// Dataset that supplied each indicator, `None` when no candidate had data
    pub sources: BTreeMap<String, Option<String>>,
    /// Every dataset queried, in order
    pub attempted: Vec<String>,
}

/// Entry point: resolve → fetch → normalize → filter → post-process → format
pub struct IndicatorClient<F, S, C = SystemClock> {
    fetcher: F,
    metadata: MetadataCache<S, C>,
    retry_policy: RetryPolicy,
}

impl IndicatorClient<SdmxClient, SdmxClient> {
    /// Setup the client with default configuration
    pub fn new() -> SdmxResult<Self> {
        Self::new_with_config(Config::default())
    }

    /// Setup the client with custom configuration, persisting reference data in the cache
    /// directory when one is available
    pub fn new_with_config(config: Config) -> SdmxResult<Self> {
        debug!("config: {config:?}");
        let client = SdmxClient::new(config.clone())?;
        let store = default_store(&config)?;
        let metadata = MetadataCache::new(client.clone(), store, config.staleness());
        Ok(Self::with_parts(client, metadata, RetryPolicy::from_config(&config)))
    }
}

#[cfg(feature = "cache")]
fn default_store(config: &Config) -> SdmxResult<Box<dyn MetadataStore>> {
    match config.resolved_cache_dir() {
        Some(dir) => {
            info!("Caching reference data in {}", dir.display());
            Ok(Box::new(metadata::DirStore::new(dir)?))
        }
        None => Ok(Box::<MemoryStore>::default()),
    }
}

#[cfg(not(feature = "cache"))]
fn default_store(_config: &Config) -> SdmxResult<Box<dyn MetadataStore>> {
    Ok(Box::<MemoryStore>::default())
}

impl<F: Fetcher, S: MetadataSource, C: Clock> IndicatorClient<F, S, C> {
    pub fn with_parts(fetcher: F, metadata: MetadataCache<S, C>, retry_policy: RetryPolicy) -> Self {
        Self {
            fetcher,
            metadata,
            retry_policy,
        }
    }

    pub fn metadata(&self) -> &MetadataCache<S, C> {
        &self.metadata
    }

    /// Reference data snapshot, with warnings for stale keys
    pub async fn reference_data(&self) -> Result<(ReferenceData, Vec<Warning>), PipelineError> {
        self.metadata
            .reference_data()
            .await
            .map_err(|err| PipelineError::new(Stage::Metadata, &[], err))
    }

    /// Candidate datasets for an indicator code, in query order
    pub async fn resolve(
        &self,
        indicator: &str,
    ) -> Result<(NonEmpty<String>, Vec<Warning>), PipelineError> {
        let (reference, warnings) = self.reference_data().await?;
        Ok((Resolver::new(&reference).resolve(indicator), warnings))
    }

    /// Run the whole pipeline for `request`
    pub async fn get_data(&self, request: &DataRequest) -> Result<DataResult, PipelineError> {
        request
            .validate()
            .map_err(|err| PipelineError::new(Stage::Resolve, &[], err))?;
        let (reference, mut warnings) = self.reference_data().await?;
        let resolver = Resolver::new(&reference);

        let mut attempted: Vec<String> = vec![];
        let mut sources = BTreeMap::new();
        let mut observations = vec![];
        let mut raw_frames = vec![];
        for indicator in request.indicators.iter() {
            let candidates = resolver.resolve(indicator);
            info!("{indicator}: candidates {:?}", candidates);
            let query = request.data_query(indicator);
            let outcome = fetch_with_fallback(&self.fetcher, &candidates, &query, &self.retry_policy)
                .await
                .map_err(|mut err| {
                    err.attempted = [attempted.clone(), err.attempted].concat();
                    err
                })?;
            attempted.extend(outcome.attempted);
            sources.insert(indicator.clone(), outcome.dataset.clone());
            let Some(dataset) = outcome.dataset else {
                continue;
            };
            let present = SupportedDimensions::from_frame(&outcome.frame);
            let supported = match reference.supported_dimensions(&dataset) {
                Some(declared) => declared.intersect(&present, &dataset),
                None => present,
            };
            let (filters, filter_warnings) = filter::plan(&request.filters, &supported, &dataset);
            warnings.extend(filter_warnings);

            if request.options.raw {
                let frame = normalize::normalize_raw(outcome.frame)
                    .map_err(|err| PipelineError::new(Stage::Normalize, &attempted, err))?;
                let frame = filter::filter_frame(frame, &filters)
                    .map_err(|err| PipelineError::new(Stage::Filter, &attempted, err))?;
                raw_frames.push(frame);
                continue;
            }

            let mut normalized = normalize::normalize(
                &outcome.frame,
                std::slice::from_ref(indicator),
                &dataset,
                &reference,
            )
            .map_err(|err| PipelineError::new(Stage::Normalize, &attempted, err))?;
            normalized.retain(|o| o.indicator == *indicator && request.in_scope(o));
            observations.extend(filter::filter_observations(normalized, &filters));
        }

        if request.options.raw {
            warnings.extend(
                request
                    .raw_ignored_options()
                    .into_iter()
                    .map(|option| Warning::RawModeIgnored { option }),
            );
            let data = concat_pages(raw_frames)
                .map_err(|err| PipelineError::new(Stage::Normalize, &attempted, err))?;
            return Ok(DataResult {
                data,
                warnings,
                sources,
                attempted,
            });
        }

        debug!("{} observations after filtering", observations.len());
        let post_process = |mut observations: Vec<Observation>| -> SdmxResult<DataFrame> {
            for step in request.transforms() {
                observations = step.transform(observations)?;
            }
            debug!("{} observations after post-processing", observations.len());
            let mut df = observations_to_df(&observations)?;
            if request.options.add_metadata {
                df = transform::enrich(df, &reference)?;
            }
            if request.options.simplify {
                df = transform::simplify(df)?;
            }
            Ok(df)
        };
        let df = post_process(observations)
            .map_err(|err| PipelineError::new(Stage::PostProcess, &attempted, err))?;
        let (data, format_warnings) = format::format(df, request.output)
            .map_err(|err| PipelineError::new(Stage::Format, &attempted, err))?;
        warnings.extend(format_warnings);
        Ok(DataResult {
            data,
            warnings,
            sources,
            attempted,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use nonempty::nonempty;
    use polars::prelude::*;

    use super::*;
    use crate::{
        error::SdmxError,
        filter::DimensionFilterSpec,
        format::OutputMode,
        metadata::{tests::test_contents, StaticSource},
        observation::Dimension,
    };

    /// Serves canned raw frames per dataset, keeping only the requested indicators like the
    /// warehouse does, and records the order datasets were asked for.
    struct MockFetcher {
        frames: HashMap<String, DataFrame>,
        calls: Mutex<Vec<String>>,
    }

    impl MockFetcher {
        fn new(frames: impl IntoIterator<Item = (&'static str, DataFrame)>) -> Self {
            Self {
                frames: frames
                    .into_iter()
                    .map(|(dataset, frame)| (dataset.to_string(), frame))
                    .collect(),
                calls: Mutex::new(vec![]),
            }
        }
    }

    impl Fetcher for MockFetcher {
        async fn fetch(&self, dataset: &str, query: &fetcher::DataQuery) -> SdmxResult<Vec<DataFrame>> {
            self.calls.lock().unwrap().push(dataset.to_string());
            let frame = self.frames.get(dataset).ok_or_else(|| SdmxError::NotFound {
                dataset: dataset.into(),
            })?;
            let mask: BooleanChunked = frame
                .column("INDICATOR")?
                .str()?
                .into_iter()
                .map(|v| v.is_some_and(|v| query.indicators.iter().any(|i| i == v)))
                .collect();
            Ok(vec![frame.filter(&mask)?])
        }
    }

    fn client(fetcher: MockFetcher) -> IndicatorClient<MockFetcher, StaticSource> {
        let metadata = MetadataCache::new(
            StaticSource::new(test_contents()),
            Box::<MemoryStore>::default(),
            chrono::Duration::days(30),
        );
        IndicatorClient::with_parts(
            fetcher,
            metadata,
            RetryPolicy {
                max_retries: 0,
                pause: Duration::ZERO,
            },
        )
    }

    /// Under-five mortality for four countries, 2014 to 2023, by sex, as the warehouse returns
    /// it before any local filtering.
    fn cme_frame() -> DataFrame {
        let mut geo = vec![];
        let mut sex = vec![];
        let mut period = vec![];
        let mut value = vec![];
        for (country, base) in [("ALB", 10.0), ("USA", 7.0), ("BRA", 16.0), ("XKX", 12.0)] {
            for year in 2014..=2023 {
                for s in ["_T", "F", "M"] {
                    geo.push(country);
                    sex.push(s);
                    period.push(year.to_string());
                    value.push(format!("{:.1}", base - f64::from(year - 2014) * 0.3));
                }
            }
        }
        let n = geo.len();
        df!(
            "DATAFLOW" => vec!["UNICEF:CME(1.0)"; n],
            "REF_AREA" => geo,
            "INDICATOR" => vec!["CME_MRY0T4"; n],
            "SEX" => sex,
            "TIME_PERIOD" => period,
            "OBS_VALUE" => value
        )
        .unwrap()
    }

    fn cme_request() -> DataRequest {
        let mut request = DataRequest::new(nonempty!["CME_MRY0T4".to_string()]);
        request.geo = Some(vec!["ALB".into(), "USA".into(), "BRA".into()]);
        request.period = Some("2015...2023".parse().unwrap());
        request
    }

    fn strings(df: &DataFrame, column: &str) -> Vec<String> {
        df.column(column)
            .unwrap()
            .str()
            .unwrap()
            .into_iter()
            .map(|v| v.unwrap_or_default().to_string())
            .collect()
    }

    #[tokio::test]
    async fn default_filters_should_select_totals_within_scope() {
        let client = client(MockFetcher::new([("CME", cme_frame())]));
        let result = client.get_data(&cme_request()).await.unwrap();
        let df = result.data;
        assert_eq!(df.height(), 3 * 9);
        assert!(strings(&df, COL::SEX).iter().all(|s| s == "_T"));
        assert!(strings(&df, COL::GEO_CODE)
            .iter()
            .all(|g| ["ALB", "USA", "BRA"].contains(&g.as_str())));
        let periods = df.column(COL::PERIOD).unwrap().f64().unwrap();
        assert!(periods
            .into_iter()
            .all(|p| p.is_some_and(|p| p.fract() == 0.0 && (2015.0..=2023.0).contains(&p))));
        assert_eq!(result.sources["CME_MRY0T4"].as_deref(), Some("CME"));
        assert_eq!(result.attempted, vec!["CME"]);
        assert!(result.warnings.is_empty());
    }

    #[tokio::test]
    async fn override_should_be_queried_instead_of_prefix() {
        let fetcher = MockFetcher::new([]);
        let client = client(fetcher);
        let request = DataRequest::new(nonempty!["ED_CR_L1_UIS_MOD".to_string()]);
        let result = client.get_data(&request).await.unwrap();
        assert_eq!(result.attempted, vec!["EDUCATION_UIS_SDG"]);
        assert_eq!(
            *client.fetcher.calls.lock().unwrap(),
            vec!["EDUCATION_UIS_SDG".to_string()]
        );
    }

    #[tokio::test]
    async fn latest_should_return_one_row_per_country() {
        let client = client(MockFetcher::new([("CME", cme_frame())]));
        let mut request = cme_request();
        request.options.latest = true;
        let result = client.get_data(&request).await.unwrap();
        let df = result.data;
        assert_eq!(df.height(), 3);
        let periods = df.column(COL::PERIOD).unwrap().f64().unwrap();
        assert!(periods.into_iter().all(|p| p == Some(2023.0)));
    }

    #[tokio::test]
    async fn unknown_indicator_should_return_empty_result() {
        let client = client(MockFetcher::new([("CME", cme_frame())]));
        let request = DataRequest::new(nonempty!["XYZ_NOTHING".to_string()]);
        let result = client.get_data(&request).await.unwrap();
        assert_eq!(result.data.height(), 0);
        assert_eq!(result.attempted, vec!["GLOBAL_DATAFLOW"]);
        assert_eq!(result.sources["XYZ_NOTHING"], None);
    }

    #[tokio::test]
    async fn fallback_should_reach_global_dataflow() {
        let client = client(MockFetcher::new([("GLOBAL_DATAFLOW", cme_frame())]));
        let result = client.get_data(&cme_request()).await.unwrap();
        assert_eq!(result.attempted, vec!["CME", "GLOBAL_DATAFLOW"]);
        assert_eq!(
            result.sources["CME_MRY0T4"].as_deref(),
            Some("GLOBAL_DATAFLOW")
        );
        assert_eq!(result.data.height(), 27);
    }

    #[tokio::test]
    async fn invalid_request_should_fail_at_resolve_stage() {
        let client = client(MockFetcher::new([]));
        let mut request = cme_request();
        request.options.mrv = Some(0);
        let err = client.get_data(&request).await.unwrap_err();
        assert_eq!(err.stage, Stage::Resolve);
        assert!(err.attempted.is_empty());
    }

    #[tokio::test]
    async fn duplicates_should_fail_at_post_process_stage() {
        let frame = cme_frame();
        let doubled = frame.vstack(&frame).unwrap();
        let client = client(MockFetcher::new([("CME", doubled)]));
        let err = client.get_data(&cme_request()).await.unwrap_err();
        assert_eq!(err.stage, Stage::PostProcess);
        assert_eq!(err.attempted, vec!["CME"]);
        assert!(matches!(err.source, SdmxError::DuplicateRows { count: 27 }));

        let mut request = cme_request();
        request.options.deduplicate = true;
        let result = client.get_data(&request).await.unwrap();
        assert_eq!(result.data.height(), 27);
    }

    #[tokio::test]
    async fn unsupported_filter_should_warn_and_keep_rows() {
        let client = client(MockFetcher::new([("CME", cme_frame())]));
        let mut request = cme_request();
        request.filters = DimensionFilterSpec::new().with(Dimension::Residence, &["U"]);
        let result = client.get_data(&request).await.unwrap();
        assert_eq!(result.data.height(), 27);
        assert_eq!(
            result.warnings,
            vec![Warning::UnsupportedFilter {
                dimension: Dimension::Residence,
                dataset: "CME".into()
            }]
        );
    }

    /// `cme_frame` reduced to its totals, without the SEX column the CME metadata declares.
    fn cme_frame_without_sex() -> DataFrame {
        cme_frame()
            .lazy()
            .filter(col("SEX").eq(lit("_T")))
            .drop(["SEX"])
            .collect()
            .unwrap()
    }

    #[tokio::test]
    async fn declared_dimension_missing_from_response_should_not_empty_result() {
        let client = client(MockFetcher::new([("CME", cme_frame_without_sex())]));
        let result = client.get_data(&cme_request()).await.unwrap();
        assert_eq!(result.data.height(), 27);
        assert!(result.warnings.is_empty());

        let mut request = cme_request();
        request.filters = DimensionFilterSpec::new().with(Dimension::Sex, &["F"]);
        let result = client.get_data(&request).await.unwrap();
        assert_eq!(result.data.height(), 27);
        assert_eq!(
            result.warnings,
            vec![Warning::UnsupportedFilter {
                dimension: Dimension::Sex,
                dataset: "CME".into()
            }]
        );

        let mut request = cme_request();
        request.options.raw = true;
        let result = client.get_data(&request).await.unwrap();
        assert_eq!(result.data.height(), 4 * 10);
    }

    #[tokio::test]
    async fn multiple_indicators_should_pivot_by_indicator() {
        let mut other = cme_frame();
        other
            .with_column(Series::new("INDICATOR", vec!["CME_MRM0"; other.height()]))
            .unwrap();
        let client = client(MockFetcher::new([
            ("CME", cme_frame()),
            ("GLOBAL_DATAFLOW", other),
        ]));
        let mut request = cme_request();
        request.indicators.push("NT_MRM0".into());
        request.output = OutputMode::WideByIndicator;
        // NT_MRM0 falls back to GLOBAL_DATAFLOW, which only holds CME_MRM0 rows
        let result = client.get_data(&request).await.unwrap();
        assert_eq!(result.sources["NT_MRM0"], None);
        assert_eq!(result.attempted, vec!["CME", "GLOBAL_DATAFLOW"]);
        assert_eq!(result.warnings, vec![Warning::SingleIndicatorWide]);

        request.indicators = nonempty!["CME_MRY0T4".to_string(), "CME_MRM0".to_string()];
        let result = client.get_data(&request).await.unwrap();
        assert!(result.warnings.is_empty());
        assert_eq!(result.data.height(), 27);
        assert!(result.data.column("CME_MRY0T4").is_ok());
        assert!(result.data.column("CME_MRM0").is_ok());
    }

    #[tokio::test]
    async fn post_processing_should_enrich_and_simplify() {
        let client = client(MockFetcher::new([("CME", cme_frame())]));
        let mut request = cme_request();
        request.options.add_metadata = true;
        let result = client.get_data(&request).await.unwrap();
        assert!(result.data.column(COL::INCOME_GROUP).is_ok());

        request.options.simplify = true;
        let result = client.get_data(&request).await.unwrap();
        assert_eq!(
            result.data.get_column_names(),
            vec![COL::GEO_CODE, COL::GEO_NAME, COL::INDICATOR, COL::PERIOD, COL::VALUE]
        );
    }

    #[tokio::test]
    async fn raw_mode_should_pass_columns_through() {
        let client = client(MockFetcher::new([("CME", cme_frame())]));
        let mut request = cme_request();
        request.options.raw = true;
        request.options.latest = true;
        let result = client.get_data(&request).await.unwrap();
        let df = result.data;
        assert_eq!(
            df.get_column_names(),
            vec!["DATAFLOW", COL::GEO_CODE, COL::INDICATOR, "SEX", COL::PERIOD, COL::VALUE]
        );
        // Sex still defaults to the total
        assert_eq!(df.height(), 4 * 10);
        assert_eq!(
            result.warnings,
            vec![Warning::RawModeIgnored {
                option: "latest".into()
            }]
        );
    }
}
