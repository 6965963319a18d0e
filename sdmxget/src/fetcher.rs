use std::future::Future;
use std::io::Cursor;
use std::time::Duration;

use itertools::Itertools;
use log::{debug, info, warn};
use nonempty::NonEmpty;
use polars::prelude::*;

use crate::{
    config::Config,
    error::{PipelineError, SdmxError, SdmxResult, Stage},
    metadata::{ContentKey, MetadataContent, MetadataSource},
};

/// What to ask a dataset for. Geography and period bounds narrow the request server-side and
/// are re-applied locally after normalisation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DataQuery {
    pub indicators: Vec<String>,
    pub geo_codes: Option<Vec<String>>,
    pub start_period: Option<i32>,
    pub end_period: Option<i32>,
}

/// Retrieves raw tabular rows for one dataset.
#[allow(async_fn_in_trait)]
pub trait Fetcher {
    /// One frame per response page, every column a string. Returns `SdmxError::NotFound` when
    /// the dataset holds nothing for the query.
    async fn fetch(&self, dataset: &str, query: &DataQuery) -> SdmxResult<Vec<DataFrame>>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Attempts after the first
    pub max_retries: u32,
    pub pause: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.max_retries,
            pause: config.retry_pause(),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

/// Run `attempt` until it succeeds, fails with a non-retryable error, or the policy's budget is
/// spent.
pub async fn with_retry<T, F, Fut>(policy: &RetryPolicy, label: &str, mut attempt: F) -> SdmxResult<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = SdmxResult<T>>,
{
    let mut retries = 0;
    loop {
        match attempt().await {
            Err(err) if err.is_retryable() && retries < policy.max_retries => {
                retries += 1;
                warn!(
                    "{label}: {err}; retry {retries}/{} in {:?}",
                    policy.max_retries, policy.pause
                );
                tokio::time::sleep(policy.pause).await;
            }
            result => return result,
        }
    }
}

/// Concatenate response pages into one frame. Pages may disagree on optional columns, which are
/// filled with nulls.
pub fn concat_pages(pages: Vec<DataFrame>) -> SdmxResult<DataFrame> {
    let mut pages = pages.into_iter().filter(|page| page.width() > 0).collect_vec();
    match pages.len() {
        0 => Ok(DataFrame::empty()),
        1 => Ok(pages.remove(0)),
        _ => {
            let lazy = pages.into_iter().map(|page| page.lazy()).collect_vec();
            Ok(concat_lf_diagonal(lazy, UnionArgs::default())?.collect()?)
        }
    }
}

#[derive(Debug)]
pub struct FetchOutcome {
    /// Dataset that supplied the rows; `None` when no candidate had data
    pub dataset: Option<String>,
    pub frame: DataFrame,
    /// Every candidate tried, in order
    pub attempted: Vec<String>,
}

/// Walk `candidates` in order and return the rows of the first one that has any.
///
/// A candidate that reports "not found" or returns zero rows is a clean miss. Any other error
/// is retried under `policy` and then skipped. If every candidate failed with such an error
/// the last one is returned; otherwise running out of candidates yields an empty frame.
pub async fn fetch_with_fallback<F: Fetcher>(
    fetcher: &F,
    candidates: &NonEmpty<String>,
    query: &DataQuery,
    policy: &RetryPolicy,
) -> Result<FetchOutcome, PipelineError> {
    let mut attempted = vec![];
    let mut clean_misses = 0;
    let mut last_error = None;
    for dataset in candidates.iter() {
        attempted.push(dataset.clone());
        info!("Fetching {:?} from `{dataset}`", query.indicators);
        let result = with_retry(policy, dataset, || fetcher.fetch(dataset, query)).await;
        match result {
            Ok(pages) => {
                let frame = concat_pages(pages)
                    .map_err(|err| PipelineError::new(Stage::Fetch, &attempted, err))?;
                if frame.height() > 0 {
                    debug!("`{dataset}` returned {} rows", frame.height());
                    return Ok(FetchOutcome {
                        dataset: Some(dataset.clone()),
                        frame,
                        attempted,
                    });
                }
                info!("`{dataset}` returned no rows; trying next candidate");
                clean_misses += 1;
            }
            Err(err) if err.is_not_found() => {
                info!("{err}; trying next candidate");
                clean_misses += 1;
            }
            Err(err) => {
                warn!("Giving up on `{dataset}`: {err}");
                last_error = Some(err);
            }
        }
    }
    match last_error {
        Some(err) if clean_misses == 0 => Err(PipelineError::new(Stage::Fetch, &attempted, err)),
        _ => {
            info!("No candidate had data for {:?}", query.indicators);
            Ok(FetchOutcome {
                dataset: None,
                frame: DataFrame::empty(),
                attempted,
            })
        }
    }
}

/// Read an SDMX-CSV body with every column as a string.
fn parse_csv(body: Vec<u8>) -> PolarsResult<DataFrame> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(DataFrame::empty());
    }
    CsvReadOptions::default()
        .with_has_header(true)
        .with_infer_schema_length(Some(0))
        .into_reader_with_file_handle(Cursor::new(body))
        .finish()
}

/// Client for an SDMX REST data warehouse and its published reference data.
#[derive(Debug, Clone)]
pub struct SdmxClient {
    client: reqwest::Client,
    config: Config,
}

impl SdmxClient {
    pub fn new(config: Config) -> SdmxResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(anyhow::Error::from)?;
        Ok(Self { client, config })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Data query URL for one page of `query`.
    pub fn data_url(&self, dataset: &str, query: &DataQuery, geo_codes: &[String]) -> String {
        let mut url = format!(
            "{}/data/{},{},{}/{}.{}.?format=csv&labels=id",
            self.config.base_url.trim_end_matches('/'),
            self.config.agency,
            dataset,
            self.config.dataflow_version,
            geo_codes.join("+"),
            query.indicators.join("+"),
        );
        if let Some(start) = query.start_period {
            url.push_str(&format!("&startPeriod={start}"));
        }
        if let Some(end) = query.end_period {
            url.push_str(&format!("&endPeriod={end}"));
        }
        url
    }

    /// Geography batches, one request each. No geography filter is a single unfiltered batch.
    fn geo_batches(&self, query: &DataQuery) -> Vec<Vec<String>> {
        match &query.geo_codes {
            Some(codes) if !codes.is_empty() => codes
                .chunks(self.config.max_geo_codes_per_request.max(1))
                .map(<[String]>::to_vec)
                .collect(),
            _ => vec![vec![]],
        }
    }

    async fn fetch_page(&self, dataset: &str, url: &str) -> SdmxResult<Option<DataFrame>> {
        debug!("GET {url}");
        let transport = |err: reqwest::Error| SdmxError::Transport {
            dataset: dataset.to_string(),
            message: err.to_string(),
        };
        let response = self.client.get(url).send().await.map_err(transport)?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if status.is_server_error() {
            return Err(SdmxError::Transport {
                dataset: dataset.to_string(),
                message: format!("server responded {status}"),
            });
        }
        if !status.is_success() {
            return Err(SdmxError::Http {
                dataset: dataset.to_string(),
                status: status.as_u16(),
            });
        }
        let body = response.bytes().await.map_err(transport)?.to_vec();
        let frame = tokio::task::spawn_blocking(move || parse_csv(body))
            .await
            .map_err(anyhow::Error::from)??;
        Ok(Some(frame))
    }
}

impl Fetcher for SdmxClient {
    async fn fetch(&self, dataset: &str, query: &DataQuery) -> SdmxResult<Vec<DataFrame>> {
        let mut pages = vec![];
        for batch in self.geo_batches(query) {
            let url = self.data_url(dataset, query, &batch);
            if let Some(page) = self.fetch_page(dataset, &url).await? {
                pages.push(page);
            }
        }
        if pages.is_empty() {
            return Err(SdmxError::NotFound {
                dataset: dataset.to_string(),
            });
        }
        Ok(pages)
    }
}

impl MetadataSource for SdmxClient {
    fn platform(&self) -> String {
        self.config.metadata_url.clone()
    }

    async fn fetch_content(&self, key: ContentKey) -> SdmxResult<MetadataContent> {
        let url = format!(
            "{}/{}",
            self.config.metadata_url.trim_end_matches('/'),
            key.file_name()
        );
        let label = key.to_string();
        let body = with_retry(&RetryPolicy::from_config(&self.config), &label, || async {
            info!("Attempting to load `{key}` from {url}");
            let transport = |err: reqwest::Error| SdmxError::Transport {
                dataset: label.clone(),
                message: err.to_string(),
            };
            let response = self.client.get(&url).send().await.map_err(transport)?;
            let status = response.status();
            if status.is_server_error() {
                return Err(SdmxError::Transport {
                    dataset: label.clone(),
                    message: format!("server responded {status}"),
                });
            }
            if !status.is_success() {
                return Err(SdmxError::MissingMetadata(format!(
                    "{url} responded {status}"
                )));
            }
            response.text().await.map_err(transport)
        })
        .await?;
        MetadataContent::from_json(key, &body)
    }
}
