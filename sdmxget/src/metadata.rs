//! Reference metadata: the typed content behind each cache key, the stores it is persisted in,
//! and the `MetadataCache` that applies the staleness policy on top of them.

use std::collections::{BTreeMap, BTreeSet, HashMap};
#[cfg(feature = "cache")]
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use futures::future::try_join_all;
use log::{debug, info, warn};
use polars::{df, prelude::DataFrame};
use serde::{Deserialize, Serialize};
use strum::IntoEnumIterator;
use strum_macros::{Display, EnumIter, EnumString};

use crate::{
    error::{SdmxError, SdmxResult, Warning},
    filter::{DEFAULT_TOTAL, SupportedDimensions},
    observation::{Dimension, GeoKind},
    resolver::{FallbackEntry, FallbackSequences},
    COL,
};

/// Keys of the independently cached reference structures.
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
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum ContentKey {
    Dataflows,
    Indicators,
    Codelists,
    Countries,
    Regions,
    FallbackSequences,
    Overrides,
}

impl ContentKey {
    /// Name of the JSON document holding this key, both remotely and in the on-disk store
    pub fn file_name(&self) -> String {
        format!("{self}.json")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DimensionInfo {
    pub dimension: Dimension,
    /// Legal values; empty when the codelist is not known
    #[serde(default)]
    pub values: Vec<String>,
    /// Reserved aggregate value
    #[serde(default = "default_total")]
    pub total: String,
}

/// Codelist holding the legal values of `dimension`
fn codelist_id(dimension: Dimension) -> String {
    format!("CL_{}", dimension.sdmx_column())
}

fn default_total() -> String {
    DEFAULT_TOTAL.into()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Dataflow {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub dimensions: Vec<DimensionInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndicatorInfo {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub unit: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CountryInfo {
    pub name: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub income_group: Option<String>,
    #[serde(default)]
    pub continent: Option<String>,
}

/// Content of one cache key. Serialised adjacently tagged so a stored entry names its key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "key", content = "content", rename_all = "snake_case")]
pub enum MetadataContent {
    Dataflows(Vec<Dataflow>),
    Indicators(Vec<IndicatorInfo>),
    /// Codelist id → code → label
    Codelists(BTreeMap<String, BTreeMap<String, String>>),
    /// Country code → country
    Countries(BTreeMap<String, CountryInfo>),
    /// Aggregate region code → name
    Regions(BTreeMap<String, String>),
    FallbackSequences(Vec<FallbackEntry>),
    /// Indicator code → dataset
    Overrides(BTreeMap<String, String>),
}

impl MetadataContent {
    pub fn key(&self) -> ContentKey {
        match self {
            MetadataContent::Dataflows(_) => ContentKey::Dataflows,
            MetadataContent::Indicators(_) => ContentKey::Indicators,
            MetadataContent::Codelists(_) => ContentKey::Codelists,
            MetadataContent::Countries(_) => ContentKey::Countries,
            MetadataContent::Regions(_) => ContentKey::Regions,
            MetadataContent::FallbackSequences(_) => ContentKey::FallbackSequences,
            MetadataContent::Overrides(_) => ContentKey::Overrides,
        }
    }

    /// Parse the bare JSON document published for `key`.
    pub fn from_json(key: ContentKey, json: &str) -> SdmxResult<Self> {
        Ok(match key {
            ContentKey::Dataflows => MetadataContent::Dataflows(serde_json::from_str(json)?),
            ContentKey::Indicators => MetadataContent::Indicators(serde_json::from_str(json)?),
            ContentKey::Codelists => MetadataContent::Codelists(serde_json::from_str(json)?),
            ContentKey::Countries => MetadataContent::Countries(serde_json::from_str(json)?),
            ContentKey::Regions => MetadataContent::Regions(serde_json::from_str(json)?),
            ContentKey::FallbackSequences => {
                MetadataContent::FallbackSequences(serde_json::from_str(json)?)
            }
            ContentKey::Overrides => MetadataContent::Overrides(serde_json::from_str(json)?),
        })
    }

    /// Reject content that cannot be used safely, before it is cached.
    fn validate(&self) -> SdmxResult<()> {
        if let MetadataContent::FallbackSequences(entries) = self {
            FallbackSequences::new(entries.clone())?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub content: MetadataContent,
    pub fetched_at: DateTime<Utc>,
    pub source_platform: String,
}

/// Source of the current time, injectable so staleness can be tested deterministically.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock(RwLock<DateTime<Utc>>);

impl ManualClock {
    pub fn new(now: DateTime<Utc>) -> Self {
        Self(RwLock::new(now))
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.0.write().unwrap_or_else(|e| e.into_inner());
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.0.read().unwrap_or_else(|e| e.into_inner())
    }
}

/// Key-value persistence for cache entries.
pub trait MetadataStore: Send + Sync {
    fn load(&self, key: ContentKey) -> SdmxResult<Option<CacheEntry>>;
    fn save(&self, key: ContentKey, entry: &CacheEntry) -> SdmxResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryStore(RwLock<HashMap<ContentKey, CacheEntry>>);

impl MetadataStore for MemoryStore {
    fn load(&self, key: ContentKey) -> SdmxResult<Option<CacheEntry>> {
        Ok(self
            .0
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned())
    }

    fn save(&self, key: ContentKey, entry: &CacheEntry) -> SdmxResult<()> {
        self.0
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, entry.clone());
        Ok(())
    }
}

#[cfg(feature = "cache")]
fn prepend<P: AsRef<Path>>(cache_path: P, file_name: &str) -> PathBuf {
    cache_path.as_ref().join(file_name)
}

/// Stores each entry as `{key}.json` in a directory.
// Only available with "cache" feature since it requires a filesystem
#[cfg(feature = "cache")]
#[derive(Debug, Clone)]
pub struct DirStore {
    dir: PathBuf,
}

#[cfg(feature = "cache")]
impl DirStore {
    pub fn new<P: AsRef<Path>>(dir: P) -> SdmxResult<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }
}

#[cfg(feature = "cache")]
impl MetadataStore for DirStore {
    fn load(&self, key: ContentKey) -> SdmxResult<Option<CacheEntry>> {
        let path = prepend(&self.dir, &key.file_name());
        match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(entry) => {
                    debug!("Loaded cached `{key}` from {}", path.display());
                    Ok(Some(entry))
                }
                Err(err) => {
                    warn!("Ignoring unreadable cache entry {}: {err}", path.display());
                    Ok(None)
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn save(&self, key: ContentKey, entry: &CacheEntry) -> SdmxResult<()> {
        let path = prepend(&self.dir, &key.file_name());
        let partial = prepend(&self.dir, &format!("{}.partial", key.file_name()));
        let file = std::fs::File::create(&partial)?;
        serde_json::to_writer(&file, entry)?;
        file.sync_all()?;
        std::fs::rename(&partial, &path)?;
        debug!("Wrote `{key}` to {}", path.display());
        Ok(())
    }
}

/// Where reference content is refreshed from.
#[allow(async_fn_in_trait)]
pub trait MetadataSource {
    /// Recorded as `source_platform` on every entry fetched from this source
    fn platform(&self) -> String;
    async fn fetch_content(&self, key: ContentKey) -> SdmxResult<MetadataContent>;
}

/// Serves fixed content, e.g. a snapshot bundled with an application or built in tests.
#[derive(Debug, Clone, Default)]
pub struct StaticSource {
    contents: BTreeMap<ContentKey, MetadataContent>,
}

impl StaticSource {
    pub fn new(contents: impl IntoIterator<Item = MetadataContent>) -> Self {
        Self {
            contents: contents.into_iter().map(|c| (c.key(), c)).collect(),
        }
    }
}

impl MetadataSource for StaticSource {
    fn platform(&self) -> String {
        "static".into()
    }

    async fn fetch_content(&self, key: ContentKey) -> SdmxResult<MetadataContent> {
        self.contents
            .get(&key)
            .cloned()
            .ok_or_else(|| SdmxError::MissingMetadata(format!("no `{key}` in static source")))
    }
}

/// Read-mostly cache of reference content with a staleness threshold.
///
/// Reads never block on staleness: a stale entry is returned as is and remembered, so
/// `refresh_stale` can bring it up to date on the next explicit call. Only a key with no
/// content anywhere (memory or store) is fetched synchronously.
pub struct MetadataCache<S, C = SystemClock> {
    source: S,
    store: Box<dyn MetadataStore>,
    clock: C,
    staleness: chrono::Duration,
    entries: RwLock<HashMap<ContentKey, CacheEntry>>,
    pending_refresh: RwLock<BTreeSet<ContentKey>>,
}

impl<S: MetadataSource> MetadataCache<S> {
    pub fn new(source: S, store: Box<dyn MetadataStore>, staleness: chrono::Duration) -> Self {
        Self::new_with_clock(source, store, staleness, SystemClock)
    }
}

impl<S: MetadataSource, C: Clock> MetadataCache<S, C> {
    pub fn new_with_clock(
        source: S,
        store: Box<dyn MetadataStore>,
        staleness: chrono::Duration,
        clock: C,
    ) -> Self {
        Self {
            source,
            store,
            clock,
            staleness,
            entries: RwLock::new(HashMap::new()),
            pending_refresh: RwLock::new(BTreeSet::new()),
        }
    }

    fn age(&self, entry: &CacheEntry) -> chrono::Duration {
        self.clock.now() - entry.fetched_at
    }

    fn cached(&self, key: ContentKey) -> Option<CacheEntry> {
        self.entries
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&key)
            .cloned()
    }

    /// Whether `key` is older than the staleness threshold. Missing content counts as stale.
    pub fn is_stale(&self, key: ContentKey) -> SdmxResult<bool> {
        let entry = match self.cached(key) {
            Some(entry) => Some(entry),
            None => self.store.load(key)?,
        };
        Ok(entry.map_or(true, |entry| self.age(&entry) > self.staleness))
    }

    /// Content for `key`, with a warning when it is stale.
    pub async fn get(&self, key: ContentKey) -> SdmxResult<(MetadataContent, Option<Warning>)> {
        let entry = match self.cached(key) {
            Some(entry) => entry,
            None => match self.store.load(key)? {
                Some(entry) => {
                    self.entries
                        .write()
                        .unwrap_or_else(|e| e.into_inner())
                        .insert(key, entry.clone());
                    entry
                }
                None => {
                    info!("No cached `{key}`; fetching");
                    self.refresh(key).await?
                }
            },
        };
        let age = self.age(&entry);
        let warning = if age > self.staleness {
            warn!("Cached `{key}` is {} days old", age.num_days());
            self.pending_refresh
                .write()
                .unwrap_or_else(|e| e.into_inner())
                .insert(key);
            Some(Warning::StaleMetadata {
                key,
                age_days: age.num_days(),
            })
        } else {
            None
        };
        Ok((entry.content, warning))
    }

    /// Fetch `key` from the source and overwrite the cached copy.
    pub async fn refresh(&self, key: ContentKey) -> SdmxResult<CacheEntry> {
        info!("Refreshing `{key}` from {}", self.source.platform());
        let content = self.source.fetch_content(key).await?;
        if content.key() != key {
            return Err(SdmxError::MissingMetadata(format!(
                "source returned `{}` when asked for `{key}`",
                content.key()
            )));
        }
        content.validate()?;
        let entry = CacheEntry {
            content,
            fetched_at: self.clock.now(),
            source_platform: self.source.platform(),
        };
        self.store.save(key, &entry)?;
        self.entries
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, entry.clone());
        self.pending_refresh
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&key);
        Ok(entry)
    }

    /// Refresh every key read as stale since the last refresh. Returns the keys refreshed.
    pub async fn refresh_stale(&self) -> SdmxResult<Vec<ContentKey>> {
        let pending: Vec<ContentKey> = self
            .pending_refresh
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .copied()
            .collect();
        for key in &pending {
            self.refresh(*key).await?;
        }
        Ok(pending)
    }

    pub async fn refresh_all(&self) -> SdmxResult<()> {
        try_join_all(ContentKey::iter().map(|key| self.refresh(key))).await?;
        Ok(())
    }

    /// Snapshot of every key, read-only for the duration of one request.
    pub async fn reference_data(&self) -> SdmxResult<(ReferenceData, Vec<Warning>)> {
        let loaded = try_join_all(ContentKey::iter().map(|key| self.get(key))).await?;
        let mut warnings = vec![];
        let mut contents = vec![];
        for (content, warning) in loaded {
            warnings.extend(warning);
            contents.push(content);
        }
        Ok((ReferenceData::from_contents(contents)?, warnings))
    }
}

/// Immutable view over all reference content used by one pipeline run.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReferenceData {
    pub dataflows: BTreeMap<String, Dataflow>,
    pub indicators: BTreeMap<String, IndicatorInfo>,
    pub codelists: BTreeMap<String, BTreeMap<String, String>>,
    pub countries: BTreeMap<String, CountryInfo>,
    pub regions: BTreeMap<String, String>,
    pub fallback_sequences: FallbackSequences,
    pub overrides: BTreeMap<String, String>,
}

impl ReferenceData {
    pub fn from_contents(contents: impl IntoIterator<Item = MetadataContent>) -> SdmxResult<Self> {
        let mut reference = ReferenceData::default();
        for content in contents {
            match content {
                MetadataContent::Dataflows(dataflows) => {
                    reference.dataflows =
                        dataflows.into_iter().map(|d| (d.id.clone(), d)).collect()
                }
                MetadataContent::Indicators(indicators) => {
                    reference.indicators =
                        indicators.into_iter().map(|i| (i.code.clone(), i)).collect()
                }
                MetadataContent::Codelists(codelists) => reference.codelists = codelists,
                MetadataContent::Countries(countries) => reference.countries = countries,
                MetadataContent::Regions(regions) => reference.regions = regions,
                MetadataContent::FallbackSequences(entries) => {
                    reference.fallback_sequences = FallbackSequences::new(entries)?
                }
                MetadataContent::Overrides(overrides) => reference.overrides = overrides,
            }
        }
        Ok(reference)
    }

    pub fn geo_kind(&self, geo_code: &str) -> GeoKind {
        if self.regions.contains_key(geo_code) {
            GeoKind::Aggregate
        } else {
            GeoKind::Country
        }
    }

    pub fn geo_name(&self, geo_code: &str) -> Option<&str> {
        self.countries
            .get(geo_code)
            .map(|c| c.name.as_str())
            .or_else(|| self.regions.get(geo_code).map(String::as_str))
    }

    /// Dimensions `dataset` declares, or `None` for a dataset without metadata. Dimensions
    /// listed without values take them from the `CL_{column}` codelist when one is loaded.
    pub fn supported_dimensions(&self, dataset: &str) -> Option<SupportedDimensions> {
        let dataflow = self.dataflows.get(dataset)?;
        let dimensions = dataflow.dimensions.iter().map(|info| {
            let mut info = info.clone();
            if info.values.is_empty() {
                if let Some(codes) = self.codelists.get(&codelist_id(info.dimension)) {
                    info.values = codes.keys().cloned().collect();
                }
            }
            info
        });
        Some(SupportedDimensions::new(dimensions))
    }

    pub fn indicator_name(&self, code: &str) -> Option<&str> {
        self.indicators.get(code).map(|i| i.name.as_str())
    }

    /// Country attributes keyed by geography code, for left-joining onto observations.
    pub fn countries_df(&self) -> polars::error::PolarsResult<DataFrame> {
        let codes: Vec<&str> = self.countries.keys().map(String::as_str).collect();
        let regions: Vec<Option<&str>> = self
            .countries
            .values()
            .map(|c| c.region.as_deref())
            .collect();
        let income_groups: Vec<Option<&str>> = self
            .countries
            .values()
            .map(|c| c.income_group.as_deref())
            .collect();
        let continents: Vec<Option<&str>> = self
            .countries
            .values()
            .map(|c| c.continent.as_deref())
            .collect();
        df!(
            COL::GEO_CODE => codes,
            COL::REGION => regions,
            COL::INCOME_GROUP => income_groups,
            COL::CONTINENT => continents
        )
    }
}
