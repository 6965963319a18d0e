use std::fs::File;
use std::path::Path;

use anyhow::Context;
use clap::{command, Args, Parser, Subcommand};
use enum_dispatch::enum_dispatch;
use log::{debug, info};
use nonempty::NonEmpty;
use polars::frame::DataFrame;
use sdmxget::{
    config::Config,
    fetcher::SdmxClient,
    filter::DimensionFilterSpec,
    format::OutputMode,
    formatters::{
        CsvFormatter, JsonFormatter, JsonLinesFormatter, OutputFormatter, OutputGenerator,
    },
    metadata::ContentKey,
    observation::Dimension,
    request::{DataRequest, PeriodSpec, PostProcessOptions},
    IndicatorClient,
};
use serde::{Deserialize, Serialize};
use spinners::{Spinner, Spinners};
use strum_macros::EnumString;

use crate::display::{
    display_candidates, display_countries, display_dataflows, display_frame, display_indicators,
};
use crate::error::SdmxCliResult;

const DEFAULT_PROGRESS_SPINNER: Spinners = Spinners::Dots;
const COMPLETE_PROGRESS_STRING: &str = "✔";
const RUNNING_TAIL_STRING: &str = "...";
const LOADING_METADATA_STRING: &str = "Loading reference metadata";
const MAX_LISTED_RESULTS: usize = 50;

/// Defines the output formats we are able to produce data in.
#[derive(Clone, Debug, Deserialize, Serialize, EnumString, PartialEq, Eq)]
#[strum(ascii_case_insensitive)]
pub enum OutputFormat {
    Csv,
    Json,
    #[strum(serialize = "jsonl", serialize = "jsonlines")]
    JsonLines,
    Table,
}

impl TryFrom<&OutputFormat> for OutputFormatter {
    type Error = anyhow::Error;

    fn try_from(value: &OutputFormat) -> Result<Self, Self::Error> {
        match value {
            OutputFormat::Csv => Ok(OutputFormatter::Csv(CsvFormatter)),
            OutputFormat::Json => Ok(OutputFormatter::Json(JsonFormatter)),
            OutputFormat::JsonLines => Ok(OutputFormatter::JsonLines(JsonLinesFormatter)),
            OutputFormat::Table => Err(anyhow::anyhow!("tables are displayed, not serialized")),
        }
    }
}

fn write_output<T, U>(
    output_generator: T,
    mut data: DataFrame,
    output_file: Option<U>,
) -> SdmxCliResult<()>
where
    T: OutputGenerator,
    U: AsRef<Path>,
{
    if let Some(output_file) = output_file {
        let mut f = File::create(output_file).context("Failed to write output")?;
        output_generator.save(&mut f, &mut data)?;
    } else {
        let mut stdout_lock = std::io::stdout().lock();
        output_generator.save(&mut stdout_lock, &mut data)?;
    };
    Ok(())
}

fn start_spinner(quiet: bool, message: &str) -> Option<Spinner> {
    (!quiet).then(|| {
        Spinner::with_timer(
            DEFAULT_PROGRESS_SPINNER,
            message.to_string() + RUNNING_TAIL_STRING,
        )
    })
}

fn stop_spinner(sp: Option<Spinner>) {
    // sp.stop_and_persist is potentially a better method, but not obvious how to
    // store the timing.
    if let Some(mut s) = sp {
        s.stop_with_symbol(COMPLETE_PROGRESS_STRING)
    }
}

fn client(config: Config) -> SdmxCliResult<IndicatorClient<SdmxClient, SdmxClient>> {
    Ok(IndicatorClient::new_with_config(config)?)
}

/// Run a request through the pipeline and write the table in `output_format`.
async fn run_request(
    config: Config,
    request: &DataRequest,
    output_format: &OutputFormat,
    output_file: Option<&str>,
    quiet: bool,
) -> SdmxCliResult<()> {
    debug!("{request:#?}");
    let sp = start_spinner(quiet, "Downloading indicator data");
    let client = client(config)?;
    let result = client.get_data(request).await;
    stop_spinner(sp);
    let result = result?;
    for warning in &result.warnings {
        eprintln!("Warning: {warning}");
    }
    for (indicator, source) in &result.sources {
        match source {
            Some(dataset) => info!("{indicator} supplied by `{dataset}`"),
            None => eprintln!("No data found for {indicator} in {:?}", result.attempted),
        }
    }
    match output_format {
        OutputFormat::Table if output_file.is_none() => display_frame(&result.data, None)?,
        format => {
            let formatter = OutputFormatter::try_from(format)?;
            write_output(formatter, result.data, output_file)?;
        }
    }
    Ok(())
}

/// Trait that defines what to run when a given subcommand is invoked.
#[enum_dispatch]
pub trait RunCommand {
    async fn run(&self, config: Config) -> SdmxCliResult<()>;
}

/// Disaggregation filters. Values are comma-separated; `total` selects the dataset's total
/// and `all` disables the filter.
#[derive(Args, Debug, Clone, Default)]
pub struct FilterArgs {
    #[arg(long, value_delimiter = ',', help = "Filter by sex (defaults to the total)")]
    sex: Vec<String>,
    #[arg(long, value_delimiter = ',', help = "Filter by age group")]
    age: Vec<String>,
    #[arg(long, value_delimiter = ',', help = "Filter by wealth quintile")]
    wealth: Vec<String>,
    #[arg(long, value_delimiter = ',', help = "Filter by residence (urban/rural)")]
    residence: Vec<String>,
    #[arg(long, value_delimiter = ',', help = "Filter by maternal education level")]
    maternal_edu: Vec<String>,
}

impl From<FilterArgs> for DimensionFilterSpec {
    fn from(args: FilterArgs) -> Self {
        let mut spec = DimensionFilterSpec::new();
        for (dimension, values) in [
            (Dimension::Sex, args.sex),
            (Dimension::Age, args.age),
            (Dimension::Wealth, args.wealth),
            (Dimension::Residence, args.residence),
            (Dimension::MaternalEdu, args.maternal_edu),
        ] {
            if !values.is_empty() {
                spec.insert(dimension, values);
            }
        }
        spec
    }
}

#[derive(Args, Debug, Clone, Default)]
pub struct PostProcessArgs {
    #[arg(long, help = "Drop rows with no value")]
    dropna: bool,
    #[arg(long, help = "Drop duplicate rows instead of failing")]
    deduplicate: bool,
    #[arg(long, conflicts_with = "mrv", help = "Keep only the latest period per series")]
    latest: bool,
    #[arg(long, value_name = "N", help = "Keep the N most recent periods per series")]
    mrv: Option<usize>,
    #[arg(
        long,
        help = "Use the nearest available year when a requested year has no value"
    )]
    circa: bool,
    #[arg(long, help = "Add region, income group and continent columns")]
    add_metadata: bool,
    #[arg(long, help = "Keep only geography, indicator, period and value columns")]
    simplify: bool,
    #[arg(long, help = "Return the warehouse's columns with only identifiers renamed")]
    raw: bool,
}

impl From<PostProcessArgs> for PostProcessOptions {
    fn from(args: PostProcessArgs) -> Self {
        PostProcessOptions {
            dropna: args.dropna,
            deduplicate: args.deduplicate,
            latest: args.latest,
            mrv: args.mrv,
            circa: args.circa,
            add_metadata: args.add_metadata,
            simplify: args.simplify,
            raw: args.raw,
        }
    }
}

/// Command-line arguments that can be parsed into a `DataRequest`.
#[derive(Args, Debug, Clone)]
pub struct RequestArgs {
    #[arg(index = 1, required = true, num_args = 1.., help = "Indicator codes")]
    indicators: Vec<String>,
    #[arg(
        short,
        long,
        value_delimiter = ',',
        help = "Geography codes, comma-separated (ISO3 countries or aggregate regions)"
    )]
    geo: Vec<String>,
    // Note: a single argument so ranges and year lists are both written as one value,
    // e.g. `-p 2015...2023` or `-p 2015,2018,2020`.
    #[arg(
        short,
        long,
        value_name = "YEAR|START...|...END|START...END|YEAR,YEAR,...",
        value_parser = parse_period,
        help = "Periods to return. Ranges are inclusive."
    )]
    period: Option<PeriodSpec>,
    #[arg(
        short = 'w',
        long = "shape",
        value_name = "long|wide-by-period|wide-by-indicator|wide-by-DIMENSION",
        default_value = "long",
        value_parser = parse_output_mode,
        help = "Shape of the returned table"
    )]
    shape: OutputMode,
    #[command(flatten)]
    filter_args: FilterArgs,
    #[command(flatten)]
    post_process_args: PostProcessArgs,
}

impl TryFrom<RequestArgs> for DataRequest {
    type Error = anyhow::Error;

    fn try_from(args: RequestArgs) -> Result<Self, Self::Error> {
        let indicators = NonEmpty::from_vec(args.indicators)
            .ok_or_else(|| anyhow::anyhow!("at least one indicator code is required"))?;
        Ok(DataRequest {
            indicators,
            geo: (!args.geo.is_empty()).then_some(args.geo),
            period: args.period,
            filters: args.filter_args.into(),
            output: args.shape,
            options: args.post_process_args.into(),
        })
    }
}

fn parse_period(value: &str) -> anyhow::Result<PeriodSpec> {
    value.parse()
}

fn parse_output_mode(value: &str) -> anyhow::Result<OutputMode> {
    Ok(value.parse()?)
}

/// The `data` command fetches one or more indicators and outputs them in a given format.
#[derive(Args, Debug)]
pub struct DataCommand {
    #[command(flatten)]
    request_args: RequestArgs,
    #[arg(
        short = 'f',
        long,
        value_name = "csv|json|jsonl|table",
        default_value = "csv",
        help = "Output format for the results"
    )]
    output_format: OutputFormat,
    #[arg(short = 'o', long, help = "Output file to place the results")]
    output_file: Option<String>,
    #[arg(from_global)]
    quiet: bool,
}

impl RunCommand for DataCommand {
    async fn run(&self, config: Config) -> SdmxCliResult<()> {
        info!("Running `data` subcommand");
        let request: DataRequest = self.request_args.clone().try_into()?;
        run_request(
            config,
            &request,
            &self.output_format,
            self.output_file.as_deref(),
            self.quiet,
        )
        .await
    }
}

/// The Recipe command loads a JSON request file and generates the output data requested
#[derive(Args, Debug)]
pub struct RecipeCommand {
    #[arg(index = 1)]
    recipe_file: String,

    #[arg(short = 'f', long, default_value = "csv")]
    output_format: OutputFormat,

    #[arg(short = 'o', long)]
    output_file: Option<String>,

    #[arg(from_global)]
    quiet: bool,
}

impl RunCommand for RecipeCommand {
    async fn run(&self, config: Config) -> SdmxCliResult<()> {
        info!("Running `recipe` subcommand");
        let recipe = std::fs::read_to_string(&self.recipe_file).context(format!(
            "Failed to read recipe from file: {}",
            self.recipe_file
        ))?;
        let request: DataRequest = serde_json::from_str(&recipe)?;
        run_request(
            config,
            &request,
            &self.output_format,
            self.output_file.as_deref(),
            self.quiet,
        )
        .await
    }
}

/// The Resolve command prints the datasets an indicator would be fetched from.
#[derive(Args, Debug)]
pub struct ResolveCommand {
    #[arg(index = 1, required = true, num_args = 1.., help = "Indicator codes")]
    indicators: Vec<String>,
    #[arg(from_global)]
    quiet: bool,
}

impl RunCommand for ResolveCommand {
    async fn run(&self, config: Config) -> SdmxCliResult<()> {
        info!("Running `resolve` subcommand");
        let sp = start_spinner(self.quiet, LOADING_METADATA_STRING);
        let client = client(config)?;
        let mut resolved = vec![];
        for indicator in &self.indicators {
            let (candidates, _) = client.resolve(indicator).await?;
            resolved.push((indicator.clone(), candidates));
        }
        stop_spinner(sp);
        display_candidates(&resolved)?;
        Ok(())
    }
}

/// The Indicators command lists the indicator registry, optionally filtered by a search term.
#[derive(Args, Debug)]
pub struct IndicatorsCommand {
    #[arg(
        index = 1,
        help = "Case-insensitive text to match against indicator codes and names"
    )]
    search: Option<String>,
    #[arg(
        long,
        help = "Show all indicators even if there are a large number"
    )]
    full: bool,
    #[arg(from_global)]
    quiet: bool,
}

impl RunCommand for IndicatorsCommand {
    async fn run(&self, config: Config) -> SdmxCliResult<()> {
        info!("Running `indicators` subcommand");
        let sp = start_spinner(self.quiet, LOADING_METADATA_STRING);
        let (reference, _) = client(config)?.reference_data().await?;
        stop_spinner(sp);
        display_indicators(
            &reference,
            self.search.as_deref(),
            (!self.full).then_some(MAX_LISTED_RESULTS),
        )?;
        Ok(())
    }
}

/// The Dataflows command lists the datasets and the disaggregations each supports.
#[derive(Args, Debug)]
pub struct DataflowsCommand {
    #[arg(from_global)]
    quiet: bool,
}

impl RunCommand for DataflowsCommand {
    async fn run(&self, config: Config) -> SdmxCliResult<()> {
        info!("Running `dataflows` subcommand");
        let sp = start_spinner(self.quiet, LOADING_METADATA_STRING);
        let (reference, _) = client(config)?.reference_data().await?;
        stop_spinner(sp);
        display_dataflows(&reference)?;
        Ok(())
    }
}

/// The Countries command lists the countries, and optionally aggregate regions, with data.
#[derive(Args, Debug)]
pub struct CountriesCommand {
    #[arg(long, help = "Also list aggregate regions")]
    regions: bool,
    #[arg(from_global)]
    quiet: bool,
}

impl RunCommand for CountriesCommand {
    async fn run(&self, config: Config) -> SdmxCliResult<()> {
        info!("Running `countries` subcommand");
        let sp = start_spinner(self.quiet, LOADING_METADATA_STRING);
        let (reference, _) = client(config)?.reference_data().await?;
        stop_spinner(sp);
        println!("\nThe following countries are available:");
        display_countries(&reference, self.regions)?;
        Ok(())
    }
}

/// The Refresh command re-downloads cached reference metadata.
#[derive(Args, Debug)]
pub struct RefreshCommand {
    #[arg(
        index = 1,
        value_name = "KEY",
        help = "\
            Metadata key to refresh: dataflows, indicators, codelists, countries, regions,\n\
            fallback_sequences or overrides. All keys when omitted."
    )]
    key: Option<ContentKey>,
    #[arg(long, conflicts_with = "key", help = "Only refresh keys older than the staleness window")]
    stale: bool,
    #[arg(from_global)]
    quiet: bool,
}

impl RunCommand for RefreshCommand {
    async fn run(&self, config: Config) -> SdmxCliResult<()> {
        info!("Running `refresh` subcommand");
        let sp = start_spinner(self.quiet, "Refreshing reference metadata");
        let client = client(config)?;
        let cache = client.metadata();
        let refreshed = match (self.key, self.stale) {
            (Some(key), _) => {
                cache.refresh(key).await?;
                vec![key]
            }
            (None, true) => {
                // Reading marks stale keys for refresh
                cache.reference_data().await?;
                cache.refresh_stale().await?
            }
            (None, false) => {
                cache.refresh_all().await?;
                <ContentKey as strum::IntoEnumIterator>::iter().collect()
            }
        };
        stop_spinner(sp);
        println!("Refreshed {} key(s).", refreshed.len());
        for key in refreshed {
            println!("  {key}");
        }
        Ok(())
    }
}

/// The entrypoint for the CLI.
#[derive(Parser, Debug)]
#[command(version, about="sdmxget fetches indicator data from SDMX data warehouses", long_about = None, name="sdmxget")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,
    #[arg(
        short = 'q',
        long = "quiet",
        help = "\
            Do not print progress bar to stdout. Results, warnings and logs (when `RUST_LOG`\n\
            is set) will still be printed.",
        global = true
    )]
    quiet: bool,
}

/// Subcommands of the CLI. Each implements `RunCommand` and declares its own args.
#[derive(Subcommand, Debug)]
#[enum_dispatch(RunCommand)]
pub enum Commands {
    /// Output data for one or more indicators
    Data(DataCommand),
    /// Output data for a request stored as JSON
    Recipe(RecipeCommand),
    /// Show which datasets an indicator is fetched from, in fallback order
    Resolve(ResolveCommand),
    /// List and search available indicators
    Indicators(IndicatorsCommand),
    /// List datasets and their disaggregations
    Dataflows(DataflowsCommand),
    /// List countries for which data are available
    Countries(CountriesCommand),
    /// Refresh cached reference metadata
    Refresh(RefreshCommand),
}
