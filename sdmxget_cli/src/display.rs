use comfy_table::{presets::NOTHING, *};
use itertools::Itertools;

use nonempty::NonEmpty;
use polars::prelude::*;
use sdmxget::metadata::ReferenceData;

/// Table with the shared borderless style used by every listing.
fn styled_table(headers: Vec<&str>) -> Table {
    let mut table = Table::new();
    table
        .load_preset(NOTHING)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(
            headers
                .into_iter()
                .map(|header| Cell::new(header).add_attribute(Attribute::Bold))
                .collect_vec(),
        )
        .set_style(comfy_table::TableComponent::BottomBorder, '─')
        .set_style(comfy_table::TableComponent::MiddleHeaderIntersections, '─')
        .set_style(comfy_table::TableComponent::HeaderLines, '─')
        .set_style(comfy_table::TableComponent::BottomBorderIntersections, '─')
        .set_style(comfy_table::TableComponent::TopBorder, '─')
        .set_style(comfy_table::TableComponent::TopBorderIntersections, '─');
    table
}

/// Print any data frame, one table row per frame row. Nulls print as blanks.
pub fn display_frame(df: &DataFrame, max_results: Option<usize>) -> anyhow::Result<()> {
    let df_to_show = match max_results {
        Some(max) => df.head(Some(max)),
        None => df.clone(),
    };
    let columns = df_to_show
        .get_columns()
        .iter()
        .map(|series| {
            Ok(series
                .cast(&DataType::String)?
                .str()?
                .into_iter()
                .map(|v| v.unwrap_or_default().to_string())
                .collect_vec())
        })
        .collect::<PolarsResult<Vec<_>>>()?;
    let mut table = styled_table(df_to_show.get_column_names());
    for row in 0..df_to_show.height() {
        table.add_row(columns.iter().map(|column| column[row].as_str()).collect_vec());
    }
    println!("\n{}", table);
    if df.height() > df_to_show.height() {
        println!(
            "{} more rows not shown. Use --full to show all rows.",
            df.height() - df_to_show.height()
        );
    }
    Ok(())
}

/// Indicators whose code or name contains `search`, ignoring case.
pub fn display_indicators(
    reference: &ReferenceData,
    search: Option<&str>,
    max_results: Option<usize>,
) -> anyhow::Result<()> {
    let needle = search.map(str::to_lowercase);
    let matches = reference
        .indicators
        .values()
        .filter(|info| {
            needle.as_deref().map_or(true, |needle| {
                info.code.to_lowercase().contains(needle)
                    || info.name.to_lowercase().contains(needle)
            })
        })
        .collect_vec();
    println!("Found {} indicator(s).", matches.len());
    let mut table = styled_table(vec!["Code", "Name", "Unit"]);
    for info in matches.iter().take(max_results.unwrap_or(usize::MAX)) {
        table.add_row(vec![
            info.code.as_str(),
            info.name.as_str(),
            info.unit.as_deref().unwrap_or_default(),
        ]);
    }
    println!("\n{}", table);
    if let Some(max) = max_results.filter(|max| matches.len() > *max) {
        println!(
            "{} more results not shown. Use --full to show all results.",
            matches.len() - max
        );
    }
    Ok(())
}

pub fn display_dataflows(reference: &ReferenceData) -> anyhow::Result<()> {
    let mut table = styled_table(vec!["Dataflow", "Name", "Dimensions"]);
    for dataflow in reference.dataflows.values() {
        let dimensions = dataflow
            .dimensions
            .iter()
            .map(|info| match info.values.len() {
                0 => info.dimension.to_string(),
                n => format!("{} ({n} values)", info.dimension),
            })
            .join(", ");
        table.add_row(vec![dataflow.id.clone(), dataflow.name.clone(), dimensions]);
    }
    println!("\n{}", table);
    Ok(())
}

pub fn display_countries(reference: &ReferenceData, include_regions: bool) -> anyhow::Result<()> {
    let mut table = styled_table(vec!["Code", "Name", "Region", "Income group", "Continent"]);
    for (code, country) in &reference.countries {
        table.add_row(vec![
            code.as_str(),
            country.name.as_str(),
            country.region.as_deref().unwrap_or_default(),
            country.income_group.as_deref().unwrap_or_default(),
            country.continent.as_deref().unwrap_or_default(),
        ]);
    }
    println!("\n{}", table);
    if include_regions {
        let mut table = styled_table(vec!["Code", "Aggregate region"]);
        for (code, name) in &reference.regions {
            table.add_row(vec![code.as_str(), name.as_str()]);
        }
        println!("\n{}", table);
    }
    Ok(())
}

pub fn display_candidates(resolved: &[(String, NonEmpty<String>)]) -> anyhow::Result<()> {
    let mut table = styled_table(vec!["Indicator", "Datasets (in query order)"]);
    for (code, candidates) in resolved {
        table.add_row(vec![code.clone(), candidates.iter().join(" → ")]);
    }
    let column = table
        .column_mut(0)
        .ok_or_else(|| anyhow::anyhow!("table has no columns"))?;
    column.set_cell_alignment(CellAlignment::Right);
    println!("\n{}", table);
    Ok(())
}
