use colored::*;
use prettytable::{format, Cell, Row as TableRow, Table};
use serde_json::Value as JsonValue;
use terminal_size::{terminal_size, Width};

use crate::connection::Row;
use crate::error::MalloyResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    Table,
    Json,
    Csv,
}

/// Get terminal width or default to 120
fn get_terminal_width() -> usize {
    terminal_size()
        .map(|(Width(w), _)| w as usize)
        .unwrap_or(120)
}

/// Truncate string to fit max width with ellipsis
fn truncate_str(s: &str, max_width: usize) -> String {
    if s.chars().count() <= max_width {
        s.to_string()
    } else if max_width <= 3 {
        s.chars().take(max_width).collect()
    } else {
        let mut result: String = s.chars().take(max_width - 3).collect();
        result.push_str("...");
        result
    }
}

pub fn format_rows(rows: &[Row], format: OutputFormat) -> MalloyResult<String> {
    match format {
        OutputFormat::Table => Ok(format_as_table(rows, get_terminal_width())),
        OutputFormat::Json => Ok(serde_json::to_string_pretty(rows)?),
        OutputFormat::Csv => Ok(format_as_csv(rows)),
    }
}

/// Parse the `results` string of a payload back into rows.
pub fn parse_rows(results: &str) -> MalloyResult<Vec<Row>> {
    Ok(serde_json::from_str(results)?)
}

fn column_names(rows: &[Row]) -> Vec<String> {
    rows.first()
        .map(|r| r.keys().cloned().collect())
        .unwrap_or_default()
}

fn format_as_table(rows: &[Row], terminal_width: usize) -> String {
    if rows.is_empty() {
        return format!("{}", "Empty result set".yellow());
    }

    let columns = column_names(rows);
    let num_cols = columns.len();
    if num_cols == 0 {
        return format!("{}", "No columns in result".yellow());
    }

    // 3 chars per column (| x |) + 1 for the final border
    let border_overhead = (num_cols * 3) + 1;
    let available_width = terminal_width.saturating_sub(border_overhead).max(num_cols);
    let min_col_width = 3;
    let col_width = (available_width / num_cols).max(min_col_width).min(50);

    let data_rows: Vec<Vec<String>> = rows
        .iter()
        .map(|row| columns.iter().map(|c| display_value(row.get(c))).collect())
        .collect();

    let mut col_max_widths: Vec<usize> = columns
        .iter()
        .map(|c| c.chars().count().min(col_width))
        .collect();
    for row_data in &data_rows {
        for (i, cell) in row_data.iter().enumerate() {
            col_max_widths[i] = col_max_widths[i].max(cell.chars().count().min(col_width));
        }
    }

    let total_width: usize = col_max_widths.iter().sum();
    if total_width > available_width {
        let scale = available_width as f64 / total_width as f64;
        for width in &mut col_max_widths {
            *width = ((*width as f64 * scale) as usize).max(min_col_width);
        }
    }

    let mut table = Table::new();
    table.set_format(*format::consts::FORMAT_BOX_CHARS);

    let header_cells: Vec<Cell> = columns
        .iter()
        .enumerate()
        .map(|(i, name)| Cell::new(&truncate_str(name, col_max_widths[i])).style_spec("Fb"))
        .collect();
    table.add_row(TableRow::new(header_cells));

    for row_data in data_rows {
        let cells: Vec<Cell> = row_data
            .iter()
            .enumerate()
            .map(|(i, cell)| Cell::new(&truncate_str(cell, col_max_widths[i])))
            .collect();
        table.add_row(TableRow::new(cells));
    }

    let mut output = table.to_string();
    output.push_str(&format!("\n{} row(s) returned\n", rows.len().to_string().cyan()));
    output
}

fn format_as_csv(rows: &[Row]) -> String {
    let columns = column_names(rows);
    let mut output = String::new();

    if columns.is_empty() {
        return output;
    }

    output.push_str(
        &columns
            .iter()
            .map(|c| escape_csv_value(c))
            .collect::<Vec<_>>()
            .join(","),
    );
    output.push('\n');

    for row in rows {
        let values: Vec<String> = columns
            .iter()
            .map(|c| escape_csv_value(&csv_value(row.get(c))))
            .collect();
        output.push_str(&values.join(","));
        output.push('\n');
    }

    output
}

fn display_value(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => "NULL".to_string(),
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn csv_value(value: Option<&JsonValue>) -> String {
    match value {
        None | Some(JsonValue::Null) => String::new(),
        Some(other) => display_value(Some(other)),
    }
}

fn escape_csv_value(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}
