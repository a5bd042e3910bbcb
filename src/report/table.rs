//! Table loading, criteria coloring and HTML output

use std::cmp::Ordering;
use std::fs;
use std::path::Path;

use serde_json::Value;
use tracing::warn;

use super::criteria::Criteria;
use crate::error::{Result, SuiteError};

/// Rows of string cells; for metric tables the first row is the header
pub type Table = Vec<Vec<String>>;

/// Header of the example-name column of metric tables
pub const EXAMPLE_COLUMN: &str = "example";

const PASS_COLOR: &str = "green";
const FAIL_COLOR: &str = "red";

/// Pass / total counter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassCount {
    pub pass: usize,
    pub total: usize,
}

impl PassCount {
    fn record(&mut self, passed: bool) {
        self.total += 1;
        if passed {
            self.pass += 1;
        }
    }

    pub fn all_passed(&self) -> bool {
        self.pass == self.total
    }

    pub fn percent(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.pass as f64 / self.total as f64 * 100.0
        }
    }
}

/// Per-criterion and overall results of a colored table
#[derive(Debug, Clone, Default)]
pub struct CriteriaSummary {
    pub columns: Vec<(String, Criteria, PassCount)>,
    /// Rows with at least one checked cell; a row passes when all its checks pass
    pub all: PassCount,
}

/// Text of a JSON cell
pub fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

pub fn read_csv(path: &Path) -> Result<Table> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)?;
    let mut table = Vec::new();
    for record in reader.records() {
        table.push(record?.iter().map(str::to_string).collect());
    }
    Ok(table)
}

fn read_json(path: &Path) -> Result<Value> {
    Ok(serde_json::from_str(&fs::read_to_string(path)?)?)
}

/// `{example: {metric: value}}` as a table with a header row
pub fn metrics_json_to_table(value: &Value) -> Result<Table> {
    let examples = value.as_object().ok_or_else(|| SuiteError::Report {
        details: "metrics file should map example names to metric objects".to_string(),
    })?;

    let mut header: Vec<String> = vec![EXAMPLE_COLUMN.to_string()];
    for metrics in examples.values() {
        if let Some(metrics) = metrics.as_object() {
            for key in metrics.keys() {
                if !header.contains(key) {
                    header.push(key.clone());
                }
            }
        }
    }

    let mut table = vec![header.clone()];
    for (example, metrics) in examples {
        let mut row = vec![example.clone()];
        for key in &header[1..] {
            row.push(metrics.get(key).map(cell_text).unwrap_or_default());
        }
        table.push(row);
    }
    Ok(table)
}

/// `{metric: value}` as `[metric, value]` rows
pub fn supermetrics_json_to_table(value: &Value) -> Result<Table> {
    let metrics = value.as_object().ok_or_else(|| SuiteError::Report {
        details: "supermetrics file should map metric names to values".to_string(),
    })?;
    Ok(metrics
        .iter()
        .map(|(k, v)| vec![k.clone(), cell_text(v)])
        .collect())
}

/// Load a metrics table from `.json` or `.csv`
pub fn load_metrics(path: &Path) -> Result<Table> {
    match extension(path).as_str() {
        "json" => metrics_json_to_table(&read_json(path)?),
        "csv" => read_csv(path),
        other => Err(SuiteError::Report {
            details: format!("metrics file type '{}' is not supported", other),
        }),
    }
}

pub fn load_supermetrics(path: &Path) -> Result<Table> {
    supermetrics_json_to_table(&read_json(path)?)
}

pub fn extension(path: &Path) -> String {
    path.extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

/// Transpose, padding short rows with empty cells
pub fn rotate(table: &Table) -> Table {
    let width = table.iter().map(Vec::len).max().unwrap_or(0);
    (0..width)
        .map(|c| {
            table
                .iter()
                .map(|row| row.get(c).cloned().unwrap_or_default())
                .collect()
        })
        .collect()
}

/// Parse `{column: expression}` in document order, skipping bad entries
pub fn parse_criteria(value: Option<&Value>) -> Vec<(String, Criteria)> {
    let Some(map) = value.and_then(Value::as_object) else {
        return Vec::new();
    };
    map.iter()
        .filter_map(|(column, expr)| {
            let Some(expr) = expr.as_str() else {
                warn!(column = %column, "criteria should be a string, skipped");
                return None;
            };
            match Criteria::parse(expr) {
                Ok(c) => Some((column.clone(), c)),
                Err(e) => {
                    warn!(column = %column, error = %e, "criteria skipped");
                    None
                }
            }
        })
        .collect()
}

fn color(text: &str, passed: bool) -> String {
    let c = if passed { PASS_COLOR } else { FAIL_COLOR };
    format!("<font color=\"{}\">{}</font>", c, text)
}

/// Numbers first (numerically), then other text
fn compare_cells(a: &str, b: &str) -> Ordering {
    match (a.trim().parse::<f64>(), b.trim().parse::<f64>()) {
        (Ok(x), Ok(y)) => x.total_cmp(&y),
        (Ok(_), Err(_)) => Ordering::Less,
        (Err(_), Ok(_)) => Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

/// Filter, sort and color a metrics table (first row is the header)
pub fn format_metrics(
    table: &Table,
    metrics: &[String],
    sort: &[String],
    criteria: &[(String, Criteria)],
) -> (Table, CriteriaSummary) {
    let Some((header, body)) = table.split_first() else {
        return (Vec::new(), CriteriaSummary::default());
    };

    let mut keep: Vec<usize> = vec![0];
    if metrics.is_empty() {
        keep.extend(1..header.len());
    } else {
        for metric in metrics {
            match header.iter().position(|h| h == metric) {
                Some(i) if !keep.contains(&i) => keep.push(i),
                Some(_) => {}
                None => warn!(metric = %metric, "metric is not in the table, skipped"),
            }
        }
    }

    let project = |row: &Vec<String>| -> Vec<String> {
        keep.iter()
            .map(|&i| row.get(i).cloned().unwrap_or_default())
            .collect()
    };
    let header: Vec<String> = project(header);
    let mut rows: Vec<Vec<String>> = body.iter().map(project).collect();

    let sort_columns: Vec<usize> = if sort.is_empty() {
        vec![0]
    } else {
        sort.iter()
            .filter_map(|key| header.iter().position(|h| h == key))
            .collect()
    };
    rows.sort_by(|a, b| {
        sort_columns
            .iter()
            .map(|&c| compare_cells(&a[c], &b[c]))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or(Ordering::Equal)
    });

    let mut summary = CriteriaSummary::default();
    let checks: Vec<(usize, usize)> = criteria
        .iter()
        .enumerate()
        .filter_map(|(k, (column, _))| header.iter().position(|h| h == column).map(|c| (k, c)))
        .collect();
    for (column, c) in criteria {
        summary
            .columns
            .push((column.clone(), c.clone(), PassCount::default()));
    }

    for row in &mut rows {
        let mut checked = false;
        let mut row_passed = true;
        for &(k, c) in &checks {
            let Ok(x) = row[c].trim().parse::<f64>() else {
                continue;
            };
            let passed = summary.columns[k].1.check(x);
            summary.columns[k].2.record(passed);
            row[c] = color(&row[c], passed);
            checked = true;
            row_passed &= passed;
        }
        if checked {
            summary.all.record(row_passed);
        }
    }

    let mut out = vec![header];
    out.extend(rows);
    (out, summary)
}

/// Color `[name, value]` rows whose name has a criterion
pub fn format_rows(table: &Table, criteria: &[(String, Criteria)]) -> (Table, CriteriaSummary) {
    let mut summary = CriteriaSummary {
        columns: criteria
            .iter()
            .map(|(k, c)| (k.clone(), c.clone(), PassCount::default()))
            .collect(),
        all: PassCount::default(),
    };
    let mut out = table.clone();
    for row in &mut out {
        let Some(name) = row.first().cloned() else {
            continue;
        };
        let Some(k) = summary.columns.iter().position(|(c, _, _)| *c == name) else {
            continue;
        };
        for cell in row.iter_mut().skip(1) {
            let Ok(x) = cell.trim().parse::<f64>() else {
                continue;
            };
            let passed = summary.columns[k].1.check(x);
            summary.columns[k].2.record(passed);
            summary.all.record(passed);
            *cell = color(cell, passed);
        }
    }
    (out, summary)
}

pub fn table_html(table: &Table, has_head: bool) -> String {
    let mut html = String::from("\n\t<table border=\"2px\">\n");
    let mut rows = table.iter();
    if has_head {
        if let Some(head) = rows.next() {
            html.push_str("\t\t<thead><tr>");
            for cell in head {
                html.push_str(&format!("<th>{}</th>", cell));
            }
            html.push_str("</tr></thead>\n");
        }
    }
    html.push_str("\t\t<tbody>");
    for row in rows {
        html.push_str("\t\t\t<tr>");
        for cell in row {
            html.push_str(&format!("<td>{}</td>", cell));
        }
        html.push_str("</tr>\n");
    }
    html.push_str("\t\t</tbody>\n\t</table>\n\n");
    html
}

/// Overall pass line plus one row per criterion
pub fn criteria_html(summary: &CriteriaSummary) -> String {
    let all = summary.all;
    let c = if all.all_passed() { PASS_COLOR } else { FAIL_COLOR };
    let mut html = format!(
        "<div class=\"head2\">Pass/Total: <font color=\"{}\">{}/{} ({:.2}%)</font></div>\n",
        c,
        all.pass,
        all.total,
        all.percent()
    );
    let mut table: Table = vec![vec![
        "metric".to_string(),
        "criteria".to_string(),
        "pass/total".to_string(),
    ]];
    for (column, criteria, count) in &summary.columns {
        table.push(vec![
            column.clone(),
            criteria.to_string(),
            color(&format!("{}/{}", count.pass, count.total), count.all_passed()),
        ]);
    }
    html.push_str(&table_html(&table, true));
    html
}
