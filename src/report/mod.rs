//! # HTML report
//!
//! Renders the `report` block of a job description:
//!
//! ```json
//! {
//!   "keys": {"targets": "ABACU lcao", "datasets": "PP-ORB"},
//!   "content": [
//!     {"type": "head1", "content": "Summary"},
//!     {"type": "metrics", "title": "Energies", "content": "metrics.json",
//!      "metrics": ["energy"], "sort": ["energy"], "criteria": {"energy": "abs(x) < 1"}},
//!     {"type": "image", "content": "band.png"}
//!   ]
//! }
//! ```
//!
//! Block types: `head1`, `head2`, `head3`, `text`, `image`, `table`,
//! `metrics`, `supermetrics`. Unknown types are skipped; a missing or
//! unreadable file yields an empty block.

pub mod criteria;
pub mod table;

use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde_json::{Map, Value};
use tracing::{error, info, warn};

use crate::error::{Result, SuiteError};
use table::{
    criteria_html, format_metrics, format_rows, load_metrics, load_supermetrics,
    parse_criteria, read_csv, rotate, table_html,
};

/// Default report file name
pub const DEFAULT_REPORT_FILE: &str = "abacustest.html";

/// File holding the tested program version
pub const VERSION_FILE: &str = "version.dat";

/// Keys always listed first in the header table
const COMMON_KEYS: &[&str] = &["test_date", "version", "job_address"];

const HTML_HEAD: &str = r#"
<html>
<head>
    <meta charset="UTF-8">
    <meta name="viewport" content="width=device-width, initial-scale=1.0">
    <style>
        body { text-align: left; }
        .head1 { font-size: 20px; font-weight: bold; white-space: pre-wrap; line-height: 2; }
        .head2 { font-size: 18px; font-weight: bold; white-space: pre-wrap; line-height: 2; }
        .head3 { font-size: 16px; font-weight: bold; white-space: pre-wrap; line-height: 2; }
        .tabletitle, .imagetitle { font-size: 16px; font-weight: bold; word-wrap: break-word; line-height: 2; }
        .doc {
            font-family: Verdana, sans-serif;
            display: inline-block;
            font-size: 16px;
            width: 100%;
            word-wrap: break-word;
            white-space: pre-wrap;
            line-height: 1.5;
        }
        #keys table { border-collapse: collapse; width: 100%; }
        #keys td { border: none; padding: 5px; text-align: left; line-height: 0.8; }
        img { max-width: 600px; height: auto; cursor: zoom-in; }
        .overlay {
            display: none;
            position: fixed;
            top: 0; left: 0; right: 0; bottom: 0;
            background-color: rgba(0, 0, 0, 0.8);
            z-index: 1000;
            overflow: auto;
        }
        .overlay img {
            position: absolute;
            top: 50%; left: 50%;
            transform: translate(-50%, -50%);
            max-width: 100%; max-height: 100%;
            object-fit: contain;
            cursor: zoom-out;
        }
    </style>
</head>
"#;

const ZOOM_SCRIPT: &str = r#"
    <script>
        function openFullscreen() {
            document.getElementById("overlay").style.display = "block";
        }
        function closeFullscreen() {
            document.getElementById("overlay").style.display = "none";
        }
    </script>
"#;

/// Values filled into empty common keys
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReportMeta {
    pub test_date: String,
    pub version: String,
    pub job_address: Option<String>,
}

impl ReportMeta {
    /// Date from `started_at`, version from `version.dat` under `dir`
    pub fn collect(dir: &Path, started_at: DateTime<Local>, job_address: Option<String>) -> Self {
        let version = fs::read_to_string(dir.join(VERSION_FILE))
            .map(|v| v.trim().to_string())
            .unwrap_or_default();
        Self {
            test_date: started_at.format("%Y-%m-%d").to_string(),
            version,
            job_address,
        }
    }
}

/// Renders report settings into one HTML page
pub struct ReportRenderer {
    /// Directory content files are resolved against
    base_dir: PathBuf,
    meta: ReportMeta,
}

impl ReportRenderer {
    pub fn new(base_dir: impl Into<PathBuf>, meta: ReportMeta) -> Self {
        Self {
            base_dir: base_dir.into(),
            meta,
        }
    }

    pub fn render(&self, settings: &Value) -> Result<String> {
        let Some(settings) = settings.as_object() else {
            return Err(SuiteError::Report {
                details: "report setting should be a mapping".to_string(),
            });
        };
        let empty = Map::new();
        let keys = settings
            .get("keys")
            .and_then(Value::as_object)
            .unwrap_or(&empty);
        let content = settings
            .get("content")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);

        let mut html = format!("{}\n<body>\n{}\n", HTML_HEAD, self.keys_html(keys));
        let mut has_image = false;

        for block in content {
            let kind = block.get("type").and_then(Value::as_str).unwrap_or("text");
            match kind {
                "head1" | "head2" | "head3" => html.push_str(&format!(
                    "\t<div class=\"{}\">{}</div>\n",
                    kind,
                    text_of(block.get("content"))
                )),
                "text" => html.push_str(&text_html(block)),
                "image" => {
                    let rendered = self.image_html(block);
                    has_image |= !rendered.is_empty();
                    html.push_str(&rendered);
                }
                "table" => html.push_str(&self.or_empty(kind, self.table_block(block))),
                "metrics" => html.push_str(&self.or_empty(kind, self.metrics_block(block))),
                "supermetrics" => {
                    html.push_str(&self.or_empty(kind, self.supermetrics_block(block)))
                }
                other => warn!(kind = other, "unknown report block type, skipped"),
            }
        }

        if has_image {
            html.push_str(ZOOM_SCRIPT);
        }
        html.push_str("\n</body>\n</html>");
        Ok(html)
    }

    /// Render and write to `output`
    pub fn write(&self, settings: &Value, output: &Path) -> Result<PathBuf> {
        let html = self.render(settings)?;
        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        fs::write(output, html)?;
        info!(path = %output.display(), "Report generated");
        Ok(output.to_path_buf())
    }

    fn or_empty(&self, kind: &str, block: Result<String>) -> String {
        block.unwrap_or_else(|e| {
            error!(kind, error = %e, "report block skipped");
            String::new()
        })
    }

    fn keys_html(&self, keys: &Map<String, Value>) -> String {
        let filled = |key: &str| -> String {
            let given = keys.get(key).map(table::cell_text).unwrap_or_default();
            if !given.is_empty() {
                return given;
            }
            match key {
                "test_date" => self.meta.test_date.clone(),
                "version" => self.meta.version.clone(),
                "job_address" => self
                    .meta
                    .job_address
                    .as_ref()
                    .map(|a| format!("<a href=\"{}\">link</a>", a))
                    .unwrap_or_default(),
                _ => String::new(),
            }
        };

        let mut html = String::from("\t<table id=\"keys\">\n");
        let rest = keys
            .keys()
            .map(String::as_str)
            .filter(|k| !COMMON_KEYS.contains(k));
        for key in COMMON_KEYS.iter().copied().chain(rest) {
            html.push_str(&format!(
                "\t\t<tr><td><strong>{}</strong></td><td>:</td><td>{}</td></tr>\n",
                capitalize(key),
                filled(key)
            ));
        }
        html.push_str("\t</table>\n");
        html
    }

    fn content_path(&self, block: &Value) -> Result<PathBuf> {
        let name = block
            .get("content")
            .and_then(Value::as_str)
            .unwrap_or_default();
        let path = self.base_dir.join(name);
        if name.is_empty() || !path.is_file() {
            return Err(SuiteError::Report {
                details: format!("{} does not exist", path.display()),
            });
        }
        Ok(path)
    }

    fn image_html(&self, block: &Value) -> String {
        if let Err(e) = self.content_path(block) {
            error!(error = %e, "image skipped");
            return String::new();
        }
        let src = text_of(block.get("content"));
        let mut html = format!(
            "\n    <img id=\"myImage\" src=\"{src}\" onclick=\"openFullscreen()\">\n    \
             <div class=\"overlay\" id=\"overlay\" onclick=\"closeFullscreen()\">\n        \
             <img id=\"fullscreenImage\" src=\"{src}\">\n    </div>\n",
            src = src
        );
        html.push_str(&title_html(block, "imagetitle"));
        html
    }

    fn table_block(&self, block: &Value) -> Result<String> {
        let path = self.content_path(block)?;
        if table::extension(&path) != "csv" {
            return Err(SuiteError::Report {
                details: format!("table file '{}' is not a .csv file", path.display()),
            });
        }
        let table = read_csv(&path)?;
        Ok(title_html(block, "tabletitle") + &table_html(&table, true))
    }

    fn metrics_block(&self, block: &Value) -> Result<String> {
        let path = self.content_path(block)?;
        let table = load_metrics(&path)?;
        if table.is_empty() {
            return Ok(String::new());
        }
        let criteria = parse_criteria(block.get("criteria"));
        let (table, summary) = format_metrics(
            &table,
            &string_list(block.get("metrics")),
            &string_list(block.get("sort")),
            &criteria,
        );

        let mut html = title_html(block, "tabletitle");
        if !criteria.is_empty() {
            html.push_str(&criteria_html(&summary));
        }
        html.push_str(&table_html(&table, true));
        Ok(html)
    }

    fn supermetrics_block(&self, block: &Value) -> Result<String> {
        let path = self.content_path(block)?;
        let table = load_supermetrics(&path)?;
        if table.is_empty() {
            return Ok(String::new());
        }
        let criteria = parse_criteria(block.get("criteria"));
        let (table, _) = format_rows(&table, &criteria);
        // one header row of metric names over one row of values
        Ok(title_html(block, "tabletitle") + &table_html(&rotate(&table), false))
    }
}

fn title_html(block: &Value, class: &str) -> String {
    match block.get("title").map(table::cell_text).filter(|t| !t.is_empty()) {
        Some(title) => format!("\t<div class=\"{}\">{}</div>\n", class, title),
        None => String::new(),
    }
}

fn text_html(block: &Value) -> String {
    let lines: Vec<String> = match block.get("content") {
        Some(Value::String(s)) => s.split('\n').map(str::to_string).collect(),
        Some(Value::Array(items)) => items.iter().map(table::cell_text).collect(),
        None => Vec::new(),
        Some(other) => {
            error!(content = %other, "text content should be a string or a list, skipped");
            return String::new();
        }
    };
    lines
        .iter()
        .map(|line| format!("\t<div class=\"doc\">    {}</div>\n", line))
        .collect()
}

fn text_of(value: Option<&Value>) -> String {
    value.map(table::cell_text).unwrap_or_default()
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items.iter().map(table::cell_text).collect(),
        Some(Value::String(s)) => vec![s.clone()],
        _ => Vec::new(),
    }
}

fn capitalize(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => String::new(),
    }
}
