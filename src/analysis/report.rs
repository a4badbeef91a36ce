use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use clap::ValueEnum;
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TraceQueryResult;
use crate::error::{PerftestError, Result};

const HTML_TEMPLATE: &str = include_str!("../../templates/report.html");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    Csv,
    Json,
    Html,
}

impl ReportFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Csv => "csv",
            Self::Json => "json",
            Self::Html => "html",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReportSummary {
    pub traces: usize,
    pub queries: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// Every (trace, query) outcome of one analysis, written once.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub format: ReportFormat,
    pub generated_at: DateTime<Utc>,
    pub summary: ReportSummary,
    pub sections: Vec<TraceQueryResult>,
}

impl Report {
    pub fn new(format: ReportFormat, traces: usize, queries: usize, sections: Vec<TraceQueryResult>) -> Self {
        let failed = sections.iter().filter(|s| s.error.is_some()).count();
        Self {
            format,
            generated_at: Utc::now(),
            summary: ReportSummary {
                traces,
                queries,
                succeeded: sections.len() - failed,
                failed,
            },
            sections,
        }
    }

    pub fn is_partial(&self) -> bool {
        self.summary.failed > 0
    }

    /// `<reports_dir>/report-<timestamp>.<ext>`
    pub fn default_path(&self, reports_dir: &Path) -> PathBuf {
        reports_dir.join(format!(
            "report-{}.{}",
            self.generated_at.format("%Y%m%d-%H%M%S"),
            self.format.extension()
        ))
    }

    pub fn render(&self) -> Result<String> {
        match self.format {
            ReportFormat::Csv => self.render_csv(),
            ReportFormat::Json => Ok(serde_json::to_string_pretty(self)?),
            ReportFormat::Html => self.render_html(),
        }
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let content = self.render()?;
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).map_err(PerftestError::at(parent))?;
        }
        fs::write(path, content).map_err(PerftestError::at(path))
    }

    /// One header covering every column seen, after `trace_file,query,error`.
    /// Sections without rows still get a line so failures stay visible.
    fn render_csv(&self) -> Result<String> {
        let mut columns: Vec<&str> = Vec::new();
        for section in &self.sections {
            for column in &section.columns {
                if !columns.contains(&column.as_str()) {
                    columns.push(column);
                }
            }
        }

        let mut writer = csv::Writer::from_writer(Vec::new());
        let mut header = vec!["trace_file", "query", "error"];
        header.extend(columns.iter().copied());
        writer.write_record(&header).map_err(csv_error)?;

        for section in &self.sections {
            let trace = section.source_trace.display().to_string();
            let error = section.error.clone().unwrap_or_default();
            if section.rows.is_empty() {
                let mut record = vec![trace, section.query_name.clone(), error];
                record.resize(header.len(), String::new());
                writer.write_record(&record).map_err(csv_error)?;
                continue;
            }
            for row in &section.rows {
                let mut record = vec![trace.clone(), section.query_name.clone(), error.clone()];
                for column in &columns {
                    let cell = section
                        .columns
                        .iter()
                        .position(|c| c == column)
                        .and_then(|idx| row.get(idx))
                        .map(cell_text)
                        .unwrap_or_default();
                    record.push(cell);
                }
                writer.write_record(&record).map_err(csv_error)?;
            }
        }

        let bytes = writer
            .into_inner()
            .map_err(|err| PerftestError::Report(err.to_string()))?;
        String::from_utf8(bytes).map_err(|err| PerftestError::Report(err.to_string()))
    }

    fn render_html(&self) -> Result<String> {
        let mut env = Environment::new();
        env.add_template("report.html", HTML_TEMPLATE)
            .map_err(|err| PerftestError::Report(err.to_string()))?;
        let template = env
            .get_template("report.html")
            .map_err(|err| PerftestError::Report(err.to_string()))?;
        template
            .render(context! { report => self })
            .map_err(|err| PerftestError::Report(err.to_string()))
    }
}

fn cell_text(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}

fn csv_error(err: csv::Error) -> PerftestError {
    PerftestError::Report(err.to_string())
}
