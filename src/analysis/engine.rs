use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;

use serde::Serialize;
use serde_json::{Number, Value};
use tracing::debug;

use super::queries::Query;
use crate::error::{PerftestError, Result};

/// Column names plus rows of JSON scalars, in query order.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct QueryTable {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Opens query sessions over trace files.
pub trait TraceProcessor {
    fn open(&self, trace: &Path) -> Result<Box<dyn TraceSession + '_>>;
}

pub trait TraceSession {
    fn query(&mut self, query: &Query) -> Result<QueryTable>;
}

/// Runs Perfetto's `trace_processor_shell` once per query.
pub struct ShellTraceProcessor {
    binary: PathBuf,
}

impl ShellTraceProcessor {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl TraceProcessor for ShellTraceProcessor {
    fn open(&self, trace: &Path) -> Result<Box<dyn TraceSession + '_>> {
        if !trace.is_file() {
            return Err(PerftestError::TraceFileNotFound(trace.to_path_buf()));
        }
        Ok(Box::new(ShellSession {
            binary: &self.binary,
            trace: trace.to_path_buf(),
        }))
    }
}

struct ShellSession<'a> {
    binary: &'a Path,
    trace: PathBuf,
}

impl TraceSession for ShellSession<'_> {
    fn query(&mut self, query: &Query) -> Result<QueryTable> {
        let failure = |message: String| PerftestError::Analysis {
            query: query.name.clone(),
            trace: self.trace.clone(),
            message,
        };

        let mut sql_file = tempfile::Builder::new()
            .suffix(".sql")
            .tempfile()
            .map_err(|err| failure(format!("cannot stage query: {err}")))?;
        sql_file
            .write_all(query.sql.as_bytes())
            .map_err(|err| failure(format!("cannot stage query: {err}")))?;

        debug!(query = %query.name, trace = %self.trace.display(), "Running trace processor");
        let output = Command::new(self.binary)
            .arg("--query-file")
            .arg(sql_file.path())
            .arg(&self.trace)
            .output()
            .map_err(|err| failure(format!("cannot run {}: {err}", self.binary.display())))?;

        let stderr = String::from_utf8_lossy(&output.stderr);
        if !output.status.success() {
            let detail = stderr
                .lines()
                .rev()
                .find(|line| !line.trim().is_empty())
                .unwrap_or("no diagnostic output");
            return Err(failure(format!("{} ({detail})", output.status)));
        }

        parse_csv_output(&String::from_utf8_lossy(&output.stdout)).map_err(failure)
    }
}

/// Parse the shell's CSV output: a header row then data rows, `[NULL]` for
/// nulls.
pub fn parse_csv_output(output: &str) -> std::result::Result<QueryTable, String> {
    if output.trim().is_empty() {
        return Ok(QueryTable::default());
    }

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(output.as_bytes());
    let columns = reader
        .headers()
        .map_err(|err| err.to_string())?
        .iter()
        .map(str::to_string)
        .collect();

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|err| err.to_string())?;
        rows.push(record.iter().map(parse_cell).collect());
    }
    Ok(QueryTable { columns, rows })
}

fn parse_cell(cell: &str) -> Value {
    if cell == "[NULL]" {
        return Value::Null;
    }
    if let Ok(int) = cell.parse::<i64>() {
        return Value::Number(int.into());
    }
    if let Ok(float) = cell.parse::<f64>()
        && let Some(number) = Number::from_f64(float)
    {
        return Value::Number(number);
    }
    Value::String(cell.to_string())
}
