use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use once_cell::sync::Lazy;
use serde::Serialize;

use crate::error::{PerftestError, Result};

static BUILTIN: Lazy<BTreeMap<&'static str, &'static str>> = Lazy::new(|| {
    BTreeMap::from([
        ("cpu_usage", include_str!("../../queries/cpu_usage.sql")),
        ("frame_metrics", include_str!("../../queries/frame_metrics.sql")),
        ("memory_usage", include_str!("../../queries/memory_usage.sql")),
        ("startup_metrics", include_str!("../../queries/startup_metrics.sql")),
    ])
});

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "path", rename_all = "lowercase")]
pub enum QuerySource {
    Builtin,
    File(PathBuf),
}

/// A static SQL query; no parameters are substituted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Query {
    pub name: String,
    #[serde(skip)]
    pub sql: String,
    pub source: QuerySource,
}

impl Query {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            source: QuerySource::Builtin,
        }
    }

    /// Load a custom query file; it is named after its file stem.
    pub fn from_file(path: &Path) -> Result<Self> {
        let name = path
            .file_stem()
            .map(|stem| stem.to_string_lossy().into_owned())
            .filter(|stem| !stem.is_empty())
            .ok_or_else(|| PerftestError::QueryNotFound {
                name: path.display().to_string(),
                searched: "custom query paths".into(),
            })?;
        let sql = std::fs::read_to_string(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => PerftestError::QueryNotFound {
                name: name.clone(),
                searched: path.display().to_string(),
            },
            _ => PerftestError::io(path, err),
        })?;
        Ok(Self {
            name,
            sql,
            source: QuerySource::File(path.to_path_buf()),
        })
    }
}

/// Built-in queries overlaid by `<name>.sql` files from configured
/// directories. Earlier directories win.
#[derive(Debug, Clone, Default)]
pub struct QueryLibrary {
    dirs: Vec<PathBuf>,
}

impl QueryLibrary {
    pub fn new(dirs: Vec<PathBuf>) -> Self {
        Self { dirs }
    }

    pub fn resolve(&self, name: &str) -> Result<Query> {
        for dir in &self.dirs {
            let candidate = dir.join(format!("{name}.sql"));
            if candidate.is_file() {
                return Query::from_file(&candidate);
            }
        }
        if let Some(sql) = BUILTIN.get(name) {
            return Ok(Query::new(name, *sql));
        }

        let mut searched = vec!["built-ins".to_string()];
        searched.extend(self.dirs.iter().map(|d| d.display().to_string()));
        Err(PerftestError::QueryNotFound {
            name: name.to_string(),
            searched: searched.join(", "),
        })
    }

    /// Resolve named queries then custom files, dropping repeated names.
    pub fn resolve_all(&self, names: &[String], custom: &[PathBuf]) -> Result<Vec<Query>> {
        let mut queries: Vec<Query> = Vec::new();
        let mut push = |query: Query| {
            if !queries.iter().any(|q| q.name == query.name) {
                queries.push(query);
            }
        };
        for name in names {
            push(self.resolve(name)?);
        }
        for path in custom {
            push(Query::from_file(path)?);
        }
        Ok(queries)
    }

    /// Every resolvable name, built-ins included, sorted.
    pub fn available(&self) -> Vec<String> {
        let mut names: Vec<String> = BUILTIN.keys().map(|name| name.to_string()).collect();
        for dir in &self.dirs {
            let pattern = format!("{}/*.sql", glob::Pattern::escape(&dir.to_string_lossy()));
            if let Ok(paths) = glob::glob(&pattern) {
                names.extend(
                    paths
                        .filter_map(|p| p.ok())
                        .filter_map(|p| p.file_stem().map(|s| s.to_string_lossy().into_owned())),
                );
            }
        }
        names.sort();
        names.dedup();
        names
    }
}
