//! Catalog of the benchmark tests the instrumentation APK ships, read from
//! `benchmark_tests.yml`.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{PerftestError, Result};

#[derive(Debug, Deserialize)]
struct CatalogFile {
    #[serde(default)]
    test_classes: Vec<TestClass>,
}

#[derive(Debug, Deserialize)]
struct TestClass {
    class: String,
    #[serde(default)]
    tests: Vec<TestEntry>,
}

#[derive(Debug, Deserialize)]
struct TestEntry {
    name: String,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogTest {
    pub class: String,
    pub name: String,
    pub description: String,
}

impl CatalogTest {
    /// `Class#method`, the form the instrumentation runner filters on.
    pub fn full_name(&self) -> String {
        format!("{}#{}", self.class, self.name)
    }
}

#[derive(Debug, Clone, Default)]
pub struct TestCatalog {
    tests: Vec<CatalogTest>,
}

impl TestCatalog {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(PerftestError::at(path))?;
        Self::from_yaml(&raw).map_err(|err| {
            PerftestError::Config(format!("invalid test catalog {}: {err}", path.display()))
        })
    }

    pub fn from_yaml(raw: &str) -> std::result::Result<Self, serde_yaml::Error> {
        let file: CatalogFile = serde_yaml::from_str(raw)?;
        let tests = file
            .test_classes
            .into_iter()
            .flat_map(|class| {
                class.tests.into_iter().map(move |test| CatalogTest {
                    class: class.class.clone(),
                    name: test.name,
                    description: test.description,
                })
            })
            .collect();
        Ok(Self { tests })
    }

    pub fn tests(&self) -> &[CatalogTest] {
        &self.tests
    }

    /// Look a test up by method name or by `Class#method`.
    pub fn find(&self, name: &str) -> Result<&CatalogTest> {
        self.tests
            .iter()
            .find(|test| test.name == name || test.full_name() == name)
            .ok_or_else(|| PerftestError::TestNotFound {
                name: name.to_string(),
                available: self
                    .tests
                    .iter()
                    .map(|test| test.name.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}
