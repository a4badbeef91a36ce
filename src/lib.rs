pub mod analysis;
pub mod build;
pub mod cache;
pub mod catalog;
pub mod config;
pub mod credentials;
pub mod devicefarm;
pub mod error;
pub mod observability;
pub mod pipeline;
pub mod poll;
pub mod security;
pub mod testrun;
pub mod validation;

pub use cache::{ArtifactCache, ArtifactSet, BuildIdentity};
pub use config::Config;
pub use error::{PerftestError, Result};
pub use pipeline::{Pipeline, PipelineError, PipelineResult, PipelineStage};
