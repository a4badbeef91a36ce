use std::fs::{self, File};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use tracing::debug;

use crate::error::{PerftestError, Result};

const NESTED_ARCHIVE: &str = "traces.tar.gz";

pub fn is_trace_name(name: &str) -> bool {
    name.contains(".perfetto-trace") || name.ends_with(".trace")
}

/// Replace anything that is not safe in a single path component.
pub fn sanitize_component(name: &str) -> String {
    let cleaned: String = name
        .trim()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    let cleaned = cleaned.trim_matches('.').to_string();
    if cleaned.is_empty() {
        "unnamed".into()
    } else {
        cleaned
    }
}

/// Final component of an archive entry name, ignoring any directories.
fn entry_file_name(name: &str) -> Option<String> {
    let last = name.rsplit(['/', '\\']).next()?;
    if last.is_empty() || last == "." || last == ".." {
        None
    } else {
        Some(sanitize_component(last))
    }
}

/// Pull every trace out of a Device Farm customer-artifact zip, including
/// traces inside nested `traces.tar.gz` archives, into `dest`.
pub fn extract_traces(zip_path: &Path, dest: &Path) -> Result<Vec<PathBuf>> {
    let archive_error = |message: String| PerftestError::Archive {
        path: zip_path.to_path_buf(),
        message,
    };

    let file = File::open(zip_path).map_err(PerftestError::at(zip_path))?;
    let mut archive = zip::ZipArchive::new(file).map_err(|err| archive_error(err.to_string()))?;
    fs::create_dir_all(dest).map_err(PerftestError::at(dest))?;

    let mut extracted = Vec::new();
    for index in 0..archive.len() {
        let mut entry = archive
            .by_index(index)
            .map_err(|err| archive_error(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        let name = entry.name().to_string();

        if name.ends_with(NESTED_ARCHIVE) {
            debug!(entry = %name, "Expanding nested trace archive");
            let mut nested = Vec::new();
            entry
                .read_to_end(&mut nested)
                .map_err(|err| archive_error(format!("{name}: {err}")))?;
            extracted.extend(extract_tar_gz(&nested, dest).map_err(|err| match err {
                PerftestError::Archive { message, .. } => archive_error(format!("{name}: {message}")),
                other => other,
            })?);
        } else if is_trace_name(&name)
            && let Some(file_name) = entry_file_name(&name)
        {
            let target = dest.join(file_name);
            let mut out = File::create(&target).map_err(PerftestError::at(&target))?;
            io::copy(&mut entry, &mut out).map_err(PerftestError::at(&target))?;
            extracted.push(target);
        }
    }

    Ok(extracted)
}

fn extract_tar_gz(bytes: &[u8], dest: &Path) -> Result<Vec<PathBuf>> {
    let tar_error = |err: io::Error| PerftestError::Archive {
        path: dest.to_path_buf(),
        message: err.to_string(),
    };

    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let mut extracted = Vec::new();
    for entry in archive.entries().map_err(tar_error)? {
        let mut entry = entry.map_err(tar_error)?;
        if !entry.header().entry_type().is_file() {
            continue;
        }
        let name = entry.path().map_err(tar_error)?.to_string_lossy().into_owned();
        if !is_trace_name(&name) {
            continue;
        }
        let Some(file_name) = entry_file_name(&name) else {
            continue;
        };
        let target = dest.join(file_name);
        let mut out = File::create(&target).map_err(PerftestError::at(&target))?;
        io::copy(&mut entry, &mut out).map_err(PerftestError::at(&target))?;
        extracted.push(target);
    }
    Ok(extracted)
}
