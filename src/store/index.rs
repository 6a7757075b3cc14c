use log::warn;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::TakeError;
use crate::store::take::{Take, TakeId};

/// File name of the take index inside a project directory
pub const INDEX_FILE: &str = "takes.yaml";

#[derive(Deserialize)]
struct IndexFile {
    next_id: TakeId,
    #[serde(default)]
    takes: Vec<Take>,
}

#[derive(Serialize)]
struct IndexFileRef<'a> {
    next_id: TakeId,
    takes: &'a [Take],
}

/// Load the take index, or None when the project has none yet
pub(crate) fn load(path: &Path) -> Result<Option<(TakeId, Vec<Take>)>, TakeError> {
    if !path.exists() {
        return Ok(None);
    }

    let content = fs::read_to_string(path)?;
    let IndexFile { mut next_id, takes } = serde_yaml::from_str(&content)?;

    for pair in takes.windows(2) {
        if pair[0].id() >= pair[1].id() {
            return Err(TakeError::Storage(format!(
                "take index {} is out of order at take {}",
                path.display(),
                pair[1].id()
            )));
        }
    }

    if let Some(last) = takes.last() {
        if next_id <= last.id() {
            warn!(
                "Take index {} has next id {} but take {} exists, repairing",
                path.display(),
                next_id,
                last.id()
            );
            next_id = last.id().next();
        }
    }

    Ok(Some((next_id, takes)))
}

/// Write the index next to the take files. Goes through a temporary file so
/// a crash never leaves a half-written index.
pub(crate) fn save(path: &Path, next_id: TakeId, takes: &[Take]) -> Result<(), TakeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let content = serde_yaml::to_string(&IndexFileRef { next_id, takes })?;
    let tmp = path.with_extension("yaml.tmp");
    fs::write(&tmp, content)?;
    fs::rename(&tmp, path)?;
    Ok(())
}
