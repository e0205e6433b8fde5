//! Companion-file resolution.
//!
//! A run is started with a list of primary files, but most units also need
//! sibling files (a measurement summary next to an image table, say). Each
//! catalog role names such a file by a fragment of its file name.

use std::path::{Path, PathBuf};

use super::error::{FileResolutionError, RunError};
use crate::store::ConfigStore;

/// Collect every file that plausibly satisfies `roles` for `primaries`.
///
/// For each role, for each primary file:
/// * the fragment is part of the primary's own file name → the primary is kept;
/// * otherwise the primary's directory is searched recursively for files whose
///   name equals the fragment, and every hit is kept.
///
/// Order follows roles then primaries; duplicates are not removed. An empty
/// role list returns `primaries` unchanged.
pub fn resolve_companions(
    primaries: &[PathBuf],
    roles: &[String],
) -> Result<Vec<PathBuf>, FileResolutionError> {
    if roles.is_empty() {
        return Ok(primaries.to_vec());
    }

    let mut found = Vec::new();
    for role in roles {
        let before = found.len();
        for primary in primaries {
            if file_name_of(primary).contains(role.as_str()) {
                found.push(primary.clone());
            } else {
                let dir = primary.parent().unwrap_or_else(|| Path::new("."));
                find_by_name(dir, role, &mut found);
            }
        }
        if found.len() == before && !primaries.is_empty() {
            return Err(FileResolutionError::UnmatchedRole { role: role.clone() });
        }
    }
    Ok(found)
}

/// The set of files a run actually iterates.
///
/// Without roles this is `files` as given. With roles the companions are
/// resolved and then narrowed back to paths containing `marker`, which
/// recovers the primary data files in role order.
pub fn effective_files(
    files: &[PathBuf],
    roles: &[String],
    marker: &str,
) -> Result<Vec<PathBuf>, FileResolutionError> {
    if roles.is_empty() {
        return Ok(files.to_vec());
    }
    let companions = resolve_companions(files, roles)?;
    Ok(companions
        .into_iter()
        .filter(|f| f.to_string_lossy().contains(marker))
        .collect())
}

/// Map role names to file-name fragments: a configured value for the role wins,
/// otherwise the role name itself is the fragment.
pub fn resolve_roles(
    store: &dyn ConfigStore,
    group: &str,
    roles: &[String],
) -> Result<Vec<String>, RunError> {
    roles
        .iter()
        .map(|role| Ok(store.lookup(group, role)?.unwrap_or_else(|| role.clone())))
        .collect()
}

fn file_name_of(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

fn find_by_name(dir: &Path, name: &str, out: &mut Vec<PathBuf>) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            log::debug!("skipping unreadable directory {}: {e}", dir.display());
            return;
        }
    };

    let mut paths: Vec<PathBuf> = entries.flatten().map(|e| e.path()).collect();
    paths.sort();

    for p in paths {
        if p.is_dir() {
            find_by_name(&p, name, out);
        } else if p.file_name().is_some_and(|n| n == name) {
            out.push(p);
        }
    }
}
