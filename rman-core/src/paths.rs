use crate::error::{Result, RmanError};
use crate::manifest::{Directory, FileEntry};
use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};

/// Prefix every file name with its directory chain, root first, joined by `/`.
///
/// The walk follows `directory_id -> parent_id` and stops at id 0, at an id no
/// directory declares, or when an id repeats.
pub(crate) fn resolve(files: &mut [FileEntry], directories: &[Directory]) {
    let mut dirs: HashMap<u64, &Directory> = HashMap::new();
    for dir in directories.iter().filter(|d| d.id != 0) {
        dirs.entry(dir.id).or_insert(dir);
    }

    for file in files {
        let mut parts: Vec<&str> = Vec::new();
        let mut seen = HashSet::new();
        let mut cur = file.directory_id;
        while cur != 0 && seen.insert(cur) {
            let Some(dir) = dirs.get(&cur) else { break };
            if !dir.name.is_empty() {
                parts.push(&dir.name);
            }
            cur = dir.parent_id;
        }
        if parts.is_empty() {
            continue;
        }
        parts.reverse();
        parts.push(&file.name);
        file.name = parts.join("/");
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PathPolicy {
    pub follow_symlinks: bool,
}

/// Map a manifest path onto `root`, refusing anything that could land outside it:
/// absolute paths, `..` components, and (unless allowed) symlinked ancestors.
pub fn validate_path(root: &Path, rel: &str, policy: PathPolicy) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    if rel.is_empty() || rel_path.is_absolute() || rel.starts_with('/') {
        return Err(RmanError::UnsafePath(rel.to_string()));
    }
    for comp in rel_path.components() {
        if !matches!(comp, Component::Normal(_) | Component::CurDir) {
            return Err(RmanError::UnsafePath(rel.to_string()));
        }
    }
    if !policy.follow_symlinks {
        let mut cur = root.to_path_buf();
        for comp in rel_path.components() {
            cur.push(comp);
            if let Ok(m) = std::fs::symlink_metadata(&cur) {
                if m.file_type().is_symlink() {
                    return Err(RmanError::UnsafePath(format!("{rel} (symlink at {})", cur.display())));
                }
            }
        }
    }
    Ok(root.join(rel_path))
}
