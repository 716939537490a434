use crate::file::{Directory, Entry, separator_of};
use anyhow::{Result, bail};
use log::{debug, trace};
use std::collections::{BTreeMap, BTreeSet};

/// Version control metadata and compiled artifacts, ignored when comparing a directory's known
/// entries with its content on disk.
pub fn default_blacklist(name: &str) -> bool {
    matches!(name, ".git" | ".svn" | ".hg")
        || [".pyc", ".pyo", ".class"]
            .iter()
            .any(|suffix| name.ends_with(suffix))
}

/// Splits off the last component. The parent of a top level entry keeps its root separator.
fn split_parent(path: &str, separator: char) -> Option<(String, String)> {
    let (parent, name) = path.rsplit_once(separator)?;
    if name.is_empty() {
        return None;
    }
    let parent = if parent.is_empty() || parent.ends_with(':') {
        format!("{parent}{separator}")
    } else {
        parent.to_owned()
    };
    Some((parent, name.to_owned()))
}

fn is_strictly_under(path: &str, root_dir: &str, separator: char) -> bool {
    let root = root_dir.trim_end_matches(separator);
    path.len() > root.len() + 1
        && path.starts_with(root)
        && path[root.len()..].starts_with(separator)
}

fn list_directory<F>(directory: &str, blacklist: &F) -> Option<BTreeSet<String>>
where
    F: Fn(&str) -> bool,
{
    let read_dir = match std::fs::read_dir(directory) {
        Ok(read_dir) => read_dir,
        Err(error) => {
            debug!("Failed to list {directory}: {error}");
            return None;
        }
    };
    read_dir
        .map(|entry| entry.map(|e| e.file_name().to_string_lossy().into_owned()))
        .filter(|name| !matches!(name, Ok(name) if blacklist(name)))
        .collect::<std::io::Result<_>>()
        .ok()
}

/// Replaces the entries of every directory that was fully consumed by a single [`Directory`].
///
/// Directories are visited deepest first, so a collapsed directory can itself complete its
/// parent. A directory is only collapsed when its known entries match its content on disk
/// exactly (blacklisted names excepted on both sides), and only directories strictly under
/// `root_dir` are considered. Entries that do not exist on disk are returned untouched.
///
/// Running the function on its own output returns the same entries.
pub fn extract_directories<F>(root_dir: &str, entries: Vec<Entry>, blacklist: F) -> Result<Vec<Entry>>
where
    F: Fn(&str) -> bool,
{
    let separator = separator_of(root_dir);
    let root_dir = root_dir.trim_end_matches(separator);
    let roots: BTreeSet<_> = entries.iter().map(|e| e.root().map(str::to_owned)).collect();
    if roots.len() > 1 {
        bail!("All the entries must share the same root, got {roots:?}");
    }
    let root = roots.into_iter().next().flatten();

    let (existent, mut out): (Vec<_>, Vec<_>) = entries.into_iter().partition(Entry::existent);

    // directory -> {name -> entry}, for every directory from the entries up to `root_dir`.
    let mut buckets: BTreeMap<String, BTreeMap<String, Entry>> = BTreeMap::new();
    for entry in existent {
        let full_path = entry.full_path();
        let Some((directory, name)) = split_parent(full_path.trim_end_matches(separator), separator)
        else {
            out.push(entry);
            continue;
        };
        buckets
            .entry(directory.clone())
            .or_default()
            .insert(name, entry);

        let mut current = directory;
        while is_strictly_under(&current, root_dir, separator) {
            let Some((parent, _)) = split_parent(&current, separator) else {
                break;
            };
            buckets.entry(parent.clone()).or_default();
            current = parent;
        }
    }

    // Reverse lexical order visits children before their parent.
    let candidates: Vec<String> = buckets
        .keys()
        .rev()
        .filter(|d| is_strictly_under(d, root_dir, separator))
        .cloned()
        .collect();
    for directory in candidates {
        let Some(known) = buckets.get(&directory) else {
            continue;
        };
        if known.is_empty() {
            continue;
        }
        let expected: BTreeSet<String> = known
            .keys()
            .filter(|name| !blacklist(name))
            .cloned()
            .collect();
        let Some(actual) = list_directory(&directory, &blacklist) else {
            continue;
        };
        if actual != expected {
            trace!("Not collapsing {directory}: {actual:?} != {expected:?}");
            continue;
        }

        let Some(known) = buckets.remove(&directory) else {
            continue;
        };
        let size = known.values().filter_map(Entry::size).sum();
        let file_count = known.values().map(Entry::file_count).sum();
        let path = match &root {
            Some(root) => directory
                .strip_prefix(root.trim_end_matches(separator))
                .map(|rest| rest.trim_start_matches(separator).to_owned())
                .unwrap_or_else(|| directory.clone()),
            None => directory.clone(),
        };
        debug!("Collapsing {directory} ({file_count} files)");
        let Some((parent, name)) = split_parent(&directory, separator) else {
            continue;
        };
        buckets.entry(parent).or_default().insert(
            name,
            Directory::new(root.clone(), path, size, file_count).into(),
        );
    }

    out.extend(buckets.into_values().flat_map(BTreeMap::into_values));
    out.sort_by(|a, b| a.path().cmp(b.path()));
    Ok(out)
}
