mod drives;
mod late_bound;

pub use drives::DriveMap;
pub use late_bound::{Anchors, LateBoundPath, PathKey};

use std::collections::HashMap;
use std::path::PathBuf;

use crate::error::{TraceResult, TracingFailure};
use crate::prelude::*;

/// Whether `path` is absolute in either the POSIX or the Windows flavor, independently of the
/// host platform: logs are parsed wherever they end up.
pub fn is_absolute(path: &str) -> bool {
    let bytes = path.as_bytes();
    path.starts_with('/')
        || path.starts_with('\\')
        || (bytes.len() >= 3
            && bytes[0].is_ascii_alphabetic()
            && bytes[1] == b':'
            && matches!(bytes[2], b'\\' | b'/'))
}

/// The separator used by an absolute path.
pub fn separator_of(path: &str) -> char {
    if path.starts_with('/') { '/' } else { '\\' }
}

/// Splits an absolute path into its root (`/`, `C:\`, `\\`) and the remainder.
fn split_root(path: &str) -> (String, &str) {
    let bytes = path.as_bytes();
    if path.starts_with('/') {
        ("/".to_owned(), &path[1..])
    } else if path.starts_with("\\\\") {
        ("\\\\".to_owned(), &path[2..])
    } else if path.starts_with('\\') {
        ("\\".to_owned(), &path[1..])
    } else if bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':' {
        let rest = path.get(2..).unwrap_or("");
        let rest = rest.strip_prefix(['\\', '/']).unwrap_or(rest);
        (format!("{}:\\", (bytes[0] as char).to_ascii_uppercase()), rest)
    } else {
        (String::new(), path)
    }
}

fn components<'a>(part: &'a str, separator: char) -> Box<dyn Iterator<Item = &'a str> + 'a> {
    if separator == '/' {
        Box::new(part.split('/'))
    } else {
        Box::new(part.split(['/', '\\']))
    }
}

/// Applies `fragments` to the absolute `base`, folding `.` and `..` without touching the disk.
///
/// `..` never climbs above the root.
pub fn normalize(base: &str, fragments: &[&str]) -> String {
    let separator = separator_of(base);
    let (root, rest) = split_root(base);
    let mut parts: Vec<&str> = Vec::new();
    for part in std::iter::once(rest).chain(fragments.iter().copied()) {
        for component in components(part, separator) {
            match component {
                "" | "." => {}
                ".." => {
                    parts.pop();
                }
                component => parts.push(component),
            }
        }
    }
    root + &parts.join(&separator.to_string())
}

/// Canonicalizes native paths for one parse.
///
/// Built once before the replay starts and dropped with the parser, it owns the volume table
/// captured at trace time and a cache of the case-corrected paths.
#[derive(Debug)]
pub struct PathResolver {
    drives: DriveMap,
    case_insensitive: bool,
    cache: HashMap<String, String>,
}

impl PathResolver {
    pub fn new(drives: DriveMap) -> Self {
        Self {
            drives,
            case_insensitive: cfg!(any(windows, target_os = "macos")),
            cache: HashMap::new(),
        }
    }

    /// Forces the case correction on or off, regardless of the host file system.
    pub fn with_case_folding(mut self, enabled: bool) -> Self {
        self.case_insensitive = enabled;
        self
    }

    pub fn drives(&self) -> &DriveMap {
        &self.drives
    }

    /// Maps a `\Device\HarddiskVolumeN\...` path to its drive letter form. `None` means the
    /// volume is not visible to the user and the path is not tracked.
    pub fn to_dos_path(&self, path: &str) -> Option<String> {
        self.drives.to_dos_path(path)
    }

    /// Returns the path as spelled on disk.
    ///
    /// Only absolute paths are accepted, relative ones must be resolved through a working
    /// directory first.
    pub fn native_path_case(&mut self, path: &str) -> TraceResult<String> {
        if !is_absolute(path) {
            return Err(TracingFailure::inconsistency(format!(
                "Cannot canonicalize the relative path {path:?}"
            )));
        }
        if !self.case_insensitive {
            return Ok(path.to_owned());
        }
        if let Some(native) = self.cache.get(path) {
            return Ok(native.clone());
        }

        let expanded = drives::long_path_name(path).unwrap_or_else(|| path.to_owned());
        let native = fix_case(&expanded);
        trace!("Native case of {path} is {native}");
        self.cache.insert(path.to_owned(), native.clone());
        Ok(native)
    }
}

/// Replaces every existing component with its spelling on disk. Components past the first
/// missing one are kept as is.
fn fix_case(path: &str) -> String {
    let separator = separator_of(path);
    let (root, rest) = split_root(path);
    let mut current = PathBuf::from(&root);
    let mut parts: Vec<String> = Vec::new();
    let mut exists = true;

    for component in components(rest, separator).filter(|c| !c.is_empty()) {
        let native = if exists {
            find_entry(&current, component)
        } else {
            None
        };
        match native {
            Some(name) => {
                current.push(&name);
                parts.push(name);
            }
            None => {
                exists = false;
                parts.push(component.to_owned());
            }
        }
    }
    root + &parts.join(&separator.to_string())
}

fn find_entry(directory: &std::path::Path, name: &str) -> Option<String> {
    let entries: Vec<String> = std::fs::read_dir(directory)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    if entries.iter().any(|entry| entry == name) {
        return Some(name.to_owned());
    }
    let lowered = name.to_lowercase();
    entries
        .into_iter()
        .find(|entry| entry.to_lowercase() == lowered)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("/usr/lib", true)]
    #[case("C:\\Windows", true)]
    #[case("c:/Windows", true)]
    #[case("\\Device\\HarddiskVolume2\\x", true)]
    #[case("relative/path", false)]
    #[case("C:relative", false)]
    #[case("", false)]
    fn test_is_absolute(#[case] path: &str, #[case] expected: bool) {
        assert_eq!(is_absolute(path), expected);
    }

    #[rstest]
    #[case("/src", &["a/./b", "../c"], "/src/a/c")]
    #[case("/", &["../../etc"], "/etc")]
    #[case("/src/", &[], "/src")]
    #[case("/", &[], "/")]
    #[case("c:\\src", &["x/y", "..\\z"], "C:\\src\\x\\z")]
    #[case("C:\\", &[""], "C:\\")]
    #[case("/src", &["a\\b"], "/src/a\\b")]
    fn test_normalize(#[case] base: &str, #[case] fragments: &[&str], #[case] expected: &str) {
        assert_eq!(normalize(base, fragments), expected);
    }

    #[test]
    fn test_relative_path_is_rejected() {
        let mut resolver = PathResolver::new(DriveMap::default());
        let failure = resolver.native_path_case("foo/bar").unwrap_err();
        assert!(failure.to_string().contains("relative path"));
    }

    #[test]
    fn test_native_case() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("Foo")).unwrap();
        std::fs::write(dir.path().join("Foo/Bar.txt"), "x").unwrap();
        let base = dir.path().to_string_lossy().into_owned();

        let mut resolver = PathResolver::new(DriveMap::default()).with_case_folding(true);
        assert_eq!(
            resolver
                .native_path_case(&format!("{base}/foo/bar.TXT"))
                .unwrap(),
            format!("{base}/Foo/Bar.txt")
        );
        // Missing components are kept verbatim.
        assert_eq!(
            resolver
                .native_path_case(&format!("{base}/FOO/missing/Child"))
                .unwrap(),
            format!("{base}/Foo/missing/Child")
        );
    }

    #[test]
    fn test_case_preserved_when_disabled() {
        let mut resolver = PathResolver::new(DriveMap::default()).with_case_folding(false);
        assert_eq!(
            resolver.native_path_case("/Some/Path").unwrap(),
            "/Some/Path"
        );
    }
}
