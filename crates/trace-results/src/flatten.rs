use crate::file::Entry;
use serde::{Deserialize, Serialize};

/// Serialized form of a file or collapsed directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatEntry {
    pub path: String,
    /// `None` when the file does not exist.
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_count: Option<usize>,
}

impl From<&Entry> for FlatEntry {
    fn from(entry: &Entry) -> Self {
        FlatEntry {
            path: entry.path().to_owned(),
            size: entry.size(),
            file_count: match entry {
                Entry::File(_) => None,
                Entry::Directory(directory) => Some(directory.file_count()),
            },
        }
    }
}

/// Serialized form of a [`Process`](crate::Process).
///
/// Fields are declared in alphabetical order so the JSON output has sorted keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlatProcess {
    pub children: Vec<FlatProcess>,
    pub command: Vec<String>,
    pub executable: String,
    pub files: Vec<FlatEntry>,
    pub initial_cwd: String,
    pub pid: u32,
}
