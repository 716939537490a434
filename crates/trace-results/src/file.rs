use std::cell::OnceCell;

/// The separator of `path`, whatever the host: traces are read on other platforms than the
/// one they were recorded on.
pub(crate) fn separator_of(path: &str) -> char {
    let bytes = path.as_bytes();
    let has_drive = bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':';
    if has_drive || (path.contains('\\') && !path.contains('/')) {
        '\\'
    } else {
        '/'
    }
}

/// Joins an optional root and a path relative to it.
pub(crate) fn join_root(root: Option<&str>, path: &str) -> String {
    match root {
        Some(root) if path.is_empty() || path == "." => root.to_owned(),
        Some(root) => {
            let separator = separator_of(root);
            format!("{}{separator}{path}", root.trim_end_matches(separator))
        }
        None => path.to_owned(),
    }
}

/// One touched file.
///
/// Existence and size are only looked up on disk when first asked for, then cached.
#[derive(Debug, Clone)]
pub struct FileAccess {
    root: Option<String>,
    path: String,
    size: OnceCell<Option<u64>>,
}

impl FileAccess {
    pub fn new<S: Into<String>>(path: S) -> Self {
        Self {
            root: None,
            path: path.into(),
            size: OnceCell::new(),
        }
    }

    /// A file whose `path` is relative to `root`.
    pub fn with_root<R: Into<String>, S: Into<String>>(root: R, path: S) -> Self {
        Self {
            root: Some(root.into()),
            path: path.into(),
            size: OnceCell::new(),
        }
    }

    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn full_path(&self) -> String {
        join_root(self.root.as_deref(), &self.path)
    }

    /// Size in bytes, `None` when the file does not exist (anymore).
    pub fn size(&self) -> Option<u64> {
        *self.size.get_or_init(|| {
            std::fs::metadata(self.full_path())
                .ok()
                .map(|metadata| metadata.len())
        })
    }

    pub fn existent(&self) -> bool {
        self.size().is_some()
    }

    /// Same file seen from another root, keeping the cached metadata.
    pub(crate) fn rebased(&self, root: Option<String>, path: String) -> Self {
        Self {
            root,
            path,
            size: self.size.clone(),
        }
    }
}

impl PartialEq for FileAccess {
    fn eq(&self, other: &Self) -> bool {
        self.root == other.root && self.path == other.path
    }
}

impl Eq for FileAccess {}

/// A fully consumed directory, substituted for all the files it contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    root: Option<String>,
    /// Always terminated by a path separator.
    path: String,
    size: u64,
    file_count: usize,
}

impl Directory {
    pub fn new<S: Into<String>>(root: Option<String>, path: S, size: u64, file_count: usize) -> Self {
        let mut path = path.into();
        let separator = separator_of(root.as_deref().unwrap_or(&path));
        if !path.ends_with(separator) {
            path.push(separator);
        }
        Self {
            root,
            path,
            size,
            file_count,
        }
    }

    pub fn root(&self) -> Option<&str> {
        self.root.as_deref()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn full_path(&self) -> String {
        let mut full_path = join_root(self.root.as_deref(), &self.path);
        let separator = separator_of(&full_path);
        if !full_path.ends_with(separator) {
            full_path.push(separator);
        }
        full_path
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn file_count(&self) -> usize {
        self.file_count
    }
}

/// Either a single file or a collapsed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entry {
    File(FileAccess),
    Directory(Directory),
}

impl Entry {
    pub fn root(&self) -> Option<&str> {
        match self {
            Entry::File(file) => file.root(),
            Entry::Directory(directory) => directory.root(),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Entry::File(file) => file.path(),
            Entry::Directory(directory) => directory.path(),
        }
    }

    pub fn full_path(&self) -> String {
        match self {
            Entry::File(file) => file.full_path(),
            Entry::Directory(directory) => directory.full_path(),
        }
    }

    pub fn size(&self) -> Option<u64> {
        match self {
            Entry::File(file) => file.size(),
            Entry::Directory(directory) => Some(directory.size()),
        }
    }

    pub fn file_count(&self) -> usize {
        match self {
            Entry::File(_) => 1,
            Entry::Directory(directory) => directory.file_count(),
        }
    }

    pub fn existent(&self) -> bool {
        match self {
            Entry::File(file) => file.existent(),
            Entry::Directory(_) => true,
        }
    }
}

impl From<FileAccess> for Entry {
    fn from(file: FileAccess) -> Self {
        Entry::File(file)
    }
}

impl From<Directory> for Entry {
    fn from(directory: Directory) -> Self {
        Entry::Directory(directory)
    }
}
