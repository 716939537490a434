use crate::file::{FileAccess, separator_of};
use crate::flatten::{FlatEntry, FlatProcess};
use itertools::Itertools;

pub type Pid = u32;

/// A traced process, its touched files and its children.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Process {
    pid: Pid,
    executable: String,
    command: Vec<String>,
    initial_cwd: String,
    files: Vec<FileAccess>,
    children: Vec<Process>,
}

impl Process {
    /// Files are sorted by path and deduplicated, children are sorted by pid.
    pub fn new(
        pid: Pid,
        executable: String,
        command: Vec<String>,
        initial_cwd: String,
        files: Vec<FileAccess>,
        children: Vec<Process>,
    ) -> Self {
        let files = files
            .into_iter()
            .sorted_by(|a, b| a.path().cmp(b.path()))
            .dedup()
            .collect();
        let children = children.into_iter().sorted_by_key(|c| c.pid).collect();
        Self {
            pid,
            executable,
            command,
            initial_cwd,
            files,
            children,
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn executable(&self) -> &str {
        &self.executable
    }

    pub fn command(&self) -> &[String] {
        &self.command
    }

    pub fn initial_cwd(&self) -> &str {
        &self.initial_cwd
    }

    pub fn files(&self) -> &[FileAccess] {
        &self.files
    }

    pub fn children(&self) -> &[Process] {
        &self.children
    }

    /// This process and all its descendants, parents first.
    pub fn all(&self) -> Vec<&Process> {
        let mut out = vec![self];
        for child in &self.children {
            out.extend(child.all());
        }
        out
    }

    pub fn flatten(&self) -> FlatProcess {
        FlatProcess {
            children: self.children.iter().map(Process::flatten).collect(),
            command: self.command.clone(),
            executable: self.executable.clone(),
            files: self
                .files
                .iter()
                .map(|file| FlatEntry {
                    path: file.path().to_owned(),
                    size: file.size(),
                    file_count: None,
                })
                .collect(),
            initial_cwd: self.initial_cwd.clone(),
            pid: self.pid,
        }
    }

    fn strip_root(&self, root: &str) -> Process {
        let separator = separator_of(root);
        let prefix = if root.ends_with(separator) {
            root.to_owned()
        } else {
            format!("{root}{separator}")
        };
        let files = self
            .files
            .iter()
            .filter_map(|file| {
                let full_path = file.full_path();
                full_path
                    .strip_prefix(&prefix)
                    .map(|relative| file.rebased(Some(root.to_owned()), relative.to_owned()))
            })
            .collect();
        let initial_cwd = if self.initial_cwd == root {
            ".".to_owned()
        } else {
            self.initial_cwd
                .strip_prefix(&prefix)
                .unwrap_or(&self.initial_cwd)
                .to_owned()
        };
        Process {
            pid: self.pid,
            executable: self.executable.clone(),
            command: self.command.clone(),
            initial_cwd,
            files,
            children: self.children.iter().map(|c| c.strip_root(root)).collect(),
        }
    }
}

/// The outcome of one trace: the root of the process tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Results {
    process: Process,
}

impl Results {
    pub fn new(process: Process) -> Self {
        Self { process }
    }

    pub fn root(&self) -> &Process {
        &self.process
    }

    pub fn processes(&self) -> Vec<&Process> {
        self.process.all()
    }

    /// Every file touched by any process, sorted and unique.
    pub fn files(&self) -> Vec<FileAccess> {
        self.processes()
            .into_iter()
            .flat_map(|p| p.files().iter().cloned())
            .sorted_by(|a, b| a.path().cmp(b.path()))
            .dedup()
            .collect()
    }

    pub fn existent(&self) -> Vec<FileAccess> {
        self.files().into_iter().filter(|f| f.existent()).collect()
    }

    pub fn non_existent(&self) -> Vec<FileAccess> {
        self.files().into_iter().filter(|f| !f.existent()).collect()
    }

    pub fn flatten(&self) -> FlatProcess {
        self.process.flatten()
    }

    /// Rebases every path under `root` and drops the files outside of it.
    ///
    /// Processes are always kept; a process whose initial cwd is outside `root` keeps it
    /// absolute.
    pub fn strip_root(&self, root: &str) -> Results {
        let trimmed = root.trim_end_matches(['/', '\\']);
        let root = if trimmed.is_empty() { root } else { trimmed };
        Results {
            process: self.process.strip_root(root),
        }
    }
}
