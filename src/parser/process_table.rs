use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;

use crate::error::{TraceResult, TracingFailure};
use crate::path::{Anchors, LateBoundPath, PathKey, PathResolver};
use crate::prelude::*;
use trace_results::{FileAccess, Pid, Process, Results};

#[derive(Debug, Clone)]
enum Executable {
    /// Resolved through the cwd when the tree is built.
    Path(LateBoundPath),
    /// A bare image name as the kernel reports it, kept verbatim.
    Image(String),
}

/// Mutable state of one process while the log is replayed.
#[derive(Debug)]
struct ProcessRecord {
    pid: Pid,
    parent: Option<Pid>,
    children: Vec<Pid>,
    executable: Option<Executable>,
    command: Vec<String>,
    initial_cwd: LateBoundPath,
    cwd: LateBoundPath,
    files: Vec<LateBoundPath>,
    known_files: HashSet<PathKey>,
    /// Opened files waiting for their handle to be cleaned up, keyed by handle.
    pending_handles: HashMap<String, LateBoundPath>,
    sealed: bool,
}

impl ProcessRecord {
    fn new(pid: Pid, parent: Option<Pid>, initial_cwd: LateBoundPath) -> Self {
        Self {
            pid,
            parent,
            children: Vec::new(),
            executable: None,
            command: Vec::new(),
            cwd: initial_cwd.clone(),
            initial_cwd,
            files: Vec::new(),
            known_files: HashSet::new(),
            pending_handles: HashMap::new(),
            sealed: false,
        }
    }

    fn add_file(&mut self, path: LateBoundPath) {
        // Same parent node and fragment means same path, the rest is deduplicated once rendered.
        if self.known_files.insert(path.key()) {
            self.files.push(path);
        }
    }
}

/// Every process observed in one log, keyed by pid.
///
/// Parent and children are stored as pids and resolved through the table.
#[derive(Debug, Default)]
pub struct ProcessTable {
    processes: BTreeMap<Pid, ProcessRecord>,
    anchors: Anchors,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.processes.contains_key(&pid)
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    fn record_mut(&mut self, pid: Pid) -> TraceResult<&mut ProcessRecord> {
        self.processes
            .get_mut(&pid)
            .ok_or_else(|| TracingFailure::inconsistency(format!("Unknown pid {pid}")))
    }

    /// Registers a process whose working directory is already known.
    pub fn add_process(
        &mut self,
        pid: Pid,
        parent: Option<Pid>,
        initial_cwd: LateBoundPath,
    ) -> TraceResult<()> {
        if self.processes.contains_key(&pid) {
            return Err(TracingFailure::inconsistency(format!(
                "Process {pid} was started twice"
            )));
        }
        if let Some(parent) = parent {
            self.record_mut(parent)?.children.push(pid);
        }
        self.processes
            .insert(pid, ProcessRecord::new(pid, parent, initial_cwd));
        Ok(())
    }

    /// Creates the process if needed, with a cwd bound later by [`ProcessTable::fork`] or
    /// [`ProcessTable::bind_initial_cwd`].
    pub fn ensure_process(&mut self, pid: Pid) {
        self.processes
            .entry(pid)
            .or_insert_with(|| ProcessRecord::new(pid, None, LateBoundPath::initial_cwd_of(pid)));
    }

    pub fn bind_initial_cwd(&mut self, pid: Pid, cwd: LateBoundPath) -> TraceResult<()> {
        if self.anchors.insert(pid, cwd).is_some() {
            return Err(TracingFailure::inconsistency(format!(
                "Initial working directory of pid {pid} bound twice"
            )));
        }
        Ok(())
    }

    /// `parent` created `child`, which inherits its cwd and its command line.
    pub fn fork(&mut self, parent: Pid, child: Pid) -> TraceResult<()> {
        let (cwd, executable, command) = {
            let record = self.processes.get(&parent).ok_or_else(|| {
                TracingFailure::inconsistency(format!(
                    "Process {child} created by unknown pid {parent}"
                ))
            })?;
            (
                record.cwd.clone(),
                record.executable.clone(),
                record.command.clone(),
            )
        };

        match self.processes.get_mut(&child) {
            Some(record) => {
                if record.parent.is_some() {
                    return Err(TracingFailure::inconsistency(format!(
                        "Process {child} already has a parent"
                    )));
                }
                record.parent = Some(parent);
                if record.executable.is_none() {
                    record.executable = executable;
                    record.command = command;
                }
                self.bind_initial_cwd(child, cwd)?;
            }
            None => {
                let mut record = ProcessRecord::new(child, Some(parent), cwd);
                record.executable = executable;
                record.command = command;
                self.processes.insert(child, record);
            }
        }
        self.record_mut(parent)?.children.push(child);
        Ok(())
    }

    pub fn chdir(&mut self, pid: Pid, path: &str) -> TraceResult<()> {
        let record = self.record_mut(pid)?;
        if record.sealed {
            return Err(TracingFailure::inconsistency(format!(
                "Process {pid} changed directory after exiting"
            )));
        }
        record.cwd = record.cwd.join(path);
        Ok(())
    }

    /// Records a file, resolved through the current cwd.
    pub fn touch(&mut self, pid: Pid, path: &str) -> TraceResult<()> {
        let record = self.record_mut(pid)?;
        let node = record.cwd.join(path);
        record.add_file(node);
        Ok(())
    }

    pub fn set_command(
        &mut self,
        pid: Pid,
        executable: &str,
        command: Vec<String>,
    ) -> TraceResult<()> {
        let record = self.record_mut(pid)?;
        record.executable = Some(Executable::Path(record.cwd.join(executable)));
        record.command = command;
        Ok(())
    }

    /// Like [`ProcessTable::set_command`] for an executable only known by its image name.
    pub fn set_image(&mut self, pid: Pid, image: &str, command: Vec<String>) -> TraceResult<()> {
        let record = self.record_mut(pid)?;
        record.executable = Some(Executable::Image(image.to_owned()));
        record.command = command;
        Ok(())
    }

    /// The process image was replaced, the new executable counts as touched.
    pub fn exec(&mut self, pid: Pid, executable: &str, command: Vec<String>) -> TraceResult<()> {
        self.set_command(pid, executable, command)?;
        self.touch(pid, executable)
    }

    pub fn open_handle(&mut self, pid: Pid, handle: &str, path: &str) -> TraceResult<()> {
        let record = self.record_mut(pid)?;
        let node = record.cwd.join(path);
        record.pending_handles.insert(handle.to_owned(), node);
        Ok(())
    }

    /// Confirms the file opened through `handle`. Returns whether one was pending.
    pub fn close_handle(&mut self, pid: Pid, handle: &str) -> TraceResult<bool> {
        let record = self.record_mut(pid)?;
        match record.pending_handles.remove(handle) {
            Some(node) => {
                record.add_file(node);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn exit(&mut self, pid: Pid) -> TraceResult<()> {
        let record = self.record_mut(pid)?;
        if !record.pending_handles.is_empty() {
            debug!(
                "Process {pid} exited with {} unconfirmed handles",
                record.pending_handles.len()
            );
            record.pending_handles.clear();
        }
        record.sealed = true;
        Ok(())
    }

    /// Checks the tree and renders every late-bound path. Consumes the table.
    pub fn into_results(mut self, resolver: &mut PathResolver) -> TraceResult<Results> {
        let roots: Vec<Pid> = self
            .processes
            .values()
            .filter(|record| record.parent.is_none())
            .map(|record| record.pid)
            .collect();
        let [root] = roots.as_slice() else {
            return Err(TracingFailure::inconsistency(format!(
                "Expected exactly one root process, found {}: {roots:?}",
                roots.len()
            )));
        };
        let root = *root;

        let mut reachable = BTreeSet::new();
        let mut stack = vec![root];
        while let Some(pid) = stack.pop() {
            if !reachable.insert(pid) {
                return Err(TracingFailure::inconsistency(format!(
                    "Process {pid} is reachable twice from the root"
                )));
            }
            if let Some(record) = self.processes.get(&pid) {
                stack.extend(record.children.iter().copied());
            }
        }
        let observed: BTreeSet<Pid> = self.processes.keys().copied().collect();
        if reachable != observed {
            let orphans: Vec<_> = observed.difference(&reachable).collect();
            return Err(TracingFailure::inconsistency(format!(
                "Processes {orphans:?} are not reachable from the root process {root}"
            )));
        }

        let process = build_process(&mut self.processes, &self.anchors, resolver, root)?;
        Ok(Results::new(process))
    }
}

fn render(
    node: &LateBoundPath,
    anchors: &Anchors,
    resolver: &mut PathResolver,
) -> TraceResult<String> {
    resolver.native_path_case(&node.render(anchors)?)
}

fn build_process(
    processes: &mut BTreeMap<Pid, ProcessRecord>,
    anchors: &Anchors,
    resolver: &mut PathResolver,
    pid: Pid,
) -> TraceResult<Process> {
    let record = processes
        .remove(&pid)
        .ok_or_else(|| TracingFailure::inconsistency(format!("Unknown pid {pid}")))?;
    let with_pid = |failure: TracingFailure| TracingFailure {
        description: format!("{} (pid {pid})", failure.description),
        ..failure
    };

    let initial_cwd = render(&record.initial_cwd, anchors, resolver).map_err(with_pid)?;
    let executable = match &record.executable {
        Some(Executable::Path(node)) => render(node, anchors, resolver).map_err(with_pid)?,
        Some(Executable::Image(image)) => image.clone(),
        None => record.command.first().cloned().unwrap_or_default(),
    };

    let mut files = Vec::with_capacity(record.files.len());
    for node in &record.files {
        let path = render(node, anchors, resolver).map_err(with_pid)?;
        if Path::new(&path).is_dir() {
            trace!("Skipping directory {path}");
            continue;
        }
        files.push(FileAccess::new(path));
    }

    let children = record
        .children
        .iter()
        .map(|child| build_process(processes, anchors, resolver, *child))
        .collect::<TraceResult<Vec<_>>>()?;

    Ok(Process::new(
        pid,
        executable,
        record.command,
        initial_cwd,
        files,
        children,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::FailureKind;
    use crate::path::DriveMap;

    fn resolver() -> PathResolver {
        PathResolver::new(DriveMap::default()).with_case_folding(false)
    }

    #[test]
    fn test_child_inherits_cwd_at_fork_time() {
        let mut table = ProcessTable::new();
        table
            .add_process(1, None, LateBoundPath::absolute("/src"))
            .unwrap();
        table
            .exec(1, "/bin/sh", vec!["sh".into(), "parent.sh".into()])
            .unwrap();
        table.touch(1, "parent.sh").unwrap();
        table.chdir(1, "sub").unwrap();
        table.fork(1, 2).unwrap();
        table.chdir(1, "/elsewhere").unwrap();
        table
            .exec(2, "/bin/sh", vec!["sh".into(), "child.sh".into()])
            .unwrap();
        table.touch(2, "child.sh").unwrap();
        table.exit(2).unwrap();
        table.exit(1).unwrap();

        let results = table.into_results(&mut resolver()).unwrap();
        let root = results.root();
        assert_eq!(root.initial_cwd(), "/src");
        let root_files: Vec<_> = root.files().iter().map(|f| f.path()).collect();
        assert_eq!(root_files, vec!["/bin/sh", "/src/parent.sh"]);

        let child = &root.children()[0];
        assert_eq!(child.pid(), 2);
        assert_eq!(child.initial_cwd(), "/src/sub");
        assert_eq!(child.command(), ["sh", "child.sh"]);
        let child_files: Vec<_> = child.files().iter().map(|f| f.path()).collect();
        assert_eq!(child_files, vec!["/bin/sh", "/src/sub/child.sh"]);
    }

    #[test]
    fn test_duplicate_paths_are_merged() {
        let mut table = ProcessTable::new();
        table
            .add_process(1, None, LateBoundPath::absolute("/src"))
            .unwrap();
        table.touch(1, "/src/a.txt").unwrap();
        table.touch(1, "/src/a.txt").unwrap();
        table.touch(1, "a.txt").unwrap();
        table.touch(1, "./x/../a.txt").unwrap();

        let results = table.into_results(&mut resolver()).unwrap();
        assert_eq!(results.root().files().len(), 1);
    }

    #[test]
    fn test_forked_child_inherits_command() {
        let mut table = ProcessTable::new();
        table
            .add_process(1, None, LateBoundPath::absolute("/"))
            .unwrap();
        table.set_command(1, "/usr/bin/make", vec!["make".into()]).unwrap();
        table.fork(1, 2).unwrap();
        let results = table.into_results(&mut resolver()).unwrap();
        let child = &results.root().children()[0];
        assert_eq!(child.executable(), "/usr/bin/make");
        assert_eq!(child.command(), ["make"]);
        assert!(results.root().files().is_empty());
    }

    #[test]
    fn test_handles_need_cleanup() {
        let mut table = ProcessTable::new();
        table
            .add_process(4, None, LateBoundPath::absolute("C:\\src"))
            .unwrap();
        table.open_handle(4, "0xA0", "C:\\src\\kept.txt").unwrap();
        table.open_handle(4, "0xB0", "C:\\src\\dropped.txt").unwrap();
        assert!(table.close_handle(4, "0xA0").unwrap());
        assert!(!table.close_handle(4, "0xC0").unwrap());
        table.exit(4).unwrap();

        let results = table.into_results(&mut resolver()).unwrap();
        let files: Vec<_> = results.root().files().iter().map(|f| f.path()).collect();
        assert_eq!(files, vec!["C:\\src\\kept.txt"]);
    }

    #[test]
    fn test_chdir_after_exit_fails() {
        let mut table = ProcessTable::new();
        table
            .add_process(1, None, LateBoundPath::absolute("/"))
            .unwrap();
        table.exit(1).unwrap();
        assert!(table.processes[&1].sealed);
        let failure = table.chdir(1, "/tmp").unwrap_err();
        assert_eq!(failure.kind, FailureKind::Inconsistency);
        // Files recorded before the exit are kept.
        table.touch(1, "/etc/hosts").unwrap();
    }

    #[test]
    fn test_unknown_parent_fails() {
        let mut table = ProcessTable::new();
        let failure = table.fork(10, 11).unwrap_err();
        assert_eq!(failure.kind, FailureKind::Inconsistency);
        assert!(failure.to_string().contains("unknown pid 10"));
    }

    #[test]
    fn test_two_roots_fail() {
        let mut table = ProcessTable::new();
        table
            .add_process(1, None, LateBoundPath::absolute("/"))
            .unwrap();
        table
            .add_process(2, None, LateBoundPath::absolute("/"))
            .unwrap();
        let failure = table.into_results(&mut resolver()).unwrap_err();
        assert!(failure.to_string().contains("found 2"));
    }

    #[test]
    fn test_unreachable_processes_fail() {
        let mut table = ProcessTable::new();
        table
            .add_process(1, None, LateBoundPath::absolute("/"))
            .unwrap();
        table
            .add_process(2, None, LateBoundPath::absolute("/"))
            .unwrap();
        table.fork(2, 3).unwrap();
        table.fork(3, 2).unwrap();
        let failure = table.into_results(&mut resolver()).unwrap_err();
        assert!(failure.to_string().contains("not reachable"));
    }

    #[test]
    fn test_unbound_anchor_fails() {
        let mut table = ProcessTable::new();
        table.ensure_process(5);
        table.touch(5, "relative.txt").unwrap();
        let failure = table.into_results(&mut resolver()).unwrap_err();
        assert!(failure.to_string().contains("pid 5"));
    }

    #[test]
    fn test_existing_directories_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let base = dir.path().to_string_lossy().into_owned();
        std::fs::write(dir.path().join("file.txt"), "x").unwrap();

        let mut table = ProcessTable::new();
        table
            .add_process(1, None, LateBoundPath::absolute(base.clone()))
            .unwrap();
        table.touch(1, ".").unwrap();
        table.touch(1, "file.txt").unwrap();
        let results = table.into_results(&mut resolver()).unwrap();
        let files: Vec<_> = results.root().files().iter().map(|f| f.path()).collect();
        assert_eq!(files, vec![format!("{base}/file.txt")]);
    }

    #[test]
    fn test_long_chdir_chain() {
        let mut table = ProcessTable::new();
        table
            .add_process(1, None, LateBoundPath::absolute("/src"))
            .unwrap();
        for _ in 0..30_000 {
            table.chdir(1, ".").unwrap();
        }
        table.touch(1, "a.txt").unwrap();
        table.touch(1, "a.txt").unwrap();
        table.chdir(1, "sub").unwrap();
        table.touch(1, "../a.txt").unwrap();
        table.exit(1).unwrap();

        let results = table.into_results(&mut resolver()).unwrap();
        let files: Vec<_> = results.root().files().iter().map(|f| f.path()).collect();
        assert_eq!(files, vec!["/src/a.txt"]);
    }
}
