use trace_results::Pid;

/// Printed by the BEGIN probe once dtrace is ready.
pub const BEGIN_MARKER: &str = "trace-inputs";

/// `O_DIRECTORY` on Darwin and the BSDs.
pub const O_DIRECTORY: u64 = 0x100000;

/// The D program tracking `traced_pid` and its descendants.
///
/// Every line is prefixed with a global `logindex` since the per-CPU buffers are not merged
/// in order.
pub fn script(traced_pid: Pid) -> String {
    format!(
        r#"
inline int TRACED_PID = {traced_pid};
int logindex;
int current_processes;

dtrace:::BEGIN {{
  logindex = 0;
  current_processes = 1;
  trackedpid[TRACED_PID] = 1;
  printf("%d %d dtrace_BEGIN(\"{BEGIN_MARKER}\")\n", logindex, TRACED_PID);
  logindex++;
}}

proc:::start /trackedpid[ppid]/ {{
  trackedpid[pid] = 1;
  current_processes += 1;
  printf("%d %d proc_start(%d)\n", logindex, pid, ppid);
  logindex++;
}}

proc:::exit /trackedpid[pid]/ {{
  trackedpid[pid] = 0;
  current_processes -= 1;
  printf("%d %d proc_exit(%d)\n", logindex, pid, (int)args[0]);
  logindex++;
}}

syscall::execve:entry /trackedpid[pid]/ {{
  self->exec_path = copyinstr(arg0);
}}

proc:::exec-success /trackedpid[pid]/ {{
  printf("%d %d proc_exec_success(\"%s\", \"%s\")\n", logindex, pid, self->exec_path,
         curpsinfo->pr_psargs);
  logindex++;
}}

syscall::open:entry, syscall::open_nocancel:entry /trackedpid[pid]/ {{
  self->open_path = arg0;
  self->open_flags = arg1;
}}

syscall::openat:entry, syscall::openat_nocancel:entry /trackedpid[pid]/ {{
  self->open_path = arg1;
  self->open_flags = arg2;
}}

syscall::open*:return /trackedpid[pid] && self->open_path/ {{
  printf("%d %d syscall_open_return(%d, %d, \"%s\")\n", logindex, pid, (int)arg0,
         self->open_flags, copyinstr(self->open_path));
  logindex++;
  self->open_path = 0;
  self->open_flags = 0;
}}

syscall::chdir:entry /trackedpid[pid]/ {{
  self->chdir_path = arg0;
}}

syscall::chdir:return /trackedpid[pid] && self->chdir_path/ {{
  printf("%d %d syscall_chdir_return(%d, \"%s\")\n", logindex, pid, (int)arg0,
         copyinstr(self->chdir_path));
  logindex++;
  self->chdir_path = 0;
}}
"#
    )
}
