use std::{
    ffi::{OsStr, OsString},
    process::Command,
};

/// A command line that can still be wrapped by the tracing tool before it is spawned.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    program: OsString,
    argv: Vec<OsString>,
    cwd: Option<OsString>,
}

impl CommandBuilder {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            argv: Vec::new(),
            cwd: None,
        }
    }

    /// Builds from a full argv, `None` when it is empty.
    pub fn from_argv<S: AsRef<OsStr>>(argv: &[S]) -> Option<Self> {
        let (program, args) = argv.split_first()?;
        let mut builder = Self::new(program);
        builder.args(args);
        Some(builder)
    }

    pub fn build(self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.argv);
        if let Some(cwd) = self.cwd {
            command.current_dir(cwd);
        }
        command
    }

    pub fn arg<S: AsRef<OsStr>>(&mut self, arg: S) -> &mut Self {
        self.argv.push(arg.as_ref().to_owned());
        self
    }

    pub fn args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        for arg in args {
            self.arg(arg.as_ref());
        }
        self
    }

    pub fn current_dir<D>(&mut self, dir: D) -> &mut Self
    where
        D: AsRef<OsStr>,
    {
        self.cwd = Some(dir.as_ref().to_owned());
        self
    }

    /// Prepends `wrapper` and its arguments, the current command becomes the wrapped one.
    pub fn wrap<S, I, T>(&mut self, wrapper: S, wrapper_args: I) -> &mut Self
    where
        S: AsRef<OsStr>,
        I: IntoIterator<Item = T>,
        T: AsRef<OsStr>,
    {
        let mut new_argv: Vec<OsString> = wrapper_args
            .into_iter()
            .map(|arg| arg.as_ref().to_owned())
            .collect();
        new_argv.push(std::mem::replace(
            &mut self.program,
            wrapper.as_ref().to_owned(),
        ));
        new_argv.append(&mut self.argv);
        self.argv = new_argv;
        self
    }

    /// The program followed by its arguments.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(&self.program)
            .chain(self.argv.iter())
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    /// Returns the command line as a string for logging
    pub fn as_command_line(&self) -> String {
        shell_words::join(self.argv())
    }
}
