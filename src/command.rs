use crate::workload::Workload;
use std::{
    collections::BTreeMap,
    ffi::{OsStr, OsString},
    process::Command,
};

#[derive(Debug, Clone)]
pub struct CommandBuilder {
    program: OsString,
    argv: Vec<OsString>,
    envs: BTreeMap<OsString, OsString>,
    cwd: Option<OsString>,
}

impl CommandBuilder {
    pub fn new<S: AsRef<OsStr>>(program: S) -> Self {
        Self {
            program: program.as_ref().to_owned(),
            argv: Vec::new(),
            envs: BTreeMap::new(),
            cwd: None,
        }
    }

    /// Build from a full argv, the first element being the program.
    pub fn from_argv<I, S>(argv: I) -> Option<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut argv = argv.into_iter();
        let mut builder = Self::new(argv.next()?);
        builder.args(argv);
        Some(builder)
    }

    pub fn build(&self) -> Command {
        let mut command = Command::new(&self.program);
        command.args(&self.argv);
        command.envs(&self.envs);
        if let Some(cwd) = &self.cwd {
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

    pub fn env<K: AsRef<OsStr>, V: AsRef<OsStr>>(&mut self, key: K, value: V) -> &mut Self {
        self.envs
            .insert(key.as_ref().to_owned(), value.as_ref().to_owned());
        self
    }

    pub fn current_dir<D>(&mut self, dir: D) -> &mut Self
    where
        D: AsRef<OsStr>,
    {
        self.cwd = Some(dir.as_ref().to_owned());
        self
    }

    pub fn get_current_dir(&self) -> Option<&OsStr> {
        self.cwd.as_deref()
    }

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
        new_argv.push(self.program.clone());
        new_argv.extend(self.argv.iter().cloned());

        self.program = wrapper.as_ref().to_owned();
        self.argv = new_argv;
        self
    }

    /// Program followed by its arguments, lossily converted for logs and traces.
    pub fn argv(&self) -> Vec<String> {
        std::iter::once(&self.program)
            .chain(self.argv.iter())
            .map(|arg| arg.to_string_lossy().into_owned())
            .collect()
    }

    /// Returns the command line as a string for debugging/testing purposes
    pub fn as_command_line(&self) -> String {
        shell_words::join(self.argv())
    }
}

/// Turns a workload into the command line of the job runner.
///
/// How the actual job invocation is assembled is up to the implementation; the supervisor only
/// needs an argv, an environment and a working directory.
pub trait CommandFactory: Send + Sync {
    fn build(&self, workload: &Workload, extra_args: &[String]) -> CommandBuilder;
}

/// Builds `act -W <workflow> [-j <job>] [extra args...]`.
#[derive(Debug, Clone)]
pub struct ActCommandFactory {
    binary: String,
}

impl ActCommandFactory {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for ActCommandFactory {
    fn default() -> Self {
        Self::new("act")
    }
}

impl CommandFactory for ActCommandFactory {
    fn build(&self, workload: &Workload, extra_args: &[String]) -> CommandBuilder {
        let mut builder = CommandBuilder::new(&self.binary);
        builder.arg("-W").arg(&workload.definition);
        if let Some(job) = &workload.job {
            builder.arg("-j").arg(job);
        }
        builder.args(extra_args);
        builder.current_dir(&workload.working_dir);
        for (key, value) in &workload.env {
            builder.env(key, value);
        }
        builder
    }
}

/// Runs an arbitrary, fixed argv regardless of the workload. Handy for wrapping any CI command.
#[derive(Debug, Clone)]
pub struct FixedCommandFactory {
    argv: Vec<String>,
}

impl FixedCommandFactory {
    pub fn new(argv: Vec<String>) -> Self {
        Self { argv }
    }
}

impl CommandFactory for FixedCommandFactory {
    fn build(&self, workload: &Workload, extra_args: &[String]) -> CommandBuilder {
        let mut builder =
            CommandBuilder::from_argv(&self.argv).unwrap_or_else(|| CommandBuilder::new("true"));
        builder.args(extra_args);
        builder.current_dir(&workload.working_dir);
        for (key, value) in &workload.env {
            builder.env(key, value);
        }
        builder
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_with_args() {
        let mut builder = CommandBuilder::new("systemctl");
        builder.arg("restart").arg("docker").wrap("sudo", ["-n"]);
        assert_eq!(builder.as_command_line(), "sudo -n systemctl restart docker");
    }

    #[test]
    fn test_wrap_with_spaces() {
        let mut builder = CommandBuilder::new("echo");
        builder.arg("hello world").wrap("sh", ["-c"]);
        assert_eq!(builder.as_command_line(), "sh -c echo 'hello world'");
    }

    #[test]
    fn test_wrap_and_build() {
        let mut builder = CommandBuilder::new("ls");
        builder.arg("-la").wrap("sudo", ["-n"]);

        let cmd = builder.build();
        assert_eq!(cmd.get_program(), "sudo");

        let args: Vec<_> = cmd.get_args().collect();
        assert_eq!(args, vec!["-n", "ls", "-la"]);
    }

    #[test]
    fn test_from_argv() {
        let builder = CommandBuilder::from_argv(["sleep", "3"]).unwrap();
        assert_eq!(builder.argv(), vec!["sleep", "3"]);
        assert!(CommandBuilder::from_argv(Vec::<String>::new()).is_none());
    }

    #[test]
    fn test_act_command_factory() {
        let mut workload = Workload::new("ci.yml")
            .with_job("build")
            .with_working_dir("/repo");
        workload.env.insert("CI".into(), "true".into());

        let builder = ActCommandFactory::default().build(&workload, &["--verbose".into()]);
        assert_eq!(builder.as_command_line(), "act -W ci.yml -j build --verbose");
        assert_eq!(builder.get_current_dir(), Some(OsStr::new("/repo")));

        let cmd = builder.build();
        let envs: Vec<_> = cmd.get_envs().collect();
        assert_eq!(envs, vec![(OsStr::new("CI"), Some(OsStr::new("true")))]);
    }

    #[test]
    fn test_fixed_command_factory() {
        let factory = FixedCommandFactory::new(vec!["sh".into(), "-c".into(), "exit 3".into()]);
        let builder = factory.build(&Workload::new("ci.yml"), &[]);
        assert_eq!(builder.argv(), vec!["sh", "-c", "exit 3"]);
    }
}
