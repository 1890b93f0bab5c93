use serde::Deserialize;

/// Which ReScript build tool to drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compiler {
    #[default]
    Rescript,
    Rewatch,
}

impl Compiler {
    pub fn label(self) -> &'static str {
        match self {
            Compiler::Rescript => "rescript",
            Compiler::Rewatch => "rewatch",
        }
    }

    fn watch_args(self) -> &'static [&'static str] {
        match self {
            Compiler::Rescript => &["-w"],
            Compiler::Rewatch => &["watch"],
        }
    }

    fn build_args(self) -> &'static [&'static str] {
        match self {
            Compiler::Rescript => &[],
            Compiler::Rewatch => &["build"],
        }
    }

    /// Only rewatch holds an exclusive lock and reports the PID of the holder.
    fn reports_conflicts(self) -> bool {
        matches!(self, Compiler::Rewatch)
    }

    /// Watch-mode invocation, using `program` in place of the default binary name.
    pub fn watch_command(self, program: Option<&str>) -> CompilerCommand {
        self.command(program, self.watch_args())
    }

    /// One-shot build invocation.
    pub fn build_command(self, program: Option<&str>) -> CompilerCommand {
        self.command(program, self.build_args())
    }

    fn command(self, program: Option<&str>, args: &[&str]) -> CompilerCommand {
        CompilerCommand {
            program: program.unwrap_or(self.label()).to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            label: self.label().to_string(),
            detect_conflicts: self.reports_conflicts(),
        }
    }
}

/// A resolved command line plus the bits of tool behavior the supervisor needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompilerCommand {
    pub program: String,
    pub args: Vec<String>,
    /// Name used in user-facing log lines.
    pub label: String,
    /// Whether stderr should be scanned for "already running" conflicts.
    pub detect_conflicts: bool,
}

impl CompilerCommand {
    pub fn to_command(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }

    /// Shell-style rendering for log lines.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}
