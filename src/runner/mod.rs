//! External command execution.
//!
//! All tools the orchestrator drives (cloud CLI, terraform, build tools, npm)
//! are invoked through `CommandRunner` with argv-style `CommandSpec`s.

pub mod command;
pub mod process;

pub use command::{CommandSpec, CommandTemplate, Vars, render_str};
pub use process::{CommandOutput, CommandRunner, ProcessRunner};

#[cfg(test)]
pub(crate) mod stub {
    //! Scripted `CommandRunner` for tests.

    use super::{CommandOutput, CommandRunner, CommandSpec};
    use crate::errors::RunnerError;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;

    #[derive(Debug, Clone)]
    pub enum Reply {
        Exit {
            code: i32,
            stdout: String,
            stderr: String,
        },
        NotFound,
    }

    impl Reply {
        pub fn ok(stdout: &str) -> Self {
            Reply::Exit {
                code: 0,
                stdout: stdout.to_string(),
                stderr: String::new(),
            }
        }

        pub fn fail(code: i32, stderr: &str) -> Self {
            Reply::Exit {
                code,
                stdout: String::new(),
                stderr: stderr.to_string(),
            }
        }
    }

    /// Answers each command with the first rule whose needle occurs in the
    /// command's display string; falls back to `default`.
    pub struct StubRunner {
        rules: Vec<(String, Reply)>,
        default: Reply,
        calls: Mutex<Vec<String>>,
    }

    impl StubRunner {
        pub fn succeeding() -> Self {
            Self {
                rules: Vec::new(),
                default: Reply::ok(""),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn with_default(default: Reply) -> Self {
            Self {
                rules: Vec::new(),
                default,
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn on(mut self, needle: &str, reply: Reply) -> Self {
            self.rules.push((needle.to_string(), reply));
            self
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        pub fn calls_containing(&self, needle: &str) -> usize {
            self.calls().iter().filter(|c| c.contains(needle)).count()
        }
    }

    #[async_trait]
    impl CommandRunner for StubRunner {
        async fn run(
            &self,
            spec: &CommandSpec,
            _timeout: Option<Duration>,
        ) -> Result<CommandOutput, RunnerError> {
            let shown = spec.display();
            self.calls.lock().unwrap().push(shown.clone());
            let reply = self
                .rules
                .iter()
                .find(|(needle, _)| shown.contains(needle.as_str()))
                .map(|(_, r)| r.clone())
                .unwrap_or_else(|| self.default.clone());
            match reply {
                Reply::Exit {
                    code,
                    stdout,
                    stderr,
                } => Ok(CommandOutput {
                    exit_code: Some(code),
                    stdout,
                    stderr,
                    duration_ms: 1,
                }),
                Reply::NotFound => Err(RunnerError::Launch {
                    program: spec.program.clone(),
                    source: std::io::Error::new(std::io::ErrorKind::NotFound, "not found"),
                }),
            }
        }
    }
}
