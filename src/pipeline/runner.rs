//! Execution of [`EngineCommand`]s as blocking OS processes.

use crate::pipeline::command::EngineCommand;
use std::process::Command;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Outcome of a successful command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command exited with {}: {command}\n{stderr}", .code.map_or_else(|| "a signal".to_string(), |c| format!("code {}", c)))]
    Failed {
        command: String,
        code: Option<i32>,
        stderr: String,
    },
}

/// Something that can run an external command to completion.
pub trait CommandRunner: Send + Sync {
    fn run(&self, command: &EngineCommand) -> Result<CommandOutput, CommandError>;
}

/// Runs commands with `std::process`, waiting for each to exit.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

impl CommandRunner for ProcessRunner {
    fn run(&self, command: &EngineCommand) -> Result<CommandOutput, CommandError> {
        tracing::info!("{}", command);
        let start = Instant::now();
        let output = Command::new(&command.program)
            .args(&command.args)
            .output()
            .map_err(|source| CommandError::Spawn {
                program: command.program.clone(),
                source,
            })?;
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        if !output.status.success() {
            return Err(CommandError::Failed {
                command: command.to_string(),
                code: output.status.code(),
                stderr,
            });
        }
        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr,
            elapsed: start.elapsed(),
        })
    }
}

/// Prints commands instead of running them.
#[derive(Debug, Clone, Copy, Default)]
pub struct DryRunRunner;

impl CommandRunner for DryRunRunner {
    fn run(&self, command: &EngineCommand) -> Result<CommandOutput, CommandError> {
        println!("{}", command);
        Ok(CommandOutput::default())
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted stand-in for the reconstruction engine.

    use super::*;
    use std::sync::Mutex;

    type Effect = Box<dyn Fn(&EngineCommand) -> Result<(), String> + Send + Sync>;

    /// Records every command; `effect` may write the files a real engine
    /// would produce or return an error to simulate a failing program.
    pub struct ScriptedRunner {
        pub commands: Mutex<Vec<EngineCommand>>,
        effect: Effect,
    }

    impl ScriptedRunner {
        pub fn new(effect: impl Fn(&EngineCommand) -> Result<(), String> + Send + Sync + 'static) -> Self {
            Self {
                commands: Mutex::new(Vec::new()),
                effect: Box::new(effect),
            }
        }

        pub fn succeeding() -> Self {
            Self::new(|_| Ok(()))
        }

        pub fn recorded(&self) -> Vec<EngineCommand> {
            self.commands.lock().unwrap().clone()
        }
    }

    impl CommandRunner for ScriptedRunner {
        fn run(&self, command: &EngineCommand) -> Result<CommandOutput, CommandError> {
            self.commands.lock().unwrap().push(command.clone());
            (self.effect)(command).map_err(|stderr| CommandError::Failed {
                command: command.to_string(),
                code: Some(1),
                stderr,
            })?;
            Ok(CommandOutput::default())
        }
    }
}
