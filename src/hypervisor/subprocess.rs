//! The shared "run argv, capture exit/stdout/stderr" seam used by the
//! hypervisor driver, the disk builder, and the seed builder.

use std::process::Command;

use anyhow::{Context, Result};

/// Captured result of running a child process to completion.
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(&self) -> bool {
        self.status == 0
    }
}

/// Anything that can run an external tool and capture its output.
/// Production code uses [`RealRunner`]; tests substitute a recording fake.
pub trait Runner: Send + Sync {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;
}

/// Runs tools as real child processes via `std::process::Command`.
#[derive(Debug, Default, Clone, Copy)]
pub struct RealRunner;

impl Runner for RealRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .output()
            .with_context(|| format!("failed to spawn {program}"))?;
        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(test)]
pub mod fakes {
    //! A recording fake runner for component tests that must not spawn
    //! real `virsh`/`qemu-img`/`genisoimage` processes.
    use std::sync::Mutex;

    use super::*;

    pub struct RecordingRunner {
        pub calls: Mutex<Vec<(String, Vec<String>)>>,
        pub responses: Mutex<Vec<CommandOutput>>,
    }

    impl RecordingRunner {
        pub fn new(responses: Vec<CommandOutput>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                responses: Mutex::new(responses),
            }
        }

        pub fn calls(&self) -> Vec<(String, Vec<String>)> {
            self.calls.lock().unwrap().clone()
        }
    }

    impl Runner for RecordingRunner {
        fn run(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push((
                program.to_string(),
                args.iter().map(|s| s.to_string()).collect(),
            ));
            let mut responses = self.responses.lock().unwrap();
            if responses.is_empty() {
                Ok(CommandOutput {
                    status: 0,
                    stdout: String::new(),
                    stderr: String::new(),
                })
            } else {
                Ok(responses.remove(0))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn real_runner_captures_exit_code_and_stdout() -> Result<()> {
        let runner = RealRunner;
        let out = runner.run("true", &[])?;
        assert!(out.ok());

        let out = runner.run("false", &[])?;
        assert!(!out.ok());
        Ok(())
    }

    #[test]
    fn recording_runner_replays_queued_responses() -> Result<()> {
        let fake = fakes::RecordingRunner::new(vec![CommandOutput {
            status: 0,
            stdout: "192.168.122.5\n".to_string(),
            stderr: String::new(),
        }]);
        let out = fake.run("virsh", &["domifaddr", "demo"])?;
        assert_eq!(out.stdout.trim(), "192.168.122.5");
        assert_eq!(fake.calls().len(), 1);
        Ok(())
    }
}
