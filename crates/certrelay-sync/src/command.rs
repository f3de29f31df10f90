//! External command execution

use std::io::Write;
use std::process::{Command, Stdio};

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command '{command}' exited with {status}: {output}")]
    Failed {
        command: String,
        status: String,
        output: String,
    },

    #[error("Command task failed: {0}")]
    Join(String),
}

/// Captured output of a successful command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl CommandOutput {
    /// stdout followed by stderr, lossily decoded
    pub fn combined(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        text.push_str(&String::from_utf8_lossy(&self.stderr));
        text
    }
}

/// Runs external programs
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run `program` to completion, feeding `stdin` if given
    ///
    /// `env` is set on the child only and never appears in errors or logs.
    /// A non-zero exit status is an error carrying the combined output.
    async fn run(
        &self,
        program: &str,
        args: &[String],
        env: &[(&str, &str)],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, CommandError>;
}

/// Runs commands with `std::process` on the blocking pool
#[derive(Debug, Clone, Default)]
pub struct SystemCommandRunner;

#[async_trait]
impl CommandRunner for SystemCommandRunner {
    async fn run(
        &self,
        program: &str,
        args: &[String],
        env: &[(&str, &str)],
        stdin: Option<&[u8]>,
    ) -> Result<CommandOutput, CommandError> {
        let program = program.to_string();
        let args = args.to_vec();
        let env: Vec<(String, String)> = env
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let stdin = stdin.map(<[u8]>::to_vec);

        tokio::task::spawn_blocking(move || run_blocking(&program, &args, &env, stdin))
            .await
            .map_err(|e| CommandError::Join(e.to_string()))?
    }
}

fn run_blocking(
    program: &str,
    args: &[String],
    env: &[(String, String)],
    stdin: Option<Vec<u8>>,
) -> Result<CommandOutput, CommandError> {
    let command_line = std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ");
    debug!("Running {}", program);

    let spawn_err = |source| CommandError::Spawn {
        program: program.to_string(),
        source,
    };

    let mut child = Command::new(program)
        .args(args)
        .envs(env.iter().map(|(k, v)| (k, v)))
        .stdin(if stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(spawn_err)?;

    // Feed stdin from another thread so a chatty child cannot deadlock us
    let writer = match (stdin, child.stdin.take()) {
        (Some(data), Some(mut pipe)) => Some(std::thread::spawn(move || pipe.write_all(&data))),
        _ => None,
    };

    let output = child.wait_with_output().map_err(spawn_err)?;
    if let Some(writer) = writer {
        match writer.join() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!("Writing stdin of {} failed: {}", program, e),
            Err(_) => debug!("stdin writer for {} panicked", program),
        }
    }

    let captured = CommandOutput {
        stdout: output.stdout,
        stderr: output.stderr,
    };

    if !output.status.success() {
        return Err(CommandError::Failed {
            command: command_line,
            status: output.status.to_string(),
            output: captured.combined().trim().to_string(),
        });
    }

    Ok(captured)
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_captures_stdout_and_stderr() {
        let output = SystemCommandRunner
            .run("sh", &args(&["-c", "echo out; echo err >&2"]), &[], None)
            .await
            .unwrap();

        assert_eq!(output.stdout, b"out\n");
        assert_eq!(output.stderr, b"err\n");
        assert_eq!(output.combined(), "out\nerr\n");
    }

    #[tokio::test]
    async fn test_feeds_stdin() {
        let output = SystemCommandRunner
            .run("cat", &[], &[], Some(b"piped bytes"))
            .await
            .unwrap();

        assert_eq!(output.stdout, b"piped bytes");
    }

    #[tokio::test]
    async fn test_non_zero_exit() {
        let err = SystemCommandRunner
            .run("sh", &args(&["-c", "echo broken >&2; exit 3"]), &[], None)
            .await
            .unwrap_err();

        match err {
            CommandError::Failed {
                command, output, ..
            } => {
                assert!(command.starts_with("sh -c"));
                assert_eq!(output, "broken");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = SystemCommandRunner
            .run("definitely-not-a-real-program-xyz", &[], &[], None)
            .await
            .unwrap_err();

        assert!(matches!(err, CommandError::Spawn { .. }));
    }

    #[tokio::test]
    async fn test_env_reaches_child_but_not_error() {
        let output = SystemCommandRunner
            .run(
                "sh",
                &args(&["-c", "printf %s \"$SECRET_VALUE\""]),
                &[("SECRET_VALUE", "hunter2")],
                None,
            )
            .await
            .unwrap();
        assert_eq!(output.stdout, b"hunter2");

        let err = SystemCommandRunner
            .run("sh", &args(&["-c", "exit 1"]), &[("SECRET_VALUE", "hunter2")], None)
            .await
            .unwrap_err();
        assert!(!err.to_string().contains("hunter2"));
    }
}
