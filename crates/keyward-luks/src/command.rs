//! Execution wrapper for the external tools keyward drives.
//!
//! Shell integration stays isolated here so the wrappers above it only deal
//! with arguments and exit codes, and tests can swap in fake binaries.

use keyward_core::error::{KeywardError, KeywardResult};
use log::debug;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use zeroize::Zeroizing;

#[derive(Debug, Clone)]
pub(crate) struct ToolCommand {
    binary: PathBuf,
    timeout: Duration,
    on_timeout: fn(String) -> KeywardError,
}

#[derive(Debug)]
pub(crate) struct Output {
    pub stdout: Zeroizing<Vec<u8>>,
    pub stderr: String,
    pub status: i32,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    /// stderr if present, stdout otherwise.
    pub fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if !stderr.is_empty() {
            return stderr.to_string();
        }
        self.stdout_text().trim().to_string()
    }

    pub fn diagnostic_lower(&self) -> String {
        self.diagnostic().to_ascii_lowercase()
    }

    /// Diagnostic text suitable for error messages.
    pub fn describe(&self) -> String {
        let diagnostic = self.diagnostic();
        if diagnostic.is_empty() {
            format!("exit code {}", self.status)
        } else {
            format!("{diagnostic} (exit code {})", self.status)
        }
    }
}

impl ToolCommand {
    pub(crate) fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self {
            binary,
            timeout,
            on_timeout: KeywardError::Provider,
        }
    }

    /// Map a timeout to a different error, e.g. `Unreachable` for keyserver calls.
    pub(crate) fn timeout_as(mut self, on_timeout: fn(String) -> KeywardError) -> Self {
        self.on_timeout = on_timeout;
        self
    }

    pub(crate) fn binary(&self) -> &Path {
        &self.binary
    }

    pub(crate) fn run(&self, args: &[&str], input: Option<&[u8]>) -> KeywardResult<Output> {
        debug!("running {} {}", self.binary.display(), args.join(" "));
        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        let mut child = command.spawn().map_err(|err| {
            KeywardError::Provider(format!("failed to run {}: {err}", self.binary.display()))
        })?;

        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                // A tool that exits before reading its stdin is reported through
                // its exit status, not as a broken pipe.
                if let Err(err) = stdin.write_all(payload) {
                    debug!("{}: stdin closed early: {err}", self.binary.display());
                }
            }
        }

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();
        self.wait_with_timeout(child, stdout_pipe, stderr_pipe)
    }

    fn wait_with_timeout(
        &self,
        mut child: Child,
        stdout_pipe: Option<ChildStdout>,
        stderr_pipe: Option<ChildStderr>,
    ) -> KeywardResult<Output> {
        let start = Instant::now();
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);
        let mut exit_status = None;

        while start.elapsed() <= self.timeout {
            if let Some(status) = child.try_wait()? {
                exit_status = Some(status);
                break;
            }
            thread::sleep(Duration::from_millis(25));
        }

        let Some(exit_status) = exit_status else {
            let _ = child.kill();
            let _ = child.wait();
            return Err((self.on_timeout)(format!(
                "{} timed out after {:?}",
                self.binary.display(),
                self.timeout
            )));
        };

        let stdout = stdout_handle
            .join()
            .map_err(|_| KeywardError::Provider("stdout reader thread panicked".into()))??;
        let stderr = stderr_handle
            .join()
            .map_err(|_| KeywardError::Provider("stderr reader thread panicked".into()))??;

        Ok(Output {
            stdout,
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            status: exit_status.code().unwrap_or(-1),
        })
    }
}

/// Key material handed to a tool that only accepts it as a file argument.
///
/// The file is created `0600` in the system temp dir and removed on drop.
pub(crate) struct KeyFile {
    file: NamedTempFile,
}

impl KeyFile {
    pub(crate) fn write(key: &[u8]) -> KeywardResult<Self> {
        let mut file = tempfile::Builder::new().prefix(".keyward-key-").tempfile()?;
        file.write_all(key)?;
        file.as_file().sync_all()?;
        Ok(Self { file })
    }

    pub(crate) fn path_arg(&self) -> String {
        self.file.path().to_string_lossy().into_owned()
    }
}

pub(crate) fn dev_mapper_node_exists(name: &str) -> bool {
    let root = Path::new("/dev/mapper");
    root.is_dir() && root.join(name).exists()
}

/// The tool does not know the subcommand (older cryptsetup without `open`/`close`).
pub(crate) fn action_unsupported(output: &Output) -> bool {
    let lower = output.diagnostic_lower();
    lower.contains("unknown action")
        || lower.contains("unknown command")
        || lower.contains("invalid action")
        || lower.contains("invalid command")
        || lower.contains("unknown option")
}

pub(crate) fn permission_denied(lower: &str) -> bool {
    lower.contains("permission denied")
        || lower.contains("operation not permitted")
        || lower.contains("not permitted")
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<KeywardResult<Zeroizing<Vec<u8>>>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> KeywardResult<Zeroizing<Vec<u8>>> {
        let mut buf = Zeroizing::new(Vec::new());
        if let Some(mut reader) = pipe {
            reader.read_to_end(&mut buf)?;
        }
        Ok(buf)
    })
}
