//! Subprocess runner shared by the cryptsetup engine and the host tools.
//!
//! Shell integration stays isolated here so the adapters can be exercised
//! with fake binaries.

use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdout, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug, Clone)]
pub(crate) struct ToolCommand {
    binary: PathBuf,
    /// `None` waits for the child however long it takes.
    timeout: Option<Duration>,
}

#[derive(Debug)]
pub(crate) struct Output {
    pub(crate) stdout: String,
    pub(crate) stderr: String,
    pub(crate) status: i32,
}

impl Output {
    pub(crate) fn success(&self) -> bool {
        self.status == 0
    }

    /// Stderr when present, stdout otherwise, trimmed.
    pub(crate) fn diagnostic(&self) -> String {
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            self.stdout.trim().to_string()
        } else {
            stderr.to_string()
        }
    }

    /// Diagnostic text for error messages; never empty.
    pub(crate) fn describe(&self) -> String {
        let diagnostic = self.diagnostic();
        if diagnostic.is_empty() {
            "no additional output".to_string()
        } else {
            diagnostic
        }
    }
}

impl ToolCommand {
    pub(crate) fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self {
            binary,
            timeout: Some(timeout),
        }
    }

    pub(crate) fn unbounded(binary: PathBuf) -> Self {
        Self {
            binary,
            timeout: None,
        }
    }

    pub(crate) fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub(crate) fn binary(&self) -> &Path {
        &self.binary
    }

    /// Run the binary with `args`, feeding `input` on stdin when given.
    ///
    /// A child that exits without reading its stdin is not an error. Exceeding
    /// the timeout, when one is set, kills the child and reports
    /// `ErrorKind::TimedOut`.
    pub(crate) fn run(&self, args: &[&str], input: Option<&[u8]>) -> io::Result<Output> {
        let mut command = Command::new(&self.binary);
        command.args(args);
        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());
        command.stdin(if input.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        });

        log::debug!("running {} {}", self.binary.display(), args.join(" "));
        let mut child = command.spawn()?;

        if let Some(payload) = input {
            if let Some(mut stdin) = child.stdin.take() {
                match stdin.write_all(payload).and_then(|_| stdin.flush()) {
                    Ok(()) => {}
                    Err(err) if err.kind() == io::ErrorKind::BrokenPipe => {}
                    Err(err) => {
                        let _ = child.kill();
                        let _ = child.wait();
                        return Err(err);
                    }
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
    ) -> io::Result<Output> {
        let stdout_handle = spawn_output_reader(stdout_pipe);
        let stderr_handle = spawn_output_reader(stderr_pipe);

        let exit_status = match self.timeout {
            None => child.wait()?,
            Some(timeout) => match poll_until(&mut child, timeout)? {
                Some(status) => status,
                None => {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(io::Error::new(
                        io::ErrorKind::TimedOut,
                        format!("{} timed out after {timeout:?}", self.binary.display()),
                    ));
                }
            },
        };

        let stdout = join_reader(stdout_handle, "stdout")?;
        let stderr = join_reader(stderr_handle, "stderr")?;

        Ok(Output {
            stdout,
            stderr,
            status: exit_status.code().unwrap_or(-1),
        })
    }
}

/// Poll `child` until it exits or `timeout` elapses; `None` means still running.
fn poll_until(child: &mut Child, timeout: Duration) -> io::Result<Option<ExitStatus>> {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if Instant::now() >= deadline {
            return Ok(None);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

fn join_reader(handle: thread::JoinHandle<io::Result<String>>, stream: &str) -> io::Result<String> {
    handle.join().map_err(|_| {
        io::Error::new(
            io::ErrorKind::Other,
            format!("{stream} reader thread panicked"),
        )
    })?
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<io::Result<String>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> io::Result<String> {
        if let Some(mut reader) = pipe {
            let mut buf = Vec::new();
            reader.read_to_end(&mut buf)?;
            Ok(String::from_utf8_lossy(&buf).to_string())
        } else {
            Ok(String::new())
        }
    })
}
