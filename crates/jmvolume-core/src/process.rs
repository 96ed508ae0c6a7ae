//! Execution wrapper for every external tool jmvolume drives.
//!
//! Secrets only ever travel through the child's stdin; the argument vector is
//! safe to log and shows up verbatim in `CommandFailed`.

use crate::error::{JmvolumeError, JmvolumeResult};
use log::debug;
use std::ffi::OsStr;
use std::io::{ErrorKind, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread;
use std::time::{Duration, Instant};

/// Captured result of a finished process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Output {
    pub status: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Output {
    pub fn success(&self) -> bool {
        self.status == 0
    }
}

/// Spawns external commands with piped stdio and an optional deadline.
///
/// Without a timeout the runner waits for the child indefinitely.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self { timeout }
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Run `program` with `args`, feeding `input` to stdin, and return stdout.
    ///
    /// A non-zero exit becomes [`JmvolumeError::CommandFailed`] carrying the
    /// rendered command line and both captured streams.
    pub fn run<S: AsRef<OsStr>>(
        &self,
        program: &Path,
        args: &[S],
        input: &[u8],
    ) -> JmvolumeResult<Vec<u8>> {
        let out = self.capture(program, args, input)?;
        if out.success() {
            return Ok(out.stdout);
        }

        Err(JmvolumeError::CommandFailed {
            command: render_command(program, args),
            exit_code: out.status,
            stdout: out.stdout,
            stderr: out.stderr,
        })
    }

    /// Run a command and return its output whatever the exit status.
    pub fn capture<S: AsRef<OsStr>>(
        &self,
        program: &Path,
        args: &[S],
        input: &[u8],
    ) -> JmvolumeResult<Output> {
        let rendered = render_command(program, args);
        debug!("exec: {rendered}");

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout_handle = spawn_output_reader(child.stdout.take());
        let stderr_handle = spawn_output_reader(child.stderr.take());

        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(input).and_then(|_| stdin.flush()) {
                // The child may legitimately exit without consuming its input.
                if err.kind() != ErrorKind::BrokenPipe {
                    let _ = child.kill();
                    let _ = child.wait();
                    return Err(JmvolumeError::Io(err));
                }
            }
        }

        let status = self.wait(&mut child, &rendered)?;

        let stdout = join_reader(stdout_handle, "stdout")?;
        let stderr = join_reader(stderr_handle, "stderr")?;
        let status = status.code().unwrap_or(-1);
        debug!("exit {status}: {rendered}");

        Ok(Output {
            status,
            stdout,
            stderr,
        })
    }

    fn wait(&self, child: &mut Child, rendered: &str) -> JmvolumeResult<ExitStatus> {
        let Some(timeout) = self.timeout else {
            return Ok(child.wait()?);
        };

        let start = Instant::now();
        while start.elapsed() <= timeout {
            if let Some(status) = child.try_wait()? {
                return Ok(status);
            }
            thread::sleep(Duration::from_millis(25));
        }

        let _ = child.kill();
        let _ = child.wait();
        Err(JmvolumeError::CommandTimeout {
            command: rendered.to_string(),
            timeout,
        })
    }
}

/// Render a program and its arguments as a single display string.
pub fn render_command<S: AsRef<OsStr>>(program: &Path, args: &[S]) -> String {
    let mut rendered = program.to_string_lossy().into_owned();
    for arg in args {
        rendered.push(' ');
        rendered.push_str(&arg.as_ref().to_string_lossy());
    }
    rendered
}

fn spawn_output_reader<R>(pipe: Option<R>) -> thread::JoinHandle<std::io::Result<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || -> std::io::Result<Vec<u8>> {
        let mut buf = Vec::new();
        if let Some(mut reader) = pipe {
            reader.read_to_end(&mut buf)?;
        }
        Ok(buf)
    })
}

fn join_reader(
    handle: thread::JoinHandle<std::io::Result<Vec<u8>>>,
    stream: &str,
) -> JmvolumeResult<Vec<u8>> {
    let bytes = handle.join().map_err(|_| {
        JmvolumeError::Io(std::io::Error::new(
            ErrorKind::Other,
            format!("{stream} reader thread panicked"),
        ))
    })??;
    Ok(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::{tempdir, TempDir};

    fn echo_helper() -> (TempDir, PathBuf) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("command.sh");
        fs::write(
            &path,
            "#!/bin/sh\ntext=\"$(cat)\"\nprintf '%s' \"$text\"\nprintf '%s' \"$text\" 1>&2\nexit \"${1:-0}\"\n",
        )
        .unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        (dir, path)
    }

    #[test]
    fn run_returns_stdout_of_piped_input() {
        let (_dir, helper) = echo_helper();
        let runner = ProcessRunner::default();
        let out = runner.run::<&str>(&helper, &[], b"Milu").unwrap();
        assert_eq!(out, b"Milu");
    }

    #[test]
    fn run_surfaces_exit_code_and_streams() {
        let (_dir, helper) = echo_helper();
        let runner = ProcessRunner::default();
        let err = runner.run(&helper, &["2"], b"Milu").unwrap_err();
        match err {
            JmvolumeError::CommandFailed {
                command,
                exit_code,
                stdout,
                stderr,
            } => {
                assert_eq!(exit_code, 2);
                assert_eq!(stdout, b"Milu");
                assert_eq!(stderr, b"Milu");
                assert!(command.ends_with("command.sh 2"));
                assert!(!command.contains("Milu"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn capture_keeps_output_on_failure() {
        let (_dir, helper) = echo_helper();
        let runner = ProcessRunner::default();
        let out = runner.capture(&helper, &["3"], b"abc").unwrap();
        assert_eq!(out.status, 3);
        assert!(!out.success());
        assert_eq!(out.stdout, b"abc");
    }

    #[test]
    fn child_ignoring_stdin_is_not_an_error() {
        let runner = ProcessRunner::default();
        let input = vec![b'x'; 1 << 20];
        let out = runner.run(Path::new("/bin/sh"), &["-c", "exit 0"], &input);
        assert!(out.is_ok());
    }

    #[test]
    fn timeout_kills_hung_process() {
        let runner = ProcessRunner::new(Some(Duration::from_millis(100)));
        let err = runner
            .run(Path::new("/bin/sh"), &["-c", "sleep 5"], b"")
            .unwrap_err();
        assert!(matches!(err, JmvolumeError::CommandTimeout { .. }));
    }

    #[test]
    fn missing_binary_is_io_error() {
        let runner = ProcessRunner::default();
        let err = runner
            .run::<&str>(Path::new("/nonexistent/jmvolume-tool"), &[], b"")
            .unwrap_err();
        assert!(matches!(err, JmvolumeError::Io(_)));
    }
}
