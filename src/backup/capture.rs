// dumpship/src/backup/capture.rs
use std::collections::VecDeque;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdout, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::db_dump::{DumpOutput, ProcessSpec};
use crate::errors::{BackupError, Result};
use crate::utils::find_executable;

/// Lines of dump stderr kept for error reports.
pub const STDERR_TAIL_LINES: usize = 20;

/// A dump that finished writing to disk.
#[derive(Debug)]
pub struct FileDump {
    pub name: String,
    pub path: PathBuf,
    pub len: u64,
}

/// A dump process still running, read through its stdout.
#[derive(Debug)]
pub struct LiveDump {
    name: String,
    child: Child,
    stdout: ChildStdout,
    stderr: JoinHandle<String>,
}

/// Produced once by capture and handed by value to exactly one upload sink.
#[derive(Debug)]
pub enum DumpArtifact {
    File(FileDump),
    Stream(LiveDump),
}

impl DumpArtifact {
    pub fn name(&self) -> &str {
        match self {
            DumpArtifact::File(file) => &file.name,
            DumpArtifact::Stream(live) => &live.name,
        }
    }
}

fn command(spec: &ProcessSpec) -> Result<Command> {
    let program = find_executable(&spec.program)?;
    debug!(program = %program.display(), "Resolved dump executable");

    let mut cmd = Command::new(program);
    cmd.args(&spec.args)
        .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    Ok(cmd)
}

/// Copies the child's stderr to ours line by line and returns the last lines seen.
fn forward_stderr(stderr: Option<ChildStderr>) -> JoinHandle<String> {
    tokio::spawn(async move {
        let Some(stderr) = stderr else {
            return String::new();
        };
        let mut reader = BufReader::new(stderr);
        let mut host = tokio::io::stderr();
        let mut tail: VecDeque<String> = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut buf = Vec::new();

        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let _ = host.write_all(&buf).await;
                    let line = String::from_utf8_lossy(&buf).trim_end().to_string();
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
            }
        }
        let _ = host.flush().await;
        Vec::from(tail).join("\n")
    })
}

/// Runs the dump to completion, leaving its output at `path`.
///
/// When the dump goes to stdout, stdout is redirected into `path`. The caller owns
/// `path` and removes it whatever the outcome.
pub async fn capture_to_file(
    spec: &ProcessSpec,
    path: &Path,
    cancel: &CancellationToken,
) -> Result<FileDump> {
    let mut cmd = command(spec)?;
    match &spec.output {
        DumpOutput::ToolWritesFile(_) => {
            cmd.stdout(Stdio::inherit());
        }
        DumpOutput::Stdout => {
            let file = tokio::fs::File::create(path).await?.into_std().await;
            cmd.stdout(Stdio::from(file));
        }
    }

    info!(command = %spec.redacted(), destination = %path.display(), "Creating backup");
    let mut child = cmd.spawn()?;
    let stderr = forward_stderr(child.stderr.take());

    let status = tokio::select! {
        status = child.wait() => status?,
        _ = cancel.cancelled() => {
            warn!("Cancellation requested, terminating dump process");
            if let Err(e) = child.kill().await {
                warn!(error = %e, "Failed to terminate dump process");
            }
            stderr.abort();
            return Err(BackupError::Cancelled);
        }
    };
    let stderr_tail = stderr.await.unwrap_or_default();

    if !status.success() {
        return Err(BackupError::CaptureFailed {
            exit_code: status.code(),
            stderr_tail,
        });
    }

    let len = tokio::fs::metadata(path).await?.len();
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    info!(path = %path.display(), bytes = len, "Backup created successfully");
    Ok(FileDump {
        name,
        path: path.to_path_buf(),
        len,
    })
}

/// Starts the dump and returns without waiting; the bytes are read from [`LiveDump::reader`].
pub fn start_stream(spec: &ProcessSpec, name: String) -> Result<LiveDump> {
    let mut cmd = command(spec)?;
    cmd.stdout(Stdio::piped());

    info!(command = %spec.redacted(), artifact = %name, "Starting streaming backup");
    let mut child = cmd.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| io::Error::other("dump process stdout was not captured"))?;
    let stderr = forward_stderr(child.stderr.take());

    Ok(LiveDump {
        name,
        child,
        stdout,
        stderr,
    })
}

impl LiveDump {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn reader(&mut self) -> &mut ChildStdout {
        &mut self.stdout
    }

    /// Waits for the process once its output has been drained. A non-zero exit means the
    /// bytes already read cannot be trusted.
    pub async fn finish(self) -> Result<()> {
        let LiveDump {
            mut child,
            stdout,
            stderr,
            ..
        } = self;
        drop(stdout);

        let status = child.wait().await?;
        let stderr_tail = stderr.await.unwrap_or_default();
        if status.success() {
            debug!("Streaming dump process exited cleanly");
            Ok(())
        } else {
            Err(BackupError::CapturePartialFailure {
                exit_code: status.code(),
                stderr_tail,
            })
        }
    }

    /// Kills the process after an upload failure or cancellation.
    pub async fn terminate(mut self) {
        if let Err(e) = self.child.kill().await {
            warn!(error = %e, "Failed to terminate dump process");
        }
        self.stderr.abort();
    }
}

/// The run's on-disk dump. Removed explicitly once delivery reaches a terminal outcome,
/// or on drop if the run unwinds first.
#[derive(Debug)]
pub struct ScratchFile {
    path: PathBuf,
    removed: bool,
}

impl ScratchFile {
    pub fn new(path: PathBuf) -> Self {
        ScratchFile {
            path,
            removed: false,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn remove(mut self) {
        self.removed = true;
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => debug!(path = %self.path.display(), "Removed temporary dump file"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %self.path.display(),
                error = %e,
                "Failed to remove temporary dump file"
            ),
        }
    }
}

impl Drop for ScratchFile {
    fn drop(&mut self) {
        if !self.removed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn sh(script: &str, output: DumpOutput) -> ProcessSpec {
        ProcessSpec {
            program: "sh".into(),
            args: vec!["-c".into(), script.into()],
            env: Vec::new(),
            output,
        }
    }

    #[tokio::test]
    async fn test_file_capture_length_matches_filesystem() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dump-app-2024-03-01T12:30:00Z.backup");
        let spec = sh("printf 0123456789", DumpOutput::Stdout);

        let dump = capture_to_file(&spec, &path, &CancellationToken::new()).await?;
        assert_eq!(dump.len, 10);
        assert_eq!(dump.len, std::fs::metadata(&path)?.len());
        assert_eq!(dump.name, "dump-app-2024-03-01T12:30:00Z.backup");
        Ok(())
    }

    #[tokio::test]
    async fn test_file_capture_when_tool_writes_the_file() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dump.backup");
        let mut spec = sh("printf abc > \"$0\"", DumpOutput::ToolWritesFile(path.clone()));
        spec.args.push(path.to_string_lossy().into_owned());

        let dump = capture_to_file(&spec, &path, &CancellationToken::new()).await?;
        assert_eq!(dump.len, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_file_capture_reports_exit_code_and_stderr() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dump.backup");
        let spec = sh("echo 'pg_dump: error: connection refused' >&2; exit 3", DumpOutput::Stdout);

        match capture_to_file(&spec, &path, &CancellationToken::new()).await {
            Err(BackupError::CaptureFailed {
                exit_code,
                stderr_tail,
            }) => {
                assert_eq!(exit_code, Some(3));
                assert!(stderr_tail.contains("connection refused"));
            }
            other => panic!("expected CaptureFailed, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_stderr_tail_keeps_only_last_lines() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dump.backup");
        let spec = sh(
            "i=1; while [ $i -le 30 ]; do echo line$i >&2; i=$((i+1)); done; exit 1",
            DumpOutput::Stdout,
        );

        match capture_to_file(&spec, &path, &CancellationToken::new()).await {
            Err(BackupError::CaptureFailed { stderr_tail, .. }) => {
                let lines: Vec<&str> = stderr_tail.lines().collect();
                assert_eq!(lines.len(), STDERR_TAIL_LINES);
                assert_eq!(lines.first(), Some(&"line11"));
                assert_eq!(lines.last(), Some(&"line30"));
            }
            other => panic!("expected CaptureFailed, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_cancellation_stops_file_capture() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("dump.backup");
        let spec = sh("sleep 30", DumpOutput::Stdout);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = capture_to_file(&spec, &path, &cancel).await;
        assert!(matches!(result, Err(BackupError::Cancelled)));
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_tool_is_reported() {
        let mut spec = sh("true", DumpOutput::Stdout);
        spec.program = "dumpship-no-such-tool".into();
        match start_stream(&spec, "x".into()) {
            Err(BackupError::ToolNotFound { program }) => {
                assert_eq!(program, "dumpship-no-such-tool")
            }
            other => panic!("expected ToolNotFound, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_stream_delivers_bytes_then_checks_exit() -> anyhow::Result<()> {
        let spec = sh("printf streamed-bytes", DumpOutput::Stdout);
        let mut live = start_stream(&spec, "dump-all.backup".into())?;
        assert_eq!(live.name(), "dump-all.backup");

        let mut bytes = Vec::new();
        live.reader().read_to_end(&mut bytes).await?;
        assert_eq!(bytes, b"streamed-bytes");
        live.finish().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_stream_non_zero_exit_is_partial_failure() -> anyhow::Result<()> {
        let spec = sh("printf partial; echo broken >&2; exit 2", DumpOutput::Stdout);
        let mut live = start_stream(&spec, "dump.backup".into())?;

        let mut bytes = Vec::new();
        live.reader().read_to_end(&mut bytes).await?;
        assert_eq!(bytes, b"partial");

        match live.finish().await {
            Err(BackupError::CapturePartialFailure {
                exit_code,
                stderr_tail,
            }) => {
                assert_eq!(exit_code, Some(2));
                assert_eq!(stderr_tail, "broken");
            }
            other => panic!("expected CapturePartialFailure, got {:?}", other),
        }
        Ok(())
    }

    #[tokio::test]
    async fn test_scratch_file_is_removed() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let explicit = dir.path().join("explicit.backup");
        std::fs::write(&explicit, b"x")?;
        ScratchFile::new(explicit.clone()).remove().await;
        assert!(!explicit.exists());

        let dropped = dir.path().join("dropped.backup");
        std::fs::write(&dropped, b"x")?;
        drop(ScratchFile::new(dropped.clone()));
        assert!(!dropped.exists());

        // Removing a file that was never created is not an error.
        ScratchFile::new(dir.path().join("never.backup")).remove().await;
        Ok(())
    }
}
