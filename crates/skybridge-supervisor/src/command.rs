//! [`CommandSpec`] – program + argument list for a supervised process.

use std::fmt;
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use skybridge_types::OutputStream;

/// An external program invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
}

impl CommandSpec {
    pub fn new<I, S>(program: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Run `script` through `shell`, e.g. `sh /opt/scripts/takepicture.sh stop`.
    pub fn script<I, S>(shell: &str, script: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut all = vec![script.into()];
        all.extend(args.into_iter().map(Into::into));
        Self {
            program: shell.to_string(),
            args: all,
        }
    }

    /// Build a Tokio [`Command`] with stdin closed and both output streams
    /// piped.
    pub(crate) fn to_command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// Read `reader` line by line and forward each line, tagged with `stream`,
/// until EOF or until the receiver goes away.
///
/// Invalid UTF-8 is replaced rather than terminating the reader.
pub(crate) async fn forward_lines<R>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::UnboundedSender<(OutputStream, String)>,
) where
    R: AsyncRead + Unpin,
{
    let mut reader = BufReader::new(reader);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim_end_matches(['\n', '\r']).to_string();
                if tx.send((stream, line)).is_err() {
                    break;
                }
            }
            Err(e) => {
                debug!(%stream, error = %e, "output reader stopped");
                break;
            }
        }
    }
}

/// Spawn `spec` as a fire-and-forget process.
///
/// The process is not tracked by any slot; its output is logged at `debug`
/// and its exit status at `info`.  It is reaped as soon as it exits, even if
/// something it started still holds its output open; output is then read for
/// at most `drain`.  Spawn errors are logged and swallowed since nobody is
/// waiting on the result.
///
/// The returned handle resolves to the exit code.
pub(crate) fn launch_detached(
    slot: &str,
    spec: &CommandSpec,
    drain: Duration,
) -> Option<JoinHandle<Option<i32>>> {
    let mut child = match spec.to_command().spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(slot, command = %spec, error = %e, "failed to launch stop command");
            return None;
        }
    };
    info!(slot, command = %spec, "stop command launched");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut readers = Vec::with_capacity(2);
    if let Some(out) = child.stdout.take() {
        readers.push(tokio::spawn(forward_lines(out, OutputStream::Stdout, tx.clone())));
    }
    if let Some(err) = child.stderr.take() {
        readers.push(tokio::spawn(forward_lines(err, OutputStream::Stderr, tx)));
    }

    let slot = slot.to_string();
    let command = spec.to_string();
    Some(tokio::spawn(async move {
        let status = loop {
            tokio::select! {
                biased;
                Some((stream, line)) = rx.recv() => {
                    debug!(slot = %slot, %stream, line = %line, "stop command output");
                }
                status = child.wait() => break status,
            }
        };

        let rest = async {
            while let Some((stream, line)) = rx.recv().await {
                debug!(slot = %slot, %stream, line = %line, "stop command output");
            }
        };
        if tokio::time::timeout(drain, rest).await.is_err() {
            debug!(slot = %slot, "stop command output still open after exit");
        }
        for reader in readers {
            reader.abort();
        }

        match status {
            Ok(status) => {
                info!(slot = %slot, command = %command, code = ?status.code(), "stop command exited");
                status.code()
            }
            Err(e) => {
                warn!(slot = %slot, command = %command, error = %e, "failed to wait for stop command");
                None
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_program_and_args() {
        let spec = CommandSpec::new("sh", ["-c", "echo hi"]);
        assert_eq!(spec.to_string(), "sh -c echo hi");
    }

    #[test]
    fn script_prepends_script_path() {
        let spec = CommandSpec::script("sh", "/opt/scripts/takepicture.sh", ["stop"]);
        assert_eq!(spec.program, "sh");
        assert_eq!(spec.args, vec!["/opt/scripts/takepicture.sh", "stop"]);
    }

    #[tokio::test]
    async fn forward_lines_splits_and_tags() {
        let input: &[u8] = b"first\r\nsecond\nthird";
        let (tx, mut rx) = mpsc::unbounded_channel();
        forward_lines(input, OutputStream::Stderr, tx).await;

        let mut got = Vec::new();
        while let Some(item) = rx.recv().await {
            got.push(item);
        }
        assert_eq!(
            got,
            vec![
                (OutputStream::Stderr, "first".to_string()),
                (OutputStream::Stderr, "second".to_string()),
                (OutputStream::Stderr, "third".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn forward_lines_replaces_invalid_utf8() {
        let input: &[u8] = b"bad \xff byte\n";
        let (tx, mut rx) = mpsc::unbounded_channel();
        forward_lines(input, OutputStream::Stdout, tx).await;

        let (_, line) = rx.recv().await.unwrap();
        assert!(line.starts_with("bad "));
        assert!(line.ends_with(" byte"));
    }

    #[tokio::test]
    async fn detached_command_is_reaped_while_a_daemon_holds_its_output() {
        // The backgrounded sleep inherits stdout and keeps the pipe open.
        let spec = CommandSpec::new("sh", ["-c", "sleep 3 & echo stopping"]);
        let waiter = launch_detached("recording", &spec, Duration::from_millis(50)).unwrap();

        let code = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("stop command was not reaped")
            .unwrap();
        assert_eq!(code, Some(0));
    }

    #[tokio::test]
    async fn detached_spawn_failure_returns_none() {
        let spec = CommandSpec::new("/nonexistent/skybridge-stop", Vec::<String>::new());
        assert!(launch_detached("picture", &spec, Duration::from_millis(50)).is_none());
    }
}
