//! Streaming runner shared by every subprocess-backed transport.
//!
//! Transfer tools redraw their progress line with `\r`, so output is read in
//! raw chunks and split on both `\r` and `\n`. stdout and stderr are merged
//! into one ordered line stream. The loop selects over the next line, the
//! kill signal, and the stall deadline, so a silent or wedged tool is still
//! interrupted promptly.

use std::collections::VecDeque;
use std::fmt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use super::constants::OUTPUT_TAIL_LINES;
use super::outcome::{AttemptOutcome, with_tail};
use crate::credentials::mask_token;

const READ_CHUNK_BYTES: usize = 8 * 1024;
const LINE_CHANNEL_CAPACITY: usize = 256;

/// Splits a byte stream into lines on `\r` and `\n`.
#[derive(Debug, Default)]
pub struct LineSplitter {
    pending: Vec<u8>,
}

impl LineSplitter {
    /// Feeds a chunk and returns every complete, non-blank line in it.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        for &byte in chunk {
            if byte == b'\r' || byte == b'\n' {
                if let Some(line) = self.take_line() {
                    lines.push(line);
                }
            } else {
                self.pending.push(byte);
            }
        }
        lines
    }

    /// Returns the trailing partial line once the stream has ended.
    pub fn finish(&mut self) -> Option<String> {
        self.take_line()
    }

    fn take_line(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let raw = std::mem::take(&mut self.pending);
        let line = String::from_utf8_lossy(&raw).trim().to_string();
        (!line.is_empty()).then_some(line)
    }
}

/// Keeps the last [`OUTPUT_TAIL_LINES`] lines of tool output.
#[derive(Debug)]
pub struct OutputTail {
    lines: VecDeque<String>,
    capacity: usize,
}

impl Default for OutputTail {
    fn default() -> Self {
        Self::with_capacity(OUTPUT_TAIL_LINES)
    }
}

impl OutputTail {
    /// Creates a tail holding at most `capacity` lines.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity: capacity.max(1),
        }
    }

    /// Records a line, evicting the oldest if full.
    pub fn push(&mut self, line: &str) {
        if self.lines.len() == self.capacity {
            self.lines.pop_front();
        }
        self.lines.push_back(line.to_string());
    }

    /// Consumes the tail in output order.
    #[must_use]
    pub fn into_lines(self) -> Vec<String> {
        self.lines.into()
    }
}

#[derive(Debug)]
struct RunningProcess {
    id: u64,
    tool: String,
    pid: Option<u32>,
    kill: CancellationToken,
}

/// The currently running transport process, if any.
///
/// Set when a tool is spawned, cleared when it exits, and read-and-killed by
/// [`ProcessSlot::kill_current`] from any task.
#[derive(Debug, Default)]
pub struct ProcessSlot {
    current: Mutex<Option<RunningProcess>>,
    next_id: AtomicU64,
}

impl ProcessSlot {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a running process. The returned guard clears the slot on drop.
    pub fn register(&self, tool: &str, pid: Option<u32>, kill: CancellationToken) -> ProcessGuard<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        if let Ok(mut current) = self.current.lock() {
            *current = Some(RunningProcess {
                id,
                tool: tool.to_string(),
                pid,
                kill,
            });
        }
        ProcessGuard { slot: self, id }
    }

    /// Name of the tool currently registered, if any.
    #[must_use]
    pub fn current_tool(&self) -> Option<String> {
        self.current
            .lock()
            .ok()
            .and_then(|current| current.as_ref().map(|p| p.tool.clone()))
    }

    /// Signals the registered process to be killed. Returns true if one was running.
    ///
    /// Best-effort: a poisoned lock is logged and treated as no process.
    pub fn kill_current(&self) -> bool {
        match self.current.lock() {
            Ok(current) => match current.as_ref() {
                Some(process) => {
                    warn!(tool = %process.tool, pid = ?process.pid, "killing running transfer process");
                    process.kill.cancel();
                    true
                }
                None => false,
            },
            Err(e) => {
                warn!(error = %e, "process slot lock poisoned, cannot kill");
                false
            }
        }
    }
}

/// Clears its [`ProcessSlot`] entry when dropped.
#[derive(Debug)]
pub struct ProcessGuard<'a> {
    slot: &'a ProcessSlot,
    id: u64,
}

impl Drop for ProcessGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut current) = self.slot.current.lock()
            && current.as_ref().is_some_and(|p| p.id == self.id)
        {
            *current = None;
        }
    }
}

/// How a tool run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolExit {
    /// The process exited on its own (`-1` when terminated by a signal).
    Exited(i32),
    /// No forward progress within the stall timeout; the process was killed.
    Stalled(Duration),
    /// Killed on request (batch cancellation).
    Killed,
    /// The process could not be started.
    SpawnFailed(String),
}

/// Exit plus the captured output tail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolRun {
    /// How the process ended.
    pub exit: ToolExit,
    /// Last lines of merged stdout/stderr.
    pub tail: Vec<String>,
}

impl ToolRun {
    /// Maps the run onto an outcome, using `tool` as the stage.
    ///
    /// Reason codes use the tool name with `-` replaced by `_` (`hf_cli_exit_1`).
    #[must_use]
    pub fn into_outcome(self, tool: &str) -> AttemptOutcome {
        let code = tool.replace('-', "_");
        match self.exit {
            ToolExit::Exited(0) => AttemptOutcome::succeeded(tool),
            ToolExit::Exited(status) => {
                AttemptOutcome::failed(tool, with_tail(&format!("{code}_exit_{status}"), &self.tail))
            }
            ToolExit::Stalled(after) => AttemptOutcome::failed(
                tool,
                with_tail(&format!("{code}_stall_timeout_{}s", after.as_secs()), &self.tail),
            ),
            ToolExit::Killed => AttemptOutcome::failed(tool, format!("{code}_cancelled")),
            ToolExit::SpawnFailed(error) => {
                AttemptOutcome::failed(tool, format!("{code}_spawn_failed: {error}"))
            }
        }
    }
}

/// A fully-specified tool invocation.
#[derive(Clone)]
pub struct ToolCommand {
    /// Short name used for stages, reasons, and logs (`aria2c`).
    pub tool: &'static str,
    /// Executable to run.
    pub program: PathBuf,
    /// Arguments, in order.
    pub args: Vec<String>,
    /// Extra environment variables.
    pub envs: Vec<(String, String)>,
    /// Environment variables removed from the inherited environment.
    pub env_remove: Vec<String>,
    /// Tokens carried in arguments or environment; masked in captured output.
    secrets: Vec<String>,
}

impl ToolCommand {
    /// Starts a command with no arguments.
    #[must_use]
    pub fn new(tool: &'static str, program: impl Into<PathBuf>) -> Self {
        Self {
            tool,
            program: program.into(),
            args: Vec::new(),
            envs: Vec::new(),
            env_remove: Vec::new(),
            secrets: Vec::new(),
        }
    }

    /// Appends one argument.
    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Sets an environment variable for the child.
    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Removes an inherited environment variable from the child.
    #[must_use]
    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env_remove.push(key.into());
        self
    }

    /// Marks a token passed to the tool; empty values are ignored.
    #[must_use]
    pub fn secret(mut self, token: &str) -> Self {
        if !token.is_empty() {
            self.secrets.push(token.to_string());
        }
        self
    }

    /// Replaces every registered secret in `line` with its masked form.
    #[must_use]
    pub fn redact(&self, line: &str) -> String {
        self.secrets
            .iter()
            .fold(line.to_string(), |acc, secret| acc.replace(secret.as_str(), &mask_token(secret)))
    }

    fn spawn(&self) -> std::io::Result<Child> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for key in &self.env_remove {
            command.env_remove(key);
        }
        for (key, value) in &self.envs {
            command.env(key, value);
        }
        command.spawn()
    }
}

impl fmt::Debug for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let args: Vec<String> = self.args.iter().map(|arg| self.redact(arg)).collect();
        f.debug_struct("ToolCommand")
            .field("tool", &self.tool)
            .field("program", &self.program)
            .field("args", &args)
            .field("envs", &self.envs)
            .field("env_remove", &self.env_remove)
            .finish_non_exhaustive()
    }
}

/// Limits applied to one tool run.
#[derive(Debug, Clone, Copy)]
pub struct RunLimits<'a> {
    /// Kill after this long without forward progress; `None` disables.
    pub stall_timeout: Option<Duration>,
    /// Slot the process is registered in while it runs.
    pub slot: &'a ProcessSlot,
    /// Batch cancellation; the process is killed when it fires.
    pub cancel: &'a CancellationToken,
}

/// Runs `command`, feeding every output line to `on_line`.
///
/// `on_line` returns true when the line shows forward progress, which resets
/// the stall deadline.
pub async fn run_streaming<F>(command: &ToolCommand, limits: RunLimits<'_>, mut on_line: F) -> ToolRun
where
    F: FnMut(&str) -> bool,
{
    let tool = command.tool;
    let mut tail = OutputTail::default();

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            warn!(tool, program = %command.program.display(), error = %e, "failed to spawn transfer tool");
            return ToolRun {
                exit: ToolExit::SpawnFailed(e.to_string()),
                tail: Vec::new(),
            };
        }
    };

    let kill = limits.cancel.child_token();
    let _guard = limits.slot.register(tool, child.id(), kill.clone());
    debug!(tool, pid = ?child.id(), "transfer tool started");

    let (tx, mut rx) = mpsc::channel(LINE_CHANNEL_CAPACITY);
    let mut pumps: Vec<JoinHandle<()>> = Vec::with_capacity(2);
    if let Some(stdout) = child.stdout.take() {
        pumps.push(tokio::spawn(pump_lines(stdout, tx.clone())));
    }
    if let Some(stderr) = child.stderr.take() {
        pumps.push(tokio::spawn(pump_lines(stderr, tx.clone())));
    }
    drop(tx);

    let mut deadline = limits.stall_timeout.map(|t| Instant::now() + t);

    let interrupted = loop {
        tokio::select! {
            line = rx.recv() => {
                let Some(line) = line else { break None };
                let line = command.redact(&line);
                trace!(tool, %line, "tool output");
                tail.push(&line);
                if on_line(&line)
                    && let Some(timeout) = limits.stall_timeout
                {
                    deadline = Some(Instant::now() + timeout);
                }
            }
            () = kill.cancelled() => break Some(ToolExit::Killed),
            () = stall_deadline(deadline) => {
                let after = limits.stall_timeout.unwrap_or_default();
                warn!(tool, stall_secs = after.as_secs(), "no progress within stall timeout, killing");
                break Some(ToolExit::Stalled(after));
            }
        }
    };

    let exit = match interrupted {
        Some(exit) => {
            terminate(&mut child, tool).await;
            exit
        }
        None => tokio::select! {
            status = child.wait() => match status {
                Ok(status) => ToolExit::Exited(status.code().unwrap_or(-1)),
                Err(e) => {
                    warn!(tool, error = %e, "failed to wait for transfer tool");
                    ToolExit::Exited(-1)
                }
            },
            () = kill.cancelled() => {
                terminate(&mut child, tool).await;
                ToolExit::Killed
            }
        },
    };

    for pump in pumps {
        pump.abort();
    }
    debug!(tool, ?exit, "transfer tool finished");

    ToolRun {
        exit,
        tail: tail.into_lines(),
    }
}

async fn stall_deadline(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn terminate(child: &mut Child, tool: &str) {
    if let Err(e) = child.start_kill() {
        warn!(tool, error = %e, "failed to kill transfer tool");
        return;
    }
    if let Err(e) = child.wait().await {
        warn!(tool, error = %e, "failed to reap killed transfer tool");
    }
}

async fn pump_lines<R>(mut reader: R, tx: mpsc::Sender<String>)
where
    R: AsyncRead + Unpin,
{
    let mut splitter = LineSplitter::default();
    let mut buf = vec![0_u8; READ_CHUNK_BYTES];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                for line in splitter.push(&buf[..n]) {
                    if tx.send(line).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
    if let Some(line) = splitter.finish() {
        let _ = tx.send(line).await;
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_line_splitter_handles_carriage_returns() {
        let mut splitter = LineSplitter::default();
        let lines = splitter.push(b" 10%|#| 1M [00:01<00:09]\r 20%|##| 2M [00:02<00:08]\r");
        assert_eq!(lines, vec!["10%|#| 1M [00:01<00:09]", "20%|##| 2M [00:02<00:08]"]);
    }

    #[test]
    fn test_line_splitter_keeps_partial_line_across_chunks() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(b"[#1 10MiB/100MiB(1").is_empty());
        let lines = splitter.push(b"0%)]\r\nnext");
        assert_eq!(lines, vec!["[#1 10MiB/100MiB(10%)]"]);
        assert_eq!(splitter.finish().as_deref(), Some("next"));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn test_line_splitter_skips_blank_lines() {
        let mut splitter = LineSplitter::default();
        assert!(splitter.push(b"\r\n\r\n   \n").is_empty());
    }

    #[test]
    fn test_output_tail_keeps_last_lines() {
        let mut tail = OutputTail::with_capacity(3);
        for i in 0..5 {
            tail.push(&format!("line {i}"));
        }
        assert_eq!(tail.into_lines(), vec!["line 2", "line 3", "line 4"]);
    }

    #[test]
    fn test_process_slot_register_and_clear() {
        let slot = ProcessSlot::new();
        assert!(!slot.kill_current());
        let token = CancellationToken::new();
        {
            let _guard = slot.register("aria2c", Some(42), token.clone());
            assert_eq!(slot.current_tool().as_deref(), Some("aria2c"));
            assert!(slot.kill_current());
            assert!(token.is_cancelled());
        }
        assert_eq!(slot.current_tool(), None);
    }

    #[test]
    fn test_stale_guard_does_not_clear_newer_process() {
        let slot = ProcessSlot::new();
        let first = slot.register("aria2c", None, CancellationToken::new());
        let _second = slot.register("wget", None, CancellationToken::new());
        drop(first);
        assert_eq!(slot.current_tool().as_deref(), Some("wget"));
    }

    #[test]
    fn test_tool_run_outcomes() {
        let ok = ToolRun { exit: ToolExit::Exited(0), tail: vec!["done".to_string()] };
        assert!(ok.into_outcome("wget").success);

        let failed = ToolRun {
            exit: ToolExit::Exited(3),
            tail: vec!["errorCode=3".to_string()],
        }
        .into_outcome("aria2c");
        assert!(!failed.success);
        assert_eq!(failed.stage, "aria2c");
        assert_eq!(failed.reason, "aria2c_exit_3 | tail: errorCode=3");

        let stalled = ToolRun {
            exit: ToolExit::Stalled(Duration::from_secs(120)),
            tail: Vec::new(),
        }
        .into_outcome("aria2c");
        assert_eq!(stalled.reason, "aria2c_stall_timeout_120s");

        let killed = ToolRun { exit: ToolExit::Killed, tail: Vec::new() }.into_outcome("hf-cli");
        assert_eq!(killed.stage, "hf-cli");
        assert_eq!(killed.reason, "hf_cli_cancelled");
    }

    #[tokio::test]
    async fn test_spawn_failure_is_reported() {
        let slot = ProcessSlot::new();
        let cancel = CancellationToken::new();
        let command = ToolCommand::new("wget", "/nonexistent/definitely-not-here");
        let run = run_streaming(
            &command,
            RunLimits { stall_timeout: None, slot: &slot, cancel: &cancel },
            |_| false,
        )
        .await;
        assert!(matches!(run.exit, ToolExit::SpawnFailed(_)));
        assert_eq!(slot.current_tool(), None);
    }

    #[test]
    fn test_redact_masks_registered_secrets() {
        let command = ToolCommand::new("aria2c", "aria2c")
            .arg("https://civitai.com/api/download/models/1?token=civ_0123456789abcdef")
            .secret("civ_0123456789abcdef")
            .secret("");
        assert_eq!(
            command.redact("[ERROR] URI=https://civitai.com/api/download/models/1?token=civ_0123456789abcdef"),
            "[ERROR] URI=https://civitai.com/api/download/models/1?token=...abcdef"
        );
        assert_eq!(command.redact("no secrets here"), "no secrets here");
    }

    #[test]
    fn test_debug_output_masks_arguments() {
        let command = ToolCommand::new("wget", "wget")
            .arg("--header")
            .arg("Authorization: Bearer hf_0123456789abcdef")
            .secret("hf_0123456789abcdef");
        let rendered = format!("{command:?}");
        assert!(rendered.contains("Bearer ...abcdef"));
        assert!(!rendered.contains("hf_0123456789abcdef"));
    }
}
