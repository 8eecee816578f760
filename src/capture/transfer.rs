// src/capture/transfer.rs
//! External transfer mechanisms behind the [`CaptureTool`] seam.
//!
//! - [`ProcessTool`]: yt-dlp (preferred) or ffmpeg subprocess for broadcasts.
//! - [`HttpTool`]: streamed HTTPS download for story media.
//! - [`ToolRouter`]: picks one of the above by item kind.

use async_trait::async_trait;
use futures::StreamExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;

use crate::error::CaptureError;
use crate::item::{EphemeralItem, ItemKind, Quality};

/// A running transfer. Owned by exactly one worker.
#[async_trait]
pub trait TransferHandle: Send {
    /// Non-blocking liveness check: `None` while still running.
    async fn poll(&mut self) -> Option<Result<(), CaptureError>>;

    /// Ask the transfer to stop, escalating to a hard kill after `grace`.
    async fn terminate(&mut self, grace: Duration);
}

#[async_trait]
pub trait CaptureTool: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether the tooling for `kind` is present at all.
    fn is_available(&self, kind: ItemKind) -> bool;

    async fn start(
        &self,
        item: &EphemeralItem,
        url: &str,
        output: &Path,
    ) -> Result<Box<dyn TransferHandle>, CaptureError>;
}

// ---------------------------------------------------------------------------
// Subprocess tool
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Program {
    YtDlp,
    Ffmpeg,
}

impl Program {
    fn binary(self) -> &'static str {
        match self {
            Program::YtDlp => "yt-dlp",
            Program::Ffmpeg => "ffmpeg",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProcessTool {
    program: Option<Program>,
    quality: Quality,
    output_format: String,
}

impl ProcessTool {
    pub fn new(program: Option<Program>, quality: Quality, output_format: impl Into<String>) -> Self {
        Self {
            program,
            quality,
            output_format: output_format.into(),
        }
    }

    /// Probe for yt-dlp, then ffmpeg.
    pub async fn detect(quality: Quality, output_format: impl Into<String>) -> Self {
        let program = if probe_version("yt-dlp", "--version").await {
            Some(Program::YtDlp)
        } else if probe_version("ffmpeg", "-version").await {
            Some(Program::Ffmpeg)
        } else {
            tracing::error!(target: "capture", "neither yt-dlp nor ffmpeg found; broadcasts cannot be captured");
            None
        };
        Self::new(program, quality, output_format)
    }

    pub fn program(&self) -> Option<Program> {
        self.program
    }

    fn args(&self, program: Program, url: &str, output: &Path) -> Vec<String> {
        let out = output.display().to_string();
        match program {
            Program::YtDlp => vec![
                "--no-warnings".into(),
                "-o".into(),
                out,
                "--format".into(),
                self.quality.ytdlp_format(),
                "--merge-output-format".into(),
                self.output_format.clone(),
                "--live-from-start".into(),
                "--wait-for-video".into(),
                "5-30".into(),
                "--retries".into(),
                "10".into(),
                "--fragment-retries".into(),
                "10".into(),
                "--concurrent-fragments".into(),
                "3".into(),
                "--no-colors".into(),
                url.to_string(),
            ],
            Program::Ffmpeg => vec![
                "-y".into(),
                "-i".into(),
                url.to_string(),
                "-c".into(),
                "copy".into(),
                "-bsf:a".into(),
                "aac_adtstoasc".into(),
                "-movflags".into(),
                "+faststart".into(),
                out,
            ],
        }
    }
}

async fn probe_version(bin: &str, flag: &str) -> bool {
    let fut = Command::new(bin)
        .arg(flag)
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .output();
    match tokio::time::timeout(Duration::from_secs(10), fut).await {
        Ok(Ok(out)) if out.status.success() => {
            let first = String::from_utf8_lossy(&out.stdout)
                .lines()
                .next()
                .unwrap_or_default()
                .to_string();
            tracing::info!(target: "capture", tool = bin, version = %first, "capture tool found");
            true
        }
        Ok(Ok(_)) => false,
        Ok(Err(e)) => {
            tracing::warn!(target: "capture", tool = bin, error = %e, "capture tool not found");
            false
        }
        Err(_) => {
            tracing::warn!(target: "capture", tool = bin, "version probe timed out");
            false
        }
    }
}

#[async_trait]
impl CaptureTool for ProcessTool {
    fn name(&self) -> &'static str {
        self.program.map(Program::binary).unwrap_or("none")
    }

    fn is_available(&self, _kind: ItemKind) -> bool {
        self.program.is_some()
    }

    async fn start(
        &self,
        _item: &EphemeralItem,
        url: &str,
        output: &Path,
    ) -> Result<Box<dyn TransferHandle>, CaptureError> {
        let program = self
            .program
            .ok_or_else(|| CaptureError::MissingTooling("yt-dlp or ffmpeg".into()))?;
        let log_path = output.with_extension("log");
        let log = std::fs::File::create(&log_path)?;
        let log_err = log.try_clone()?;
        let child = Command::new(program.binary())
            .args(self.args(program, url, output))
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(log_err))
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    CaptureError::MissingTooling(program.binary().into())
                } else {
                    CaptureError::Io(e)
                }
            })?;
        tracing::debug!(target: "capture", tool = program.binary(), pid = ?child.id(), "transfer process spawned");
        Ok(Box::new(ProcessHandle {
            program,
            child,
            log_path,
        }))
    }
}

struct ProcessHandle {
    program: Program,
    child: Child,
    log_path: PathBuf,
}

impl ProcessHandle {
    async fn log_tail(&self) -> String {
        match tokio::fs::read_to_string(&self.log_path).await {
            Ok(s) => {
                let lines: Vec<&str> = s.lines().collect();
                let start = lines.len().saturating_sub(20);
                lines[start..].join("\n")
            }
            Err(_) => String::new(),
        }
    }
}

#[async_trait]
impl TransferHandle for ProcessHandle {
    async fn poll(&mut self) -> Option<Result<(), CaptureError>> {
        match self.child.try_wait() {
            Ok(None) => None,
            Ok(Some(status)) => {
                let tail = self.log_tail().await;
                let res = classify_exit(self.program, status.code(), &tail);
                if res.is_ok() {
                    let _ = tokio::fs::remove_file(&self.log_path).await;
                }
                Some(res)
            }
            Err(e) => Some(Err(CaptureError::Io(e))),
        }
    }

    async fn terminate(&mut self, grace: Duration) {
        if matches!(self.child.try_wait(), Ok(Some(_))) {
            return;
        }
        #[cfg(unix)]
        if let Some(pid) = self.child.id() {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::debug!(target: "capture", pid, error = %e, "SIGTERM failed");
            }
            if tokio::time::timeout(grace, self.child.wait()).await.is_ok() {
                return;
            }
        }
        #[cfg(not(unix))]
        let _ = grace;
        tracing::warn!(target: "capture", tool = self.program.binary(), "transfer did not stop in time, killing");
        if let Err(e) = self.child.kill().await {
            tracing::warn!(target: "capture", error = %e, "kill failed");
        }
    }
}

/// Turn an exit code plus the tail of the tool's log into an outcome.
pub fn classify_exit(program: Program, code: Option<i32>, log_tail: &str) -> Result<(), CaptureError> {
    if log_tail.contains("No space left") {
        return Err(CaptureError::DiskExhausted("no space left on device".into()));
    }
    match program {
        Program::YtDlp => match code {
            Some(0) => Ok(()),
            // The broadcast ending mid-capture is a normal end of the stream.
            _ if log_tail.contains("HTTP Error 403")
                || log_tail.to_ascii_lowercase().contains("is offline") =>
            {
                tracing::info!(target: "capture", "stream went offline");
                Ok(())
            }
            _ if log_tail.contains("Interrupted by user") => Ok(()),
            other => Err(CaptureError::Transfer(format!(
                "yt-dlp exited with code {}",
                other.map(|c| c.to_string()).unwrap_or_else(|| "signal".into())
            ))),
        },
        Program::Ffmpeg => match code {
            Some(0) | Some(255) => Ok(()),
            other => Err(CaptureError::Transfer(format!(
                "ffmpeg exited with code {}",
                other.map(|c| c.to_string()).unwrap_or_else(|| "signal".into())
            ))),
        },
    }
}

// ---------------------------------------------------------------------------
// HTTP download tool
// ---------------------------------------------------------------------------

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) \
AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

#[derive(Debug, Clone)]
pub struct HttpTool {
    client: reqwest::Client,
}

impl HttpTool {
    pub fn new(connect_timeout: Duration, read_timeout: Duration, user_agent: &str) -> Result<Self, CaptureError> {
        let ua = if user_agent.trim().is_empty() {
            DEFAULT_USER_AGENT
        } else {
            user_agent
        };
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .user_agent(ua)
            .build()?;
        Ok(Self { client })
    }
}

fn part_path(output: &Path) -> PathBuf {
    let mut name = output
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    output.with_file_name(name)
}

async fn download(client: reqwest::Client, url: String, output: PathBuf) -> Result<u64, CaptureError> {
    let tmp = part_path(&output);
    let result = async {
        let resp = client.get(&url).send().await?.error_for_status()?;
        let mut file = tokio::fs::File::create(&tmp).await?;
        let mut stream = resp.bytes_stream();
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await.map_err(map_write_err)?;
            written += chunk.len() as u64;
        }
        file.flush().await.map_err(map_write_err)?;
        drop(file);
        tokio::fs::rename(&tmp, &output).await?;
        Ok::<u64, CaptureError>(written)
    }
    .await;
    if result.is_err() {
        let _ = tokio::fs::remove_file(&tmp).await;
    }
    result
}

fn map_write_err(e: std::io::Error) -> CaptureError {
    // ENOSPC
    if e.raw_os_error() == Some(28) {
        CaptureError::DiskExhausted(e.to_string())
    } else {
        CaptureError::Io(e)
    }
}

#[async_trait]
impl CaptureTool for HttpTool {
    fn name(&self) -> &'static str {
        "http"
    }

    fn is_available(&self, _kind: ItemKind) -> bool {
        true
    }

    async fn start(
        &self,
        _item: &EphemeralItem,
        url: &str,
        output: &Path,
    ) -> Result<Box<dyn TransferHandle>, CaptureError> {
        let join = tokio::spawn(download(
            self.client.clone(),
            url.to_string(),
            output.to_path_buf(),
        ));
        Ok(Box::new(HttpHandle {
            join: Some(join),
            temp: part_path(output),
        }))
    }
}

struct HttpHandle {
    join: Option<JoinHandle<Result<u64, CaptureError>>>,
    temp: PathBuf,
}

#[async_trait]
impl TransferHandle for HttpHandle {
    async fn poll(&mut self) -> Option<Result<(), CaptureError>> {
        if !self.join.as_ref()?.is_finished() {
            return None;
        }
        let join = self.join.take()?;
        Some(match join.await {
            Ok(Ok(_bytes)) => Ok(()),
            Ok(Err(e)) => Err(e),
            Err(e) => Err(CaptureError::Transfer(format!("download task failed: {e}"))),
        })
    }

    async fn terminate(&mut self, _grace: Duration) {
        if let Some(join) = self.join.take() {
            join.abort();
            let _ = join.await;
        }
        let _ = tokio::fs::remove_file(&self.temp).await;
    }
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Dispatches broadcasts and stories to their own tools.
#[derive(Clone)]
pub struct ToolRouter {
    broadcast: Arc<dyn CaptureTool>,
    story: Arc<dyn CaptureTool>,
}

impl ToolRouter {
    pub fn new(broadcast: Arc<dyn CaptureTool>, story: Arc<dyn CaptureTool>) -> Self {
        Self { broadcast, story }
    }

    fn pick(&self, kind: ItemKind) -> &Arc<dyn CaptureTool> {
        match kind {
            ItemKind::Broadcast => &self.broadcast,
            ItemKind::Story => &self.story,
        }
    }
}

#[async_trait]
impl CaptureTool for ToolRouter {
    fn name(&self) -> &'static str {
        "router"
    }

    fn is_available(&self, kind: ItemKind) -> bool {
        self.pick(kind).is_available(kind)
    }

    async fn start(
        &self,
        item: &EphemeralItem,
        url: &str,
        output: &Path,
    ) -> Result<Box<dyn TransferHandle>, CaptureError> {
        self.pick(item.kind).start(item, url, output).await
    }
}
