//! Adapter around the external checker process
//!
//! The checker is a long-running child process. Check requests are written to
//! its stdin as `scheme://address:port` lines; results come back on stdout as
//! one JSON object per line and are handed to a [`ResultSink`].

use crate::error::{Error, Result};
use crate::proxy::models::{CheckResult, ProxyId};
use crate::proxy::parser::ProxyParser;
use async_trait::async_trait;
use std::io;
use std::process::Stdio;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Default checker executable
const DEFAULT_PROGRAM: &str = "proxyshiva";

/// Configuration for the checker process
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckerConfig {
    /// Executable name or path
    pub program: String,
    /// Skip addresses in reserved ranges
    pub skip_reserved: bool,
    /// Accept any TLS certificate
    pub skip_cert: bool,
    /// Per-check timeout handed to the checker
    pub timeout: Option<u64>,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            program: DEFAULT_PROGRAM.to_string(),
            skip_reserved: true,
            skip_cert: false,
            timeout: None,
        }
    }
}

impl CheckerConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(mut self, program: String) -> Self {
        self.program = program;
        self
    }

    pub fn with_skip_reserved(mut self, skip_reserved: bool) -> Self {
        self.skip_reserved = skip_reserved;
        self
    }

    pub fn with_skip_cert(mut self, skip_cert: bool) -> Self {
        self.skip_cert = skip_cert;
        self
    }

    pub fn with_timeout(mut self, timeout: Option<u64>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Command line arguments for the checker process
    pub fn args(&self) -> Vec<String> {
        let mut args = vec!["-json".to_string(), "-interactive".to_string()];
        if self.skip_reserved {
            args.push("-skipres".to_string());
        }
        if self.skip_cert {
            args.push("-skipcert".to_string());
        }
        if let Some(timeout) = self.timeout {
            args.push(format!("-timeout={}", timeout));
        }
        args
    }
}

/// Receives parsed check results
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn on_result(&self, result: CheckResult) -> Result<()>;
}

/// Accepts check requests without waiting for their outcome
pub trait CheckDispatcher: Send + Sync {
    fn enqueue(&self, proxy: &ProxyId) -> Result<()>;
}

/// Handle to the running checker
pub struct ProxyChecker {
    requests: mpsc::UnboundedSender<String>,
    /// Killed when the checker is dropped
    child: Option<Child>,
}

impl ProxyChecker {
    /// Start the checker process and begin forwarding its results to `sink`
    pub fn spawn(config: &CheckerConfig, sink: Arc<dyn ResultSink>) -> Result<Self> {
        let mut child = Command::new(&config.program)
            .args(config.args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| match err.kind() {
                io::ErrorKind::NotFound => Error::CheckerNotFound(config.program.clone()),
                _ => Error::CheckerSpawn(err),
            })?;

        let stdin = child.stdin.take().ok_or_else(|| missing_pipe("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| missing_pipe("stdout"))?;

        info!(
            program = %config.program,
            args = ?config.args(),
            pid = ?child.id(),
            "checker process started"
        );

        let mut checker = Self::from_streams(stdin, stdout, sink);
        checker.child = Some(child);
        Ok(checker)
    }

    /// Drive a checker over arbitrary streams
    pub fn from_streams<W, R>(input: W, output: R, sink: Arc<dyn ResultSink>) -> Self
    where
        W: AsyncWrite + Unpin + Send + 'static,
        R: AsyncRead + Unpin + Send + 'static,
    {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(write_requests(input, rx));
        tokio::spawn(read_results(output, sink));

        Self {
            requests: tx,
            child: None,
        }
    }

    /// OS process id of the checker, if it is a child process
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }
}

impl CheckDispatcher for ProxyChecker {
    fn enqueue(&self, proxy: &ProxyId) -> Result<()> {
        self.requests
            .send(proxy.request_line())
            .map_err(|_| Error::CheckerClosed)
    }
}

fn missing_pipe(name: &str) -> Error {
    Error::CheckerSpawn(io::Error::new(
        io::ErrorKind::BrokenPipe,
        format!("checker {} is not piped", name),
    ))
}

async fn write_requests<W>(mut input: W, mut requests: mpsc::UnboundedReceiver<String>)
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = requests.recv().await {
        let written = match input.write_all(line.as_bytes()).await {
            Ok(()) => input.flush().await,
            Err(err) => Err(err),
        };
        if let Err(err) = written {
            warn!(%err, "checker stopped accepting requests");
            break;
        }
        debug!(request = line.trim_end(), "sent check request");
    }
}

/// Feed every result line from `output` to `sink`, in order.
///
/// Malformed lines are skipped; a failing sink only loses that one result.
async fn read_results<R>(output: R, sink: Arc<dyn ResultSink>)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(output).split(b'\n');
    loop {
        match lines.next_segment().await {
            Ok(Some(bytes)) => {
                let line = String::from_utf8_lossy(&bytes);
                let Some(result) = ProxyParser::parse_result_line(&line) else {
                    continue;
                };
                let proxy = result.proxy_id();
                if let Err(err) = sink.on_result(result).await {
                    warn!(%proxy, %err, "failed to apply check result");
                }
            }
            Ok(None) => {
                warn!("checker output closed");
                break;
            }
            Err(err) => {
                warn!(%err, "failed to read checker output");
                break;
            }
        }
    }
}
