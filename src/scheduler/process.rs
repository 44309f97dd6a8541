//! Process-isolated workers.
//!
//! A process worker is the current executable re-run with the hidden
//! `worker` subcommand. The parent writes one [`WorkerRequest`] per line to
//! the child's stdin and reads one [`WorkerReply`] per line from its stdout.
//! The child logs JSON lines to stderr; a single [`LogRelay`] consumer
//! re-emits them through the parent's subscriber, tagged with the worker id.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::error::ForecastError;
use crate::pipeline::RunConfig;

use super::job::{UnitJob, WorkerReply, WorkerRequest};
use super::worker_pool::{EntryBuilder, PoolError, UnitEntry, Worker, WorkerFactory};

/// Environment variable carrying the worker id into the child process.
pub const WORKER_ID_ENV: &str = "FORECAST_FORGE_WORKER_ID";

/// Subcommand that turns the executable into a worker.
pub const WORKER_SUBCOMMAND: &str = "worker";

/// Exit code of a worker stopped by an interrupt.
pub const INTERRUPTED_EXIT_CODE: i32 = 130;

/// One stderr line of a worker process.
#[derive(Debug)]
struct LogLine {
    worker_id: String,
    line: String,
}

/// A worker log record parsed from its JSON form.
#[derive(Debug, Clone, PartialEq)]
pub struct RelayedEvent {
    pub level: String,
    pub message: String,
    pub target: String,
    pub unit: Option<String>,
    /// Remaining event fields rendered as `key=value`.
    pub fields: Vec<String>,
}

impl RelayedEvent {
    /// Parses a JSON log line. Returns `None` for anything else.
    pub fn parse(line: &str) -> Option<Self> {
        let value: Value = serde_json::from_str(line).ok()?;
        let fields = value.get("fields")?.as_object()?;

        let message = fields
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let unit = fields
            .get("unit")
            .and_then(Value::as_str)
            .or_else(|| value.pointer("/span/unit").and_then(Value::as_str))
            .or_else(|| {
                value
                    .get("spans")
                    .and_then(Value::as_array)
                    .and_then(|spans| spans.iter().rev().find_map(|s| s.get("unit")?.as_str()))
            })
            .map(str::to_string);
        let extra = fields
            .iter()
            .filter(|(key, _)| key.as_str() != "message" && key.as_str() != "unit")
            .map(|(key, value)| match value {
                Value::String(s) => format!("{}={}", key, s),
                other => format!("{}={}", key, other),
            })
            .collect();

        Some(Self {
            level: value
                .get("level")
                .and_then(Value::as_str)
                .unwrap_or("INFO")
                .to_string(),
            message,
            target: value
                .get("target")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
            unit,
            fields: extra,
        })
    }
}

fn emit(worker_id: &str, line: &str) {
    let Some(event) = RelayedEvent::parse(line) else {
        if !line.trim().is_empty() {
            info!(worker = %worker_id, "{}", line);
        }
        return;
    };

    let unit = event.unit.as_deref().unwrap_or("-");
    let text = if event.fields.is_empty() {
        event.message
    } else {
        format!("{} {}", event.message, event.fields.join(" "))
    };
    match event.level.as_str() {
        "ERROR" => error!(worker = %worker_id, unit = %unit, origin = %event.target, "{}", text),
        "WARN" => warn!(worker = %worker_id, unit = %unit, origin = %event.target, "{}", text),
        "DEBUG" => debug!(worker = %worker_id, unit = %unit, origin = %event.target, "{}", text),
        "TRACE" => trace!(worker = %worker_id, unit = %unit, origin = %event.target, "{}", text),
        _ => info!(worker = %worker_id, unit = %unit, origin = %event.target, "{}", text),
    }
}

/// Single consumer of worker log lines.
///
/// Cloned senders are handed to every worker; the consumer task ends once
/// every sender is gone.
#[derive(Clone)]
pub struct LogRelay {
    tx: mpsc::UnboundedSender<LogLine>,
}

impl LogRelay {
    /// Starts the consumer task.
    pub fn start() -> (Self, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<LogLine>();
        let handle = tokio::spawn(async move {
            while let Some(log) = rx.recv().await {
                emit(&log.worker_id, &log.line);
            }
        });
        (Self { tx }, handle)
    }

    fn forward(&self, worker_id: String, stderr: ChildStderr) -> JoinHandle<()> {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx
                    .send(LogLine {
                        worker_id: worker_id.clone(),
                        line,
                    })
                    .is_err()
                {
                    break;
                }
            }
        })
    }
}

/// Spawns worker processes.
pub struct ProcessWorkerFactory {
    program: PathBuf,
    args: Vec<String>,
    relay: LogRelay,
    shutdown_timeout: Duration,
}

impl ProcessWorkerFactory {
    /// Creates a factory running `program` with `args`.
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, relay: LogRelay) -> Self {
        Self {
            program: program.into(),
            args,
            relay,
            shutdown_timeout: Duration::from_secs(10),
        }
    }

    /// Creates a factory re-running the current executable as a worker.
    ///
    /// `global_args` are passed before the worker subcommand.
    pub fn current_exe(global_args: Vec<String>, relay: LogRelay) -> Result<Self, PoolError> {
        let program = std::env::current_exe()
            .map_err(|e| PoolError::WorkerInitFailed(format!("cannot locate executable: {}", e)))?;
        let mut args = global_args;
        args.push(WORKER_SUBCOMMAND.to_string());
        Ok(Self::new(program, args, relay))
    }

    /// Sets how long a worker may take to exit after shutdown.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }
}

#[async_trait]
impl WorkerFactory for ProcessWorkerFactory {
    async fn spawn(&self, worker_id: String) -> Result<Box<dyn Worker>, PoolError> {
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env(WORKER_ID_ENV, &worker_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                PoolError::WorkerInitFailed(format!("{}: {}", self.program.display(), e))
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| PoolError::WorkerInitFailed("worker stdin not captured".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| PoolError::WorkerInitFailed("worker stdout not captured".to_string()))?;
        let stderr_task = child
            .stderr
            .take()
            .map(|stderr| self.relay.forward(worker_id.clone(), stderr));

        debug!(worker_id = %worker_id, pid = ?child.id(), "Spawned worker process");

        Ok(Box::new(ProcessWorker {
            id: worker_id,
            child,
            stdin: Some(stdin),
            stdout: BufReader::new(stdout).lines(),
            stderr_task,
            alive: true,
            shutdown_timeout: self.shutdown_timeout,
        }))
    }
}

/// Parent-side handle of one worker process.
pub struct ProcessWorker {
    id: String,
    child: Child,
    stdin: Option<ChildStdin>,
    stdout: Lines<BufReader<ChildStdout>>,
    stderr_task: Option<JoinHandle<()>>,
    alive: bool,
    shutdown_timeout: Duration,
}

impl ProcessWorker {
    async fn send(&mut self, request: &WorkerRequest) -> Result<(), ForecastError> {
        let mut line =
            serde_json::to_string(request).map_err(|e| PoolError::Protocol(e.to_string()))?;
        line.push('\n');
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| PoolError::Protocol("worker stdin already closed".to_string()))?;
        stdin.write_all(line.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Marks the worker dead and describes how it ended.
    async fn crashed(&mut self, unit: String, reason: String) -> ForecastError {
        self.alive = false;
        let status = match tokio::time::timeout(Duration::from_secs(1), self.child.wait()).await {
            Ok(Ok(status)) => status.to_string(),
            Ok(Err(e)) => e.to_string(),
            Err(_) => "still running".to_string(),
        };
        ForecastError::WorkerCrashed {
            unit,
            message: format!("{} ({})", reason, status),
        }
    }
}

#[async_trait]
impl Worker for ProcessWorker {
    fn id(&self) -> &str {
        &self.id
    }

    async fn run(&mut self, job: UnitJob) -> Result<(), ForecastError> {
        let unit = job.unit.name.clone();
        let index = job.index;
        if !self.alive {
            return Err(ForecastError::WorkerCrashed {
                unit,
                message: format!("worker {} is no longer running", self.id),
            });
        }

        if let Err(e) = self.send(&WorkerRequest::Run { job }).await {
            return Err(self.crashed(unit, format!("cannot send unit: {}", e)).await);
        }

        match self.stdout.next_line().await {
            Ok(Some(line)) => match serde_json::from_str::<WorkerReply>(&line) {
                Ok(reply) if reply.index == index => reply.into_result(),
                Ok(reply) => {
                    self.alive = false;
                    Err(PoolError::Protocol(format!(
                        "expected reply for unit {} but got unit {}",
                        index, reply.index
                    ))
                    .into())
                }
                Err(e) => {
                    self.alive = false;
                    Err(PoolError::Protocol(format!("invalid reply: {}", e)).into())
                }
            },
            Ok(None) => Err(self.crashed(unit, "worker exited".to_string()).await),
            Err(e) => Err(self.crashed(unit, e.to_string()).await),
        }
    }

    fn is_alive(&self) -> bool {
        self.alive
    }

    async fn shutdown(self: Box<Self>) {
        let mut this = self;
        if this.alive {
            if let Err(e) = this.send(&WorkerRequest::Shutdown).await {
                debug!(worker_id = %this.id, error = %e, "Could not ask worker to stop");
            }
        }
        drop(this.stdin.take());

        match tokio::time::timeout(this.shutdown_timeout, this.child.wait()).await {
            Ok(Ok(status)) => debug!(worker_id = %this.id, %status, "Worker process exited"),
            Ok(Err(e)) => warn!(worker_id = %this.id, error = %e, "Failed to wait for worker"),
            Err(_) => {
                warn!(worker_id = %this.id, "Worker did not exit in time, killing it");
                if let Err(e) = this.child.kill().await {
                    error!(worker_id = %this.id, error = %e, "Failed to kill worker");
                }
            }
        }

        if let Some(task) = this.stderr_task.take() {
            if let Err(e) = task.await {
                debug!(worker_id = %this.id, error = %e, "Log forwarding task failed");
            }
        }
    }
}

/// How a worker process loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    /// The parent asked the worker to stop or closed its input.
    Finished,
    /// An interrupt arrived.
    Interrupted,
}

impl WorkerExit {
    pub fn exit_code(self) -> i32 {
        match self {
            WorkerExit::Finished => 0,
            WorkerExit::Interrupted => INTERRUPTED_EXIT_CODE,
        }
    }
}

/// Child-side loop of a worker process.
///
/// Reads requests from stdin and answers on stdout until asked to stop. The
/// unit entry is built on the first unit and reused for the rest.
pub async fn worker_main(builder: Arc<dyn EntryBuilder>) -> Result<WorkerExit, ForecastError> {
    let worker_id =
        std::env::var(WORKER_ID_ENV).unwrap_or_else(|_| format!("pid-{}", std::process::id()));
    let mut requests = BufReader::new(tokio::io::stdin()).lines();
    let mut stdout = tokio::io::stdout();
    let mut entry: Option<Arc<dyn UnitEntry>> = None;

    let interrupt = tokio::signal::ctrl_c();
    tokio::pin!(interrupt);

    info!(worker_id = %worker_id, "Worker process started");
    loop {
        let line = tokio::select! {
            _ = &mut interrupt => {
                warn!(worker_id = %worker_id, "Worker interrupted");
                return Ok(WorkerExit::Interrupted);
            }
            line = requests.next_line() => line?,
        };
        let Some(line) = line else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: WorkerRequest = serde_json::from_str(&line)
            .map_err(|e| PoolError::Protocol(format!("invalid request: {}", e)))?;
        let job = match request {
            WorkerRequest::Shutdown => break,
            WorkerRequest::Run { job } => job,
        };

        let result = match ensure_entry(&mut entry, builder.as_ref(), &job.args.run_config).await {
            Ok(current) => {
                tokio::select! {
                    _ = &mut interrupt => {
                        warn!(worker_id = %worker_id, unit = %job.unit.name, "Worker interrupted");
                        return Ok(WorkerExit::Interrupted);
                    }
                    result = current.run_unit(job.clone()) => result,
                }
            }
            Err(e) => {
                error!(worker_id = %worker_id, error = %e, "Failed to build worker context");
                Err(e)
            }
        };

        let mut reply = serde_json::to_string(&WorkerReply::from_result(&job, &result))
            .map_err(|e| PoolError::Protocol(e.to_string()))?;
        reply.push('\n');
        stdout.write_all(reply.as_bytes()).await?;
        stdout.flush().await?;
    }

    info!(worker_id = %worker_id, "Worker process stopped");
    Ok(WorkerExit::Finished)
}

async fn ensure_entry(
    slot: &mut Option<Arc<dyn UnitEntry>>,
    builder: &dyn EntryBuilder,
    config: &RunConfig,
) -> Result<Arc<dyn UnitEntry>, ForecastError> {
    if let Some(entry) = slot {
        return Ok(Arc::clone(entry));
    }
    let built = builder.build(config).await?;
    *slot = Some(Arc::clone(&built));
    Ok(built)
}
