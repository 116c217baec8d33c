//! Process-backed execution context
//!
//! The child speaks newline-delimited JSON over stdio: the pool writes
//! `PoolToWorker` frames to its stdin, the child answers with
//! `WorkerToPool` frames on stdout, stderr passes through untouched.
//! Termination is cooperative first (a terminate frame plus stdin EOF),
//! escalating to a kill after a short grace period.
//!
//! [`process_worker_main`] is the matching child-side entry point; worker
//! binaries hand it their handler registry and nothing else.

use std::io::{self, BufRead, Write};
use std::process::Stdio;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

use threadmill_core::channel::ChannelHandle;
use threadmill_core::config::{ProcessOptions, RuntimeKind};
use threadmill_core::error::TransportError;
use threadmill_core::message::{
    PoolToWorker, ReadyMessage, RequestMessage, ResponseMessage, StartupMessage, WorkerToPool,
};

use crate::context::{ExecutionContext, SpawnSpec, WorkerEvent};
use crate::memory::MemoryProbe;
use crate::runner::{execute_request, ContextMessages, TaskRunner, WorkerContext};

/// How long a terminated worker gets to exit on its own
const KILL_GRACE_PERIOD: Duration = Duration::from_secs(1);

type UserRoute = Arc<Mutex<Option<mpsc::UnboundedSender<Value>>>>;

/// Pool-side handle to one worker process
pub struct ProcessContext {
    stdin_tx: mpsc::UnboundedSender<PoolToWorker>,
    responses: Receiver<ResponseMessage>,
    user_route: UserRoute,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessContext {
    pub fn spawn(spec: SpawnSpec, options: ProcessOptions) -> Result<Self, TransportError> {
        let Some(program) = options.program else {
            return Err(TransportError::new(
                "process runtime requires a worker program",
            ));
        };

        let mut child = Command::new(&program)
            .args(&options.args)
            .envs(options.env.iter().cloned())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                TransportError::new(format!(
                    "failed to spawn worker process {}: {err}",
                    program.display()
                ))
            })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            TransportError::new("worker process has no stdin pipe")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            TransportError::new("worker process has no stdout pipe")
        })?;

        let (stdin_tx, stdin_rx) = mpsc::unbounded_channel::<PoolToWorker>();
        let (responses_tx, responses_rx) = unbounded();
        let (kill_tx, kill_rx) = oneshot::channel();
        let user_route: UserRoute = Arc::new(Mutex::new(None));

        // Writer: frames queued by the pool, one JSON line each.
        tokio::spawn(write_frames(stdin, stdin_rx));

        // Reader: route child frames to the response buffer, the bound
        // channel, or the scheduler.
        tokio::spawn(read_frames(
            stdout,
            spec.token,
            spec.events.clone(),
            responses_tx,
            user_route.clone(),
        ));

        // Waiter: owns the child, reports the exit, escalates to a kill
        // when termination drags past the grace period.
        let events = spec.events;
        let token = spec.token;
        tokio::spawn(async move {
            let mut kill_rx = kill_rx;
            tokio::select! {
                _ = child.wait() => {
                    let _ = events.send((token, WorkerEvent::Exited));
                    return;
                }
                _ = &mut kill_rx => {}
            }
            tokio::select! {
                _ = child.wait() => {}
                _ = tokio::time::sleep(KILL_GRACE_PERIOD) => {
                    debug!("worker process ignored terminate, killing it");
                    if child.start_kill().is_ok() {
                        let _ = child.wait().await;
                    }
                }
            }
            let _ = events.send((token, WorkerEvent::Exited));
        });

        let context = ProcessContext {
            stdin_tx,
            responses: responses_rx,
            user_route,
            kill_tx: Some(kill_tx),
        };
        context
            .stdin_tx
            .send(PoolToWorker::Startup(spec.startup))
            .map_err(|_| TransportError::new("worker process closed its stdin immediately"))?;
        Ok(context)
    }
}

impl ExecutionContext for ProcessContext {
    fn kind(&self) -> RuntimeKind {
        RuntimeKind::Process
    }

    fn post_request(&mut self, request: RequestMessage) -> Result<(), TransportError> {
        self.stdin_tx
            .send(PoolToWorker::Request(request))
            .map_err(|_| TransportError::new("worker process is gone"))
    }

    fn try_recv_response(&mut self) -> Option<ResponseMessage> {
        self.responses.try_recv().ok()
    }

    fn bind_channel(&mut self, channel: ChannelHandle) -> Result<(), TransportError> {
        let (mut from_user, to_user) = channel.into_parts();
        *self.user_route.lock() = Some(to_user);
        let stdin_tx = self.stdin_tx.clone();
        tokio::spawn(async move {
            while let Some(data) = from_user.recv().await {
                if stdin_tx.send(PoolToWorker::User { data }).is_err() {
                    break;
                }
            }
        });
        Ok(())
    }

    fn terminate(&mut self) {
        let _ = self.stdin_tx.send(PoolToWorker::Terminate);
        if let Some(kill) = self.kill_tx.take() {
            let _ = kill.send(());
        }
    }
}

async fn write_frames(
    stdin: tokio::process::ChildStdin,
    mut frames: mpsc::UnboundedReceiver<PoolToWorker>,
) {
    let mut stdin = stdin;
    while let Some(frame) = frames.recv().await {
        let line = match serde_json::to_string(&frame) {
            Ok(line) => line,
            Err(err) => {
                warn!(error = %err, "dropping unserializable frame");
                continue;
            }
        };
        if stdin.write_all(line.as_bytes()).await.is_err()
            || stdin.write_all(b"\n").await.is_err()
            || stdin.flush().await.is_err()
        {
            break;
        }
    }
    // Receiver closed or pipe broken either way; dropping stdin sends EOF.
}

async fn read_frames(
    stdout: tokio::process::ChildStdout,
    token: crate::context::SlotToken,
    events: crate::context::EventSender,
    responses: crossbeam_channel::Sender<ResponseMessage>,
    user_route: UserRoute,
) {
    let mut lines = BufReader::new(stdout).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WorkerToPool>(&line) {
                    Ok(WorkerToPool::Ready(_)) => {
                        let _ = events.send((token, WorkerEvent::Ready));
                    }
                    Ok(WorkerToPool::Response(response)) => {
                        if responses.send(response).is_err() {
                            break;
                        }
                        let _ = events.send((token, WorkerEvent::Wake));
                    }
                    Ok(WorkerToPool::User { data }) => {
                        let route = user_route.lock();
                        match route.as_ref() {
                            Some(sender) => {
                                let _ = sender.send(data);
                            }
                            None => debug!("user frame arrived with no bound channel"),
                        }
                    }
                    Err(err) => {
                        let _ = events.send((
                            token,
                            WorkerEvent::Failed {
                                message: format!("malformed frame from worker: {err}"),
                            },
                        ));
                        break;
                    }
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
}

/// Errors a worker binary can hit before or between tasks
#[derive(Debug, Error)]
pub enum ProcessWorkerError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),
}

enum ChildOrder {
    Start(StartupMessage),
    Run(RequestMessage),
    Stop,
}

#[derive(Clone)]
struct FrameWriter {
    stdout: Arc<Mutex<io::Stdout>>,
}

impl FrameWriter {
    fn new() -> Self {
        FrameWriter {
            stdout: Arc::new(Mutex::new(io::stdout())),
        }
    }

    fn write(&self, frame: &WorkerToPool) -> io::Result<()> {
        let line = serde_json::to_string(frame)?;
        let mut stdout = self.stdout.lock();
        stdout.write_all(line.as_bytes())?;
        stdout.write_all(b"\n")?;
        stdout.flush()
    }
}

/// Entry point for worker binaries
///
/// Reads frames from stdin until a terminate frame or EOF, running each
/// request through `runner` and writing the response back on stdout.
/// Returns once the pool side is done with this worker.
pub fn process_worker_main(runner: Arc<dyn TaskRunner>) -> Result<(), ProcessWorkerError> {
    let (orders_tx, orders_rx) = std::sync::mpsc::channel();
    let (user_tx, user_rx) = std::sync::mpsc::channel();

    // Dedicated reader so out-of-band frames keep flowing while a handler
    // runs on the main thread.
    thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            let Ok(line) = line else { break };
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<PoolToWorker>(&line) {
                Ok(PoolToWorker::Startup(startup)) => {
                    if orders_tx.send(ChildOrder::Start(startup)).is_err() {
                        return;
                    }
                }
                Ok(PoolToWorker::Request(request)) => {
                    if orders_tx.send(ChildOrder::Run(request)).is_err() {
                        return;
                    }
                }
                Ok(PoolToWorker::User { data }) => {
                    let _ = user_tx.send(data);
                }
                Ok(PoolToWorker::Terminate) => {
                    let _ = orders_tx.send(ChildOrder::Stop);
                    return;
                }
                Err(err) => {
                    warn!(error = %err, "malformed frame from pool");
                    let _ = orders_tx.send(ChildOrder::Stop);
                    return;
                }
            }
        }
        let _ = orders_tx.send(ChildOrder::Stop);
    });

    let writer = FrameWriter::new();

    let startup = match orders_rx.recv() {
        Ok(ChildOrder::Start(startup)) => startup,
        _ => {
            return Err(ProcessWorkerError::Protocol(
                "expected a startup frame first".to_string(),
            ))
        }
    };

    let runner_ref = runner.as_ref();
    if let Some(file) = &startup.target_file {
        if let Err(err) = runner_ref.resolve(file, &startup.target_name) {
            debug!(worker_id = %startup.worker_id, error = %err, "default target not pre-loadable");
        }
    }

    let outgoing = writer.clone();
    let context = WorkerContext::new(startup.worker_id, startup.worker_data.clone()).with_messages(
        ContextMessages {
            incoming: user_rx,
            outgoing: Box::new(move |data| {
                outgoing
                    .write(&WorkerToPool::User { data })
                    .map_err(|err| err.to_string())
            }),
        },
    );

    writer.write(&WorkerToPool::Ready(ReadyMessage { ready: true }))?;

    let mut probe = MemoryProbe::new();
    loop {
        match orders_rx.recv() {
            Ok(ChildOrder::Run(request)) => {
                let response = execute_request(runner_ref, &context, request, &mut probe);
                writer.write(&WorkerToPool::Response(response))?;
            }
            Ok(ChildOrder::Start(_)) => {
                return Err(ProcessWorkerError::Protocol(
                    "unexpected second startup frame".to_string(),
                ))
            }
            Ok(ChildOrder::Stop) | Err(_) => break,
        }
    }
    Ok(())
}
