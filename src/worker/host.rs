//! The worker side: a dedicated thread that owns one engine.
//!
//! Requests are served strictly in arrival order on a current-thread
//! runtime, so a single engine never runs two calls at once.

use std::time::Instant;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::config::EngineLocation;
use crate::error::{Error, Result, TransportError};
use crate::store::cipher::DbKey;
use crate::store::engine::{CloseOptions, Engine};
use crate::worker::protocol::{
    Envelope, LogLevel, Payload, Reply, Request, WorkerEvent, WorkerTag,
};
use crate::worker::surface::{Args, SqlSurface};

/// Channel ends held by the host after a successful spawn.
pub(crate) struct WorkerLink {
    pub requests: mpsc::UnboundedSender<Envelope>,
    pub events: mpsc::UnboundedReceiver<WorkerEvent>,
    pub ready: oneshot::Receiver<std::result::Result<(), String>>,
}

/// Start the worker thread for `surface` over the file at `location`.
pub(crate) fn spawn(
    tag: WorkerTag,
    location: EngineLocation,
    surface: Box<dyn SqlSurface>,
) -> Result<WorkerLink> {
    let (request_tx, request_rx) = mpsc::unbounded_channel();
    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();

    std::thread::Builder::new()
        .name(format!("cipher-store-{tag}"))
        .spawn(move || run(tag, location, surface, request_rx, event_tx, ready_tx))
        .map_err(|e| TransportError::SpawnFailed {
            worker: tag.to_string(),
            reason: e.to_string(),
        })?;

    Ok(WorkerLink {
        requests: request_tx,
        events: event_rx,
        ready: ready_rx,
    })
}

fn run(
    tag: WorkerTag,
    location: EngineLocation,
    surface: Box<dyn SqlSurface>,
    requests: mpsc::UnboundedReceiver<Envelope>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    ready: oneshot::Sender<std::result::Result<(), String>>,
) {
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            let _ = ready.send(Err(e.to_string()));
            return;
        }
    };
    let _ = ready.send(Ok(()));

    let engine = Engine::new(location, surface.schema());
    let host = Host {
        tag,
        engine,
        surface,
        events,
    };
    runtime.block_on(host.serve(requests));
}

struct Host {
    tag: WorkerTag,
    engine: Engine,
    surface: Box<dyn SqlSurface>,
    events: mpsc::UnboundedSender<WorkerEvent>,
}

impl Host {
    async fn serve(mut self, mut requests: mpsc::UnboundedReceiver<Envelope>) {
        while let Some(Envelope { seq, request }) = requests.recv().await {
            let exit = matches!(request, Request::Close { exit: true, .. });
            let kind = request.kind().to_string();
            let started = Instant::now();

            let outcome = self.handle(request).await;
            let duration_ms = started.elapsed().as_millis() as u64;

            debug!(
                worker = %self.tag,
                seq,
                request = %kind,
                duration_ms,
                ok = outcome.is_ok(),
                "Handled request"
            );
            if let Err(e) = &outcome {
                self.log_failure(&kind, e);
            }

            let reply = Reply {
                seq,
                outcome,
                duration_ms,
            };
            if self.events.send(WorkerEvent::Reply(reply)).is_err() {
                // Host dropped its end; nobody is listening any more.
                break;
            }
            if exit {
                break;
            }
        }

        if self.engine.is_open() {
            let _ = self.engine.close(CloseOptions::default()).await;
        }
        debug!(worker = %self.tag, "Worker stopped");
    }

    async fn handle(&mut self, request: Request) -> Result<Payload> {
        match request {
            Request::Initialize { key } => {
                let key = DbKey::parse(&key)?;
                self.engine.open(key).await?;
                Ok(Payload::Done)
            }
            Request::Close { options, .. } => {
                self.engine.close(options).await?;
                Ok(Payload::Done)
            }
            Request::RemoveDb => {
                self.engine.close(CloseOptions::default()).await?;
                self.engine.remove_db()?;
                Ok(Payload::Done)
            }
            Request::Rekey { key } => {
                let key = DbKey::parse(&key)?;
                self.engine.rekey(key).await?;
                Ok(Payload::Done)
            }
            Request::Checkpoint => {
                self.engine.checkpoint().await?;
                Ok(Payload::Done)
            }
            Request::Maintain { new_key } => {
                let new_key = new_key.as_ref().map(DbKey::parse).transpose()?;
                self.engine.maintain().await?;
                if let Some(key) = new_key {
                    self.engine.rekey(key).await?;
                }
                Ok(Payload::Done)
            }
            Request::Size => Ok(Payload::Size(self.engine.size_on_disk()?)),
            Request::SqlCall { method, args } => {
                if !self.engine.is_open() {
                    return Err(Error::NotInitialized);
                }
                let args = Args::new(method.as_str(), args);
                let value = self.surface.call(&mut self.engine, &method, args).await?;
                Ok(Payload::Value(value))
            }
            Request::SqlMethods => Ok(Payload::Methods(
                self.surface.methods().iter().map(|m| m.to_string()).collect(),
            )),
        }
    }

    fn log_failure(&self, kind: &str, error: &Error) {
        let level = match error {
            Error::UnknownMethod(_) | Error::InvalidArguments { .. } | Error::NotInitialized => {
                LogLevel::Warn
            }
            _ => LogLevel::Error,
        };
        let _ = self.events.send(WorkerEvent::Log {
            level,
            message: format!("{kind}: {error}"),
        });
    }
}
