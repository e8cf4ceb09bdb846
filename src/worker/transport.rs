//! Host side of a worker: request correlation, startup, and backup.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use serde_json::Value as Json;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, error, info, warn};

use crate::config::EngineLocation;
use crate::error::{DatabaseError, Error, Result, TransportError};
use crate::store::accelerator_db::AcceleratorSurface;
use crate::store::engine::CloseOptions;
use crate::store::main_db::MainSurface;
use crate::worker::host::{self, WorkerLink};
use crate::worker::pending::PendingCalls;
use crate::worker::protocol::{
    Envelope, LogLevel, Payload, Request, SqlCallResult, WorkerEvent, WorkerTag,
};
use crate::worker::surface::SqlSurface;

/// Contract shared by both workers.
#[async_trait]
pub trait Transport: Send + Sync {
    fn tag(&self) -> WorkerTag;

    /// Start the worker if needed, then open and migrate its database.
    async fn initialize(&self, key: &SecretString) -> Result<()>;

    /// Close the database. With `exit` the worker thread stops as well and
    /// the transport refuses all further requests.
    async fn close(&self, exit: bool, options: CloseOptions) -> Result<()>;

    /// Close the database, then delete its file set.
    async fn remove_db(&self) -> Result<()>;

    async fn rekey(&self, key: &SecretString) -> Result<()>;

    /// Copy the live file set into `dir` and run maintenance (and an
    /// optional rekey) on the copy only.
    async fn backup(&self, dir: &Path, new_key: Option<&SecretString>) -> Result<()>;

    /// Bytes used on disk by the database file set.
    async fn size(&self) -> Result<u64>;

    async fn sql_call(&self, method: &str, args: Vec<Json>) -> Result<SqlCallResult>;

    async fn get_sql_methods(&self) -> Result<Vec<String>>;
}

/// Tunables shared by every worker a transport spawns.
#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub start_timeout: Duration,
    pub chunk_limit: usize,
}

enum Link {
    Idle,
    Running(mpsc::UnboundedSender<Envelope>),
    Exited,
}

struct Answer {
    payload: Payload,
    duration_ms: u64,
    seq: u64,
}

/// A [`Transport`] backed by a dedicated worker thread.
pub struct WorkerTransport {
    tag: WorkerTag,
    location: EngineLocation,
    options: WorkerOptions,
    link: Mutex<Link>,
    next_seq: AtomicU64,
    pending: Arc<PendingCalls>,
    /// Key of the live database, reused to open backup copies.
    key: Mutex<Option<SecretString>>,
}

impl WorkerTransport {
    pub fn new(tag: WorkerTag, location: EngineLocation, options: WorkerOptions) -> Self {
        Self {
            tag,
            location,
            options,
            link: Mutex::new(Link::Idle),
            next_seq: AtomicU64::new(0),
            pending: Arc::new(PendingCalls::new(tag)),
            key: Mutex::new(None),
        }
    }

    /// Transport for the main store.
    pub fn main(location: EngineLocation, options: WorkerOptions) -> Self {
        Self::new(WorkerTag::Main, location, options)
    }

    /// Transport for the accelerator store.
    pub fn accelerator(location: EngineLocation, options: WorkerOptions) -> Self {
        Self::new(WorkerTag::Accelerator, location, options)
    }

    pub fn location(&self) -> &EngineLocation {
        &self.location
    }

    fn surface(&self) -> Box<dyn SqlSurface> {
        match self.tag {
            WorkerTag::Main => Box::new(MainSurface::new(self.options.chunk_limit)),
            WorkerTag::Accelerator => Box::new(AcceleratorSurface::new(self.options.chunk_limit)),
        }
    }

    fn worker(&self) -> String {
        self.tag.to_string()
    }

    /// Spawn the worker thread unless it is already running.
    async fn ensure_started(&self) -> Result<()> {
        let mut link = self.link.lock().await;
        match &*link {
            Link::Running(_) => return Ok(()),
            Link::Exited => return Err(TransportError::Closed { worker: self.worker() }.into()),
            Link::Idle => {}
        }

        let WorkerLink {
            requests,
            events,
            ready,
        } = host::spawn(self.tag, self.location.clone(), self.surface())?;

        match tokio::time::timeout(self.options.start_timeout, ready).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(reason))) => {
                return Err(TransportError::SpawnFailed {
                    worker: self.worker(),
                    reason,
                }
                .into());
            }
            Ok(Err(_)) => {
                return Err(TransportError::SpawnFailed {
                    worker: self.worker(),
                    reason: "worker exited during startup".to_string(),
                }
                .into());
            }
            Err(_) => {
                return Err(TransportError::StartupTimeout {
                    worker: self.worker(),
                    timeout: self.options.start_timeout,
                }
                .into());
            }
        }

        tokio::spawn(read_events(self.tag, events, Arc::clone(&self.pending)));
        *link = Link::Running(requests);
        debug!(worker = %self.tag, path = %self.location.db_path().display(), "Worker started");
        Ok(())
    }

    async fn sender(&self) -> Result<mpsc::UnboundedSender<Envelope>> {
        match &*self.link.lock().await {
            Link::Running(sender) => Ok(sender.clone()),
            Link::Idle => Err(Error::NotInitialized),
            Link::Exited => Err(TransportError::Closed { worker: self.worker() }.into()),
        }
    }

    async fn request(&self, request: Request) -> Result<Answer> {
        let sender = self.sender().await?;
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        let reply = self.pending.insert(seq)?;

        debug!(worker = %self.tag, seq, request = request.kind(), "Sending request");
        if sender.send(Envelope { seq, request }).is_err() {
            self.pending.remove(seq);
            return Err(TransportError::Closed { worker: self.worker() }.into());
        }

        let reply = reply.await.map_err(|_| {
            if self.pending.is_poisoned() {
                TransportError::Poisoned { worker: self.worker() }
            } else {
                TransportError::Disconnected { worker: self.worker() }
            }
        })?;
        Ok(Answer {
            payload: reply.outcome?,
            duration_ms: reply.duration_ms,
            seq: reply.seq,
        })
    }

    async fn request_done(&self, request: Request) -> Result<()> {
        self.request(request).await.map(|_| ())
    }

    async fn copy_file_set(&self, dir: &Path) -> Result<()> {
        tokio::fs::create_dir_all(dir)
            .await
            .map_err(|e| DatabaseError::Io(format!("{}: {e}", dir.display())))?;
        // The shared-memory index is rebuilt by whoever opens the copy.
        let [db, wal, _shm] = self.location.file_set();
        for source in [db, wal] {
            let Some(name) = source.file_name() else {
                continue;
            };
            let target = dir.join(name);
            match tokio::fs::copy(&source, &target).await {
                Ok(bytes) => debug!(worker = %self.tag, from = %source.display(), bytes, "Copied"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => {
                    return Err(DatabaseError::Io(format!("{}: {e}", source.display())).into());
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for WorkerTransport {
    fn tag(&self) -> WorkerTag {
        self.tag
    }

    async fn initialize(&self, key: &SecretString) -> Result<()> {
        self.ensure_started().await?;
        self.request_done(Request::Initialize { key: key.clone() }).await?;
        *self.key.lock().await = Some(key.clone());
        Ok(())
    }

    async fn close(&self, exit: bool, options: CloseOptions) -> Result<()> {
        let result = match self.sender().await {
            Ok(_) => self.request_done(Request::Close { options, exit }).await,
            // Nothing was ever started; closing is a no-op.
            Err(Error::NotInitialized) => Ok(()),
            Err(e) => Err(e),
        };
        if exit {
            *self.link.lock().await = Link::Exited;
            info!(worker = %self.tag, "Worker exited");
        }
        result
    }

    async fn remove_db(&self) -> Result<()> {
        self.request_done(Request::RemoveDb).await?;
        *self.key.lock().await = None;
        Ok(())
    }

    async fn rekey(&self, key: &SecretString) -> Result<()> {
        self.request_done(Request::Rekey { key: key.clone() }).await?;
        *self.key.lock().await = Some(key.clone());
        Ok(())
    }

    async fn backup(&self, dir: &Path, new_key: Option<&SecretString>) -> Result<()> {
        let key = self.key.lock().await.clone().ok_or(Error::NotInitialized)?;

        self.request_done(Request::Checkpoint).await?;
        self.copy_file_set(dir).await?;

        let copy = WorkerTransport::new(
            self.tag,
            EngineLocation::new(dir, self.location.file_name.clone()),
            self.options.clone(),
        );
        let maintained = async {
            copy.initialize(&key).await?;
            copy.request_done(Request::Maintain {
                new_key: new_key.cloned(),
            })
            .await
        }
        .await;
        let closed = copy.close(true, CloseOptions::default()).await;

        maintained?;
        closed?;
        info!(
            worker = %self.tag,
            dir = %dir.display(),
            rekeyed = new_key.is_some(),
            "Backup written"
        );
        Ok(())
    }

    async fn size(&self) -> Result<u64> {
        match self.request(Request::Size).await?.payload {
            Payload::Size(bytes) => Ok(bytes),
            other => Err(unexpected_payload(self.tag, "size", other)),
        }
    }

    async fn sql_call(&self, method: &str, args: Vec<Json>) -> Result<SqlCallResult> {
        let answer = self
            .request(Request::SqlCall {
                method: method.to_string(),
                args,
            })
            .await?;
        match answer.payload {
            Payload::Value(result) => Ok(SqlCallResult {
                result,
                duration_ms: answer.duration_ms,
                seq_id: answer.seq,
            }),
            other => Err(unexpected_payload(self.tag, method, other)),
        }
    }

    async fn get_sql_methods(&self) -> Result<Vec<String>> {
        match self.request(Request::SqlMethods).await?.payload {
            Payload::Methods(methods) => Ok(methods),
            other => Err(unexpected_payload(self.tag, "getSQLMethods", other)),
        }
    }
}

fn unexpected_payload(tag: WorkerTag, request: &str, payload: Payload) -> Error {
    DatabaseError::Serialization(format!("{tag} answered {request} with {payload:?}")).into()
}

/// Route replies to their callers and forward worker logs.
///
/// A reply nobody asked for means the two sides no longer agree on the
/// conversation: the table is poisoned and reading stops, which in turn
/// stops the worker.
async fn read_events(
    tag: WorkerTag,
    mut events: mpsc::UnboundedReceiver<WorkerEvent>,
    pending: Arc<PendingCalls>,
) {
    while let Some(event) = events.recv().await {
        match event {
            WorkerEvent::Reply(reply) => {
                if let Err(e) = pending.complete(reply) {
                    let abandoned = pending.poison();
                    error!(worker = %tag, error = %e, abandoned, "Protocol violation");
                    break;
                }
            }
            WorkerEvent::Log { level, message } => forward_log(tag, level, &message),
        }
    }

    let abandoned = pending.fail_all();
    if abandoned > 0 {
        warn!(worker = %tag, abandoned, "Worker stopped with requests in flight");
    }
}

fn forward_log(tag: WorkerTag, level: LogLevel, message: &str) {
    match (tag, level) {
        (WorkerTag::Accelerator, LogLevel::Error) => {
            error!(target: "cipher_store::accelerator", "{message}")
        }
        (WorkerTag::Accelerator, LogLevel::Warn) => {
            warn!(target: "cipher_store::accelerator", "{message}")
        }
        (WorkerTag::Main, LogLevel::Error) => error!(worker = %tag, "{message}"),
        (WorkerTag::Main, LogLevel::Warn) => warn!(worker = %tag, "{message}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::worker::protocol::Reply;
    use serde_json::json;

    fn options() -> WorkerOptions {
        WorkerOptions {
            start_timeout: Duration::from_secs(10),
            chunk_limit: 999,
        }
    }

    fn key(byte: &str) -> SecretString {
        SecretString::from(byte.repeat(32))
    }

    fn main_transport(dir: &Path) -> WorkerTransport {
        WorkerTransport::main(EngineLocation::new(dir.join("sql"), "db.sqlite"), options())
    }

    #[tokio::test]
    async fn call_before_initialize_is_not_initialized() {
        let dir = tempfile::tempdir().unwrap();
        let transport = main_transport(dir.path());

        let err = transport.sql_call("getAllItems", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::NotInitialized));
    }

    #[tokio::test]
    async fn sequence_numbers_increase_per_call() {
        let dir = tempfile::tempdir().unwrap();
        let transport = main_transport(dir.path());
        transport.initialize(&key("aa")).await.unwrap();

        let first = transport.sql_call("getAllItems", vec![]).await.unwrap();
        let second = transport
            .sql_call("createOrUpdateItem", vec![json!({"id": "k", "v": 1})])
            .await
            .unwrap();

        assert!(second.seq_id > first.seq_id);
        assert_eq!(first.result, json!([]));
    }

    #[tokio::test]
    async fn per_call_errors_leave_worker_usable() {
        let dir = tempfile::tempdir().unwrap();
        let transport = main_transport(dir.path());
        transport.initialize(&key("aa")).await.unwrap();

        let err = transport.sql_call("noSuchMethod", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::UnknownMethod(_)));

        let count = transport.sql_call("getMessageCount", vec![]).await.unwrap();
        assert_eq!(count.result, json!(0));
    }

    #[tokio::test]
    async fn concurrent_calls_all_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let transport = Arc::new(main_transport(dir.path()));
        transport.initialize(&key("aa")).await.unwrap();

        let calls = (0..20).map(|i| {
            let transport = Arc::clone(&transport);
            async move {
                transport
                    .sql_call("createOrUpdateItem", vec![json!({"id": format!("k{i}")})])
                    .await
            }
        });
        let results = futures::future::join_all(calls).await;

        assert!(results.iter().all(|r| r.is_ok()));
        let items = transport.sql_call("getAllItems", vec![]).await.unwrap();
        assert_eq!(items.result.as_array().unwrap().len(), 20);
    }

    #[tokio::test]
    async fn exit_refuses_further_requests() {
        let dir = tempfile::tempdir().unwrap();
        let transport = main_transport(dir.path());
        transport.initialize(&key("aa")).await.unwrap();

        transport.close(true, CloseOptions::default()).await.unwrap();

        let err = transport.sql_call("getAllItems", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Closed { .. })));
        assert!(transport.initialize(&key("aa")).await.is_err());
    }

    #[tokio::test]
    async fn remove_db_closes_then_erases() {
        let dir = tempfile::tempdir().unwrap();
        let transport = main_transport(dir.path());
        transport.initialize(&key("aa")).await.unwrap();
        assert!(transport.size().await.unwrap() > 0);

        transport.remove_db().await.unwrap();

        assert_eq!(transport.size().await.unwrap(), 0);
        assert!(!transport.location().db_path().exists());
    }

    #[tokio::test]
    async fn backup_copy_opens_with_new_key_and_original_keeps_old() {
        let dir = tempfile::tempdir().unwrap();
        let transport = main_transport(dir.path());
        transport.initialize(&key("aa")).await.unwrap();
        transport
            .sql_call("createOrUpdateItem", vec![json!({"id": "k", "v": 1})])
            .await
            .unwrap();

        let backup_dir = dir.path().join("backup").join("sql");
        transport.backup(&backup_dir, Some(&key("bb"))).await.unwrap();

        // Live store is untouched and still serves calls.
        let live = transport.sql_call("getItemById", vec![json!("k")]).await.unwrap();
        assert_eq!(live.result["v"], 1);

        let copy = WorkerTransport::main(EngineLocation::new(&backup_dir, "db.sqlite"), options());
        copy.initialize(&key("bb")).await.unwrap();
        let restored = copy.sql_call("getItemById", vec![json!("k")]).await.unwrap();
        assert_eq!(restored.result["v"], 1);

        let stale = WorkerTransport::main(EngineLocation::new(&backup_dir, "db.sqlite"), options());
        copy.close(true, CloseOptions::default()).await.unwrap();
        assert!(stale.initialize(&key("aa")).await.is_err());
    }

    #[tokio::test]
    async fn accelerator_reports_its_methods() {
        let dir = tempfile::tempdir().unwrap();
        let transport = WorkerTransport::accelerator(
            EngineLocation::new(dir.path().join("accel"), "db.sqlite"),
            options(),
        );
        transport.initialize(&key("aa")).await.unwrap();

        let methods = transport.get_sql_methods().await.unwrap();

        assert!(methods.iter().any(|m| m == "upsertReadPosition"));
        assert!(!methods.iter().any(|m| m == "saveMessage"));
    }

    #[tokio::test]
    async fn unmatched_reply_shuts_the_transport() {
        let (events, receiver) = mpsc::unbounded_channel();
        let pending = Arc::new(PendingCalls::new(WorkerTag::Accelerator));
        let waiting = pending.insert(1).unwrap();
        let reader = tokio::spawn(read_events(
            WorkerTag::Accelerator,
            receiver,
            Arc::clone(&pending),
        ));

        events
            .send(WorkerEvent::Reply(Reply {
                seq: 9,
                outcome: Ok(Payload::Done),
                duration_ms: 0,
            }))
            .unwrap();
        reader.await.unwrap();

        assert!(waiting.await.is_err());
        assert!(events.is_closed());
        assert!(matches!(pending.insert(2), Err(TransportError::Poisoned { .. })));
    }

    #[tokio::test]
    async fn poisoned_transport_refuses_calls() {
        let dir = tempfile::tempdir().unwrap();
        let transport = main_transport(dir.path());
        transport.initialize(&key("aa")).await.unwrap();

        transport.pending.poison();

        let err = transport.sql_call("getAllItems", vec![]).await.unwrap_err();
        assert!(matches!(err, Error::Transport(TransportError::Poisoned { .. })));
    }
}
