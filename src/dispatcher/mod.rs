//! Dispatcher: the single entry point to both stores.
//!
//! On startup it brings both workers up together, drains the legacy
//! unprocessed queue from main into the accelerator, and learns which
//! methods the accelerator serves. After that every call is routed by a
//! fixed [`RouteTable`].

pub mod disk;
pub mod routes;

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use futures::future::try_join;
use secrecy::SecretString;
use serde_json::{Value as Json, json};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{
    BACKUP_FREE_SPACE_MARGIN, CONFIG_FILE_NAME, EPHEMERAL_FILE_NAME, EngineLocation, StoreConfig,
    UNPROCESSED_MIGRATION_BATCH,
};
use crate::error::{DatabaseError, Error, Result};
use crate::store::cipher::DbKey;
use crate::store::engine::CloseOptions;
use crate::store::unprocessed;
use crate::worker::protocol::{CallOutcome, WorkerTag};
use crate::worker::transport::{Transport, WorkerOptions, WorkerTransport};

pub use disk::{DiskSpace, SystemDiskSpace};
pub use routes::RouteTable;

/// Startup progress, observed by calls that arrive early.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Initializing,
    Ready,
    Failed,
}

struct Transports {
    main: Arc<dyn Transport>,
    accelerator: Arc<dyn Transport>,
}

struct Running {
    config: StoreConfig,
    transports: Transports,
    routes: RouteTable,
}

pub struct Dispatcher {
    disk: Arc<dyn DiskSpace>,
    /// Transports supplied up front instead of built from the config.
    preset: Mutex<Option<Transports>>,
    phase: watch::Sender<Phase>,
    running: OnceLock<Running>,
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl Dispatcher {
    pub fn new() -> Self {
        let (phase, _) = watch::channel(Phase::Idle);
        Self {
            disk: Arc::new(SystemDiskSpace),
            preset: Mutex::new(None),
            phase,
            running: OnceLock::new(),
        }
    }

    /// Replace the free-space source.
    pub fn with_disk_space(mut self, disk: Arc<dyn DiskSpace>) -> Self {
        self.disk = disk;
        self
    }

    /// Use these transports instead of spawning workers from the config.
    pub fn with_transports(
        mut self,
        main: Arc<dyn Transport>,
        accelerator: Arc<dyn Transport>,
    ) -> Self {
        self.preset = Mutex::new(Some(Transports { main, accelerator }));
        self
    }

    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// The route table, once startup has finished.
    pub fn routes(&self) -> Option<&RouteTable> {
        self.running.get().map(|running| &running.routes)
    }

    /// Bring both stores up. A second call fails with `AlreadyInitialized`.
    pub async fn initialize(&self, config: StoreConfig) -> Result<()> {
        let claimed = self.phase.send_if_modified(|phase| {
            if *phase == Phase::Idle {
                *phase = Phase::Initializing;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(Error::AlreadyInitialized);
        }

        match self.start(config).await {
            Ok(running) => {
                info!(
                    accelerator_routes = running.routes.len(),
                    "Dispatcher ready"
                );
                // Only this call can reach here, so the cell is empty.
                let _ = self.running.set(running);
                self.phase.send_replace(Phase::Ready);
                Ok(())
            }
            Err(e) => {
                if e.is_fatal() {
                    error!(error = %e, "Database startup failed and cannot be recovered");
                } else {
                    error!(error = %e, "Database startup failed");
                }
                self.phase.send_replace(Phase::Failed);
                Err(e)
            }
        }
    }

    async fn start(&self, config: StoreConfig) -> Result<Running> {
        DbKey::parse(&config.key)?;
        let transports = self.take_preset().unwrap_or_else(|| build_transports(&config));

        let started = try_join(
            transports.main.initialize(&config.key),
            transports.accelerator.initialize(&config.key),
        )
        .await;
        if let Err(e) = started {
            let _ = try_join(
                transports.main.close(false, CloseOptions::default()),
                transports.accelerator.close(false, CloseOptions::default()),
            )
            .await;
            return Err(e);
        }

        migrate_legacy_unprocessed(&*transports.main, &*transports.accelerator).await?;

        let methods = transports.accelerator.get_sql_methods().await?;
        let routes = RouteTable::new(methods);
        debug!(methods = ?routes.accelerator_methods(), "Accelerator routes");

        Ok(Running {
            config,
            transports,
            routes,
        })
    }

    fn take_preset(&self) -> Option<Transports> {
        self.preset.lock().ok().and_then(|mut preset| preset.take())
    }

    /// Wait out any in-flight startup, then hand back the running state.
    async fn ready(&self) -> Result<&Running> {
        let mut phase = self.phase.subscribe();
        let settled = *phase
            .wait_for(|phase| *phase != Phase::Initializing)
            .await
            .map_err(|_| Error::NotInitialized)?;
        match settled {
            Phase::Ready => self.running.get().ok_or(Error::NotInitialized),
            _ => Err(Error::NotInitialized),
        }
    }

    /// Route `method` to the worker that serves it.
    pub async fn call(&self, method: &str, args: Vec<Json>) -> Result<CallOutcome> {
        let running = self.ready().await?;
        let worker_tag = running.routes.resolve(method);
        let transport = running.transports.get(worker_tag);

        let answer = transport.sql_call(method, args).await?;
        debug!(
            method,
            worker = %worker_tag,
            seq = answer.seq_id,
            duration_ms = answer.duration_ms,
            "Call served"
        );
        Ok(CallOutcome {
            result: answer.result,
            duration_ms: answer.duration_ms,
            seq_id: answer.seq_id,
            worker_tag,
        })
    }

    /// Close both stores. With `exit` the workers stop for good.
    pub async fn close(&self, exit: bool, options: CloseOptions) -> Result<()> {
        let Some(running) = self.running.get() else {
            return Ok(());
        };
        try_join(
            running.transports.main.close(exit, options),
            running.transports.accelerator.close(exit, options),
        )
        .await?;
        info!(exit, optimize = options.optimize, vacuum = options.vacuum, "Stores closed");
        Ok(())
    }

    /// Close and erase both stores.
    pub async fn remove_db(&self) -> Result<()> {
        let running = self.ready().await?;
        try_join(
            running.transports.main.remove_db(),
            running.transports.accelerator.remove_db(),
        )
        .await?;
        info!("Stores removed");
        Ok(())
    }

    /// Re-encrypt main, then the accelerator.
    ///
    /// Not atomic across the two: if the process dies in between, main is
    /// on the new key and the accelerator still on the old one.
    pub async fn rekey(&self, new_key: &SecretString) -> Result<()> {
        DbKey::parse(new_key)?;
        let running = self.ready().await?;
        running.transports.main.rekey(new_key).await?;
        running.transports.accelerator.rekey(new_key).await?;
        info!("Stores rekeyed");
        Ok(())
    }

    /// Write a timestamped backup of both stores and the host config files.
    pub async fn backup(&self) -> Result<PathBuf> {
        self.backup_with_key(None).await
    }

    /// Like [`backup`](Self::backup), re-encrypting the copies under
    /// `new_key`. The live stores keep their key.
    pub async fn backup_with_key(&self, new_key: Option<&SecretString>) -> Result<PathBuf> {
        if let Some(key) = new_key {
            DbKey::parse(key)?;
        }
        let running = self.ready().await?;
        let config = &running.config;
        let transports = &running.transports;

        let (main_size, accelerator_size) =
            try_join(transports.main.size(), transports.accelerator.size()).await?;
        let required = main_size + accelerator_size + BACKUP_FREE_SPACE_MARGIN;
        let available = self.disk.available_bytes(&config.config_dir).await?;
        if available < required {
            warn!(required, available, "Not enough free space for backup");
            return Err(Error::DiskSpaceInsufficient {
                required,
                available,
            });
        }

        let dir = config.backups_dir().join(backup_dir_name(chrono::Utc::now()));
        let written = async {
            try_join(
                transports.main.backup(&dir.join(&config.sql_folder), new_key),
                transports
                    .accelerator
                    .backup(&dir.join(&config.accelerator_folder), new_key),
            )
            .await?;
            copy_config_files(&config.config_dir, &dir).await
        }
        .await;

        match written {
            Ok(()) => {
                info!(dir = %dir.display(), "Backup complete");
                Ok(dir)
            }
            Err(e) => {
                if let Err(cleanup) = tokio::fs::remove_dir_all(&dir).await {
                    if cleanup.kind() != std::io::ErrorKind::NotFound {
                        warn!(
                            dir = %dir.display(),
                            error = %cleanup,
                            "Could not remove partial backup"
                        );
                    }
                }
                error!(error = %e, "Backup failed");
                Err(match e {
                    Error::BackupFailed(_) => e,
                    other => Error::BackupFailed(other.to_string()),
                })
            }
        }
    }
}

impl Transports {
    fn get(&self, tag: WorkerTag) -> &Arc<dyn Transport> {
        match tag {
            WorkerTag::Main => &self.main,
            WorkerTag::Accelerator => &self.accelerator,
        }
    }
}

fn build_transports(config: &StoreConfig) -> Transports {
    let options = WorkerOptions {
        start_timeout: config.worker_start_timeout,
        chunk_limit: config.chunk_limit,
    };
    Transports {
        main: Arc::new(WorkerTransport::main(
            EngineLocation::new(config.main_dir(), config.db_file_name.clone()),
            options.clone(),
        )),
        accelerator: Arc::new(WorkerTransport::accelerator(
            EngineLocation::new(config.accelerator_dir(), config.db_file_name.clone()),
            options,
        )),
    }
}

/// Move the unprocessed queue from main into the accelerator in batches,
/// clearing main only after every counted row landed.
async fn migrate_legacy_unprocessed(
    main: &dyn Transport,
    accelerator: &dyn Transport,
) -> Result<usize> {
    let count = main
        .sql_call("getUnprocessedCount", vec![])
        .await?
        .result
        .as_u64()
        .unwrap_or(0);
    if count == 0 {
        return Ok(0);
    }
    info!(count, "Moving unprocessed queue to accelerator");

    let mut after: Option<String> = None;
    let mut moved = 0;
    loop {
        let result = main
            .sql_call(
                "getUnprocessedPage",
                vec![json!(after), json!(UNPROCESSED_MIGRATION_BATCH)],
            )
            .await?
            .result;
        let page: unprocessed::Page = serde_json::from_value(result).map_err(|e| {
            DatabaseError::Serialization(format!("getUnprocessedPage: {e}"))
        })?;
        if page.items.is_empty() {
            break;
        }
        let batch = page.items.len();

        accelerator
            .sql_call(
                "saveUnprocesseds",
                vec![Json::Array(page.items), json!({"forceSave": true})],
            )
            .await?;
        moved += batch;
        debug!(batch, moved, "Unprocessed batch moved");

        match page.last_id {
            Some(last) if after.as_deref() != Some(last.as_str()) => after = Some(last),
            _ => break,
        }
    }

    if moved as u64 != count {
        error!(count, moved, "Unprocessed queue only partly moved; main left intact");
        return Err(DatabaseError::Query(format!(
            "unprocessed migration moved {moved} of {count} rows"
        ))
        .into());
    }

    main.sql_call("removeAllUnprocessed", vec![]).await?;
    info!(moved, "Unprocessed queue moved");
    Ok(moved)
}

fn backup_dir_name(now: chrono::DateTime<chrono::Utc>) -> String {
    format!("backup-{}", now.format("%Y%m%dT%H%M%S%.3fZ"))
}

/// Copy the required config file and the optional ephemeral file.
async fn copy_config_files(config_dir: &Path, backup_dir: &Path) -> Result<()> {
    tokio::fs::create_dir_all(backup_dir)
        .await
        .map_err(|e| Error::BackupFailed(format!("{}: {e}", backup_dir.display())))?;

    let required = config_dir.join(CONFIG_FILE_NAME);
    tokio::fs::copy(&required, backup_dir.join(CONFIG_FILE_NAME))
        .await
        .map_err(|e| Error::BackupFailed(format!("{}: {e}", required.display())))?;

    let optional = config_dir.join(EPHEMERAL_FILE_NAME);
    if let Err(e) = tokio::fs::copy(&optional, backup_dir.join(EPHEMERAL_FILE_NAME)).await {
        warn!(path = %optional.display(), error = %e, "Skipping optional config file");
    }
    Ok(())
}
