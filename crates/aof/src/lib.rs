//! Append-only-file persistence
//!
//! Every successful mutating command is serialized to the AOF as a RESP
//! multi-bulk frame, preceded by a `SELECT n` frame whenever the target
//! database differs from the one the file currently has selected. Recovery
//! replays the file; compaction is in [`rewrite`].

mod rewrite;

pub use rewrite::RewriteCtx;

use bytes::Bytes;
use parking_lot::Mutex;
use resp::{CmdLine, RespError, RespParser, RespValue};
use std::fs::{File, OpenOptions};
use std::io::{BufReader, Read, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use storage::{AofPayload, Store};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// AOF persistence error
#[derive(Debug, thiserror::Error)]
pub enum AofError {
    #[error("aof io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("aof rename failed: {0}")]
    Rename(String),
}

/// The live AOF file and the database it currently has selected.
///
/// One mutex guards both: taking it pauses appends, which is exactly what
/// the rewrite boundaries need.
pub(crate) struct AofFile {
    pub(crate) file: File,
    pub(crate) current_db: usize,
}

/// Factory for the isolated scratch store the rewriter replays into.
pub type TmpStoreMaker = Box<dyn Fn() -> Arc<Store> + Send + Sync>;

/// Append-only-file handler: owns the file, the background append task and
/// the rewrite procedure.
pub struct AofHandler {
    filename: PathBuf,
    store: Arc<Store>,
    databases: usize,
    tmp_store_maker: TmpStoreMaker,
    pub(crate) file: Mutex<AofFile>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl AofHandler {
    /// Open (creating if needed) the AOF at `filename`, replay it into
    /// `store`, then start appending `store`'s mutations to it.
    ///
    /// Must be called within a tokio runtime.
    pub fn new(filename: impl Into<PathBuf>, store: Arc<Store>) -> Result<Arc<Self>, AofError> {
        let databases = store.databases();
        Self::with_tmp_store_maker(
            filename,
            store,
            Box::new(move || Arc::new(Store::new(databases))),
        )
    }

    /// As [`AofHandler::new`], with an injected scratch-store factory.
    pub fn with_tmp_store_maker(
        filename: impl Into<PathBuf>,
        store: Arc<Store>,
        tmp_store_maker: TmpStoreMaker,
    ) -> Result<Arc<Self>, AofError> {
        let filename = filename.into();
        let file = open_aof(&filename)?;
        let handler = Arc::new(Self {
            databases: store.databases(),
            filename,
            store,
            tmp_store_maker,
            file: Mutex::new(AofFile {
                file,
                current_db: 0,
            }),
            task: Mutex::new(None),
        });

        handler.load_aof(None);

        let (tx, rx) = mpsc::unbounded_channel();
        handler.store.set_aof_sink(Some(tx));
        let task = tokio::spawn(handler.clone().append_task(rx));
        *handler.task.lock() = Some(task);
        Ok(handler)
    }

    pub(crate) fn filename(&self) -> &Path {
        &self.filename
    }

    pub(crate) fn databases(&self) -> usize {
        self.databases
    }

    pub(crate) fn tmp_store(&self) -> Arc<Store> {
        (self.tmp_store_maker)()
    }

    /// Replay the file into the handler's store, up to `max_bytes` when
    /// given. Used at startup and (with a byte limit) by the rewriter.
    pub fn load_aof(&self, max_bytes: Option<u64>) {
        let final_db = replay_file(&self.filename, &self.store, max_bytes);
        // keep the append path's SELECT bookkeeping in line with the file
        self.file.lock().current_db = final_db;
    }

    async fn append_task(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<AofPayload>) {
        while let Some(payload) = rx.recv().await {
            self.append(payload);
        }
        info!("aof append task stopped");
    }

    /// Write one command frame, preceded by SELECT when the target database
    /// changed. Holding the file mutex for the whole write keeps every frame
    /// self-delimiting on disk.
    fn append(&self, payload: AofPayload) {
        let mut file = self.file.lock();
        if payload.db_index != file.current_db {
            let select = select_frame(payload.db_index);
            if let Err(e) = file.file.write_all(&select) {
                error!("aof select write failed: {}", e);
                return;
            }
            file.current_db = payload.db_index;
        }
        let frame = resp::encode_to_vec(&RespValue::from_cmd_line(payload.cmd_line));
        if let Err(e) = file.file.write_all(&frame) {
            error!("aof append failed: {}", e);
        }
    }

    /// Detach from the store, drain pending appends and fsync.
    pub async fn close(&self) {
        self.store.set_aof_sink(None);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
        let file = self.file.lock();
        if let Err(e) = file.file.sync_all() {
            warn!("aof fsync on close failed: {}", e);
        }
    }
}

/// Open the live AOF append/create/read-write, mode 0600.
pub(crate) fn open_aof(path: &Path) -> Result<File, AofError> {
    Ok(OpenOptions::new()
        .append(true)
        .create(true)
        .read(true)
        .mode(0o600)
        .open(path)?)
}

pub(crate) fn select_frame(db_index: usize) -> Vec<u8> {
    let cmd = resp::to_cmd_line([
        Bytes::from_static(b"SELECT"),
        Bytes::from(db_index.to_string()),
    ]);
    resp::encode_to_vec(&RespValue::from_cmd_line(cmd))
}

/// Replay `path` into `store`, stopping at `max_bytes` when given, at the
/// first incomplete frame (a crash can truncate the tail), or at the first
/// malformed frame. Returns the database index the replay ended selected on.
pub(crate) fn replay_file(path: &Path, store: &Store, max_bytes: Option<u64>) -> usize {
    let mut current_db = 0usize;
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return current_db,
        Err(e) => {
            warn!("aof open for replay failed: {}", e);
            return current_db;
        }
    };
    let limited = file.take(max_bytes.unwrap_or(u64::MAX));
    let mut parser = RespParser::new(BufReader::new(limited));
    loop {
        let value = match parser.parse() {
            Ok(v) => v,
            Err(RespError::UnexpectedEof) => break,
            Err(e) => {
                warn!("aof replay stopped on malformed frame: {}", e);
                break;
            }
        };
        let Some(cmd_line) = value.as_cmd_line() else {
            warn!("aof replay skipped non-command frame");
            continue;
        };
        if cmd_line.is_empty() {
            continue;
        }
        if let Some(db_index) = parse_select(&cmd_line) {
            if db_index < store.databases() {
                current_db = db_index;
            } else {
                warn!("aof replay skipped SELECT {}: out of range", db_index);
            }
            continue;
        }
        let reply = store.exec_for_replay(current_db, &cmd_line);
        if reply.is_error() {
            warn!(
                "aof replay command failed: {:?}",
                String::from_utf8_lossy(&cmd_line[0])
            );
        }
    }
    current_db
}

fn parse_select(cmd_line: &CmdLine) -> Option<usize> {
    if cmd_line.len() != 2 || !cmd_line[0].eq_ignore_ascii_case(b"SELECT") {
        return None;
    }
    std::str::from_utf8(&cmd_line[1]).ok()?.parse().ok()
}
