//! AOF compaction
//!
//! Replaces the log with a minimal equivalent dumped from current state.
//! Only the boundaries (start, finish) pause appends; the dump itself runs
//! against an isolated scratch store replayed from a frozen prefix of the
//! live file, so writers proceed freely while it runs.

use crate::{open_aof, replay_file, select_frame, AofError, AofHandler};
use resp::RespValue;
use std::fs::File;
use std::io::{self, Seek, SeekFrom, Write};
use storage::{entity_to_cmd, expire_cmd};
use tempfile::NamedTempFile;
use tracing::{info, warn};

/// Context of one in-flight rewrite, created by
/// [`AofHandler::start_rewrite`] and consumed by
/// [`AofHandler::finish_rewrite`].
pub struct RewriteCtx {
    tmp_file: NamedTempFile,
    /// Live AOF length at rewrite start. Every byte up to here is a whole
    /// frame; every frame after belongs to the tail to be spliced.
    file_size: u64,
    /// Database the live file had selected at rewrite start.
    db_idx: usize,
}

impl AofHandler {
    /// Compact the AOF. Any error before the final rename leaves the live
    /// file untouched; the scratch file is discarded on drop.
    pub fn rewrite(&self) -> Result<(), AofError> {
        let mut ctx = self.start_rewrite()?;
        if let Err(e) = self.do_rewrite(&mut ctx) {
            warn!("aof rewrite aborted: {}", e);
            return Err(e);
        }
        self.finish_rewrite(ctx)?;
        info!("aof rewrite finished");
        Ok(())
    }

    /// Phase 1: briefly pause appends to freeze a prefix of the live file.
    pub fn start_rewrite(&self) -> Result<RewriteCtx, AofError> {
        let file = self.file.lock();

        // land buffered frames so the frozen prefix is complete on disk
        if let Err(e) = file.file.sync_all() {
            warn!("aof fsync failed: {}", e);
            return Err(e.into());
        }
        let file_size = file.file.metadata()?.len();

        let tmp_file = match tempfile::Builder::new().suffix(".aof").tempfile() {
            Ok(f) => f,
            Err(e) => {
                warn!("aof rewrite tmp file create failed: {}", e);
                return Err(e.into());
            }
        };
        Ok(RewriteCtx {
            tmp_file,
            file_size,
            db_idx: file.current_db,
        })
    }

    /// Phase 2 (no lock held): dump a scratch store replayed from the frozen
    /// prefix into the scratch file, one canonical command per key.
    pub fn do_rewrite(&self, ctx: &mut RewriteCtx) -> Result<(), AofError> {
        let tmp_store = self.tmp_store();
        replay_file(self.filename(), &tmp_store, Some(ctx.file_size));

        let out = ctx.tmp_file.as_file_mut();
        for db_index in 0..self.databases() {
            out.write_all(&select_frame(db_index))?;
            let mut write_err: Option<io::Error> = None;
            tmp_store.for_each(db_index, |key, entity, expire_at| {
                if let Some(cmd) = entity_to_cmd(key, entity) {
                    let frame = resp::encode_to_vec(&RespValue::from_cmd_line(cmd));
                    if let Err(e) = out.write_all(&frame) {
                        write_err = Some(e);
                        return false;
                    }
                }
                if let Some(at) = expire_at {
                    let frame =
                        resp::encode_to_vec(&RespValue::from_cmd_line(expire_cmd(key, at)));
                    if let Err(e) = out.write_all(&frame) {
                        write_err = Some(e);
                        return false;
                    }
                }
                true
            });
            if let Some(e) = write_err {
                return Err(e.into());
            }
        }
        Ok(())
    }

    /// Phase 3: pause appends, splice the tail written since
    /// [`AofHandler::start_rewrite`] onto the scratch file, and swap it in.
    ///
    /// # Panics
    /// Panics when the live AOF cannot be reopened after the rename; the
    /// durability invariant cannot be restored in that state.
    pub fn finish_rewrite(&self, mut ctx: RewriteCtx) -> Result<(), AofError> {
        let mut live = self.file.lock();

        let mut src = File::open(self.filename())?;
        src.seek(SeekFrom::Start(ctx.file_size))?;

        // align the scratch file to the database the tail was written under
        let out = ctx.tmp_file.as_file_mut();
        out.write_all(&select_frame(ctx.db_idx))?;
        io::copy(&mut src, out)?;
        drop(src);

        ctx.tmp_file
            .persist(self.filename())
            .map_err(|e| AofError::Rename(e.to_string()))?;

        // the renamed file is the database's only durable copy now
        let reopened = match open_aof(self.filename()) {
            Ok(f) => f,
            Err(e) => panic!("reopen aof after rewrite failed: {}", e),
        };
        live.file = reopened;

        // re-establish the invariant: the file's selected db matches the
        // append path's bookkeeping
        let select = select_frame(live.current_db);
        if let Err(e) = live.file.write_all(&select) {
            panic!("aof select after rewrite failed: {}", e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use resp::to_cmd_line;
    use std::sync::Arc;
    use std::time::Duration;
    use storage::Store;
    use tempfile::TempDir;

    async fn drain() {
        tokio::time::sleep(Duration::from_millis(100)).await;
    }

    #[tokio::test]
    async fn rewrite_is_equivalent_and_smaller() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("appendonly.aof");

        let store = Arc::new(Store::new(4));
        let handler = AofHandler::new(&path, store.clone()).unwrap();

        // churn: repeated overwrites leave redundant frames behind
        for i in 0..50 {
            store.exec(0, &to_cmd_line(["SET".to_string(), "hot".to_string(), format!("v{}", i)]));
        }
        store.exec(1, &to_cmd_line(["SET", "other", "x"]));
        store.exec(0, &to_cmd_line(["EXPIRE", "hot", "500"]));
        drain().await;

        let before = std::fs::metadata(&path).unwrap().len();
        handler.rewrite().unwrap();
        let after = std::fs::metadata(&path).unwrap().len();
        assert!(after < before, "rewrite must shrink a churned log");
        handler.close().await;

        let restored = Arc::new(Store::new(4));
        let handler2 = AofHandler::new(&path, restored.clone()).unwrap();
        assert_eq!(
            restored.exec(0, &to_cmd_line(["GET", "hot"])),
            RespValue::BulkString(Bytes::from("v49"))
        );
        assert_eq!(
            restored.exec(1, &to_cmd_line(["GET", "other"])),
            RespValue::BulkString(Bytes::from("x"))
        );
        match restored.exec(0, &to_cmd_line(["TTL", "hot"])) {
            RespValue::Integer(ttl) => assert!(ttl > 490 && ttl <= 500, "ttl {}", ttl),
            other => panic!("unexpected ttl reply: {:?}", other),
        }
        handler2.close().await;
    }

    #[tokio::test]
    async fn commands_during_rewrite_survive_the_splice() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("appendonly.aof");

        let store = Arc::new(Store::new(2));
        let handler = AofHandler::new(&path, store.clone()).unwrap();
        for i in 0..100 {
            store.exec(0, &to_cmd_line(["SET".to_string(), format!("k{}", i), "v".to_string()]));
        }
        drain().await;

        let mut ctx = handler.start_rewrite().unwrap();

        // a writer lands while the dump is running
        store.exec(0, &to_cmd_line(["SET", "x", "y"]));
        drain().await;

        handler.do_rewrite(&mut ctx).unwrap();
        handler.finish_rewrite(ctx).unwrap();
        handler.close().await;

        let restored = Arc::new(Store::new(2));
        let handler2 = AofHandler::new(&path, restored.clone()).unwrap();
        assert_eq!(
            restored.exec(0, &to_cmd_line(["GET", "x"])),
            RespValue::BulkString(Bytes::from("y")),
            "tail write must survive the splice"
        );
        for i in (0..100).step_by(25) {
            assert_eq!(
                restored.exec(0, &to_cmd_line(["GET".to_string(), format!("k{}", i)])),
                RespValue::BulkString(Bytes::from("v"))
            );
        }
        handler2.close().await;
    }

    #[tokio::test]
    async fn appends_after_rewrite_land_in_the_right_db() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("appendonly.aof");

        let store = Arc::new(Store::new(4));
        let handler = AofHandler::new(&path, store.clone()).unwrap();
        store.exec(3, &to_cmd_line(["SET", "pre", "1"]));
        drain().await;

        handler.rewrite().unwrap();

        store.exec(3, &to_cmd_line(["SET", "post", "2"]));
        drain().await;
        handler.close().await;

        let restored = Arc::new(Store::new(4));
        let handler2 = AofHandler::new(&path, restored.clone()).unwrap();
        assert_eq!(
            restored.exec(3, &to_cmd_line(["GET", "post"])),
            RespValue::BulkString(Bytes::from("2"))
        );
        assert_eq!(restored.exec(0, &to_cmd_line(["GET", "post"])), RespValue::Null);
        handler2.close().await;
    }
}
