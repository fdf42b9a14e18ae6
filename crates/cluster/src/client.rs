//! Peer connection pool
//!
//! One lazily-connected RESP client per peer node. A request holds the
//! connection for its full round trip, so replies cannot interleave. A
//! `SELECT` is sent ahead of the command whenever the connection's selected
//! database differs from the session's.

use resp::{AsyncRespEncoder, AsyncRespParser, CmdLine, RespValue};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

struct PeerConn {
    parser: AsyncRespParser<OwnedReadHalf>,
    encoder: AsyncRespEncoder<OwnedWriteHalf>,
    selected_db: usize,
}

/// One peer node's client.
struct PeerClient {
    addr: String,
    conn: Mutex<Option<PeerConn>>,
}

impl PeerClient {
    fn new(addr: String) -> Self {
        Self {
            addr,
            conn: Mutex::new(None),
        }
    }

    async fn connect(&self) -> std::io::Result<PeerConn> {
        let stream = TcpStream::connect(&self.addr).await?;
        let (read, write) = stream.into_split();
        debug!("connected to peer {}", self.addr);
        Ok(PeerConn {
            parser: AsyncRespParser::new(read),
            encoder: AsyncRespEncoder::new(write),
            selected_db: 0,
        })
    }

    async fn request(&self, db_index: usize, cmd_line: CmdLine) -> RespValue {
        let mut slot = self.conn.lock().await;
        if slot.is_none() {
            match self.connect().await {
                Ok(conn) => *slot = Some(conn),
                Err(e) => {
                    warn!("connect to peer {} failed: {}", self.addr, e);
                    return RespValue::error(format!("ERR peer {} unreachable: {}", self.addr, e));
                }
            }
        }
        let Some(conn) = slot.as_mut() else {
            return RespValue::error("ERR peer connection unavailable");
        };

        match Self::round_trip(conn, db_index, cmd_line).await {
            Ok(reply) => reply,
            Err(e) => {
                // drop the broken connection; the next request reconnects
                *slot = None;
                warn!("request to peer {} failed: {}", self.addr, e);
                RespValue::error(format!("ERR peer {} request failed: {}", self.addr, e))
            }
        }
    }

    async fn round_trip(
        conn: &mut PeerConn,
        db_index: usize,
        cmd_line: CmdLine,
    ) -> Result<RespValue, resp::RespError> {
        if conn.selected_db != db_index {
            let select = resp::to_cmd_line([
                bytes::Bytes::from_static(b"SELECT"),
                bytes::Bytes::from(db_index.to_string()),
            ]);
            conn.encoder
                .encode(&RespValue::from_cmd_line(select))
                .await?;
            let reply = conn.parser.parse().await?;
            if reply.is_error() {
                return Ok(reply);
            }
            conn.selected_db = db_index;
        }
        conn.encoder
            .encode(&RespValue::from_cmd_line(cmd_line))
            .await?;
        conn.parser.parse().await
    }
}

/// Lazily-populated pool of peer clients.
#[derive(Default)]
pub(crate) struct ClientPool {
    clients: Mutex<HashMap<String, Arc<PeerClient>>>,
}

impl ClientPool {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Send one command to `addr` and await its reply. Failures come back as
    /// RESP error replies, never as panics.
    pub(crate) async fn request(&self, addr: &str, db_index: usize, cmd_line: CmdLine) -> RespValue {
        let client = {
            let mut clients = self.clients.lock().await;
            clients
                .entry(addr.to_string())
                .or_insert_with(|| Arc::new(PeerClient::new(addr.to_string())))
                .clone()
        };
        client.request(db_index, cmd_line).await
    }

    /// Drop every pooled connection.
    pub(crate) async fn close(&self) {
        self.clients.lock().await.clear();
    }
}
