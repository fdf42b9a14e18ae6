//! RESP protocol server
//!
//! Accepts client and peer connections and feeds parsed command lines into
//! the cluster router. Each connection carries its own [`Session`].

use anyhow::Result;
use cluster::{Cluster, Session};
use resp::{AsyncRespEncoder, AsyncRespParser, RespError, RespValue};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::split;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

/// RESP protocol server
pub struct RespServer {
    cluster: Arc<Cluster>,
    addr: SocketAddr,
}

impl RespServer {
    pub fn new(cluster: Arc<Cluster>, addr: SocketAddr) -> Self {
        Self { cluster, addr }
    }

    /// Bind and serve until the process exits.
    pub async fn start(&self) -> Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!("resp server listening on {}", self.addr);
        self.serve(listener).await
    }

    /// Serve on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        loop {
            match listener.accept().await {
                Ok((stream, peer)) => {
                    debug!("new connection from {}", peer);
                    let cluster = self.cluster.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle_client(stream, cluster).await {
                            warn!("connection {} closed with error: {}", peer, e);
                        }
                    });
                }
                Err(e) => {
                    error!("accept failed: {}", e);
                }
            }
        }
    }
}

async fn handle_client(stream: TcpStream, cluster: Arc<Cluster>) -> Result<()> {
    let (reader, writer) = split(stream);
    let mut parser = AsyncRespParser::new(reader);
    let mut encoder = AsyncRespEncoder::new(writer);
    let mut session = Session::default();

    loop {
        let value = match parser.parse().await {
            Ok(value) => value,
            Err(RespError::UnexpectedEof) => return Ok(()), // peer went away
            Err(e) => {
                let reply = RespValue::error(format!("ERR protocol error: {}", e));
                encoder.encode(&reply).await?;
                return Ok(());
            }
        };

        let reply = match value.as_cmd_line() {
            Some(cmd_line) if cmd_line.is_empty() => RespValue::error("ERR empty command"),
            Some(cmd_line) => cluster.exec(&mut session, cmd_line).await,
            None => RespValue::error("ERR expected a multi-bulk command"),
        };
        encoder.encode(&reply).await?;
    }
}
