//! RESP protocol async encoder

use crate::{encode_to_vec, RespValue};
use std::io;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// RESP protocol async encoder
pub struct AsyncRespEncoder<W: AsyncWrite + Unpin> {
    writer: W,
}

impl<W: AsyncWrite + Unpin> AsyncRespEncoder<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Encode a RESP value and flush it to the peer.
    pub async fn encode(&mut self, value: &RespValue) -> io::Result<()> {
        let bytes = encode_to_vec(value);
        self.writer.write_all(&bytes).await?;
        self.writer.flush().await
    }
}
