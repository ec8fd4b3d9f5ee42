use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{PipeError, ReadDeadline, Relay};
use crate::pool::RELAY_BUFFER_SIZE;

impl Relay {
    /// Copies bytes between `origin` and `remote` in both directions until
    /// both have ended.
    ///
    /// When one direction ends, by EOF or by error, the read side of the
    /// other direction gets a deadline of `tcp_wait_timeout` from now. A peer
    /// that keeps a half-closed connection open is thus cut off after the
    /// wait window. With `idle_timeout` set, a relay on which nothing has
    /// moved for that long is cut in both directions.
    pub async fn pipe<A, B>(&self, origin: A, remote: B) -> Result<(), PipeError>
    where
        A: AsyncRead + AsyncWrite + Send,
        B: AsyncRead + AsyncWrite + Send,
    {
        let (mut origin_r, mut origin_w) = tokio::io::split(origin);
        let (mut remote_r, mut remote_w) = tokio::io::split(remote);

        let origin_deadline = ReadDeadline::new();
        let remote_deadline = ReadDeadline::new();
        let idle = ReadDeadline::new();
        let wait = self.config.tcp_wait_timeout;

        let uplink = async {
            let res = self
                .copy_buffer(&mut origin_r, &mut remote_w, &origin_deadline, &idle)
                .await;
            remote_deadline.set_after(wait);
            res
        };

        let downlink = async {
            let res = self
                .copy_buffer(&mut remote_r, &mut origin_w, &remote_deadline, &idle)
                .await;
            origin_deadline.set_after(wait);
            res
        };

        let (up, down) = tokio::join!(uplink, downlink);
        if let (Ok(sent), Ok(received)) = (&up, &down) {
            tracing::trace!(sent, received, "pipe finished");
        }
        PipeError::join(up, down)
    }

    /// One direction of [`Relay::pipe`]. Returns the number of bytes copied.
    async fn copy_buffer<R, W>(
        &self,
        src: &mut R,
        dst: &mut W,
        deadline: &ReadDeadline,
        idle: &ReadDeadline,
    ) -> io::Result<u64>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = self.pool.get(RELAY_BUFFER_SIZE);
        let mut copied = 0u64;

        loop {
            let n = deadline.guard(idle.guard(src.read(&mut buf[..]))).await?;
            if n == 0 {
                break;
            }
            dst.write_all(&buf[..n]).await?;
            copied += n as u64;
            if let Some(idle_timeout) = self.config.idle_timeout {
                idle.set_after(idle_timeout);
            }
        }

        // propagate the half-close
        if let Err(e) = dst.shutdown().await {
            tracing::trace!(error = %e, "shutdown after eof");
        }
        Ok(copied)
    }
}
