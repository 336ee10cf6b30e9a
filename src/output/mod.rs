//! Newline-delimited JSON output of the unified datapoint stream.

use anyhow::{Context, Result};
use tokio::io::{AsyncWrite, AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::datapoint::DataPoint;

/// Writes one JSON object per line.
pub struct JsonLines<W: AsyncWrite + Unpin> {
    writer: BufWriter<W>,
    buf: Vec<u8>,
}

impl<W: AsyncWrite + Unpin> JsonLines<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: BufWriter::new(writer),
            buf: Vec::with_capacity(256),
        }
    }

    pub async fn write(&mut self, dp: &DataPoint) -> Result<()> {
        self.buf.clear();
        serde_json::to_writer(&mut self.buf, dp).context("encoding datapoint")?;
        self.buf.push(b'\n');
        self.writer
            .write_all(&self.buf)
            .await
            .context("writing datapoint")
    }

    pub async fn flush(&mut self) -> Result<()> {
        self.writer.flush().await.context("flushing output")
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

/// Consumes the dispatcher stream until it closes or `cancel` fires.
///
/// Points already queued are written in arrival order; the writer is flushed
/// whenever the queue runs dry. Returns the number of points written.
pub async fn drain<W: AsyncWrite + Unpin>(
    rx: &mut mpsc::Receiver<DataPoint>,
    out: &mut JsonLines<W>,
    cancel: &CancellationToken,
) -> Result<u64> {
    let mut written = 0u64;

    loop {
        let dp = tokio::select! {
            _ = cancel.cancelled() => break,
            dp = rx.recv() => match dp {
                Some(dp) => dp,
                None => break,
            },
        };

        out.write(&dp).await?;
        written += 1;

        while let Ok(dp) = rx.try_recv() {
            out.write(&dp).await?;
            written += 1;
        }

        out.flush().await?;
    }

    out.flush().await?;
    debug!(written, "output drained");

    Ok(written)
}
