// ABOUTME: Splits combined exec output into separate stdout and stderr channels
// ABOUTME: Frames arrive already decoded by the runtime client; this only routes them

use super::{OutputChunk, ProviderError, Result, StreamType};
use bytes::Bytes;
use futures::stream::{BoxStream, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Two output channels fed by a background pump over the combined stream
pub struct Demuxed {
    pub stdout: mpsc::UnboundedReceiver<Bytes>,
    pub stderr: mpsc::UnboundedReceiver<Bytes>,
    pump: JoinHandle<Result<()>>,
}

impl Demuxed {
    /// Tear down the combined stream and both channels
    pub fn destroy(&mut self) {
        self.pump.abort();
        self.stdout.close();
        self.stderr.close();
    }

    /// Wait for the pump to finish and surface any stream error.
    ///
    /// A pump cancelled through `destroy` finishes cleanly.
    pub async fn finish(&mut self) -> Result<()> {
        match (&mut self.pump).await {
            Ok(result) => result,
            Err(e) if e.is_cancelled() => Ok(()),
            Err(e) => Err(ProviderError::InternalError(format!(
                "output pump panicked: {}",
                e
            ))),
        }
    }

    /// Destroy, then wait until the combined stream itself has been dropped
    pub async fn shutdown(&mut self) {
        self.destroy();
        if let Err(e) = self.finish().await {
            debug!("Output stream failed before shutdown: {}", e);
        }
    }
}

impl Drop for Demuxed {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

/// Split a combined chunk stream into stdout and stderr channels.
///
/// Chunk order is preserved within each channel. Both channels close when the
/// combined stream ends or fails.
pub fn demux(mut output: BoxStream<'static, Result<OutputChunk>>) -> Demuxed {
    let (stdout_tx, stdout) = mpsc::unbounded_channel();
    let (stderr_tx, stderr) = mpsc::unbounded_channel();

    let pump = tokio::spawn(async move {
        while let Some(item) = output.next().await {
            let chunk = match item {
                Ok(chunk) => chunk,
                Err(e) => {
                    warn!("Exec output stream failed: {}", e);
                    return Err(e);
                }
            };
            let tx = match chunk.stream {
                StreamType::Stdout => &stdout_tx,
                StreamType::Stderr => &stderr_tx,
            };
            if tx.send(chunk.data).is_err() {
                debug!("Output receiver closed, stopping demux pump");
                return Ok(());
            }
        }
        Ok(())
    });

    Demuxed {
        stdout,
        stderr,
        pump,
    }
}
