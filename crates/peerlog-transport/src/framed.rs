//! Duplex channel over any tokio byte stream.
//!
//! Each message is written as a 4-byte big-endian length followed by the
//! payload. Frames above the configured maximum are refused on both sides.

use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::{DuplexChannel, Listeners, Subscription, TransportConfig, TransportError};

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    data: &[u8],
) -> Result<(), TransportError> {
    let len = u32::try_from(data.len()).map_err(|_| TransportError::MessageTooLarge {
        size: data.len(),
        max: u32::MAX as usize,
    })?;
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(data).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame, refusing anything above `max_size`.
pub async fn read_frame<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_size: usize,
) -> Result<Bytes, TransportError> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;

    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max_size {
        return Err(TransportError::MessageTooLarge {
            size: len,
            max: max_size,
        });
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// A [`DuplexChannel`] backed by a byte stream (TCP socket, pipe, ...).
///
/// Owns a reader task and a writer task; both stop when the channel is
/// closed or dropped, or when the stream fails.
pub struct FramedChannel {
    outbound: mpsc::UnboundedSender<Bytes>,
    inbox: Listeners,
    max_message_size: usize,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
}

impl FramedChannel {
    /// Split `stream` and start pumping frames. Must be called inside a
    /// tokio runtime.
    pub fn spawn<S>(stream: S, config: &TransportConfig) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut read_half, mut write_half) = tokio::io::split(stream);
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Bytes>();
        let inbox = Listeners::new();
        let max_message_size = config.max_message_size;

        let reader = tokio::spawn({
            let inbox = inbox.clone();
            async move {
                loop {
                    match read_frame(&mut read_half, max_message_size).await {
                        Ok(frame) => {
                            inbox.dispatch(frame);
                        }
                        Err(e) => {
                            tracing::debug!("framed channel read ended: {e}");
                            break;
                        }
                    }
                }
                inbox.close();
            }
        });

        let writer = tokio::spawn({
            let inbox = inbox.clone();
            async move {
                while let Some(frame) = outbound_rx.recv().await {
                    if let Err(e) = write_frame(&mut write_half, &frame).await {
                        tracing::warn!("framed channel write failed: {e}");
                        inbox.close();
                        break;
                    }
                }
                let _ = write_half.shutdown().await;
            }
        });

        Self {
            outbound,
            inbox,
            max_message_size,
            reader,
            writer,
        }
    }

    /// Stop both pumps and end every subscription.
    pub fn close(&self) {
        self.reader.abort();
        self.writer.abort();
        self.inbox.close();
    }

    pub fn is_closed(&self) -> bool {
        self.inbox.is_closed()
    }
}

impl DuplexChannel for FramedChannel {
    fn send(&self, data: Bytes) -> Result<(), TransportError> {
        if data.len() > self.max_message_size {
            return Err(TransportError::MessageTooLarge {
                size: data.len(),
                max: self.max_message_size,
            });
        }
        if self.inbox.is_closed() {
            return Err(TransportError::Closed);
        }
        self.outbound.send(data).map_err(|_| TransportError::Closed)
    }

    fn listen(&self) -> Subscription {
        self.inbox.subscribe()
    }
}

impl Drop for FramedChannel {
    fn drop(&mut self) {
        self.reader.abort();
        self.writer.abort();
    }
}
