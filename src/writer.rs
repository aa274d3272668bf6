//! Dedicated writer task for outbound frames.
//!
//! Each channel runs one writer task fed by an unbounded mpsc queue.
//! Senders never block, which lets response callbacks and handlers emit
//! frames from synchronous code; the task batches whatever is ready and
//! writes it with vectored I/O.
//!
//! ```text
//! client ──┐
//! request ─┼─► mpsc::UnboundedSender<OutboundFrame> ─► writer task ─► pipe
//! handler ─┘
//! ```
//!
//! Every frame may carry a completion hook invoked exactly once with the
//! write outcome. A failed write cancels the channel, fails the current
//! batch, and drains the queue failing everything still pending.

use std::io::IoSlice;

use bytes::Bytes;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::Result;

/// Maximum frames folded into a single vectored write.
const MAX_BATCH_SIZE: usize = 64;

/// Hook invoked exactly once when the frame's write completes or fails.
pub type WriteCompletion = Box<dyn FnOnce(std::io::Result<()>) + Send + Sync + 'static>;

/// An encoded frame queued for the writer task.
pub struct OutboundFrame {
    /// Length prefix, type code, and fixed header fields.
    pub header: Bytes,
    /// Body region, appended without copying. May be empty.
    pub body: Bytes,
    /// Optional write-outcome hook.
    pub completion: Option<WriteCompletion>,
}

impl OutboundFrame {
    pub fn new(header: Bytes, body: Bytes, completion: Option<WriteCompletion>) -> Self {
        Self {
            header,
            body,
            completion,
        }
    }

    /// Total size on the wire.
    pub fn size(&self) -> usize {
        self.header.len() + self.body.len()
    }

    pub(crate) fn complete(self, result: std::io::Result<()>) {
        if let Some(hook) = self.completion {
            hook(result);
        }
    }

    pub(crate) fn fail(self, message: &str) {
        self.complete(Err(std::io::Error::new(
            std::io::ErrorKind::BrokenPipe,
            message.to_owned(),
        )));
    }
}

impl std::fmt::Debug for OutboundFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutboundFrame")
            .field("header_len", &self.header.len())
            .field("body_len", &self.body.len())
            .field("has_completion", &self.completion.is_some())
            .finish()
    }
}

/// Spawn the writer task for one channel.
///
/// The task runs until the sender side is dropped, the cancellation token
/// fires, or a write fails (which also cancels the token). Queued frames
/// that never reach the wire have their completions failed.
pub fn spawn_writer_task<W>(
    writer: W,
    cancel: CancellationToken,
) -> (mpsc::UnboundedSender<OutboundFrame>, JoinHandle<Result<()>>)
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(writer_loop(rx, writer, cancel));
    (tx, task)
}

async fn writer_loop<W>(
    mut rx: mpsc::UnboundedReceiver<OutboundFrame>,
    mut writer: W,
    cancel: CancellationToken,
) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let first = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                drain_and_fail(&mut rx, "channel closed");
                return Ok(());
            }
            frame = rx.recv() => match frame {
                Some(frame) => frame,
                None => return Ok(()),
            },
        };

        let mut batch = Vec::with_capacity(MAX_BATCH_SIZE);
        batch.push(first);
        while batch.len() < MAX_BATCH_SIZE {
            match rx.try_recv() {
                Ok(frame) => batch.push(frame),
                Err(_) => break,
            }
        }

        match write_batch(&mut writer, &batch).await {
            Ok(()) => {
                for frame in batch {
                    frame.complete(Ok(()));
                }
            }
            Err(e) => {
                tracing::error!("write failed, tearing down channel: {e}");
                cancel.cancel();
                let message = e.to_string();
                for frame in batch {
                    frame.fail(&message);
                }
                drain_and_fail(&mut rx, &message);
                return Err(e.into());
            }
        }
    }
}

/// Stop accepting frames and fail everything still queued.
fn drain_and_fail(rx: &mut mpsc::UnboundedReceiver<OutboundFrame>, message: &str) {
    rx.close();
    while let Ok(frame) = rx.try_recv() {
        frame.fail(message);
    }
}

/// Write a batch of frames with scatter/gather I/O.
///
/// The fast path is a single `write_vectored` covering every header and
/// body slice; on a partial write the remaining slices are rebuilt and
/// retried until the batch is fully on the wire.
async fn write_batch<W>(writer: &mut W, batch: &[OutboundFrame]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    if batch.is_empty() {
        return Ok(());
    }

    let mut slices: Vec<IoSlice<'_>> = Vec::with_capacity(batch.len() * 2);
    for frame in batch {
        slices.push(IoSlice::new(&frame.header));
        if !frame.body.is_empty() {
            slices.push(IoSlice::new(&frame.body));
        }
    }

    let total_size: usize = batch.iter().map(|f| f.size()).sum();
    let mut total_written = writer.write_vectored(&slices).await?;

    if total_written == 0 {
        return Err(std::io::Error::new(
            std::io::ErrorKind::WriteZero,
            "write_vectored returned 0",
        ));
    }

    while total_written < total_size {
        let remaining = build_remaining_slices(batch, total_written);
        if remaining.is_empty() {
            break;
        }
        let written = writer.write_vectored(&remaining).await?;
        if written == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "write_vectored returned 0",
            ));
        }
        total_written += written;
    }

    writer.flush().await
}

/// Rebuild the slice list after a partial write of `skip_bytes`.
fn build_remaining_slices(batch: &[OutboundFrame], skip_bytes: usize) -> Vec<IoSlice<'_>> {
    let mut slices = Vec::with_capacity(batch.len() * 2);
    let mut skipped = 0;

    for frame in batch {
        for region in [&frame.header, &frame.body] {
            if region.is_empty() {
                continue;
            }
            let start = skipped;
            let end = skipped + region.len();
            if skip_bytes < end {
                let offset = skip_bytes.saturating_sub(start);
                slices.push(IoSlice::new(&region[offset..]));
            }
            skipped = end;
        }
    }

    slices
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::duplex;

    fn frame(header: &'static [u8], body: &'static [u8]) -> OutboundFrame {
        OutboundFrame::new(
            Bytes::from_static(header),
            Bytes::from_static(body),
            None,
        )
    }

    #[test]
    fn test_frame_size() {
        let f = frame(b"12345678", b"body");
        assert_eq!(f.size(), 12);
    }

    #[tokio::test]
    async fn test_writer_sends_frames() {
        let (client, mut server) = duplex(4096);
        let cancel = CancellationToken::new();
        let (tx, _task) = spawn_writer_task(client, cancel);

        tx.send(frame(b"AAAA", b"hello")).unwrap();

        let mut buf = vec![0u8; 64];
        let n = tokio::io::AsyncReadExt::read(&mut server, &mut buf)
            .await
            .unwrap();
        assert_eq!(&buf[..n], b"AAAAhello");
    }

    #[tokio::test]
    async fn test_completion_on_success() {
        let (client, mut server) = duplex(4096);
        let cancel = CancellationToken::new();
        let (tx, _task) = spawn_writer_task(client, cancel);

        let (done_tx, done_rx) = tokio::sync::oneshot::channel();
        let mut done_tx = Some(done_tx);
        tx.send(OutboundFrame::new(
            Bytes::from_static(b"head"),
            Bytes::new(),
            Some(Box::new(move |result| {
                let _ = done_tx.take().unwrap().send(result.is_ok());
            })),
        ))
        .unwrap();

        assert!(done_rx.await.unwrap());
        let mut buf = [0u8; 4];
        tokio::io::AsyncReadExt::read_exact(&mut server, &mut buf)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_completion_on_write_failure() {
        // Dropping the read half makes subsequent writes fail.
        let (client, server) = duplex(16);
        drop(server);

        let cancel = CancellationToken::new();
        let (tx, task) = spawn_writer_task(client, cancel.clone());

        let failures = Arc::new(AtomicUsize::new(0));
        for _ in 0..3 {
            let failures = failures.clone();
            tx.send(OutboundFrame::new(
                Bytes::from_static(b"xxxxxxxx"),
                Bytes::new(),
                Some(Box::new(move |result| {
                    if result.is_err() {
                        failures.fetch_add(1, Ordering::SeqCst);
                    }
                })),
            ))
            .unwrap();
        }

        let result = task.await.unwrap();
        assert!(result.is_err());
        assert!(cancel.is_cancelled());
        assert_eq!(failures.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_cancel_fails_pending_completions() {
        let (client, _server) = duplex(4096);
        let cancel = CancellationToken::new();
        let (tx, task) = spawn_writer_task(client, cancel.clone());

        // Let the writer park on recv, then cancel.
        tokio::time::sleep(Duration::from_millis(10)).await;
        cancel.cancel();
        task.await.unwrap().unwrap();

        let failed = Arc::new(AtomicUsize::new(0));
        let failed2 = failed.clone();
        let send_result = tx.send(OutboundFrame::new(
            Bytes::from_static(b"late"),
            Bytes::new(),
            Some(Box::new(move |result| {
                if result.is_err() {
                    failed2.fetch_add(1, Ordering::SeqCst);
                }
            })),
        ));
        // The queue is closed; the frame comes back with its completion.
        if let Err(e) = send_result {
            e.0.fail("channel closed");
        }
        assert_eq!(failed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_writer_shutdown_on_sender_drop() {
        let (client, _server) = duplex(4096);
        let cancel = CancellationToken::new();
        let (tx, task) = spawn_writer_task(client, cancel);
        drop(tx);
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_write_batch_multiple() {
        let mut buf = Cursor::new(Vec::new());
        let batch = vec![frame(b"h1", b"b1"), frame(b"h2", b""), frame(b"h3", b"b3")];
        write_batch(&mut buf, &batch).await.unwrap();
        assert_eq!(buf.into_inner(), b"h1b1h2h3b3");
    }

    #[test]
    fn test_build_remaining_slices() {
        let batch = vec![frame(b"12345678", b"hello")];

        let slices = build_remaining_slices(&batch, 0);
        assert_eq!(slices.len(), 2);

        let slices = build_remaining_slices(&batch, 5);
        assert_eq!(slices.len(), 2);
        assert_eq!(slices[0].len(), 3);
        assert_eq!(slices[1].len(), 5);

        let slices = build_remaining_slices(&batch, 8);
        assert_eq!(slices.len(), 1);
        assert_eq!(slices[0].len(), 5);

        let slices = build_remaining_slices(&batch, 13);
        assert!(slices.is_empty());
    }
}
