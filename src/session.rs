//! Per-session read and write tasks.
//!
//! A promoted peer is served by two tasks. The read task owns the receive
//! half and the fixed-size receive buffer, and is the only place a
//! disconnect is detected. The write task drains the outbound frame queue;
//! a failed write drops that frame and moves on, it never tears the
//! session down.

use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

use crate::codec;
use crate::server::Shared;

/// Read loop for the active session.
///
/// Issues one read at a time into a zero-filled buffer of the size the
/// server was opened with. Each completed read is decoded and handed to
/// the consumer before the next read is armed. Exits on peer disconnect,
/// read error, or server shutdown, then releases the admission gate if
/// this session still owns the slot.
pub(crate) async fn read_task<R>(
    mut reader: R,
    shared: Arc<Shared>,
    session_id: u64,
    buffer_size: usize,
    mut shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; buffer_size];

    loop {
        let n = tokio::select! {
            result = reader.read(&mut buffer) => match result {
                Ok(n) => n,
                Err(e) => {
                    debug!(session_id, error = %e, "Read failed, closing session");
                    break;
                }
            },
            _ = shutdown.changed() => {
                trace!(session_id, "Read task stopping on shutdown");
                break;
            }
        };

        if n == 0 {
            info!(session_id, "Peer disconnected");
            break;
        }

        trace!(session_id, bytes = n, "Received frame");
        let text = codec::decode_inbound(&buffer[..n]);
        shared.deliver(text);
    }

    shared.release_session(session_id);
}

/// Write loop for the active session.
///
/// Drains queued frames until the sender side is dropped, which happens
/// when the session slot is cleared, then follows the last frame with a
/// FIN. Server shutdown ends the loop directly, abandoning whatever is
/// still queued or stuck mid-write against a peer that stopped reading.
pub(crate) async fn write_task<W>(
    mut writer: W,
    mut outbound: mpsc::UnboundedReceiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        // Biased so a close signal outranks frames already queued
        let frame = tokio::select! {
            biased;
            _ = shutdown.changed() => break,
            frame = outbound.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        tokio::select! {
            result = writer.write_all(&frame) => {
                if let Err(e) = result {
                    debug!(error = %e, bytes = frame.len(), "Write failed, dropping frame");
                }
            }
            _ = shutdown.changed() => {
                debug!(bytes = frame.len(), "Write abandoned on shutdown");
                break;
            }
        }
    }

    let _ = writer.shutdown().await;
    trace!("Write task finished");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::server::{Consumer, PeerHandle};
    use std::io;
    use tokio::sync::Semaphore;
    use tokio_test::io::Builder;

    fn install_peer(shared: &Shared, id: u64, tx: mpsc::UnboundedSender<Bytes>) -> Arc<Semaphore> {
        let gate = Arc::new(Semaphore::new(0));
        *shared.peer.lock().unwrap() = Some(PeerHandle {
            id,
            addr: "127.0.0.1:0".parse().unwrap(),
            outbound: tx,
            gate: Arc::clone(&gate),
        });
        gate
    }

    #[tokio::test]
    async fn test_read_task_echoes_through_peer_queue() {
        let shared = Arc::new(Shared::new());
        let (tx, mut rx) = mpsc::unbounded_channel();
        let gate = install_peer(&shared, 1, tx);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let mock = Builder::new().read(b"ping").build();
        read_task(mock, Arc::clone(&shared), 1, 64, shutdown_rx).await;

        // The echoed frame was queued before EOF tore the session down
        assert_eq!(rx.recv().await.unwrap(), Bytes::from_static(b"ping"));
        assert!(shared.peer.lock().unwrap().is_none());
        assert_eq!(gate.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_read_task_routes_to_subscriber() {
        let shared = Arc::new(Shared::new());
        let (sub_tx, mut sub_rx) = mpsc::unbounded_channel();
        *shared.consumer.lock().unwrap() = Consumer::Subscriber(sub_tx);
        let (peer_tx, mut peer_rx) = mpsc::unbounded_channel();
        install_peer(&shared, 1, peer_tx);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        // Zero-padded frame: the subscriber sees the trimmed text
        let mock = Builder::new().read(b"hello\0\0\0").build();
        read_task(mock, Arc::clone(&shared), 1, 64, shutdown_rx).await;

        assert_eq!(sub_rx.recv().await.unwrap(), "hello");
        // Nothing was echoed back
        assert!(peer_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_read_task_stale_release_leaves_successor() {
        let shared = Arc::new(Shared::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let gate = install_peer(&shared, 2, tx);
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        // A read task from an older session observes disconnect after the
        // slot has already been handed to session 2
        let mock = Builder::new().build();
        read_task(mock, Arc::clone(&shared), 1, 64, shutdown_rx).await;

        let peer = shared.peer.lock().unwrap();
        assert_eq!(peer.as_ref().map(|p| p.id), Some(2));
        assert_eq!(gate.available_permits(), 0);
    }

    #[tokio::test]
    async fn test_read_task_exits_on_shutdown_signal() {
        let shared = Arc::new(Shared::new());
        let (tx, _rx) = mpsc::unbounded_channel();
        let gate = install_peer(&shared, 1, tx);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // No scripted reads and a live handle: the read stays pending
        // until the shutdown signal lands
        let (mock, _handle) = Builder::new().build_with_handle();
        let task = tokio::spawn(read_task(mock, Arc::clone(&shared), 1, 64, shutdown_rx));

        shutdown_tx.send(true).unwrap();
        task.await.unwrap();

        assert!(shared.peer.lock().unwrap().is_none());
        assert_eq!(gate.available_permits(), 1);
    }

    #[tokio::test]
    async fn test_write_task_writes_frames_in_order() {
        let mock = Builder::new().write(b"ping").write(b"pong").build();
        let (tx, rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tx.send(Bytes::from_static(b"ping")).unwrap();
        tx.send(Bytes::from_static(b"pong")).unwrap();
        drop(tx);

        write_task(mock, rx, shutdown_rx).await;
    }

    #[tokio::test]
    async fn test_write_task_swallows_write_errors() {
        let mock = Builder::new()
            .write(b"first")
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "peer reset"))
            .write(b"third")
            .build();
        let (tx, rx) = mpsc::unbounded_channel();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        tx.send(Bytes::from_static(b"first")).unwrap();
        tx.send(Bytes::from_static(b"second")).unwrap();
        tx.send(Bytes::from_static(b"third")).unwrap();
        drop(tx);

        // The faulted frame is dropped, later frames still go out
        write_task(mock, rx, shutdown_rx).await;
    }

    #[tokio::test]
    async fn test_write_task_discards_queue_on_shutdown() {
        // No write expectations: frames queued behind an already-raised
        // shutdown signal must never reach the peer
        let mock = Builder::new().build();
        let (tx, rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tx.send(Bytes::from_static(b"queued")).unwrap();
        tx.send(Bytes::from_static(b"frames")).unwrap();
        shutdown_tx.send(true).unwrap();

        write_task(mock, rx, shutdown_rx).await;
    }
}
