//! Single-session TCP server.
//!
//! Owns the listening socket and the lifecycle of the one peer allowed to
//! be connected at a time. Admission is a one-permit semaphore: the accept
//! loop takes the permit before arming an accept, and whoever clears the
//! active-session slot puts it back. The listener backlog is one as well,
//! so the kernel queues at most one further connection attempt while a
//! session is active.

use crate::codec;
use crate::session;
use bytes::Bytes;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

/// Single-session TCP server.
///
/// All methods are synchronous and callable from any thread. `open`
/// spawns the accept task onto the calling thread's tokio runtime and
/// reports `false` instead of panicking when there is none.
pub struct Server {
    shared: Arc<Shared>,
    state: Mutex<Option<OpenState>>,
}

/// State shared with the accept and session tasks.
pub(crate) struct Shared {
    pub(crate) is_open: AtomicBool,
    pub(crate) next_session_id: AtomicU64,
    pub(crate) peer: Mutex<Option<PeerHandle>>,
    pub(crate) consumer: Mutex<Consumer>,
}

/// Resources owned by one open/close cycle.
struct OpenState {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

/// Handle to the connected peer, held in the active-session slot.
pub(crate) struct PeerHandle {
    pub(crate) id: u64,
    pub(crate) addr: SocketAddr,
    pub(crate) outbound: mpsc::UnboundedSender<Bytes>,
    pub(crate) gate: Arc<Semaphore>,
}

/// Where decoded inbound text goes.
pub(crate) enum Consumer {
    /// Push inbound text straight back to the peer (the default).
    Echo,
    /// Hand inbound text to an embedder-owned channel.
    Subscriber(mpsc::UnboundedSender<String>),
}

impl Shared {
    pub(crate) fn new() -> Self {
        Shared {
            is_open: AtomicBool::new(false),
            next_session_id: AtomicU64::new(1),
            peer: Mutex::new(None),
            consumer: Mutex::new(Consumer::Echo),
        }
    }

    /// Allocate the next session id. Ids are never reused, which lets a
    /// late teardown from an old session recognize that the slot has
    /// moved on without it.
    pub(crate) fn allocate_session_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Queue text for the connected peer. Without a peer this drops the
    /// text and reports nothing: sends are fire-and-forget.
    pub(crate) fn send_text(&self, text: &str) {
        let frame = codec::encode_outbound(text);
        let peer = self.peer.lock().unwrap();
        match peer.as_ref() {
            Some(handle) => {
                trace!(peer = %handle.addr, bytes = frame.len(), "Queueing outbound frame");
                // The write task stops once this slot is cleared, so a
                // send error here means teardown won the race.
                let _ = handle.outbound.send(frame);
            }
            None => trace!("No peer connected, dropping outbound text"),
        }
    }

    /// Route decoded inbound text to the consumer.
    pub(crate) fn deliver(&self, text: String) {
        let subscriber = {
            let consumer = self.consumer.lock().unwrap();
            match &*consumer {
                Consumer::Echo => None,
                Consumer::Subscriber(tx) => Some(tx.clone()),
            }
        };

        match subscriber {
            None => self.send_text(&text),
            Some(tx) => {
                if tx.send(text).is_err() {
                    trace!("Subscriber receiver dropped, discarding inbound text");
                }
            }
        }
    }

    /// Clear the active-session slot if `session_id` still owns it, and
    /// release the admission gate. Exactly one release happens per
    /// session: either here or in `close`, whichever clears the slot.
    pub(crate) fn release_session(&self, session_id: u64) {
        let handle = {
            let mut peer = self.peer.lock().unwrap();
            match peer.as_ref() {
                Some(current) if current.id == session_id => peer.take(),
                _ => None,
            }
        };

        if let Some(handle) = handle {
            debug!(session_id, "Session slot released");
            handle.gate.add_permits(1);
        }
    }
}

impl Server {
    /// Create a closed server. No socket exists until `open`.
    pub fn new() -> Self {
        Server {
            shared: Arc::new(Shared::new()),
            state: Mutex::new(None),
        }
    }

    /// Open the listener and start accepting.
    ///
    /// Returns `true` once listening. Calling `open` while already open is
    /// a no-op that returns `true` and leaves the existing listener, any
    /// active session, and the configured buffer size untouched. An
    /// address that does not parse as an IP literal, a zero buffer size,
    /// a calling thread with no tokio runtime, or a failed bind all
    /// return `false` with no state change.
    pub fn open(&self, address: &str, port: u16, buffer_size: usize) -> bool {
        let mut state = self.state.lock().unwrap();
        if state.is_some() {
            debug!("Open called while already open");
            return true;
        }

        let ip: IpAddr = match address.parse() {
            Ok(ip) => ip,
            Err(_) => {
                warn!(address, "Rejecting open: address is not an IP literal");
                return false;
            }
        };
        if buffer_size == 0 {
            warn!("Rejecting open: buffer size must be positive");
            return false;
        }
        // The accept task needs a runtime to land on.
        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => {
                warn!("Rejecting open: no tokio runtime on this thread");
                return false;
            }
        };

        let addr = SocketAddr::new(ip, port);
        let listener = match bind_single_backlog(addr) {
            Ok(listener) => listener,
            Err(e) => {
                error!(address = %addr, error = %e, "Failed to bind listener");
                return false;
            }
        };
        let local_addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                error!(error = %e, "Failed to read bound address");
                return false;
            }
        };
        let listener = match TcpListener::from_std(listener) {
            Ok(listener) => listener,
            Err(e) => {
                error!(error = %e, "Failed to register listener with the runtime");
                return false;
            }
        };

        // The admission gate starts with its one permit available: no
        // session exists yet, so the first accept arms immediately.
        let gate = Arc::new(Semaphore::new(1));
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Flipped before the spawn: with the listener live, the accept
        // task can promote a peer from the backlog before this function
        // returns.
        self.shared.is_open.store(true, Ordering::SeqCst);
        let accept_task = runtime.spawn(accept_loop(
            Arc::clone(&self.shared),
            listener,
            gate,
            buffer_size,
            shutdown_rx,
        ));

        *state = Some(OpenState {
            local_addr,
            shutdown: shutdown_tx,
            accept_task,
        });

        info!(address = %local_addr, buffer_size, "Server listening");
        true
    }

    /// Close the listener and tear down any active session.
    ///
    /// Signals the accept and session tasks and returns without waiting
    /// for them; the listening socket is released once the accept task
    /// observes the signal. Outbound frames still queued for the peer are
    /// discarded, not flushed. `shutdown` is the awaitable variant.
    /// Closing a closed server is a no-op.
    pub fn close(&self) {
        let _ = self.begin_close();
    }

    /// Close and wait until the accept task has exited, at which point the
    /// listening socket is provably released and the same port can be
    /// bound again.
    pub async fn shutdown(&self) {
        if let Some(task) = self.begin_close() {
            if let Err(e) = task.await {
                debug!(error = %e, "Accept task ended abnormally");
            }
        }
    }

    fn begin_close(&self) -> Option<JoinHandle<()>> {
        let task = match self.state.lock() {
            Ok(mut state) => {
                self.shared.is_open.store(false, Ordering::SeqCst);
                state.take().map(|open| {
                    // Wakes the accept loop and the session read task.
                    let _ = open.shutdown.send(true);
                    info!(address = %open.local_addr, "Server closing");
                    open.accept_task
                })
            }
            Err(_) => None,
        };

        // Tear down the active session. The session tasks stop on the
        // signal sent above, the write task abandoning whatever it still
        // has queued or in flight.
        if let Ok(mut peer) = self.shared.peer.lock() {
            if let Some(handle) = peer.take() {
                info!(peer = %handle.addr, session_id = handle.id, "Session closed");
                handle.gate.add_permits(1);
            }
        }

        task
    }

    /// Whether the server is currently open.
    pub fn is_open(&self) -> bool {
        self.shared.is_open.load(Ordering::SeqCst)
    }

    /// Address the listener is bound to, if open. With port 0 this is
    /// where the kernel actually put us.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state.lock().unwrap().as_ref().map(|open| open.local_addr)
    }

    /// Address of the connected peer, if a session is active.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.shared.peer.lock().unwrap().as_ref().map(|handle| handle.addr)
    }

    /// Queue `text` for the connected peer, encoded as ASCII.
    ///
    /// Fire-and-forget: without a connected peer this does nothing, and a
    /// write failure on the socket neither surfaces here nor tears the
    /// session down.
    pub fn send_data(&self, text: &str) {
        self.shared.send_text(text);
    }

    /// Reroute inbound text to the returned channel instead of echoing it.
    ///
    /// Replaces any previous subscriber and survives close/open cycles.
    /// Once a subscriber is installed nothing is echoed to the peer, but
    /// `send_data` still works for replies.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.shared.consumer.lock().unwrap() = Consumer::Subscriber(tx);
        rx
    }
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for Server {
    /// Dropping signals teardown; it does not wait for the accept task.
    fn drop(&mut self) {
        self.close();
    }
}

/// Accept loop: holds the listener for one open/close cycle and arms
/// exactly one accept at a time.
async fn accept_loop(
    shared: Arc<Shared>,
    listener: TcpListener,
    gate: Arc<Semaphore>,
    buffer_size: usize,
    mut shutdown: watch::Receiver<bool>,
) {
    'run: loop {
        // Wait for the admission gate: no accept is armed while a session
        // is active. The permit is forgotten here and restored by whoever
        // clears the session slot.
        tokio::select! {
            permit = gate.acquire() => match permit {
                Ok(permit) => permit.forget(),
                Err(_) => break 'run,
            },
            _ = shutdown.changed() => break 'run,
        }

        let (stream, peer_addr) = loop {
            tokio::select! {
                result = listener.accept() => match result {
                    Ok(accepted) => break accepted,
                    Err(e) => {
                        // Transient failures (EMFILE and friends) keep the
                        // accept armed.
                        error!(error = %e, "Failed to accept connection");
                    }
                },
                _ = shutdown.changed() => break 'run,
            }
        };

        // Clone before the shutdown check: a close signalled after this
        // point is guaranteed visible to either the check below or the
        // session tasks' receivers.
        let reader_shutdown = shutdown.clone();
        let writer_shutdown = shutdown.clone();
        let session_id = shared.allocate_session_id();
        let (read_half, write_half) = stream.into_split();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();

        // Promotion: the slot lock serializes against close. The check is
        // this cycle's own shutdown flag: once close has signalled, the
        // connection is dropped unserved, even if a new open is already
        // live on a fresh cycle.
        {
            let mut peer = shared.peer.lock().unwrap();
            if *shutdown.borrow() {
                debug!(peer = %peer_addr, "Dropping connection accepted during close");
                break 'run;
            }
            debug_assert!(peer.is_none(), "session slot occupied while the gate was held");
            *peer = Some(PeerHandle {
                id: session_id,
                addr: peer_addr,
                outbound: outbound_tx,
                gate: Arc::clone(&gate),
            });
        }

        info!(peer = %peer_addr, session_id, "Peer connected");

        tokio::spawn(session::write_task(write_half, outbound_rx, writer_shutdown));
        tokio::spawn(session::read_task(
            read_half,
            Arc::clone(&shared),
            session_id,
            buffer_size,
            reader_shutdown,
        ));
    }

    debug!("Accept loop exited");
}

/// Create the listening socket with a backlog of one.
///
/// Backlog sizing is part of the contract: while a session is active the
/// kernel holds at most one completed connection for later promotion.
fn bind_single_backlog(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1)?;

    Ok(socket.into())
}
