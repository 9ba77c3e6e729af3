//! The I/O multiplexer driving broker sockets.
//!
//! [`Selectable`] is the seam between the poll engine and the platform:
//! production code uses [`TcpSelector`] over non-blocking TCP streams,
//! tests script a mock. A selector never reports errors out of `poll`;
//! anything that goes wrong with a socket surfaces as a disconnection
//! event for that node.

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::net::TcpStream;
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::cluster::{BrokerId, Node};
use crate::protocol::frame::frame_message;

/// A request payload on its way to a node.
#[derive(Debug)]
pub struct NetworkSend {
    pub node_id: BrokerId,
    pub correlation_id: i32,
    /// Serialized request, without the length prefix.
    pub payload: Vec<u8>,
}

/// One complete response message received from a node.
#[derive(Debug)]
pub struct NetworkReceive {
    pub node_id: BrokerId,
    /// Unframed response bytes (header + body).
    pub payload: Vec<u8>,
}

/// Everything one `poll` pass observed, in the order the engine consumes
/// it.
#[derive(Debug, Default)]
pub struct SelectorEvents {
    /// `(node, correlation id)` pairs whose bytes fully left the process.
    pub completed_sends: Vec<(BrokerId, i32)>,
    pub completed_receives: Vec<NetworkReceive>,
    pub disconnected: Vec<BrokerId>,
    pub connected: Vec<BrokerId>,
}

impl SelectorEvents {
    pub fn is_empty(&self) -> bool {
        self.completed_sends.is_empty()
            && self.completed_receives.is_empty()
            && self.disconnected.is_empty()
            && self.connected.is_empty()
    }
}

/// An asynchronous multi-connection network I/O interface.
pub trait Selectable {
    /// Begin establishing a connection; completion or failure is reported
    /// by a later `poll` as a connected or disconnected event.
    fn connect(
        &mut self,
        node: &Node,
        send_buffer_bytes: usize,
        receive_buffer_bytes: usize,
    ) -> io::Result<()>;

    /// Queue a request for writing. The connection must exist; sends to
    /// unknown nodes surface as a disconnection of that node.
    fn send(&mut self, send: NetworkSend);

    /// Do one round of socket I/O, blocking up to `timeout_ms` while
    /// nothing happens.
    fn poll(&mut self, timeout_ms: i64) -> SelectorEvents;

    /// Whether the connection is ready to carry requests.
    fn is_channel_ready(&self, node: BrokerId) -> bool;

    /// Drop the connection, if any. Bookkeeping (draining in-flight
    /// requests) is the engine's job, so no disconnection event follows.
    fn close(&mut self, node: BrokerId);

    fn close_all(&mut self);

    /// Make a blocking `poll` return promptly. Callable from any thread.
    fn wakeup(&self);
}

/// Cross-thread handle that interrupts a blocking [`TcpSelector::poll`].
#[derive(Clone)]
pub struct Wakeup(Arc<WakeupInner>);

struct WakeupInner {
    flag: Mutex<bool>,
    condvar: Condvar,
}

impl Wakeup {
    fn new() -> Self {
        Self(Arc::new(WakeupInner {
            flag: Mutex::new(false),
            condvar: Condvar::new(),
        }))
    }

    pub fn wakeup(&self) {
        *self.0.flag.lock() = true;
        self.0.condvar.notify_all();
    }

    /// Wait until woken or `timeout` elapses; returns true if woken.
    fn consume_or_wait(&self, timeout: Duration) -> bool {
        let mut flag = self.0.flag.lock();
        if !*flag {
            self.0.condvar.wait_for(&mut flag, timeout);
        }
        std::mem::replace(&mut *flag, false)
    }

    fn consume(&self) -> bool {
        std::mem::replace(&mut *self.0.flag.lock(), false)
    }
}

struct PendingSend {
    correlation_id: i32,
    /// Framed bytes, length prefix included.
    bytes: Vec<u8>,
    written: usize,
}

struct Connection {
    stream: TcpStream,
    sends: VecDeque<PendingSend>,
    incoming: Vec<u8>,
}

impl Connection {
    /// Split one complete frame off the incoming buffer, if present.
    fn take_frame(&mut self, max_message_size: usize) -> io::Result<Option<Vec<u8>>> {
        if self.incoming.len() < 4 {
            return Ok(None);
        }
        let len = i32::from_be_bytes(
            self.incoming[..4]
                .try_into()
                .expect("slice of length 4 converts"),
        );
        if len < 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("negative frame size {}", len),
            ));
        }
        let len = len as usize;
        if len > max_message_size {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame of {} bytes exceeds limit {}", len, max_message_size),
            ));
        }
        if self.incoming.len() < 4 + len {
            return Ok(None);
        }
        let frame = self.incoming[4..4 + len].to_vec();
        self.incoming.drain(..4 + len);
        Ok(Some(frame))
    }
}

struct ConnectOutcome {
    node_id: BrokerId,
    result: io::Result<TcpStream>,
}

/// Production [`Selectable`] over plaintext TCP.
///
/// Connections are established on short-lived background threads so that
/// `connect` never blocks the driver; everything else happens on the
/// driver thread with non-blocking sockets.
pub struct TcpSelector {
    connections: HashMap<BrokerId, Connection>,
    connect_tx: Sender<ConnectOutcome>,
    connect_rx: Receiver<ConnectOutcome>,
    /// Nodes whose connection vanished between polls (e.g. send to a
    /// closed node); reported at the next poll.
    pending_disconnects: Vec<BrokerId>,
    wakeup: Wakeup,
    max_message_size: usize,
}

/// Granularity of the wait inside `poll`; socket readiness is discovered
/// by re-scanning, wakeups interrupt immediately.
const POLL_SLICE: Duration = Duration::from_millis(5);

impl TcpSelector {
    pub fn new(max_message_size: usize) -> Self {
        let (connect_tx, connect_rx) = channel();
        Self {
            connections: HashMap::new(),
            connect_tx,
            connect_rx,
            pending_disconnects: Vec::new(),
            wakeup: Wakeup::new(),
            max_message_size,
        }
    }

    /// Handle for waking a blocked `poll` from another thread.
    pub fn wakeup_handle(&self) -> Wakeup {
        self.wakeup.clone()
    }

    fn drain_connect_outcomes(&mut self, events: &mut SelectorEvents) {
        while let Ok(outcome) = self.connect_rx.try_recv() {
            match outcome.result {
                Ok(stream) => {
                    debug!(node = outcome.node_id, "connection established");
                    self.connections.insert(
                        outcome.node_id,
                        Connection {
                            stream,
                            sends: VecDeque::new(),
                            incoming: Vec::new(),
                        },
                    );
                    events.connected.push(outcome.node_id);
                }
                Err(e) => {
                    warn!(node = outcome.node_id, error = %e, "connection attempt failed");
                    events.disconnected.push(outcome.node_id);
                }
            }
        }
    }

    fn service_connections(&mut self, events: &mut SelectorEvents) {
        let mut dead = Vec::new();

        for (id, conn) in self.connections.iter_mut() {
            if let Err(e) = service_one(*id, conn, events, self.max_message_size) {
                debug!(node = id, error = %e, "connection error");
                dead.push(*id);
            }
        }

        for id in dead {
            self.connections.remove(&id);
            events.disconnected.push(id);
        }
    }
}

fn service_one(
    id: BrokerId,
    conn: &mut Connection,
    events: &mut SelectorEvents,
    max_message_size: usize,
) -> io::Result<()> {
    // writes first so a request queued this tick can still go out
    while let Some(front) = conn.sends.front_mut() {
        match conn.stream.write(&front.bytes[front.written..]) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                front.written += n;
                if front.written == front.bytes.len() {
                    events.completed_sends.push((id, front.correlation_id));
                    conn.sends.pop_front();
                }
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    let mut buf = [0u8; 8192];
    loop {
        match conn.stream.read(&mut buf) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => conn.incoming.extend_from_slice(&buf[..n]),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }

    while let Some(frame) = conn.take_frame(max_message_size)? {
        events.completed_receives.push(NetworkReceive {
            node_id: id,
            payload: frame,
        });
    }

    Ok(())
}

impl Selectable for TcpSelector {
    fn connect(
        &mut self,
        node: &Node,
        send_buffer_bytes: usize,
        receive_buffer_bytes: usize,
    ) -> io::Result<()> {
        let port = u16::try_from(node.port).map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid port {}", node.port),
            )
        })?;
        let host = node.host.clone();
        let node_id = node.id;
        let tx = self.connect_tx.clone();
        let wakeup = self.wakeup.clone();

        std::thread::Builder::new()
            .name(format!("rsbroker-connect-{}", node_id))
            .spawn(move || {
                let result = TcpStream::connect((host.as_str(), port)).and_then(|stream| {
                    stream.set_nodelay(true)?;
                    stream.set_nonblocking(true)?;
                    buffers::configure(&stream, send_buffer_bytes, receive_buffer_bytes);
                    Ok(stream)
                });
                // the selector may already be gone; nothing to do then
                tx.send(ConnectOutcome { node_id, result }).ok();
                wakeup.wakeup();
            })?;
        Ok(())
    }

    fn send(&mut self, send: NetworkSend) {
        let Some(conn) = self.connections.get_mut(&send.node_id) else {
            if !self.pending_disconnects.contains(&send.node_id) {
                self.pending_disconnects.push(send.node_id);
            }
            return;
        };
        match frame_message(&send.payload) {
            Ok(bytes) => conn.sends.push_back(PendingSend {
                correlation_id: send.correlation_id,
                bytes,
                written: 0,
            }),
            Err(e) => {
                warn!(node = send.node_id, error = %e, "dropping unframeable send");
                self.connections.remove(&send.node_id);
                self.pending_disconnects.push(send.node_id);
            }
        }
    }

    fn poll(&mut self, timeout_ms: i64) -> SelectorEvents {
        let mut events = SelectorEvents::default();
        events.disconnected.append(&mut self.pending_disconnects);

        // clamp to a day so a "forever" timeout cannot overflow the deadline
        let deadline = Instant::now() + Duration::from_millis(timeout_ms.clamp(0, 86_400_000) as u64);
        loop {
            self.drain_connect_outcomes(&mut events);
            self.service_connections(&mut events);

            if !events.is_empty() || self.wakeup.consume() {
                break;
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            if self.wakeup.consume_or_wait(POLL_SLICE.min(deadline - now)) {
                break;
            }
        }

        events
    }

    fn is_channel_ready(&self, node: BrokerId) -> bool {
        self.connections.contains_key(&node)
    }

    fn close(&mut self, node: BrokerId) {
        self.connections.remove(&node);
    }

    fn close_all(&mut self) {
        self.connections.clear();
    }

    fn wakeup(&self) {
        self.wakeup.wakeup();
    }
}

#[cfg(unix)]
mod buffers {
    use std::net::TcpStream;
    use std::os::unix::io::AsRawFd;

    use tracing::debug;

    /// Apply SO_SNDBUF / SO_RCVBUF. Failure is logged, not fatal: the
    /// kernel default is a working fallback.
    pub(super) fn configure(stream: &TcpStream, send_bytes: usize, receive_bytes: usize) {
        let fd = stream.as_raw_fd();
        for (opt, bytes) in [(libc::SO_SNDBUF, send_bytes), (libc::SO_RCVBUF, receive_bytes)] {
            let value = bytes as libc::c_int;
            let rc = unsafe {
                libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    opt,
                    &value as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                )
            };
            if rc != 0 {
                debug!(
                    opt,
                    bytes,
                    error = %std::io::Error::last_os_error(),
                    "failed to size socket buffer"
                );
            }
        }
    }
}

#[cfg(not(unix))]
mod buffers {
    use std::net::TcpStream;

    pub(super) fn configure(_stream: &TcpStream, _send_bytes: usize, _receive_bytes: usize) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_frame_needs_complete_prefix_and_body() {
        let mut conn = Connection {
            stream: TcpStream::connect(listener_addr()).unwrap(),
            sends: VecDeque::new(),
            incoming: vec![],
        };

        conn.incoming.extend_from_slice(&3i32.to_be_bytes());
        assert!(conn.take_frame(1024).unwrap().is_none());

        conn.incoming.extend_from_slice(b"abc");
        assert_eq!(conn.take_frame(1024).unwrap().unwrap(), b"abc");
        assert!(conn.incoming.is_empty());
    }

    #[test]
    fn test_take_frame_rejects_oversize() {
        let mut conn = Connection {
            stream: TcpStream::connect(listener_addr()).unwrap(),
            sends: VecDeque::new(),
            incoming: 1024i32.to_be_bytes().to_vec(),
        };
        assert!(conn.take_frame(16).is_err());
    }

    #[test]
    fn test_send_to_unknown_node_reports_disconnect() {
        let mut selector = TcpSelector::new(1024);
        selector.send(NetworkSend {
            node_id: 42,
            correlation_id: 1,
            payload: vec![1, 2, 3],
        });
        let events = selector.poll(0);
        assert_eq!(events.disconnected, vec![42]);
    }

    #[test]
    fn test_wakeup_interrupts_poll() {
        let mut selector = TcpSelector::new(1024);
        let handle = selector.wakeup_handle();
        let started = Instant::now();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            handle.wakeup();
        });
        let events = selector.poll(5_000);
        assert!(events.is_empty());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    /// A listening socket so `Connection` test fixtures have a live stream.
    fn listener_addr() -> std::net::SocketAddr {
        use std::net::TcpListener;
        use std::sync::OnceLock;

        static LISTENER: OnceLock<TcpListener> = OnceLock::new();
        LISTENER
            .get_or_init(|| TcpListener::bind("127.0.0.1:0").unwrap())
            .local_addr()
            .unwrap()
    }
}
