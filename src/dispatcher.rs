//! The event dispatcher: owns the UDP socket, correlates outgoing
//! queries with incoming replies by transaction id, tracks per-query
//! deadlines, and drives a generic timer queue for periodic tasks.
//! `spec.md` §4.D / §5.

use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use mio::net::UdpSocket as MioUdpSocket;
use mio::{Events, Interest, Poll, Token};

use crate::krpc::{KrpcMessage, TransactionId};
use crate::node::decompact_address;
use crate::timer::{TimerQueue, TimerSpec};
use std::net::SocketAddrV4;

const SOCKET_TOKEN: Token = Token(0);
const POLL_TIMEOUT: Duration = Duration::from_millis(200);
const MIN_TIMEOUT: Duration = Duration::from_secs(1);
const RECV_BUF_LEN: usize = 1500;

pub type Callback = Box<dyn FnMut(&Event)>;

/// The outgoing envelope and destination a correlated event refers
/// back to.
pub struct LocalRequest {
    pub t: TransactionId,
    pub query: KrpcMessage,
    pub addr: SocketAddrV4,
}

pub enum Event {
    Startup,
    Quit,
    Timeout {
        local: LocalRequest,
    },
    Request {
        remote: KrpcMessage,
        from: SocketAddrV4,
    },
    Response {
        local: LocalRequest,
        remote: KrpcMessage,
        from: SocketAddrV4,
    },
    Error {
        local: LocalRequest,
        remote: KrpcMessage,
        from: SocketAddrV4,
    },
}

impl Event {
    /// The transaction id of the correlated local request, if any.
    pub fn transaction_id(&self) -> Option<&TransactionId> {
        match self {
            Event::Startup | Event::Quit | Event::Request { .. } => None,
            Event::Timeout { local } | Event::Response { local, .. } | Event::Error { local, .. } => {
                Some(&local.t)
            }
        }
    }
}

pub enum StepOutcome<T> {
    Event(Event),
    TimerFired(T),
}

struct PendingEntry {
    query: KrpcMessage,
    addr: SocketAddrV4,
    deadline: Instant,
    callback: Option<Callback>,
}

struct DeadlineEntry {
    deadline: Instant,
    seq: u64,
    t: TransactionId,
}

impl PartialEq for DeadlineEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}
impl Eq for DeadlineEntry {}
impl Ord for DeadlineEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}
impl PartialOrd for DeadlineEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

pub struct EventDispatcher<T: Clone> {
    socket: MioUdpSocket,
    poll: Poll,
    mio_events: Events,
    pending: HashMap<TransactionId, PendingEntry>,
    deadlines: BinaryHeap<DeadlineEntry>,
    next_seq: u64,
    timers: TimerQueue<T>,
    sync_wait: HashSet<TransactionId>,
    resolved: HashMap<TransactionId, Event>,
    fired_callbacks: HashMap<TransactionId, Callback>,
    inbox: VecDeque<(Vec<u8>, SocketAddrV4)>,
}

impl<T: Clone> EventDispatcher<T> {
    pub fn bind(addr: SocketAddrV4) -> std::io::Result<Self> {
        let mut socket = MioUdpSocket::bind(SocketAddr::V4(addr))?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut socket, SOCKET_TOKEN, Interest::READABLE)?;
        Ok(EventDispatcher {
            socket,
            poll,
            mio_events: Events::with_capacity(256),
            pending: HashMap::new(),
            deadlines: BinaryHeap::new(),
            next_seq: 0,
            timers: TimerQueue::new(),
            sync_wait: HashSet::new(),
            resolved: HashMap::new(),
            fired_callbacks: HashMap::new(),
            inbox: VecDeque::new(),
        })
    }

    pub fn start_timer(&mut self, spec: TimerSpec<T>) {
        self.timers.start(spec);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Registers the pending request and hands the datagram to the
    /// socket. Registration happens first, per `spec.md` §4.D, to
    /// eliminate a receive-before-register race. Send failures
    /// (ICMP-unreachable, etc.) are logged and swallowed: the request
    /// still resolves via its deadline, never via an early error.
    pub fn send(
        &mut self,
        query: KrpcMessage,
        addr: SocketAddrV4,
        callback: Option<Callback>,
        sync: bool,
        timeout: Duration,
    ) -> TransactionId {
        let t = query.transaction_id().clone();
        let timeout = timeout.max(MIN_TIMEOUT);
        let deadline = Instant::now() + timeout;
        let seq = self.next_seq;
        self.next_seq += 1;

        self.pending.insert(
            t.clone(),
            PendingEntry {
                query: query.clone(),
                addr,
                deadline,
                callback,
            },
        );
        self.deadlines.push(DeadlineEntry {
            deadline,
            seq,
            t: t.clone(),
        });
        if sync {
            self.sync_wait.insert(t.clone());
        }

        let bytes = query.to_bytes();
        if let Err(err) = self.socket.send_to(&bytes, SocketAddr::V4(addr)) {
            log::warn!("send to {addr} failed, will resolve via timeout: {err}");
        }
        t
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddrV4> {
        match self.socket.local_addr()? {
            SocketAddr::V4(addr) => Ok(addr),
            SocketAddr::V6(_) => unreachable!("bound with a v4 address"),
        }
    }

    /// Sends a reply (response or error) with no transaction
    /// bookkeeping: replies aren't themselves awaited, so there is
    /// nothing to correlate a future datagram against.
    pub fn send_reply(&mut self, msg: KrpcMessage, addr: SocketAddrV4) {
        let bytes = msg.to_bytes();
        if let Err(err) = self.socket.send_to(&bytes, SocketAddr::V4(addr)) {
            log::warn!("reply send to {addr} failed: {err}");
        }
    }

    pub fn mark_sync_wait(&mut self, t: &TransactionId) {
        self.sync_wait.insert(t.clone());
    }

    pub fn take_resolved(&mut self, t: &TransactionId) -> Option<Event> {
        let ev = self.resolved.remove(t)?;
        self.sync_wait.remove(t);
        Some(ev)
    }

    /// Runs one iteration of the dispatcher: polls the socket with a
    /// short timeout, and if nothing arrived, fires due timers or pops
    /// one expired pending request.
    pub fn step(&mut self) -> Option<StepOutcome<T>> {
        if self.inbox.is_empty() {
            self.poll_socket();
        }

        if let Some((bytes, from)) = self.inbox.pop_front() {
            return self.correlate(&bytes, from).map(StepOutcome::Event);
        }

        let now = Instant::now();
        let fired = self.timers.drain_due(now);
        if let Some(payload) = fired.into_iter().next() {
            return Some(StepOutcome::TimerFired(payload));
        }

        if let Some(top) = self.deadlines.peek() {
            if top.deadline <= now {
                let entry = self.deadlines.pop().unwrap();
                if let Some(pending) = self.pending.remove(&entry.t) {
                    if let Some(cb) = pending.callback {
                        self.fired_callbacks.insert(entry.t.clone(), cb);
                    }
                    return Some(StepOutcome::Event(Event::Timeout {
                        local: LocalRequest {
                            t: entry.t,
                            query: pending.query,
                            addr: pending.addr,
                        },
                    }));
                }
                // Already resolved by a response/error; the heap entry
                // is stale, try again next call.
            }
        }

        None
    }

    fn poll_socket(&mut self) {
        if let Err(err) = self.poll.poll(&mut self.mio_events, Some(POLL_TIMEOUT)) {
            log::warn!("poll failed: {err}");
            return;
        }
        let mut readable = false;
        for event in self.mio_events.iter() {
            if event.token() == SOCKET_TOKEN && event.is_readable() {
                readable = true;
            }
        }
        if !readable {
            return;
        }
        let mut buf = [0u8; RECV_BUF_LEN];
        loop {
            match self.socket.recv_from(&mut buf) {
                Ok((len, SocketAddr::V4(from))) => {
                    self.inbox.push_back((buf[..len].to_vec(), from));
                }
                Ok((_, SocketAddr::V6(_))) => {
                    // IPv6 is out of scope (spec.md §1); drop silently.
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) => {
                    log::warn!("recv failed: {err}");
                    break;
                }
            }
        }
    }

    fn correlate(&mut self, bytes: &[u8], from: SocketAddrV4) -> Option<Event> {
        let msg = match KrpcMessage::from_bytes(bytes) {
            Ok(msg) => msg,
            Err(err) => {
                log::debug!("dropping malformed datagram from {from}: {err}");
                return None;
            }
        };
        let t = msg.transaction_id().clone();
        match self.pending.remove(&t) {
            Some(pending) => {
                if matches!(msg, KrpcMessage::Query { .. }) {
                    log::debug!("query-shaped reply for known transaction from {from}, dropping");
                    return None;
                }
                if let Some(cb) = pending.callback {
                    self.fired_callbacks.insert(t.clone(), cb);
                }
                let local = LocalRequest {
                    t,
                    query: pending.query,
                    addr: pending.addr,
                };
                match msg {
                    KrpcMessage::Response { .. } => Some(Event::Response {
                        local,
                        remote: msg,
                        from,
                    }),
                    KrpcMessage::Error { .. } => Some(Event::Error {
                        local,
                        remote: msg,
                        from,
                    }),
                    KrpcMessage::Query { .. } => unreachable!(),
                }
            }
            None => match msg {
                KrpcMessage::Query { .. } => Some(Event::Request { remote: msg, from }),
                _ => {
                    log::debug!("unsolicited reply for unknown transaction from {from}, dropping");
                    None
                }
            },
        }
    }

    /// Finalizes an event after the upstream consumer has processed it:
    /// runs the attached per-request callback, if any, and then stores
    /// the event for `wait_response` if its transaction is in the
    /// wait-set. Must be called exactly once per `Event` returned from
    /// `step`, after the caller's own event handling.
    pub fn finish_event(&mut self, event: Event) {
        let t = event.transaction_id().cloned();
        let Some(t) = t else {
            return;
        };
        if let Some(mut cb) = self.fired_callbacks.remove(&t) {
            cb(&event);
        }
        if self.sync_wait.contains(&t) {
            self.resolved.insert(t, event);
        }
    }
}

/// Parses a compact address out of the wire form used by trackers and
/// `values` entries in `get_peers` responses.
pub fn parse_peer_addr(bytes: &[u8]) -> Option<SocketAddrV4> {
    decompact_address(bytes)
}
