#![forbid(unsafe_code)]

//! Single-threaded reactor: one readiness poll multiplexes the listener
//! and every client connection, an activity-ordered idle list drives
//! timeouts, and each iteration ends with a bounded expiry sweep.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token};
use tracing::{debug, info, warn};

use ox_command::dispatch;
use ox_config::Config;
use ox_protocol::tokenize;
use ox_store::Engine;

const LISTENER: Token = Token(0);
const EVENTS_CAPACITY: usize = 1024;
const READ_CHUNK: usize = 8 * 1024;
/// A connection that feeds an unterminated line past this size is
/// dropped instead of buffering without bound.
const MAX_LINE_BYTES: usize = 64 * 1024;

struct Conn {
    stream: TcpStream,
    rbuf: Vec<u8>,
    wbuf: Vec<u8>,
    last_activity_ms: u64,
    writing: bool,
    prev: Option<Token>,
    next: Option<Token>,
}

/// Connections linked in ascending last-activity order. Activity always
/// moves a connection to the tail, so the head is always the next
/// eviction candidate and the eviction walk can stop at the first live
/// connection.
#[derive(Debug, Default)]
struct IdleList {
    head: Option<Token>,
    tail: Option<Token>,
}

impl IdleList {
    fn unlink(&mut self, conns: &mut HashMap<Token, Conn>, token: Token) {
        let Some(conn) = conns.get_mut(&token) else {
            return;
        };
        let (prev, next) = (conn.prev.take(), conn.next.take());
        match prev {
            Some(p) => {
                if let Some(c) = conns.get_mut(&p) {
                    c.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(n) => {
                if let Some(c) = conns.get_mut(&n) {
                    c.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn push_tail(&mut self, conns: &mut HashMap<Token, Conn>, token: Token) {
        match self.tail {
            Some(t) => {
                if let Some(c) = conns.get_mut(&t) {
                    c.next = Some(token);
                }
                if let Some(c) = conns.get_mut(&token) {
                    c.prev = Some(t);
                }
            }
            None => self.head = Some(token),
        }
        self.tail = Some(token);
    }
}

pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: TcpListener,
    conns: HashMap<Token, Conn>,
    idle: IdleList,
    next_token: usize,
    idle_timeout_ms: u64,
    engine: Engine,
}

impl EventLoop {
    /// Bind the listener and register it with the poll.
    pub fn new(config: &Config, engine: Engine) -> io::Result<Self> {
        let addr: SocketAddr = config
            .bind_address()
            .parse()
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;
        let mut listener = TcpListener::bind(addr)?;
        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTENER, Interest::READABLE)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(EVENTS_CAPACITY),
            listener,
            conns: HashMap::new(),
            idle: IdleList::default(),
            next_token: 1,
            idle_timeout_ms: config.idle_timeout_ms,
            engine,
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until the poll itself fails; that error is fatal because
    /// the loop cannot make progress without readiness.
    pub fn run(&mut self) -> io::Result<()> {
        loop {
            self.turn(None)?;
        }
    }

    /// One loop iteration: wait for readiness (bounded by the nearest
    /// idle deadline and `max_wait`), service ready sockets, evict idle
    /// connections, sweep expired keys.
    pub fn turn(&mut self, max_wait: Option<Duration>) -> io::Result<()> {
        let timeout = match (self.next_idle_deadline(), max_wait) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (Some(a), None) => Some(a),
            (None, b) => b,
        };
        match self.poll.poll(&mut self.events, timeout) {
            Ok(()) => {}
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
        let ready: Vec<(Token, bool)> = self
            .events
            .iter()
            .map(|e| (e.token(), e.is_readable()))
            .collect();
        for (token, readable) in ready {
            if token == LISTENER {
                self.accept_ready();
            } else {
                self.service(token, readable);
            }
        }
        let now = now_ms();
        self.evict_idle(now);
        self.engine.sweep(now);
        Ok(())
    }

    fn accept_ready(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((mut stream, peer)) => {
                    let token = Token(self.next_token);
                    self.next_token += 1;
                    if let Err(e) = self
                        .poll
                        .registry()
                        .register(&mut stream, token, Interest::READABLE)
                    {
                        warn!(error = %e, "failed to register accepted connection");
                        continue;
                    }
                    info!(token = token.0, peer = %peer, "accepted connection");
                    self.conns.insert(
                        token,
                        Conn {
                            stream,
                            rbuf: Vec::new(),
                            wbuf: Vec::new(),
                            last_activity_ms: now_ms(),
                            writing: false,
                            prev: None,
                            next: None,
                        },
                    );
                    self.idle.push_tail(&mut self.conns, token);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    /// Service one ready connection: drain the socket, run every
    /// complete line through the dispatcher, flush replies, refresh the
    /// idle position. Any hard failure tears the connection down.
    fn service(&mut self, token: Token, readable: bool) {
        if !self.conns.contains_key(&token) {
            return;
        }
        let alive = (!readable || self.drain_read(token))
            && self.process_lines(token)
            && self.flush_write(token);
        if alive {
            self.touch(token);
        } else {
            self.teardown(token);
        }
    }

    /// Read until `WouldBlock`; registrations are edge-triggered, so
    /// leaving bytes in the socket would stall the connection.
    fn drain_read(&mut self, token: Token) -> bool {
        let Some(conn) = self.conns.get_mut(&token) else {
            return false;
        };
        let mut chunk = [0_u8; READ_CHUNK];
        loop {
            match conn.stream.read(&mut chunk) {
                Ok(0) => {
                    debug!(token = token.0, "peer closed");
                    return false;
                }
                Ok(n) => {
                    conn.rbuf.extend_from_slice(&chunk[..n]);
                    if conn.rbuf.len() > MAX_LINE_BYTES {
                        warn!(token = token.0, "request line too long");
                        return false;
                    }
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return true,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(token = token.0, error = %e, "read failed");
                    return false;
                }
            }
        }
    }

    fn process_lines(&mut self, token: Token) -> bool {
        let lines = {
            let Some(conn) = self.conns.get_mut(&token) else {
                return false;
            };
            let mut lines = Vec::new();
            while let Some(pos) = conn.rbuf.iter().position(|&b| b == b'\n') {
                let raw: Vec<u8> = conn.rbuf.drain(..=pos).collect();
                lines.push(String::from_utf8_lossy(&raw).into_owned());
            }
            lines
        };
        if lines.is_empty() {
            return true;
        }
        let now = now_ms();
        let mut out = String::new();
        for line in &lines {
            debug!(token = token.0, command = %line.trim_end(), "dispatch");
            let reply = dispatch(&tokenize(line), &mut self.engine, now);
            out.push_str(&reply.render());
        }
        match self.conns.get_mut(&token) {
            Some(conn) => {
                conn.wbuf.extend_from_slice(out.as_bytes());
                true
            }
            None => false,
        }
    }

    /// Write as much of the pending reply bytes as the socket accepts.
    /// Leftovers keep the connection registered for writability until
    /// drained.
    fn flush_write(&mut self, token: Token) -> bool {
        let Some(conn) = self.conns.get_mut(&token) else {
            return false;
        };
        while !conn.wbuf.is_empty() {
            match conn.stream.write(&conn.wbuf) {
                Ok(0) => return false,
                Ok(n) => {
                    conn.wbuf.drain(..n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(token = token.0, error = %e, "write failed");
                    return false;
                }
            }
        }
        let want_write = !conn.wbuf.is_empty();
        if want_write != conn.writing {
            let interest = if want_write {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };
            if let Err(e) = self
                .poll
                .registry()
                .reregister(&mut conn.stream, token, interest)
            {
                warn!(token = token.0, error = %e, "reregister failed");
                return false;
            }
            conn.writing = want_write;
        }
        true
    }

    /// Refresh the activity timestamp and move to the idle-list tail,
    /// keeping the list sorted without a search.
    fn touch(&mut self, token: Token) {
        self.idle.unlink(&mut self.conns, token);
        if let Some(conn) = self.conns.get_mut(&token) {
            conn.last_activity_ms = now_ms();
        }
        self.idle.push_tail(&mut self.conns, token);
    }

    fn teardown(&mut self, token: Token) {
        self.idle.unlink(&mut self.conns, token);
        if let Some(mut conn) = self.conns.remove(&token) {
            let _ = self.poll.registry().deregister(&mut conn.stream);
            info!(token = token.0, "closed connection");
        }
    }

    /// Walk from the head; insertion order guarantees the walk can stop
    /// at the first connection that is not yet due.
    fn evict_idle(&mut self, now: u64) {
        while let Some(head) = self.idle.head {
            let last = match self.conns.get(&head) {
                Some(conn) => conn.last_activity_ms,
                None => break,
            };
            if now.saturating_sub(last) < self.idle_timeout_ms {
                break;
            }
            info!(token = head.0, "evicting idle connection");
            self.teardown(head);
        }
    }

    /// Time until the oldest connection hits the idle timeout; `None`
    /// (wait indefinitely) with no connections.
    fn next_idle_deadline(&self) -> Option<Duration> {
        let head = self.idle.head?;
        let conn = self.conns.get(&head)?;
        let deadline = conn.last_activity_ms + self.idle_timeout_ms;
        Some(Duration::from_millis(deadline.saturating_sub(now_ms())))
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
}
