use std::collections::VecDeque;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::unix::io::FromRawFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use mio::{Events, Interest, Poll, Token, Waker};

use crate::error::{EngineError, EngineResult};
use crate::request::{Connection, ProcessResult, Stream};
use crate::server::Server;
use crate::tls::TlsStream;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);
const FIRST_CONN: usize = 2;

/// An accepted socket in transit between threads, before it is wrapped
/// for TLS and registered with a worker's poll.
pub(crate) enum HandedSocket {
    Tcp(std::net::TcpStream),
    Unix(std::os::unix::net::UnixStream),
}

/// State shared with waker-driven callers: resume requests, socket
/// hand-off from an acceptor thread, and the shutdown flag.
pub(crate) struct LoopShared {
    waker: Waker,
    resume: Mutex<Vec<(usize, u64)>>,
    handoff: Mutex<VecDeque<HandedSocket>>,
    shutdown: AtomicBool,
}

impl LoopShared {
    pub(crate) fn resume_slot(&self, slot: usize, generation: u64) {
        self.resume.lock().expect("resume queue poisoned").push((slot, generation));
        let _ = self.waker.wake();
    }

    pub(crate) fn push_socket(&self, sock: HandedSocket) {
        self.handoff.lock().expect("handoff queue poisoned").push_back(sock);
        let _ = self.waker.wake();
    }

    pub(crate) fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

/// Re-enters the protocol state machine of a paused connection with
/// its undrained bytes. Safe to call from any thread; the wake is
/// routed to the loop that owns the connection.
#[derive(Clone)]
pub struct ResumeHandle {
    shared: Option<Arc<LoopShared>>,
    slot: usize,
    generation: u64,
}

impl ResumeHandle {
    pub(crate) fn new(shared: Arc<LoopShared>, slot: usize, generation: u64) -> Self {
        Self { shared: Some(shared), slot, generation }
    }

    #[cfg(test)]
    pub(crate) fn detached() -> Self {
        Self { shared: None, slot: 0, generation: 0 }
    }

    pub fn resume(&self) {
        if let Some(shared) = &self.shared {
            shared.resume_slot(self.slot, self.generation);
        }
    }
}

/// Cross-thread control for a running loop.
#[derive(Clone)]
pub struct LoopHandle {
    shared: Arc<LoopShared>,
}

impl LoopHandle {
    pub fn shutdown(&self) {
        self.shared.request_shutdown();
    }

    pub(crate) fn push_socket(&self, sock: HandedSocket) {
        self.shared.push_socket(sock);
    }
}

pub(crate) enum Listener {
    Tcp(mio::net::TcpListener),
    Unix(mio::net::UnixListener),
}

impl Listener {
    pub(crate) fn register(
        &mut self,
        registry: &mio::Registry,
        token: Token,
    ) -> std::io::Result<()> {
        match self {
            Listener::Tcp(listener) => registry.register(listener, token, Interest::READABLE),
            Listener::Unix(listener) => registry.register(listener, token, Interest::READABLE),
        }
    }

    pub(crate) fn deregister(&mut self, registry: &mio::Registry) -> std::io::Result<()> {
        match self {
            Listener::Tcp(listener) => registry.deregister(listener),
            Listener::Unix(listener) => registry.deregister(listener),
        }
    }

    /// Accept one pending connection; `None` once the backlog is drained.
    pub(crate) fn accept_handed(&mut self) -> std::io::Result<Option<HandedSocket>> {
        match self {
            Listener::Tcp(listener) => match listener.accept() {
                Ok((stream, peer)) => {
                    trace!("accepted {peer}");
                    // Unwrap to std for the shared hand-off type; the
                    // fd stays non-blocking.
                    let std_stream = unsafe {
                        use std::os::unix::io::IntoRawFd;
                        std::net::TcpStream::from_raw_fd(stream.into_raw_fd())
                    };
                    Ok(Some(HandedSocket::Tcp(std_stream)))
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
                Err(err) => Err(err),
            },
            Listener::Unix(listener) => match listener.accept() {
                Ok((stream, _addr)) => {
                    let std_stream = unsafe {
                        use std::os::unix::io::IntoRawFd;
                        std::os::unix::net::UnixStream::from_raw_fd(stream.into_raw_fd())
                    };
                    Ok(Some(HandedSocket::Unix(std_stream)))
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
                Err(err) => Err(err),
            },
        }
    }
}

/// One event loop: a poll, its listener (optional; worker loops get
/// sockets handed off instead), and the connections it exclusively
/// owns.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    listener: Option<Listener>,
    connections: Vec<Option<Connection>>,
    free_slots: Vec<usize>,
    next_generation: u64,
    shared: Arc<LoopShared>,
    server: Server,
    tls: Option<Arc<rustls::ServerConfig>>,
}

impl EventLoop {
    pub fn new(server: Server) -> EngineResult<Self> {
        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER)?;
        Ok(Self {
            poll,
            events: Events::with_capacity(1024),
            listener: None,
            connections: Vec::new(),
            free_slots: Vec::new(),
            next_generation: 0,
            shared: Arc::new(LoopShared {
                waker,
                resume: Mutex::new(Vec::new()),
                handoff: Mutex::new(VecDeque::new()),
                shutdown: AtomicBool::new(false),
            }),
            server,
            tls: None,
        })
    }

    pub fn handle(&self) -> LoopHandle {
        LoopHandle { shared: self.shared.clone() }
    }

    /// Bound TCP address, once `bind` succeeded with a TCP spec.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match &self.listener {
            Some(Listener::Tcp(listener)) => listener.local_addr().ok(),
            _ => None,
        }
    }

    pub(crate) fn set_tls_runtime(&mut self, config: Arc<rustls::ServerConfig>) {
        self.tls = Some(config);
    }

    /// Open and register the listener. `spec` accepts a plain address
    /// or hostname, an `ipv6:` prefixed address, or a `unix:` prefixed
    /// socket path (`port` is ignored for the latter).
    pub fn bind(&mut self, spec: &str, port: u16, backlog: i32) -> EngineResult<()> {
        if self.listener.is_some() {
            return Err(EngineError::Config("listener already bound".to_string()));
        }
        if let Some(tls) = self.server.inner.tls_config() {
            self.tls = Some(tls.build()?);
        }
        let mut listener = open_listener(spec, port, backlog)?;
        listener.register(self.poll.registry(), LISTENER)?;
        info!("listening on {spec}:{port} (backlog {backlog})");
        self.listener = Some(listener);
        Ok(())
    }

    /// `bind` with TLS material: the config is installed on the server
    /// and every connection accepted on this listener is wrapped.
    pub fn bind_tls(
        &mut self,
        spec: &str,
        port: u16,
        backlog: i32,
        tls: crate::tls::TlsConfig,
    ) -> EngineResult<()> {
        self.server.set_tls(tls);
        self.bind(spec, port, backlog)
    }

    /// Stop accepting; established connections are unaffected.
    pub fn unbind(&mut self) -> EngineResult<()> {
        if let Some(mut listener) = self.listener.take() {
            listener.deregister(self.poll.registry())?;
        }
        Ok(())
    }

    /// Run until shutdown is requested via the handle.
    pub fn run(&mut self) -> EngineResult<()> {
        loop {
            let timeout = self.poll_timeout();
            self.poll.poll(&mut self.events, timeout)?;

            if self.shared.shutdown.load(Ordering::SeqCst) {
                self.teardown_all();
                return Ok(());
            }

            let tokens: Vec<Token> = self.events.iter().map(|event| event.token()).collect();
            for token in tokens {
                match token {
                    LISTENER => self.accept_pending()?,
                    WAKER => {}
                    token => self.service(token.0 - FIRST_CONN),
                }
            }

            self.adopt_handed_sockets();
            self.drain_resumes();
            self.sweep_idle();
        }
    }

    fn poll_timeout(&self) -> Option<Duration> {
        let config = self.server.inner.read_config();
        if config.read_timeout.is_some() || config.write_timeout.is_some() {
            Some(Duration::from_millis(500))
        } else {
            None
        }
    }

    fn accept_pending(&mut self) -> EngineResult<()> {
        loop {
            let Some(listener) = &mut self.listener else {
                return Ok(());
            };
            let Some(handed) = listener.accept_handed()? else {
                return Ok(());
            };
            if let Err(err) = self.adopt(handed) {
                warn!("failed to adopt accepted socket: {err}");
            }
        }
    }

    /// Register a socket with this loop and create its connection.
    pub(crate) fn adopt(&mut self, sock: HandedSocket) -> EngineResult<()> {
        let slot = self.free_slots.pop().unwrap_or(self.connections.len());
        let token = Token(slot + FIRST_CONN);
        let interest = Interest::READABLE | Interest::WRITABLE;

        let stream = match sock {
            HandedSocket::Tcp(stream) => {
                let mut stream = mio::net::TcpStream::from_std(stream);
                self.poll.registry().register(&mut stream, token, interest)?;
                match &self.tls {
                    Some(config) => {
                        Stream::Tls(Box::new(TlsStream::new(stream, config.clone())?))
                    }
                    None => Stream::Tcp(stream),
                }
            }
            HandedSocket::Unix(stream) => {
                let mut stream = mio::net::UnixStream::from_std(stream);
                self.poll.registry().register(&mut stream, token, interest)?;
                Stream::Unix(stream)
            }
        };

        // Slots are recycled; the generation tells a stale resume
        // handle from the connection currently in the slot.
        self.next_generation += 1;
        let connection = Connection::new(
            stream,
            self.server.inner.clone(),
            self.shared.clone(),
            slot,
            self.next_generation,
        );
        if slot == self.connections.len() {
            self.connections.push(Some(connection));
        } else {
            self.connections[slot] = Some(connection);
        }
        Ok(())
    }

    fn adopt_handed_sockets(&mut self) {
        loop {
            let sock = self.shared.handoff.lock().expect("handoff queue poisoned").pop_front();
            match sock {
                Some(sock) => {
                    if let Err(err) = self.adopt(sock) {
                        warn!("failed to adopt handed-off socket: {err}");
                    }
                }
                None => break,
            }
        }
    }

    fn drain_resumes(&mut self) {
        let slots: Vec<(usize, u64)> =
            self.shared.resume.lock().expect("resume queue poisoned").drain(..).collect();
        for (slot, generation) in slots {
            if let Some(Some(conn)) = self.connections.get_mut(slot) {
                if conn.generation != generation {
                    trace!("dropping stale resume for slot {slot}");
                    continue;
                }
                conn.clear_pause();
                self.service(slot);
            }
        }
    }

    /// One full service pass for a connection: drain the socket, run
    /// the state machine, flush output, and apply the verdict.
    fn service(&mut self, slot: usize) {
        let Some(Some(conn)) = self.connections.get_mut(slot) else {
            return;
        };

        let mut eof = false;
        if !conn.paused {
            match conn.fill_from_socket() {
                Ok(open) => eof = !open,
                Err(err) => {
                    let err = EngineError::Socket(err);
                    conn.fire_transport_error(&err);
                    self.teardown(slot);
                    return;
                }
            }
        }

        match conn.process_buffer() {
            ProcessResult::Open => {}
            ProcessResult::CloseAfterFlush => conn.close_after_write = true,
            ProcessResult::Teardown => {
                self.teardown(slot);
                return;
            }
        }

        match conn.write_outgoing() {
            Ok(pending) => {
                if !pending && conn.close_after_write {
                    self.teardown(slot);
                    return;
                }
            }
            Err(err) => {
                let err = EngineError::Socket(err);
                conn.fire_transport_error(&err);
                self.teardown(slot);
                return;
            }
        }

        if eof {
            // Peer closed; anything unflushed is already queued, and
            // no further requests can arrive.
            if self.connections[slot]
                .as_ref()
                .map(|conn| conn.outgoing.is_empty())
                .unwrap_or(true)
            {
                self.teardown(slot);
            } else if let Some(conn) = self.connections[slot].as_mut() {
                conn.close_after_write = true;
            }
        }
    }

    fn sweep_idle(&mut self) {
        let now = Instant::now();
        let expired: Vec<usize> = self
            .connections
            .iter()
            .enumerate()
            .filter_map(|(slot, conn)| match conn {
                Some(conn) if conn.idle_deadline_exceeded(now) => Some(slot),
                _ => None,
            })
            .collect();
        for slot in expired {
            debug!("closing idle connection in slot {slot}");
            self.teardown(slot);
        }
    }

    fn teardown(&mut self, slot: usize) {
        if let Some(Some(mut conn)) = self.connections.get_mut(slot).map(Option::take) {
            conn.run_fini_hooks();
            let registry = self.poll.registry();
            let _ = match &mut conn.stream {
                Stream::Tcp(stream) => registry.deregister(stream),
                Stream::Unix(stream) => registry.deregister(stream),
                Stream::Tls(stream) => registry.deregister(stream.socket_mut()),
            };
            self.free_slots.push(slot);
        }
    }

    fn teardown_all(&mut self) {
        let slots: Vec<usize> = (0..self.connections.len())
            .filter(|slot| self.connections[*slot].is_some())
            .collect();
        for slot in slots {
            self.teardown(slot);
        }
        let _ = self.unbind();
    }
}

fn resolve_addr(spec: &str, port: u16) -> EngineResult<SocketAddr> {
    if let Some(v6) = spec.strip_prefix("ipv6:") {
        let ip: std::net::Ipv6Addr = v6
            .parse()
            .map_err(|_| EngineError::Config(format!("bad ipv6 address: {v6}")))?;
        return Ok(SocketAddr::new(ip.into(), port));
    }
    if let Ok(ip) = spec.parse::<std::net::IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (spec, port)
        .to_socket_addrs()
        .map_err(|err| EngineError::Config(format!("cannot resolve {spec}: {err}")))?
        .next()
        .ok_or_else(|| EngineError::Config(format!("no addresses for {spec}")))
}

pub(crate) fn open_listener(spec: &str, port: u16, backlog: i32) -> EngineResult<Listener> {
    if let Some(path) = spec.strip_prefix("unix:") {
        let listener = open_unix_listener(path, backlog)?;
        return Ok(Listener::Unix(mio::net::UnixListener::from_std(listener)));
    }
    let addr = resolve_addr(spec, port)?;
    let listener = open_tcp_listener(addr, backlog)?;
    Ok(Listener::Tcp(mio::net::TcpListener::from_std(listener)))
}

// The listener sockets are opened at the libc level so the caller's
// backlog is honored exactly.
pub(crate) fn open_tcp_listener(
    addr: SocketAddr,
    backlog: i32,
) -> std::io::Result<std::net::TcpListener> {
    let family = match addr {
        SocketAddr::V4(_) => libc::AF_INET,
        SocketAddr::V6(_) => libc::AF_INET6,
    };
    unsafe {
        let fd = libc::socket(family, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let one: libc::c_int = 1;
        if libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        ) < 0
        {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        let result = match addr {
            SocketAddr::V4(v4) => {
                let mut sin: libc::sockaddr_in = std::mem::zeroed();
                sin.sin_family = libc::AF_INET as libc::sa_family_t;
                sin.sin_port = v4.port().to_be();
                sin.sin_addr.s_addr = u32::from(*v4.ip()).to_be();
                libc::bind(
                    fd,
                    &sin as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                )
            }
            SocketAddr::V6(v6) => {
                let mut sin6: libc::sockaddr_in6 = std::mem::zeroed();
                sin6.sin6_family = libc::AF_INET6 as libc::sa_family_t;
                sin6.sin6_port = v6.port().to_be();
                sin6.sin6_addr.s6_addr = v6.ip().octets();
                sin6.sin6_scope_id = v6.scope_id();
                libc::bind(
                    fd,
                    &sin6 as *const _ as *const libc::sockaddr,
                    std::mem::size_of::<libc::sockaddr_in6>() as libc::socklen_t,
                )
            }
        };
        if result < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }

        if libc::listen(fd, backlog) < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        if libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        Ok(std::net::TcpListener::from_raw_fd(fd))
    }
}

fn open_unix_listener(path: &str, backlog: i32) -> std::io::Result<std::os::unix::net::UnixListener> {
    // A stale socket file from a previous run blocks bind.
    let _ = std::fs::remove_file(path);
    unsafe {
        let fd = libc::socket(libc::AF_UNIX, libc::SOCK_STREAM | libc::SOCK_CLOEXEC, 0);
        if fd < 0 {
            return Err(std::io::Error::last_os_error());
        }
        let mut sun: libc::sockaddr_un = std::mem::zeroed();
        sun.sun_family = libc::AF_UNIX as libc::sa_family_t;
        let bytes = path.as_bytes();
        if bytes.len() >= sun.sun_path.len() {
            libc::close(fd);
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "unix socket path too long",
            ));
        }
        for (idx, byte) in bytes.iter().enumerate() {
            sun.sun_path[idx] = *byte as libc::c_char;
        }
        let len = std::mem::size_of::<libc::sa_family_t>() + bytes.len() + 1;
        if libc::bind(fd, &sun as *const _ as *const libc::sockaddr, len as libc::socklen_t) < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        if libc::listen(fd, backlog) < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        if libc::fcntl(fd, libc::F_SETFL, libc::O_NONBLOCK) < 0 {
            let err = std::io::Error::last_os_error();
            libc::close(fd);
            return Err(err);
        }
        Ok(std::os::unix::net::UnixListener::from_raw_fd(fd))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_spec_forms() {
        let addr = resolve_addr("127.0.0.1", 8080).expect("v4");
        assert!(addr.is_ipv4());
        assert_eq!(addr.port(), 8080);

        let addr = resolve_addr("ipv6:::1", 9090).expect("v6");
        assert!(addr.is_ipv6());
        assert_eq!(addr.port(), 9090);

        assert!(resolve_addr("ipv6:not-an-address", 1).is_err());
    }

    #[test]
    fn tcp_listener_honors_bind() {
        let listener =
            open_tcp_listener("127.0.0.1:0".parse().expect("addr"), 16).expect("listener");
        let local = listener.local_addr().expect("local addr");
        assert_ne!(local.port(), 0);
    }

    #[test]
    fn stale_resume_handle_skips_recycled_slot() {
        let mut event_loop = EventLoop::new(Server::new()).expect("event loop");
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("listener");
        let addr = listener.local_addr().expect("local addr");

        let _client_a = std::net::TcpStream::connect(addr).expect("client a");
        let (sock_a, _) = listener.accept().expect("accept a");
        sock_a.set_nonblocking(true).expect("nonblocking a");
        event_loop.adopt(HandedSocket::Tcp(sock_a)).expect("adopt a");
        let stale = {
            let conn = event_loop.connections[0].as_mut().expect("conn a");
            conn.paused = true;
            ResumeHandle::new(event_loop.shared.clone(), 0, conn.generation)
        };
        event_loop.teardown(0);

        let _client_b = std::net::TcpStream::connect(addr).expect("client b");
        let (sock_b, _) = listener.accept().expect("accept b");
        sock_b.set_nonblocking(true).expect("nonblocking b");
        event_loop.adopt(HandedSocket::Tcp(sock_b)).expect("adopt b");
        let occupant = event_loop.connections[0].as_mut().expect("slot reused");
        occupant.paused = true;

        // The first connection's handle targets the same slot index but
        // an older generation; it must not touch the new occupant.
        stale.resume();
        event_loop.drain_resumes();
        let occupant = event_loop.connections[0].as_ref().expect("conn b");
        assert!(occupant.paused, "stale handle resumed a recycled slot");

        let fresh = ResumeHandle::new(event_loop.shared.clone(), 0, occupant.generation);
        fresh.resume();
        event_loop.drain_resumes();
        let occupant = event_loop.connections[0].as_ref().expect("conn b");
        assert!(!occupant.paused);
    }

    #[test]
    fn unix_listener_binds_and_rebinds() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.sock");
        let path = path.to_str().expect("utf8 path");
        let first = open_unix_listener(path, 8).expect("first bind");
        drop(first);
        // Stale socket file must not block a rebind.
        let _second = open_unix_listener(path, 8).expect("rebind");
    }
}
