use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::{info, warn};
use mio::{Events, Poll, Token, Waker};

use crate::error::{EngineError, EngineResult};
use crate::event_loop::{open_listener, EventLoop, Listener, LoopHandle};
use crate::server::Server;

const LISTENER: Token = Token(0);
const WAKER: Token = Token(1);

/// Runs once on each worker thread before its loop starts, with the
/// worker index.
pub type ThreadInit = Arc<dyn Fn(usize) + Send + Sync>;

/// Cross-thread shutdown control for a running dispatcher.
#[derive(Clone)]
pub struct DispatcherHandle {
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl DispatcherHandle {
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        let _ = self.waker.wake();
    }
}

struct Worker {
    handle: LoopHandle,
    join: JoinHandle<()>,
}

/// Accept-and-distribute front end: one acceptor thread owns the
/// listener and hands sockets round-robin to a pool of worker event
/// loops. Each accepted connection lives on exactly one worker.
pub struct Dispatcher {
    poll: Poll,
    events: Events,
    listener: Option<Listener>,
    server: Server,
    threads: usize,
    thread_init: Option<ThreadInit>,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Dispatcher {
    pub fn new(server: Server) -> EngineResult<Self> {
        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER)?);
        Ok(Self {
            poll,
            events: Events::with_capacity(256),
            listener: None,
            server,
            threads: 1,
            thread_init: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            waker,
        })
    }

    /// Worker thread count and optional per-thread init; takes effect
    /// at [`Dispatcher::run`].
    pub fn use_threads(&mut self, count: usize, init: Option<ThreadInit>) {
        self.threads = count.max(1);
        self.thread_init = init;
    }

    pub fn handle(&self) -> DispatcherHandle {
        DispatcherHandle {
            shutdown: self.shutdown.clone(),
            waker: self.waker.clone(),
        }
    }

    /// Bound TCP address, once `bind` succeeded with a TCP spec.
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        match &self.listener {
            Some(Listener::Tcp(listener)) => listener.local_addr().ok(),
            _ => None,
        }
    }

    /// `bind` with TLS material installed on the server first; every
    /// worker wraps its accepted sockets.
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

    pub fn bind(&mut self, spec: &str, port: u16, backlog: i32) -> EngineResult<()> {
        if self.listener.is_some() {
            return Err(EngineError::Config("listener already bound".to_string()));
        }
        let mut listener = open_listener(spec, port, backlog)?;
        listener.register(self.poll.registry(), LISTENER)?;
        info!("dispatcher listening on {spec}:{port} (backlog {backlog})");
        self.listener = Some(listener);
        Ok(())
    }

    /// Spawn the workers and run the acceptor until shutdown. Workers
    /// are drained and joined before this returns.
    pub fn run(&mut self) -> EngineResult<()> {
        let tls = match self.server.inner.tls_config() {
            Some(config) => Some(config.build()?),
            None => None,
        };

        let mut workers = Vec::with_capacity(self.threads);
        for idx in 0..self.threads {
            let mut worker_loop = EventLoop::new(self.server.clone())?;
            if let Some(tls) = &tls {
                worker_loop.set_tls_runtime(tls.clone());
            }
            let handle = worker_loop.handle();
            let init = self.thread_init.clone();
            let join = std::thread::Builder::new()
                .name(format!("engine-worker-{idx}"))
                .spawn(move || {
                    if let Some(init) = init {
                        init(idx);
                    }
                    if let Err(err) = worker_loop.run() {
                        warn!("worker {idx} exited with error: {err}");
                    }
                })?;
            workers.push(Worker { handle, join });
        }
        info!("dispatcher running with {} worker(s)", workers.len());

        let mut next_worker = 0usize;
        loop {
            self.poll.poll(&mut self.events, None)?;
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let mut accept_ready = false;
            for event in self.events.iter() {
                if event.token() == LISTENER {
                    accept_ready = true;
                }
            }
            if accept_ready {
                while let Some(listener) = &mut self.listener {
                    let Some(sock) = listener.accept_handed()? else {
                        break;
                    };
                    workers[next_worker].handle.push_socket(sock);
                    next_worker = (next_worker + 1) % workers.len();
                }
            }
        }

        if let Some(mut listener) = self.listener.take() {
            let _ = listener.deregister(self.poll.registry());
        }
        for worker in &workers {
            worker.handle.shutdown();
        }
        for worker in workers {
            if worker.join.join().is_err() {
                warn!("a worker thread panicked during shutdown");
            }
        }
        Ok(())
    }
}
