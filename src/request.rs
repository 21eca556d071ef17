use std::collections::VecDeque;
use std::io::{Read, Write};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, trace, warn};

use crate::error::EngineError;
use crate::event_loop::{LoopShared, ResumeHandle};
use crate::hooks::{self, HookData, HookOutcome, HookTable, HookType};
use crate::keyval::KeyVal;
use crate::router::{Callback, Handler};
use crate::server::{ConfigSnapshot, ServerInner};
use crate::tls::TlsStream;
use crate::tokenizer::{FeedState, MessageMeta, TokenError, TokenFlow, TokenSink, Tokenizer};
use crate::uri::Uri;

pub(crate) enum Stream {
    Tcp(mio::net::TcpStream),
    Unix(mio::net::UnixStream),
    Tls(Box<TlsStream>),
}

impl Stream {
    pub(crate) fn sni(&self) -> Option<&str> {
        match self {
            Stream::Tls(tls) => tls.sni(),
            _ => None,
        }
    }

    pub(crate) fn wants_write(&self) -> bool {
        matches!(self, Stream::Tls(tls) if tls.wants_write())
    }
}

impl Read for Stream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.read(buf),
            Stream::Unix(stream) => stream.read(buf),
            Stream::Tls(stream) => stream.read(buf),
        }
    }
}

impl Write for Stream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        match self {
            Stream::Tcp(stream) => stream.write(buf),
            Stream::Unix(stream) => stream.write(buf),
            Stream::Tls(stream) => stream.write(buf),
        }
    }

    fn flush(&mut self) -> std::io::Result<()> {
        match self {
            Stream::Tls(stream) => stream.flush(),
            _ => Ok(()),
        }
    }
}

pub(crate) struct Outgoing {
    pub(crate) data: Vec<u8>,
    pub(crate) offset: usize,
}

/// One HTTP transaction. Owned by its connection; handlers and hooks
/// borrow it for the duration of a single call.
pub struct Request {
    pub(crate) method: String,
    pub(crate) version_minor: u8,
    pub(crate) uri: Uri,
    pub(crate) headers_in: KeyVal,
    pub(crate) headers_out: KeyVal,
    pub(crate) body: Vec<u8>,
    /// Payload staging area for fixed-length replies.
    pub(crate) buffer_out: Vec<u8>,
    /// Wire-ready reply bytes, drained into the connection's write queue.
    pub(crate) output: Vec<u8>,
    pub(crate) status: u16,
    pub(crate) keepalive: bool,
    pub(crate) finished: bool,
    pub(crate) reply_started: bool,
    pub(crate) chunked_reply: bool,
    pub(crate) paused: bool,
    pub(crate) hooks: Option<Box<HookTable>>,
    pub(crate) matched: Option<Arc<Callback>>,
    pub(crate) handler: Option<Handler>,
    pub(crate) match_start: usize,
    pub(crate) match_end: usize,
    resume: ResumeHandle,
    partial_key: Option<String>,
}

impl Request {
    pub(crate) fn new(resume: ResumeHandle) -> Self {
        Self {
            method: String::new(),
            version_minor: 1,
            uri: Uri::default(),
            headers_in: KeyVal::new(),
            headers_out: KeyVal::new(),
            body: Vec::new(),
            buffer_out: Vec::new(),
            output: Vec::new(),
            status: 0,
            keepalive: true,
            finished: false,
            reply_started: false,
            chunked_reply: false,
            paused: false,
            hooks: None,
            matched: None,
            handler: None,
            match_start: 0,
            match_end: 0,
            resume,
            partial_key: None,
        }
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn version_minor(&self) -> u8 {
        self.version_minor
    }

    pub fn protocol(&self) -> String {
        format!("HTTP/1.{}", self.version_minor)
    }

    pub fn uri(&self) -> &Uri {
        &self.uri
    }

    pub fn headers(&self) -> &KeyVal {
        &self.headers_in
    }

    pub fn headers_out(&self) -> &KeyVal {
        &self.headers_out
    }

    pub fn headers_out_mut(&mut self) -> &mut KeyVal {
        &mut self.headers_out
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn take_body(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.body)
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn keepalive(&self) -> bool {
        self.keepalive
    }

    pub fn matched_callback(&self) -> Option<&Arc<Callback>> {
        self.matched.as_ref()
    }

    /// Path bytes before the matched sub-range (consumed by a leading
    /// wildcard).
    pub fn matched_prefix(&self) -> &str {
        &self.uri.path.full[..self.match_start.min(self.uri.path.full.len())]
    }

    /// Path bytes after the matched sub-range; for an entry on `/foo/`
    /// matching `/foo/bar` this is `bar`.
    pub fn matched_suffix(&self) -> &str {
        &self.uri.path.full[self.match_end.min(self.uri.path.full.len())..]
    }

    /// Stage payload bytes for a later `send_reply`.
    pub fn write_body(&mut self, data: &[u8]) {
        self.buffer_out.extend_from_slice(data);
    }

    /// Transient request-scope hook override, consulted before the
    /// matched callback's table and the connection table.
    pub fn set_hook(&mut self, ty: HookType, hook: crate::hooks::HookFn) {
        self.hooks.get_or_insert_with(Default::default).set(ty, hook);
    }

    pub fn unset_hook(&mut self, ty: HookType) {
        if let Some(table) = self.hooks.as_deref_mut() {
            table.unset(ty);
        }
    }

    pub fn unset_all_hooks(&mut self) {
        self.hooks = None;
    }

    /// Suspend input processing on this connection once the current
    /// handler or hook returns. Resume with the handle from
    /// [`Request::resume_handle`].
    pub fn pause(&mut self) {
        self.paused = true;
    }

    /// Cross-thread-safe handle that re-enters the protocol state
    /// machine with any undrained bytes.
    pub fn resume_handle(&self) -> ResumeHandle {
        self.resume.clone()
    }
}

/// What the event loop should do with a connection after a processing
/// step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ProcessResult {
    Open,
    /// Flush queued output, then close.
    CloseAfterFlush,
    /// Tear down immediately, without a response.
    Teardown,
}

/// One accepted socket: buffers, tokenizer, the live request (at most
/// one), hook table, and keep-alive accounting.
pub(crate) struct Connection {
    pub(crate) stream: Stream,
    pub(crate) buffer: Vec<u8>,
    pub(crate) outgoing: VecDeque<Outgoing>,
    tokenizer: Tokenizer,
    pub(crate) request: Option<Request>,
    pub(crate) hooks: HookTable,
    root: Arc<ServerInner>,
    active: Arc<ServerInner>,
    sni_vhost: bool,
    requests_served: u32,
    body_bytes: u64,
    pub(crate) close_after_write: bool,
    pub(crate) paused: bool,
    slot: usize,
    pub(crate) generation: u64,
    shared: Arc<LoopShared>,
    cfg: ConfigSnapshot,
    pub(crate) last_activity: Instant,
}

impl Connection {
    pub(crate) fn new(
        stream: Stream,
        root: Arc<ServerInner>,
        shared: Arc<LoopShared>,
        slot: usize,
        generation: u64,
    ) -> Self {
        let cfg = root.config_snapshot();
        let hooks = root.connection_hooks();
        Self {
            stream,
            buffer: Vec::new(),
            outgoing: VecDeque::new(),
            tokenizer: Tokenizer::new(cfg.max_body_size),
            request: None,
            hooks,
            active: root.clone(),
            root,
            sni_vhost: false,
            requests_served: 0,
            body_bytes: 0,
            close_after_write: false,
            paused: false,
            slot,
            generation,
            shared,
            cfg,
            last_activity: Instant::now(),
        }
    }

    pub(crate) fn wants_write(&self) -> bool {
        !self.outgoing.is_empty() || self.stream.wants_write()
    }

    fn fire_hook(&mut self, ty: HookType, data: &HookData<'_>) -> HookOutcome {
        let hook = {
            let request_table = self.request.as_ref().and_then(|req| req.hooks.as_deref());
            let callback = self.request.as_ref().and_then(|req| req.matched.as_ref());
            let callback_guard = callback.map(|cb| cb.hooks_guard());
            hooks::resolve(request_table, callback_guard.as_deref(), &self.hooks, ty)
        };
        match hook {
            Some(hook) => hook(self.request.as_mut(), data),
            None => HookOutcome::Ok,
        }
    }

    fn flow(&mut self, outcome: HookOutcome) -> TokenFlow {
        match outcome {
            HookOutcome::Ok => TokenFlow::Continue,
            HookOutcome::Pause => {
                self.suspend();
                TokenFlow::Pause
            }
            HookOutcome::Abort => TokenFlow::Abort,
        }
    }

    fn suspend(&mut self) {
        self.paused = true;
        if let Some(req) = self.request.as_mut() {
            req.paused = true;
        }
    }

    pub(crate) fn clear_pause(&mut self) {
        self.paused = false;
        if let Some(req) = self.request.as_mut() {
            req.paused = false;
        }
    }

    fn queue_output(&mut self, data: Vec<u8>) {
        if !data.is_empty() {
            self.outgoing.push_back(Outgoing { data, offset: 0 });
        }
    }

    fn flush_request_output(&mut self) {
        if let Some(req) = self.request.as_mut() {
            if !req.output.is_empty() {
                let data = std::mem::take(&mut req.output);
                self.outgoing.push_back(Outgoing { data, offset: 0 });
            }
        }
    }

    fn resolve_route(&mut self) {
        if let Some(req) = self.request.as_mut() {
            let full = req.uri.path.full.clone();
            let dir = req.uri.path.path.clone();
            match self.active.resolve_route(&full, &dir) {
                Some(matched) => {
                    req.matched = matched.callback;
                    req.handler = Some(matched.handler);
                    req.match_start = matched.match_start;
                    req.match_end = matched.match_end;
                }
                None => {
                    trace!("no route for {full}");
                    req.matched = None;
                    req.handler = None;
                    req.match_start = 0;
                    req.match_end = full.len();
                }
            }
        }
    }

    // Virtual-host selection. SNI always wins over the Host header and
    // pins the connection's routing table for its lifetime; a
    // Host-header switch is undone at the next keep-alive boundary.
    fn select_vhost(&mut self) -> TokenFlow {
        let sni = if self.cfg.sni_vhosts {
            self.stream.sni().map(str::to_string)
        } else {
            None
        };
        let (name, via_sni) = match sni {
            Some(name) => (Some(name), true),
            None => (
                self.request
                    .as_ref()
                    .and_then(|req| req.headers_in.get("host"))
                    .map(strip_host_port)
                    .map(str::to_string),
                false,
            ),
        };
        let Some(name) = name else {
            return TokenFlow::Continue;
        };
        if self.sni_vhost {
            // Already pinned by SNI; routing ran on the vhost registry.
            let outcome = self.fire_hook(HookType::Hostname, &HookData::Hostname(&name));
            return self.flow(outcome);
        }
        if let Some(vhost) = self.root.find_vhost(&name) {
            self.active = vhost;
            self.sni_vhost = via_sni;
            self.resolve_route();
            let outcome = self.fire_hook(HookType::Hostname, &HookData::Hostname(&name));
            return self.flow(outcome);
        }
        TokenFlow::Continue
    }

    fn dispatch(&mut self) -> TokenFlow {
        if let Some(req) = self.request.as_mut() {
            // Compatibility heuristic: a form-encoded body stands in
            // for a missing query string.
            let form = req
                .headers_in
                .get("content-type")
                .map(|ct| ct.trim_start().starts_with("application/x-www-form-urlencoded"))
                .unwrap_or(false);
            if form && req.uri.query_raw.is_empty() && !req.body.is_empty() {
                let raw = String::from_utf8_lossy(&req.body).into_owned();
                req.uri.set_query(&raw);
            }
        }
        let handler = self.request.as_ref().and_then(|req| req.handler.clone());
        match handler {
            Some(handler) => {
                if let Some(req) = self.request.as_mut() {
                    handler(req);
                }
            }
            None => {
                if let Some(req) = self.request.as_mut() {
                    req.send_reply(404);
                }
            }
        }
        if self.request.as_ref().map(|req| req.paused).unwrap_or(false) {
            self.suspend();
            return TokenFlow::Pause;
        }
        TokenFlow::Continue
    }

    /// Close out a completed transaction: flush the reply, decide
    /// keep-alive, restore the routing table, and rearm the tokenizer.
    fn finalize(&mut self) -> ProcessResult {
        self.flush_request_output();
        let Some(req) = self.request.as_ref() else {
            return ProcessResult::Open;
        };
        if !req.finished {
            if req.paused {
                return ProcessResult::Open;
            }
            warn!(
                "handler for {} returned without replying or pausing",
                req.uri.path.full
            );
            let _ = self.fire_hook(HookType::RequestFini, &HookData::None);
            self.request = None;
            return ProcessResult::CloseAfterFlush;
        }
        self.requests_served += 1;
        let keepalive = req.keepalive;
        let _ = self.fire_hook(HookType::RequestFini, &HookData::None);
        self.request = None;
        if !keepalive {
            return ProcessResult::CloseAfterFlush;
        }
        if !self.sni_vhost {
            if let Some(parent) = self.active.parent() {
                self.active = parent;
            }
        }
        self.tokenizer.reset();
        ProcessResult::Open
    }

    /// Drive buffered input through the tokenizer until it runs dry,
    /// pauses, or fails. Buffered keep-alive requests are handled back
    /// to back.
    pub(crate) fn process_buffer(&mut self) -> ProcessResult {
        loop {
            if self.paused {
                return ProcessResult::Open;
            }
            let mut tokenizer = std::mem::take(&mut self.tokenizer);
            let buffer = std::mem::take(&mut self.buffer);
            let result = tokenizer.feed(&buffer, self);
            self.tokenizer = tokenizer;
            self.buffer = buffer;
            match result {
                Ok(outcome) => {
                    self.buffer.drain(..outcome.consumed);
                    match outcome.state {
                        FeedState::NeedMore | FeedState::Paused => {
                            self.flush_request_output();
                            return ProcessResult::Open;
                        }
                        FeedState::Complete => {
                            let result = self.finalize();
                            if result != ProcessResult::Open {
                                return result;
                            }
                            if self.request.is_some() {
                                // Paused at message end; resume finishes.
                                return ProcessResult::Open;
                            }
                            if self.buffer.is_empty() {
                                return ProcessResult::Open;
                            }
                        }
                    }
                }
                Err(TokenError::Parse(reason)) => {
                    warn!("closing connection on malformed input: {reason}");
                    return ProcessResult::Teardown;
                }
                Err(TokenError::DataTooLong) => {
                    let err = EngineError::DataTooLong;
                    warn!("closing connection: {err}");
                    let _ = self.fire_hook(HookType::Error, &HookData::Error(&err));
                    self.flush_request_output();
                    if self.outgoing.is_empty() {
                        return ProcessResult::Teardown;
                    }
                    return ProcessResult::CloseAfterFlush;
                }
                Err(TokenError::Aborted) => {
                    let err = EngineError::HookAbort(HookType::Read);
                    debug!("hook aborted transaction");
                    let _ = self.fire_hook(HookType::Error, &HookData::Error(&err));
                    return ProcessResult::Teardown;
                }
            }
        }
    }

    /// Drain the socket into the parse buffer. Returns false on EOF.
    pub(crate) fn fill_from_socket(&mut self) -> std::io::Result<bool> {
        let mut temp = [0_u8; 4096];
        loop {
            match self.stream.read(&mut temp) {
                Ok(0) => return Ok(false),
                Ok(read) => {
                    self.buffer.extend_from_slice(&temp[..read]);
                    self.last_activity = Instant::now();
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => return Ok(true),
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
    }

    /// Write queued output. Returns true while bytes remain queued.
    pub(crate) fn write_outgoing(&mut self) -> std::io::Result<bool> {
        while let Some(front) = self.outgoing.front_mut() {
            match self.stream.write(&front.data[front.offset..]) {
                Ok(0) => break,
                Ok(written) => {
                    front.offset += written;
                    self.last_activity = Instant::now();
                    if front.offset >= front.data.len() {
                        self.outgoing.pop_front();
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(err),
            }
        }
        self.stream.flush()?;
        if self.outgoing.is_empty() {
            let _ = self.fire_hook(HookType::Write, &HookData::None);
        }
        Ok(!self.outgoing.is_empty())
    }

    /// Deterministic teardown: fini hooks run exactly once, buffers are
    /// released with the connection.
    pub(crate) fn run_fini_hooks(&mut self) {
        if self.request.is_some() {
            let _ = self.fire_hook(HookType::RequestFini, &HookData::None);
            self.request = None;
        }
        let _ = self.fire_hook(HookType::ConnectionFini, &HookData::None);
        debug!(
            "connection closed after {} request(s), {} body byte(s)",
            self.requests_served, self.body_bytes
        );
    }

    pub(crate) fn fire_transport_error(&mut self, err: &EngineError) {
        let _ = self.fire_hook(HookType::Error, &HookData::Error(err));
    }

    pub(crate) fn idle_deadline_exceeded(&self, now: Instant) -> bool {
        let limit = if self.wants_write() {
            self.cfg.write_timeout.or(self.cfg.read_timeout)
        } else {
            self.cfg.read_timeout
        };
        match limit {
            Some(limit) => now.duration_since(self.last_activity) > limit,
            None => false,
        }
    }
}

// Keep-alive is the HTTP/1.1 default unless the client opts out;
// HTTP/1.0 requires an explicit opt-in.
fn should_keep_alive(version_minor: u8, connection_header: Option<&str>) -> bool {
    let connection = connection_header.unwrap_or_default().to_ascii_lowercase();
    if version_minor == 1 {
        !connection.contains("close")
    } else {
        connection.contains("keep-alive")
    }
}

fn strip_host_port(host: &str) -> &str {
    if let Some(end) = host.rfind(']') {
        // Bracketed IPv6 literal, with or without a port.
        return &host[..=end];
    }
    match host.rfind(':') {
        Some(idx) => &host[..idx],
        None => host,
    }
}

impl TokenSink for Connection {
    fn on_start(&mut self) -> TokenFlow {
        let resume = ResumeHandle::new(self.shared.clone(), self.slot, self.generation);
        self.request = Some(Request::new(resume));
        let outcome = self.fire_hook(HookType::HeadersStart, &HookData::None);
        self.flow(outcome)
    }

    fn on_path(&mut self, raw_path: &str) -> TokenFlow {
        if let Some(req) = self.request.as_mut() {
            req.uri = Uri::parse(raw_path);
        }
        self.resolve_route();
        let outcome = self.fire_hook(HookType::Path, &HookData::Path(raw_path));
        self.flow(outcome)
    }

    fn on_args(&mut self, raw_query: &str) -> TokenFlow {
        if let Some(req) = self.request.as_mut() {
            req.uri.set_query(raw_query);
        }
        TokenFlow::Continue
    }

    fn on_header_key(&mut self, key: &str) -> TokenFlow {
        if let Some(req) = self.request.as_mut() {
            req.partial_key = Some(key.to_string());
        }
        TokenFlow::Continue
    }

    fn on_header_value(&mut self, value: &str) -> TokenFlow {
        let key = self.request.as_mut().and_then(|req| {
            let key = req.partial_key.take()?;
            req.headers_in.push(key.clone(), value);
            Some(key)
        });
        match key {
            Some(key) => {
                let outcome =
                    self.fire_hook(HookType::Header, &HookData::Header { key: &key, value });
                self.flow(outcome)
            }
            None => TokenFlow::Continue,
        }
    }

    fn on_headers_complete(&mut self, meta: &MessageMeta) -> TokenFlow {
        let over_cap = self
            .cfg
            .max_keepalive_requests
            .map(|cap| self.requests_served >= cap)
            .unwrap_or(false);
        if let Some(req) = self.request.as_mut() {
            req.method = meta.method.clone();
            req.version_minor = meta.version_minor;
            req.keepalive =
                should_keep_alive(meta.version_minor, req.headers_in.get("connection"));
            if over_cap {
                req.keepalive = false;
            }
        }
        // Queued before any hook gets a chance to pause: the
        // headers-complete event is delivered exactly once, so a
        // later emission point would be skipped on resume.
        if meta.expect_continue && meta.version_minor >= 1 {
            self.queue_output(b"HTTP/1.1 100 Continue\r\n\r\n".to_vec());
        }
        let flow = self.select_vhost();
        if flow != TokenFlow::Continue {
            return flow;
        }
        let outcome = self.fire_hook(HookType::Headers, &HookData::None);
        self.flow(outcome)
    }

    fn on_body_chunk(&mut self, data: &[u8]) -> TokenFlow {
        self.body_bytes += data.len() as u64;
        if let Some(req) = self.request.as_mut() {
            req.body.extend_from_slice(data);
        }
        let outcome = self.fire_hook(HookType::Read, &HookData::Body(data));
        self.flow(outcome)
    }

    fn on_chunk_start(&mut self, size: u64) -> TokenFlow {
        let outcome = self.fire_hook(HookType::NewChunk, &HookData::ChunkLen(size));
        self.flow(outcome)
    }

    fn on_chunk_end(&mut self) -> TokenFlow {
        let outcome = self.fire_hook(HookType::ChunkComplete, &HookData::None);
        self.flow(outcome)
    }

    fn on_chunks_complete(&mut self) -> TokenFlow {
        let outcome = self.fire_hook(HookType::ChunksComplete, &HookData::None);
        self.flow(outcome)
    }

    fn on_message_complete(&mut self) -> TokenFlow {
        self.dispatch()
    }
}
