use std::collections::VecDeque;

/// Flow signal handed back by a sink for every tokenizer event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenFlow {
    Continue,
    Pause,
    Abort,
}

/// Facts about a message known once the header block completes.
#[derive(Debug, Clone)]
pub struct MessageMeta {
    pub method: String,
    pub version_minor: u8,
    pub content_length: Option<u64>,
    pub chunked: bool,
    pub expect_continue: bool,
    /// Content-Type declares a `multipart/*` body.
    pub multipart: bool,
}

/// Receiver for the fixed tokenizer event set. Events for one message
/// arrive strictly in order: start, path, args, per-header key/value,
/// headers-complete, body/chunk events, message-complete.
pub trait TokenSink {
    fn on_start(&mut self) -> TokenFlow;
    fn on_path(&mut self, raw_path: &str) -> TokenFlow;
    fn on_args(&mut self, raw_query: &str) -> TokenFlow;
    fn on_header_key(&mut self, key: &str) -> TokenFlow;
    fn on_header_value(&mut self, value: &str) -> TokenFlow;
    fn on_headers_complete(&mut self, meta: &MessageMeta) -> TokenFlow;
    fn on_body_chunk(&mut self, data: &[u8]) -> TokenFlow;
    fn on_chunk_start(&mut self, size: u64) -> TokenFlow;
    fn on_chunk_end(&mut self) -> TokenFlow;
    fn on_chunks_complete(&mut self) -> TokenFlow;
    fn on_message_complete(&mut self) -> TokenFlow;
}

#[derive(Debug, PartialEq, Eq)]
pub enum TokenError {
    Parse(&'static str),
    DataTooLong,
    Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedState {
    /// All fed bytes handled, message still incomplete.
    NeedMore,
    /// A sink callback asked to suspend; unconsumed bytes stay with the caller.
    Paused,
    /// The message is complete; call `reset` before the next one.
    Complete,
}

#[derive(Debug)]
pub struct FeedOutcome {
    pub consumed: usize,
    pub state: FeedState,
}

// Header events are replayed from owned copies so a pause mid-batch
// resumes exactly after the last delivered event.
enum PendingEvent {
    Start,
    Path(String),
    Args(String),
    HeaderKey(String),
    HeaderValue(String),
    HeadersComplete(MessageMeta),
}

enum State {
    Headers,
    Emit,
    Body,
    ChunkSize,
    ChunkData,
    ChunkDataCrlf,
    Trailer,
    Done,
}

enum Step {
    Go,
    Return(FeedState),
}

fn apply(flow: TokenFlow) -> Result<Step, TokenError> {
    match flow {
        TokenFlow::Continue => Ok(Step::Go),
        TokenFlow::Pause => Ok(Step::Return(FeedState::Paused)),
        TokenFlow::Abort => Err(TokenError::Aborted),
    }
}

const MAX_HEADERS: usize = 64;
const MAX_CHUNK_SIZE_LINE: usize = 32;

/// Incremental push driver over httparse. The caller feeds whatever
/// bytes it has; the driver reports how many it consumed so partially
/// delivered messages pick up where they left off, including across a
/// pause. Events are emitted exactly once per message.
pub struct Tokenizer {
    state: State,
    pending: VecDeque<PendingEvent>,
    remaining: u64,
    chunked: bool,
    body_cap: Option<u64>,
    body_seen: u64,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new(None)
    }
}

impl Tokenizer {
    pub fn new(body_cap: Option<u64>) -> Self {
        Self {
            state: State::Headers,
            pending: VecDeque::new(),
            remaining: 0,
            chunked: false,
            body_cap,
            body_seen: 0,
        }
    }

    pub fn set_body_cap(&mut self, cap: Option<u64>) {
        self.body_cap = cap;
    }

    /// Prepare for the next message on the same connection.
    pub fn reset(&mut self) {
        self.state = State::Headers;
        self.pending.clear();
        self.remaining = 0;
        self.chunked = false;
        self.body_seen = 0;
    }

    pub fn feed<S: TokenSink>(
        &mut self,
        buf: &[u8],
        sink: &mut S,
    ) -> Result<FeedOutcome, TokenError> {
        let mut consumed = 0;
        loop {
            match self.state {
                State::Headers => {
                    match self.parse_headers(&buf[consumed..])? {
                        Some(header_len) => {
                            consumed += header_len;
                            self.state = State::Emit;
                        }
                        None => return Ok(self.outcome(consumed, FeedState::NeedMore)),
                    }
                }
                State::Emit => {
                    while let Some(event) = self.pending.pop_front() {
                        let flow = match &event {
                            PendingEvent::Start => sink.on_start(),
                            PendingEvent::Path(path) => sink.on_path(path),
                            PendingEvent::Args(query) => sink.on_args(query),
                            PendingEvent::HeaderKey(key) => sink.on_header_key(key),
                            PendingEvent::HeaderValue(value) => sink.on_header_value(value),
                            PendingEvent::HeadersComplete(meta) => sink.on_headers_complete(meta),
                        };
                        match apply(flow)? {
                            Step::Go => {}
                            Step::Return(state) => return Ok(self.outcome(consumed, state)),
                        }
                    }
                    self.state = if self.chunked {
                        State::ChunkSize
                    } else if self.remaining > 0 {
                        State::Body
                    } else {
                        return self.finish(consumed, sink);
                    };
                }
                State::Body => {
                    let avail = (buf.len() - consumed) as u64;
                    if avail == 0 {
                        return Ok(self.outcome(consumed, FeedState::NeedMore));
                    }
                    let take = avail.min(self.remaining) as usize;
                    self.account_body(take as u64)?;
                    let flow = sink.on_body_chunk(&buf[consumed..consumed + take]);
                    consumed += take;
                    self.remaining -= take as u64;
                    match apply(flow)? {
                        Step::Go => {}
                        Step::Return(state) => return Ok(self.outcome(consumed, state)),
                    }
                    if self.remaining == 0 {
                        return self.finish(consumed, sink);
                    }
                }
                State::ChunkSize => {
                    let rest = &buf[consumed..];
                    let line_end = match find_crlf(rest) {
                        Some(idx) => idx,
                        None if rest.len() > MAX_CHUNK_SIZE_LINE => {
                            return Err(TokenError::Parse("chunk size line too long"))
                        }
                        None => return Ok(self.outcome(consumed, FeedState::NeedMore)),
                    };
                    let size = parse_chunk_size(&rest[..line_end])?;
                    consumed += line_end + 2;
                    if size == 0 {
                        self.state = State::Trailer;
                    } else {
                        self.remaining = size;
                        self.state = State::ChunkData;
                        match apply(sink.on_chunk_start(size))? {
                            Step::Go => {}
                            Step::Return(state) => return Ok(self.outcome(consumed, state)),
                        }
                    }
                }
                State::ChunkData => {
                    let avail = (buf.len() - consumed) as u64;
                    if avail == 0 {
                        return Ok(self.outcome(consumed, FeedState::NeedMore));
                    }
                    let take = avail.min(self.remaining) as usize;
                    self.account_body(take as u64)?;
                    let flow = sink.on_body_chunk(&buf[consumed..consumed + take]);
                    consumed += take;
                    self.remaining -= take as u64;
                    match apply(flow)? {
                        Step::Go => {}
                        Step::Return(state) => return Ok(self.outcome(consumed, state)),
                    }
                    if self.remaining == 0 {
                        self.state = State::ChunkDataCrlf;
                    }
                }
                State::ChunkDataCrlf => {
                    let rest = &buf[consumed..];
                    if rest.len() < 2 {
                        return Ok(self.outcome(consumed, FeedState::NeedMore));
                    }
                    if &rest[..2] != b"\r\n" {
                        return Err(TokenError::Parse("missing CRLF after chunk data"));
                    }
                    consumed += 2;
                    self.state = State::ChunkSize;
                    match apply(sink.on_chunk_end())? {
                        Step::Go => {}
                        Step::Return(state) => return Ok(self.outcome(consumed, state)),
                    }
                }
                State::Trailer => {
                    let rest = &buf[consumed..];
                    let line_end = match find_crlf(rest) {
                        Some(idx) => idx,
                        None => return Ok(self.outcome(consumed, FeedState::NeedMore)),
                    };
                    consumed += line_end + 2;
                    if line_end == 0 {
                        match apply(sink.on_chunks_complete())? {
                            Step::Go => {}
                            Step::Return(state) => return Ok(self.outcome(consumed, state)),
                        }
                        return self.finish(consumed, sink);
                    }
                    // Trailer headers are tolerated and dropped.
                }
                State::Done => return Ok(self.outcome(consumed, FeedState::Complete)),
            }
        }
    }

    fn finish<S: TokenSink>(
        &mut self,
        consumed: usize,
        sink: &mut S,
    ) -> Result<FeedOutcome, TokenError> {
        self.state = State::Done;
        match apply(sink.on_message_complete())? {
            Step::Go => Ok(self.outcome(consumed, FeedState::Complete)),
            Step::Return(state) => Ok(self.outcome(consumed, state)),
        }
    }

    fn outcome(&self, consumed: usize, state: FeedState) -> FeedOutcome {
        FeedOutcome { consumed, state }
    }

    fn account_body(&mut self, len: u64) -> Result<(), TokenError> {
        self.body_seen += len;
        match self.body_cap {
            Some(cap) if self.body_seen > cap => Err(TokenError::DataTooLong),
            _ => Ok(()),
        }
    }

    // Re-parses the whole unconsumed buffer on every feed, as the
    // underlying pull parser requires; events are queued exactly once,
    // on completion, so callers never observe duplicates.
    fn parse_headers(&mut self, buf: &[u8]) -> Result<Option<usize>, TokenError> {
        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        let status = request
            .parse(buf)
            .map_err(|_| TokenError::Parse("invalid request line or headers"))?;
        let header_len = match status {
            httparse::Status::Complete(len) => len,
            httparse::Status::Partial => return Ok(None),
        };

        let method = request
            .method
            .ok_or(TokenError::Parse("request line missing method"))?;
        let target = request
            .path
            .ok_or(TokenError::Parse("request line missing target"))?;
        let version_minor = request
            .version
            .ok_or(TokenError::Parse("request line missing version"))?;

        let mut content_length = None;
        let mut chunked = false;
        let mut expect_continue = false;
        let mut multipart = false;
        for header in request.headers.iter() {
            let value = String::from_utf8_lossy(header.value);
            if header.name.eq_ignore_ascii_case("content-length") {
                let parsed = value
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| TokenError::Parse("invalid content-length"))?;
                content_length = Some(parsed);
            } else if header.name.eq_ignore_ascii_case("transfer-encoding") {
                chunked = value.to_ascii_lowercase().contains("chunked");
            } else if header.name.eq_ignore_ascii_case("expect") {
                expect_continue = value.trim().eq_ignore_ascii_case("100-continue");
            } else if header.name.eq_ignore_ascii_case("content-type") {
                multipart = value
                    .trim_start()
                    .get(..10)
                    .map(|prefix| prefix.eq_ignore_ascii_case("multipart/"))
                    .unwrap_or(false);
            }
        }

        if let (Some(declared), Some(cap)) = (content_length, self.body_cap) {
            if declared > cap {
                return Err(TokenError::DataTooLong);
            }
        }

        self.pending.push_back(PendingEvent::Start);
        let (raw_path, raw_query) = match target.split_once('?') {
            Some((path, query)) => (path, Some(query)),
            None => (target, None),
        };
        self.pending.push_back(PendingEvent::Path(raw_path.to_string()));
        if let Some(query) = raw_query {
            self.pending.push_back(PendingEvent::Args(query.to_string()));
        }
        for header in request.headers.iter() {
            self.pending
                .push_back(PendingEvent::HeaderKey(header.name.to_string()));
            self.pending.push_back(PendingEvent::HeaderValue(
                String::from_utf8_lossy(header.value).into_owned(),
            ));
        }

        self.chunked = chunked;
        self.remaining = if chunked { 0 } else { content_length.unwrap_or(0) };
        self.pending
            .push_back(PendingEvent::HeadersComplete(MessageMeta {
                method: method.to_string(),
                version_minor,
                content_length,
                chunked,
                expect_continue,
                multipart,
            }));
        Ok(Some(header_len))
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|window| window == b"\r\n")
}

fn parse_chunk_size(line: &[u8]) -> Result<u64, TokenError> {
    let line = String::from_utf8_lossy(line);
    let size_str = line.split(';').next().unwrap_or("").trim();
    u64::from_str_radix(size_str, 16).map_err(|_| TokenError::Parse("invalid chunk size"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct RecordingSink {
        events: Vec<String>,
        body: Vec<u8>,
        meta: Option<MessageMeta>,
        pause_on_event: Option<&'static str>,
        abort_on_event: Option<&'static str>,
    }

    impl RecordingSink {
        fn record(&mut self, name: &'static str) -> TokenFlow {
            self.events.push(name.to_string());
            if self.pause_on_event == Some(name) {
                self.pause_on_event = None;
                return TokenFlow::Pause;
            }
            if self.abort_on_event == Some(name) {
                return TokenFlow::Abort;
            }
            TokenFlow::Continue
        }
    }

    impl TokenSink for RecordingSink {
        fn on_start(&mut self) -> TokenFlow {
            self.record("start")
        }
        fn on_path(&mut self, raw_path: &str) -> TokenFlow {
            self.events.push(format!("path:{raw_path}"));
            TokenFlow::Continue
        }
        fn on_args(&mut self, raw_query: &str) -> TokenFlow {
            self.events.push(format!("args:{raw_query}"));
            TokenFlow::Continue
        }
        fn on_header_key(&mut self, key: &str) -> TokenFlow {
            self.events.push(format!("hk:{key}"));
            TokenFlow::Continue
        }
        fn on_header_value(&mut self, value: &str) -> TokenFlow {
            self.events.push(format!("hv:{value}"));
            TokenFlow::Continue
        }
        fn on_headers_complete(&mut self, meta: &MessageMeta) -> TokenFlow {
            self.meta = Some(meta.clone());
            self.record("headers")
        }
        fn on_body_chunk(&mut self, data: &[u8]) -> TokenFlow {
            self.body.extend_from_slice(data);
            self.record("body")
        }
        fn on_chunk_start(&mut self, _size: u64) -> TokenFlow {
            self.record("chunk-start")
        }
        fn on_chunk_end(&mut self) -> TokenFlow {
            self.record("chunk-end")
        }
        fn on_chunks_complete(&mut self) -> TokenFlow {
            self.record("chunks-complete")
        }
        fn on_message_complete(&mut self) -> TokenFlow {
            self.record("complete")
        }
    }

    fn feed_all(tok: &mut Tokenizer, sink: &mut RecordingSink, bytes: &[u8]) -> FeedOutcome {
        let mut buffer = bytes.to_vec();
        loop {
            let outcome = tok.feed(&buffer, sink).expect("feed");
            let consumed = outcome.consumed;
            buffer.drain(..consumed);
            if outcome.state != FeedState::NeedMore || consumed == 0 {
                return outcome;
            }
        }
    }

    #[test]
    fn simple_get_emits_ordered_events() {
        let mut tok = Tokenizer::new(None);
        let mut sink = RecordingSink::default();
        let outcome = feed_all(
            &mut tok,
            &mut sink,
            b"GET /rest/get?key=foo HTTP/1.1\r\nHost: a\r\n\r\n",
        );
        assert_eq!(outcome.state, FeedState::Complete);
        assert_eq!(
            sink.events,
            vec![
                "start",
                "path:/rest/get",
                "args:key=foo",
                "hk:Host",
                "hv:a",
                "headers",
                "complete"
            ]
        );
    }

    #[test]
    fn split_feeds_do_not_duplicate_events() {
        let raw = b"GET /x HTTP/1.1\r\nHost: a\r\nX-Long: value\r\n\r\n";
        let mut tok = Tokenizer::new(None);
        let mut sink = RecordingSink::default();
        // Feed byte by byte through a persistent buffer.
        let mut buffer: Vec<u8> = Vec::new();
        let mut state = FeedState::NeedMore;
        for byte in raw.iter() {
            buffer.push(*byte);
            let outcome = tok.feed(&buffer, &mut sink).expect("feed");
            buffer.drain(..outcome.consumed);
            state = outcome.state;
        }
        assert_eq!(state, FeedState::Complete);
        assert_eq!(sink.events.iter().filter(|e| *e == "start").count(), 1);
        assert_eq!(sink.events.iter().filter(|e| *e == "headers").count(), 1);
        assert_eq!(sink.events.iter().filter(|e| *e == "complete").count(), 1);
    }

    #[test]
    fn content_length_body_is_delivered() {
        let mut tok = Tokenizer::new(None);
        let mut sink = RecordingSink::default();
        let outcome = feed_all(
            &mut tok,
            &mut sink,
            b"POST /p HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello",
        );
        assert_eq!(outcome.state, FeedState::Complete);
        assert_eq!(sink.body, b"hello");
    }

    #[test]
    fn chunked_body_with_split_boundaries() {
        let raw =
            b"POST /p HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let mut tok = Tokenizer::new(None);
        let mut sink = RecordingSink::default();
        let mut buffer: Vec<u8> = Vec::new();
        let mut state = FeedState::NeedMore;
        for piece in raw.chunks(7) {
            buffer.extend_from_slice(piece);
            loop {
                let outcome = tok.feed(&buffer, &mut sink).expect("feed");
                buffer.drain(..outcome.consumed);
                state = outcome.state;
                if outcome.state != FeedState::NeedMore || outcome.consumed == 0 || buffer.is_empty() {
                    break;
                }
            }
        }
        assert_eq!(state, FeedState::Complete);
        assert_eq!(sink.body, b"wikipedia");
        assert_eq!(
            sink.events.iter().filter(|e| *e == "chunk-start").count(),
            2
        );
        assert_eq!(sink.events.iter().filter(|e| *e == "chunk-end").count(), 2);
        assert_eq!(
            sink.events.iter().filter(|e| *e == "chunks-complete").count(),
            1
        );
    }

    #[test]
    fn multipart_content_type_is_flagged() {
        let mut tok = Tokenizer::new(None);
        let mut sink = RecordingSink::default();
        let outcome = feed_all(
            &mut tok,
            &mut sink,
            b"POST /u HTTP/1.1\r\nContent-Type: Multipart/Form-Data; boundary=x\r\nContent-Length: 1\r\n\r\ny",
        );
        assert_eq!(outcome.state, FeedState::Complete);
        let meta = sink.meta.expect("headers complete");
        assert!(meta.multipart);

        let mut tok = Tokenizer::new(None);
        let mut sink = RecordingSink::default();
        feed_all(
            &mut tok,
            &mut sink,
            b"POST /u HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 1\r\n\r\ny",
        );
        assert!(!sink.meta.expect("headers complete").multipart);
    }

    #[test]
    fn declared_length_over_cap_is_data_too_long() {
        let mut tok = Tokenizer::new(Some(4));
        let mut sink = RecordingSink::default();
        let err = tok
            .feed(
                b"POST /p HTTP/1.1\r\nContent-Length: 10\r\n\r\n0123456789",
                &mut sink,
            )
            .expect_err("cap enforced");
        assert_eq!(err, TokenError::DataTooLong);
    }

    #[test]
    fn accumulated_chunked_bytes_over_cap_is_data_too_long() {
        let mut tok = Tokenizer::new(Some(6));
        let mut sink = RecordingSink::default();
        let err = tok
            .feed(
                b"POST /p HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nwiki\r\n5\r\npedia\r\n0\r\n\r\n",
                &mut sink,
            )
            .expect_err("cap enforced");
        assert_eq!(err, TokenError::DataTooLong);
    }

    #[test]
    fn pause_mid_body_keeps_remaining_bytes_unconsumed() {
        let mut tok = Tokenizer::new(None);
        let mut sink = RecordingSink::default();
        sink.pause_on_event = Some("headers");
        let raw = b"POST /p HTTP/1.1\r\nContent-Length: 5\r\n\r\nhello";
        let mut buffer = raw.to_vec();

        let outcome = tok.feed(&buffer, &mut sink).expect("feed");
        assert_eq!(outcome.state, FeedState::Paused);
        buffer.drain(..outcome.consumed);
        assert_eq!(buffer, b"hello");

        // Resuming re-enters with the undrained bytes.
        let outcome = tok.feed(&buffer, &mut sink).expect("feed");
        assert_eq!(outcome.state, FeedState::Complete);
        assert_eq!(sink.body, b"hello");
    }

    #[test]
    fn abort_from_sink_is_surfaced() {
        let mut tok = Tokenizer::new(None);
        let mut sink = RecordingSink::default();
        sink.abort_on_event = Some("headers");
        let err = tok
            .feed(b"GET / HTTP/1.1\r\n\r\n", &mut sink)
            .expect_err("abort surfaced");
        assert_eq!(err, TokenError::Aborted);
    }

    #[test]
    fn malformed_request_line_is_a_parse_error() {
        let mut tok = Tokenizer::new(None);
        let mut sink = RecordingSink::default();
        let err = tok
            .feed(b"NOT AN HTTP REQUEST\r\n\r\n", &mut sink)
            .expect_err("parse error");
        assert!(matches!(err, TokenError::Parse(_)));
    }

    #[test]
    fn reset_allows_a_second_message() {
        let mut tok = Tokenizer::new(None);
        let mut sink = RecordingSink::default();
        let outcome = feed_all(&mut tok, &mut sink, b"GET /a HTTP/1.1\r\n\r\n");
        assert_eq!(outcome.state, FeedState::Complete);
        tok.reset();
        let outcome = feed_all(&mut tok, &mut sink, b"GET /b HTTP/1.1\r\n\r\n");
        assert_eq!(outcome.state, FeedState::Complete);
        assert_eq!(sink.events.iter().filter(|e| *e == "complete").count(), 2);
    }
}
