use crate::request::Request;

/// Fixed numeric-code to reason-phrase table. Unknown codes render as
/// "Unknown" rather than failing the reply.
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        409 => "Conflict",
        411 => "Length Required",
        413 => "Payload Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        417 => "Expectation Failed",
        426 => "Upgrade Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        _ => "Unknown",
    }
}

fn wrap_chunk(out: &mut Vec<u8>, chunk: &[u8]) {
    let size = format!("{:X}\r\n", chunk.len());
    out.reserve(size.len() + chunk.len() + 2);
    out.extend_from_slice(size.as_bytes());
    out.extend_from_slice(chunk);
    out.extend_from_slice(b"\r\n");
}

// Status line plus normalized headers. The engine owns the Connection
// header outright; Content-Length is computed only when the caller set
// none; Transfer-Encoding and Content-Length never coexist.
fn build_head(req: &Request, status: u16, computed_length: Option<u64>, chunked: bool) -> Vec<u8> {
    let mut head = Vec::with_capacity(128);
    head.extend_from_slice(
        format!(
            "HTTP/1.{} {} {}\r\n",
            req.version_minor,
            status,
            reason_phrase(status)
        )
        .as_bytes(),
    );

    let mut have_type = false;
    let mut have_length = false;
    for (name, value) in req.headers_out.iter() {
        if name.eq_ignore_ascii_case("connection") {
            continue;
        }
        if chunked
            && (name.eq_ignore_ascii_case("content-length")
                || name.eq_ignore_ascii_case("transfer-encoding"))
        {
            continue;
        }
        if name.eq_ignore_ascii_case("content-type") {
            have_type = true;
        }
        if name.eq_ignore_ascii_case("content-length") {
            have_length = true;
        }
        head.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
    }

    if chunked {
        head.extend_from_slice(b"Transfer-Encoding: chunked\r\n");
    } else if let Some(length) = computed_length {
        if !have_length {
            head.extend_from_slice(format!("Content-Length: {length}\r\n").as_bytes());
        }
    }

    let has_body = chunked || computed_length.map(|len| len > 0).unwrap_or(false);
    if has_body && !have_type {
        head.extend_from_slice(b"Content-Type: text/plain\r\n");
    }

    // Emitted only when it disagrees with the protocol default:
    // HTTP/1.1 defaults to keep-alive, HTTP/1.0 to close.
    if req.version_minor >= 1 {
        if !req.keepalive {
            head.extend_from_slice(b"Connection: close\r\n");
        }
    } else if req.keepalive {
        head.extend_from_slice(b"Connection: keep-alive\r\n");
    }

    head.extend_from_slice(b"\r\n");
    head
}

impl Request {
    /// Send a complete reply: staged payload (see
    /// [`Request::write_body`]) framed with a computed Content-Length.
    pub fn send_reply(&mut self, status: u16) {
        if self.reply_started {
            return;
        }
        let body = std::mem::take(&mut self.buffer_out);
        let head = build_head(self, status, Some(body.len() as u64), false);
        self.status = status;
        self.reply_started = true;
        self.output.extend_from_slice(&head);
        if self.method != "HEAD" {
            self.output.extend_from_slice(&body);
        }
        self.finished = true;
    }

    /// Begin a streamed, fixed-framing reply. Without an explicit
    /// Content-Length the peer delimits the body by connection close,
    /// so keep-alive is dropped.
    pub fn send_reply_start(&mut self, status: u16) {
        if self.reply_started {
            return;
        }
        if !self.headers_out.contains("content-length") {
            self.keepalive = false;
        }
        let head = build_head(self, status, None, false);
        self.status = status;
        self.reply_started = true;
        self.output.extend_from_slice(&head);
    }

    pub fn send_reply_body(&mut self, data: &[u8]) {
        if self.method != "HEAD" {
            self.output.extend_from_slice(data);
        }
    }

    pub fn send_reply_end(&mut self) {
        self.finished = true;
    }

    /// Begin a chunked reply: any Content-Length is stripped and every
    /// subsequent chunk is framed as `<hex-len>CRLF bytes CRLF`.
    pub fn send_reply_chunk_start(&mut self, status: u16) {
        if self.reply_started {
            return;
        }
        self.headers_out.remove("content-length");
        self.chunked_reply = true;
        let head = build_head(self, status, None, true);
        self.status = status;
        self.reply_started = true;
        self.output.extend_from_slice(&head);
    }

    pub fn send_reply_chunk(&mut self, data: &[u8]) {
        if data.is_empty() || self.method == "HEAD" {
            return;
        }
        wrap_chunk(&mut self.output, data);
    }

    /// Terminate a chunked reply with the zero-length chunk and
    /// trailing CRLF.
    pub fn send_reply_chunk_end(&mut self) {
        if self.chunked_reply {
            self.output.extend_from_slice(b"0\r\n\r\n");
        }
        self.finished = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event_loop::ResumeHandle;

    fn request(version_minor: u8) -> Request {
        let mut req = Request::new(ResumeHandle::detached());
        req.version_minor = version_minor;
        req.method = "GET".to_string();
        req
    }

    fn head_lines(output: &[u8]) -> Vec<String> {
        let text = String::from_utf8_lossy(output);
        let head = text.split("\r\n\r\n").next().unwrap_or("");
        head.split("\r\n").map(str::to_string).collect()
    }

    #[test]
    fn fixed_reply_computes_content_length_and_default_type() {
        let mut req = request(1);
        req.write_body(b"hello");
        req.send_reply(200);
        let lines = head_lines(&req.output);
        assert_eq!(lines[0], "HTTP/1.1 200 OK");
        assert!(lines.contains(&"Content-Length: 5".to_string()));
        assert!(lines.contains(&"Content-Type: text/plain".to_string()));
        assert!(req.output.ends_with(b"hello"));
        assert!(req.finished);
    }

    #[test]
    fn explicit_content_length_is_not_overridden() {
        let mut req = request(1);
        req.headers_out_mut().set("Content-Length", "5");
        req.write_body(b"hello");
        req.send_reply(200);
        let text = String::from_utf8_lossy(&req.output);
        assert_eq!(text.matches("Content-Length").count(), 1);
    }

    #[test]
    fn explicit_content_type_is_kept() {
        let mut req = request(1);
        req.headers_out_mut().set("Content-Type", "application/json");
        req.write_body(b"{}");
        req.send_reply(200);
        let text = String::from_utf8_lossy(&req.output);
        assert!(text.contains("Content-Type: application/json"));
        assert!(!text.contains("text/plain"));
    }

    #[test]
    fn connection_header_emitted_only_on_disagreement() {
        let mut req = request(1);
        req.send_reply(204);
        assert!(!String::from_utf8_lossy(&req.output).contains("Connection:"));

        let mut req = request(1);
        req.keepalive = false;
        req.send_reply(204);
        assert!(String::from_utf8_lossy(&req.output).contains("Connection: close"));

        let mut req = request(0);
        req.keepalive = true;
        req.send_reply(204);
        assert!(String::from_utf8_lossy(&req.output).contains("Connection: keep-alive"));

        let mut req = request(0);
        req.keepalive = false;
        req.send_reply(204);
        assert!(!String::from_utf8_lossy(&req.output).contains("Connection:"));
    }

    #[test]
    fn chunked_reply_is_byte_exact() {
        let mut req = request(1);
        req.send_reply_chunk_start(200);
        let head_len = req.output.len();
        req.send_reply_chunk(b"AAA");
        req.send_reply_chunk(b"BB");
        req.send_reply_chunk(b"C");
        req.send_reply_chunk_end();
        let body = &req.output[head_len..];
        assert_eq!(body, b"3\r\nAAA\r\n2\r\nBB\r\n1\r\nC\r\n0\r\n\r\n");
        let head = String::from_utf8_lossy(&req.output[..head_len]);
        assert!(head.contains("Transfer-Encoding: chunked"));
        assert!(!head.contains("Content-Length"));
    }

    #[test]
    fn chunk_start_strips_existing_content_length() {
        let mut req = request(1);
        req.headers_out_mut().set("Content-Length", "999");
        req.send_reply_chunk_start(200);
        assert!(!String::from_utf8_lossy(&req.output).contains("Content-Length"));
    }

    #[test]
    fn head_requests_keep_length_but_suppress_body() {
        let mut req = request(1);
        req.method = "HEAD".to_string();
        req.write_body(b"hello");
        req.send_reply(200);
        let text = String::from_utf8_lossy(&req.output);
        assert!(text.contains("Content-Length: 5"));
        assert!(req.output.ends_with(b"\r\n\r\n"));
    }

    #[test]
    fn streamed_reply_without_length_drops_keepalive() {
        let mut req = request(1);
        req.send_reply_start(200);
        req.send_reply_body(b"data");
        req.send_reply_end();
        assert!(!req.keepalive);
        assert!(String::from_utf8_lossy(&req.output).contains("Connection: close"));
    }

    #[test]
    fn unknown_status_gets_placeholder_reason() {
        assert_eq!(reason_phrase(299), "Unknown");
        let mut req = request(1);
        req.send_reply(299);
        assert!(String::from_utf8_lossy(&req.output).starts_with("HTTP/1.1 299 Unknown"));
    }
}
