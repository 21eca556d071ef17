use crate::keyval::KeyVal;

/// Path portion of a request target, split into directory and file
/// components so prefix-registered handlers can address either form.
#[derive(Debug, Clone, Default)]
pub struct Path {
    /// The raw path as received, query stripped.
    pub full: String,
    /// Everything up to and including the last `/`.
    pub path: String,
    /// Everything after the last `/` (may be empty).
    pub file: String,
}

impl Path {
    pub fn parse(raw: &str) -> Self {
        let full = if raw.is_empty() { "/".to_string() } else { raw.to_string() };
        match full.rfind('/') {
            Some(idx) => Self {
                path: full[..=idx].to_string(),
                file: full[idx + 1..].to_string(),
                full,
            },
            None => Self {
                path: "/".to_string(),
                file: full.clone(),
                full,
            },
        }
    }
}

/// Parsed request target: authority (absolute-form targets only), path
/// components, the raw query string, and its decoded key/value pairs.
#[derive(Debug, Clone, Default)]
pub struct Uri {
    pub authority: Option<String>,
    pub path: Path,
    pub query_raw: String,
    pub query: KeyVal,
}

impl Uri {
    /// Build the model from a raw request target, splitting the query
    /// off at the first `?` and percent-decoding its pairs.
    pub fn parse(target: &str) -> Self {
        let (target, authority) = strip_authority(target);
        let mut parts = target.splitn(2, '?');
        let raw_path = parts.next().unwrap_or("");
        let raw_query = parts.next().unwrap_or("");
        Self {
            authority,
            path: Path::parse(raw_path),
            query_raw: raw_query.to_string(),
            query: parse_query(raw_query),
        }
    }

    pub fn query_value(&self, key: &str) -> Option<&str> {
        self.query.get(key)
    }

    /// Replace the parsed query in place. Used when a form-encoded body
    /// stands in for a missing query string.
    pub(crate) fn set_query(&mut self, raw: &str) {
        self.query_raw = raw.to_string();
        self.query = parse_query(raw);
    }
}

// Absolute-form targets ("http://host/path") show up from some proxies;
// everything after the authority is treated as the origin-form target.
fn strip_authority(target: &str) -> (&str, Option<String>) {
    for scheme in ["http://", "https://"] {
        if let Some(rest) = target.strip_prefix(scheme) {
            return match rest.find('/') {
                Some(idx) => (&rest[idx..], Some(rest[..idx].to_string())),
                None => ("/", Some(rest.to_string())),
            };
        }
    }
    (target, None)
}

/// Split a raw query string into ordered, percent-decoded pairs.
/// Both `&` and `;` separate pairs; a pair without `=` records an
/// empty value. Invalid escapes are kept literally.
pub fn parse_query(raw: &str) -> KeyVal {
    let mut out = KeyVal::new();
    for piece in raw.split(['&', ';']) {
        if piece.is_empty() {
            continue;
        }
        let mut kv = piece.splitn(2, '=');
        let key = kv.next().unwrap_or("");
        let value = kv.next().unwrap_or("");
        out.push(percent_decode(key, false), percent_decode(value, true));
    }
    out
}

/// Re-encode pairs into `k=v&k=v` form, escaping reserved bytes.
pub fn encode_query(pairs: &KeyVal) -> String {
    let mut out = String::new();
    for (key, value) in pairs.iter() {
        if !out.is_empty() {
            out.push('&');
        }
        percent_encode_into(&mut out, key);
        out.push('=');
        percent_encode_into(&mut out, value);
    }
    out
}

fn percent_encode_into(out: &mut String, raw: &str) {
    for byte in raw.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => {
                out.push('%');
                out.push(char::from_digit((byte >> 4) as u32, 16).unwrap_or('0').to_ascii_uppercase());
                out.push(char::from_digit((byte & 0xf) as u32, 16).unwrap_or('0').to_ascii_uppercase());
            }
        }
    }
}

fn hex_val(byte: u8) -> Option<u8> {
    match byte {
        b'0'..=b'9' => Some(byte - b'0'),
        b'a'..=b'f' => Some(byte - b'a' + 10),
        b'A'..=b'F' => Some(byte - b'A' + 10),
        _ => None,
    }
}

/// Percent-decode one component. `plus_as_space` applies the historical
/// form-encoding rule for values.
pub fn percent_decode(raw: &str, plus_as_space: bool) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut idx = 0;
    while idx < bytes.len() {
        match bytes[idx] {
            b'%' => {
                let high = bytes.get(idx + 1).and_then(|b| hex_val(*b));
                let low = bytes.get(idx + 2).and_then(|b| hex_val(*b));
                match (high, low) {
                    (Some(high), Some(low)) => {
                        out.push((high << 4) | low);
                        idx += 3;
                    }
                    _ => {
                        out.push(b'%');
                        idx += 1;
                    }
                }
            }
            b'+' if plus_as_space => {
                out.push(b' ');
                idx += 1;
            }
            byte => {
                out.push(byte);
                idx += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_splits_into_dir_and_file() {
        let path = Path::parse("/a/b/c");
        assert_eq!(path.full, "/a/b/c");
        assert_eq!(path.path, "/a/b/");
        assert_eq!(path.file, "c");

        let root = Path::parse("/");
        assert_eq!(root.path, "/");
        assert_eq!(root.file, "");
    }

    #[test]
    fn uri_splits_query_at_first_question_mark() {
        let uri = Uri::parse("/rest/get?key=foo&x=a?b");
        assert_eq!(uri.path.full, "/rest/get");
        assert_eq!(uri.query_raw, "key=foo&x=a?b");
        assert_eq!(uri.query_value("key"), Some("foo"));
        assert_eq!(uri.query_value("x"), Some("a?b"));
    }

    #[test]
    fn absolute_form_target_keeps_authority() {
        let uri = Uri::parse("http://example.com:8080/db/get?key=k");
        assert_eq!(uri.authority.as_deref(), Some("example.com:8080"));
        assert_eq!(uri.path.full, "/db/get");
        assert_eq!(uri.query_value("key"), Some("k"));
    }

    #[test]
    fn query_decoding_handles_escapes_and_plus() {
        let kv = parse_query("a%20b=c%2Fd&plus=1+2&bare&semi=1;other=2");
        assert_eq!(kv.get("a b"), Some("c/d"));
        assert_eq!(kv.get("plus"), Some("1 2"));
        assert_eq!(kv.get("bare"), Some(""));
        assert_eq!(kv.get("other"), Some("2"));
    }

    #[test]
    fn invalid_escape_is_kept_literally() {
        let kv = parse_query("k=%zz%4");
        assert_eq!(kv.get("k"), Some("%zz%4"));
    }

    #[test]
    fn encode_then_parse_round_trips() {
        let mut original = KeyVal::new();
        original.push("key", "foo");
        original.push("other", "some value");
        original.push("path", "/a/b");
        let encoded = encode_query(&original);
        let parsed = parse_query(&encoded);
        for (key, value) in original.iter() {
            assert_eq!(parsed.get(key), Some(value));
        }
    }
}
