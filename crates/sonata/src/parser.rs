// src/parser.rs
//! Incremental HTTP/1.x request parser.
//!
//! The parser is a two-level state machine. The inner level scans for CRLF
//! terminated lines and tolerates lines split across reads; the outer level
//! consumes one complete line per step (request line, then headers) and finally
//! waits for the declared body. All progress is kept in byte offsets, so the
//! same parser can be re-run against a buffer that has grown since the last call.

use crate::http::{HttpCode, Method, Version};
use memchr::{memchr, memchr2};

/// Primary parse state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CheckState {
    #[default]
    RequestLine,
    Header,
    Body,
}

/// Result of scanning for one line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineStatus {
    /// A complete `\r\n` terminated line is available.
    Ok,
    /// Malformed line terminator.
    Bad,
    /// No terminator yet; more bytes are needed.
    Open,
}

/// Fields extracted from the request head.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Request {
    pub method: Option<Method>,
    /// Origin-form target, always starting with `/`.
    pub target: String,
    pub version: Version,
    pub host: Option<String>,
    pub content_length: usize,
    pub keep_alive: bool,
}

#[derive(Debug)]
pub struct RequestParser {
    state: CheckState,
    /// Parse cursor: everything before it has been classified.
    checked_index: usize,
    /// Start of the line currently being scanned.
    line_start: usize,
    /// Largest Content-Length accepted; anything above is a bad request.
    body_limit: usize,
    request: Request,
}

impl RequestParser {
    pub fn new() -> Self {
        Self::with_body_limit(usize::MAX)
    }

    /// A parser that rejects declared bodies longer than `body_limit` bytes.
    pub fn with_body_limit(body_limit: usize) -> Self {
        Self {
            state: CheckState::RequestLine,
            checked_index: 0,
            line_start: 0,
            body_limit,
            request: Request::default(),
        }
    }

    /// Forget the current request. The body limit is kept.
    pub fn reset(&mut self) {
        *self = Self::with_body_limit(self.body_limit);
    }

    pub fn state(&self) -> CheckState {
        self.state
    }

    pub fn checked_index(&self) -> usize {
        self.checked_index
    }

    pub fn line_start(&self) -> usize {
        self.line_start
    }

    pub fn request(&self) -> &Request {
        &self.request
    }

    /// Run the machine over `data`, which must be the whole buffer received so
    /// far for this request (earlier calls may have seen a prefix of it).
    pub fn parse(&mut self, data: &[u8]) -> HttpCode {
        loop {
            if self.state != CheckState::Body {
                match self.parse_line(data) {
                    LineStatus::Ok => {}
                    LineStatus::Open => return HttpCode::NoRequest,
                    LineStatus::Bad => return HttpCode::BadRequest,
                }
            }

            match self.state {
                CheckState::RequestLine => {
                    let line = self.take_line(data);
                    match self.parse_request_line(line) {
                        HttpCode::NoRequest => continue,
                        other => return other,
                    }
                }
                CheckState::Header => {
                    let line = self.take_line(data);
                    match self.parse_header(line) {
                        HttpCode::NoRequest => continue,
                        other => return other,
                    }
                }
                CheckState::Body => return self.parse_body(data),
            }
        }
    }

    /// Scan from `checked_index` for the next line terminator.
    pub fn parse_line(&mut self, data: &[u8]) -> LineStatus {
        if self.checked_index >= data.len() {
            return LineStatus::Open;
        }

        let Some(offset) = memchr2(b'\r', b'\n', &data[self.checked_index..]) else {
            self.checked_index = data.len();
            return LineStatus::Open;
        };
        let idx = self.checked_index + offset;

        if data[idx] == b'\r' {
            if idx + 1 == data.len() {
                // Keep the cursor on the '\r' so the next read can complete the pair.
                self.checked_index = idx;
                return LineStatus::Open;
            }
            if data[idx + 1] == b'\n' {
                self.checked_index = idx + 2;
                return LineStatus::Ok;
            }
            return LineStatus::Bad;
        }

        if idx > self.line_start && data[idx - 1] == b'\r' {
            self.checked_index = idx + 1;
            return LineStatus::Ok;
        }
        LineStatus::Bad
    }

    /// The just-completed line without its terminator; advances `line_start`.
    fn take_line<'a>(&mut self, data: &'a [u8]) -> &'a [u8] {
        let line = &data[self.line_start..self.checked_index - 2];
        self.line_start = self.checked_index;
        line
    }

    fn parse_request_line(&mut self, line: &[u8]) -> HttpCode {
        let Ok(text) = std::str::from_utf8(line) else {
            return HttpCode::BadRequest;
        };

        let mut parts = text.split_ascii_whitespace();
        let (Some(method), Some(target), Some(version), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return HttpCode::BadRequest;
        };

        let Some(method) = Method::from_bytes(method.as_bytes()) else {
            return HttpCode::BadRequest;
        };

        let version = if version.eq_ignore_ascii_case("HTTP/1.1") {
            Version::Http11
        } else if version.eq_ignore_ascii_case("HTTP/1.0") {
            Version::Http10
        } else {
            return HttpCode::BadRequest;
        };

        let Some(path) = origin_form(target) else {
            return HttpCode::BadRequest;
        };

        self.request.method = Some(method);
        self.request.target = path.to_string();
        self.request.version = version;

        if method != Method::Get {
            return HttpCode::NotImplemented;
        }

        self.state = CheckState::Header;
        HttpCode::NoRequest
    }

    fn parse_header(&mut self, line: &[u8]) -> HttpCode {
        if line.is_empty() {
            if self.request.content_length > 0 {
                self.state = CheckState::Body;
                return HttpCode::NoRequest;
            }
            return HttpCode::GetRequest;
        }

        let Some(colon) = memchr(b':', line) else {
            tracing::trace!(header = %String::from_utf8_lossy(line), "ignoring header without a colon");
            return HttpCode::NoRequest;
        };
        let name = line[..colon].trim_ascii();
        let value = &line[colon + 1..];

        // Only the values of recognized headers are decoded.
        if name.eq_ignore_ascii_case(b"Connection") {
            self.request.keep_alive = trim_value(value).eq_ignore_ascii_case(b"keep-alive");
        } else if name.eq_ignore_ascii_case(b"Content-Length") {
            let len = std::str::from_utf8(trim_value(value))
                .ok()
                .and_then(|v| v.parse::<usize>().ok());
            match len {
                Some(len) if len <= self.body_limit => self.request.content_length = len,
                _ => return HttpCode::BadRequest,
            }
        } else if name.eq_ignore_ascii_case(b"Host") {
            let Ok(host) = std::str::from_utf8(trim_value(value)) else {
                return HttpCode::BadRequest;
            };
            self.request.host = Some(host.to_string());
        } else {
            tracing::trace!(header = %String::from_utf8_lossy(name), "ignoring unrecognized header");
        }

        HttpCode::NoRequest
    }

    fn parse_body(&mut self, data: &[u8]) -> HttpCode {
        let Some(end) = self.checked_index.checked_add(self.request.content_length) else {
            return HttpCode::BadRequest;
        };
        if data.len() >= end {
            self.checked_index = end;
            self.line_start = self.checked_index;
            return HttpCode::GetRequest;
        }
        HttpCode::NoRequest
    }
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

fn trim_value(value: &[u8]) -> &[u8] {
    let start = value.iter().position(|b| !matches!(b, b' ' | b'\t')).unwrap_or(value.len());
    let end = value.iter().rposition(|b| !matches!(b, b' ' | b'\t')).map_or(start, |i| i + 1);
    &value[start..end]
}

/// Reduce a request target to its origin form. Absolute-form targets
/// (`http://host/path`) keep only the path.
fn origin_form(target: &str) -> Option<&str> {
    let authority = strip_prefix_ignore_case(target, "http://")
        .or_else(|| strip_prefix_ignore_case(target, "https://"));
    let path = match authority {
        Some(rest) => &rest[rest.find('/')?..],
        None => target,
    };
    path.starts_with('/').then_some(path)
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.as_bytes().get(..prefix.len())?;
    head.eq_ignore_ascii_case(prefix.as_bytes())
        .then(|| &s[prefix.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(data: &[u8]) -> (HttpCode, RequestParser) {
        let mut parser = RequestParser::new();
        let code = parser.parse(data);
        (code, parser)
    }

    /// Feed `data` in chunks of `step` bytes, re-running the parser after each
    /// chunk the way the reactor does, and stop at the first terminal outcome.
    fn parse_fragmented(data: &[u8], step: usize) -> (HttpCode, RequestParser) {
        let mut parser = RequestParser::new();
        let mut code = HttpCode::NoRequest;
        let mut end = 0;
        while end < data.len() {
            end = (end + step).min(data.len());
            code = parser.parse(&data[..end]);
            if code != HttpCode::NoRequest {
                break;
            }
        }
        (code, parser)
    }

    #[test]
    fn keep_alive_get_request() {
        let (code, parser) = parse_all(b"GET /index.html HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(code, HttpCode::GetRequest);
        let req = parser.request();
        assert_eq!(req.method, Some(Method::Get));
        assert_eq!(req.target, "/index.html");
        assert_eq!(req.version, Version::Http11);
        assert!(req.keep_alive);
    }

    #[test]
    fn recognized_headers_are_recorded() {
        let (code, parser) = parse_all(
            b"GET / HTTP/1.0\r\nhost:  example.org \r\nX-Trace: abc\r\nconnection: close\r\n\r\n",
        );
        assert_eq!(code, HttpCode::GetRequest);
        let req = parser.request();
        assert_eq!(req.host.as_deref(), Some("example.org"));
        assert_eq!(req.version, Version::Http10);
        assert!(!req.keep_alive);
    }

    #[test]
    fn unsupported_method_is_not_a_get() {
        let (code, parser) = parse_all(b"DELETE /x HTTP/1.1\r\n\r\n");
        assert_eq!(code, HttpCode::NotImplemented);
        assert_eq!(parser.request().method, Some(Method::Delete));
    }

    #[test]
    fn malformed_request_lines() {
        for raw in [
            &b"GET /x\r\n\r\n"[..],
            b"GET /x HTTP/2.0\r\n\r\n",
            b"BREW /pot HTTP/1.1\r\n\r\n",
            b"GET x HTTP/1.1\r\n\r\n",
            b"GET /a /b HTTP/1.1\r\n\r\n",
            b"GET /x HTTP/1.1\n\r\n",
            b"GET /x HTTP/1.1\rX\r\n",
        ] {
            let (code, _) = parse_all(raw);
            assert_eq!(code, HttpCode::BadRequest, "{:?}", String::from_utf8_lossy(raw));
        }
    }

    #[test]
    fn absolute_form_target_keeps_path() {
        let (code, parser) = parse_all(b"GET http://example.org/docs/a.txt HTTP/1.1\r\n\r\n");
        assert_eq!(code, HttpCode::GetRequest);
        assert_eq!(parser.request().target, "/docs/a.txt");

        let (code, _) = parse_all(b"GET http://example.org HTTP/1.1\r\n\r\n");
        assert_eq!(code, HttpCode::BadRequest);
    }

    #[test]
    fn invalid_content_length_is_rejected() {
        let (code, _) = parse_all(b"GET / HTTP/1.1\r\nContent-Length: lots\r\n\r\n");
        assert_eq!(code, HttpCode::BadRequest);
    }

    #[test]
    fn oversized_content_length_is_rejected() {
        let (code, _) =
            parse_all(b"GET / HTTP/1.1\r\nContent-Length: 18446744073709551615\r\n\r\n");
        assert_eq!(code, HttpCode::BadRequest);

        let mut parser = RequestParser::with_body_limit(2048);
        let code = parser.parse(b"GET / HTTP/1.1\r\nContent-Length: 2049\r\n\r\n");
        assert_eq!(code, HttpCode::BadRequest);

        parser.reset();
        let code = parser.parse(b"GET / HTTP/1.1\r\nContent-Length: 2048\r\n\r\n");
        assert_eq!(code, HttpCode::NoRequest);
        assert_eq!(parser.state(), CheckState::Body);
    }

    #[test]
    fn body_end_past_address_space_is_rejected() {
        let mut parser = RequestParser::new();
        let head = b"GET / HTTP/1.1\r\nContent-Length: 18446744073709551600\r\n\r\n";
        assert_eq!(parser.parse(head), HttpCode::BadRequest);
    }

    #[test]
    fn unrecognized_header_with_binary_value_is_ignored() {
        let (code, parser) =
            parse_all(b"GET / HTTP/1.1\r\nX-Note: caf\xe9\r\nConnection: keep-alive\r\n\r\n");
        assert_eq!(code, HttpCode::GetRequest);
        assert!(parser.request().keep_alive);

        let (code, _) = parse_all(b"GET / HTTP/1.1\r\nHost: caf\xe9\r\n\r\n");
        assert_eq!(code, HttpCode::BadRequest);
    }

    #[test]
    fn body_waits_for_declared_length() {
        let head = b"GET /form HTTP/1.1\r\nContent-Length: 5\r\n\r\n";
        let mut data = head.to_vec();
        let mut parser = RequestParser::new();

        assert_eq!(parser.parse(&data), HttpCode::NoRequest);
        assert_eq!(parser.state(), CheckState::Body);

        data.extend_from_slice(b"abcd");
        assert_eq!(parser.parse(&data), HttpCode::NoRequest);

        data.push(b'e');
        assert_eq!(parser.parse(&data), HttpCode::GetRequest);
        assert_eq!(parser.checked_index(), data.len());
    }

    #[test]
    fn incomplete_head_needs_more_data() {
        let (code, parser) = parse_all(b"GET /some/path HTT");
        assert_eq!(code, HttpCode::NoRequest);
        assert_eq!(parser.state(), CheckState::RequestLine);

        let (code, parser) = parse_all(b"GET / HTTP/1.1\r\nHost: a\r\n");
        assert_eq!(code, HttpCode::NoRequest);
        assert_eq!(parser.state(), CheckState::Header);
    }

    #[test]
    fn carriage_return_at_fragment_edge_stays_open() {
        let mut parser = RequestParser::new();
        let full = b"GET / HTTP/1.1\r\n\r\n";
        assert_eq!(parser.parse(&full[..15]), HttpCode::NoRequest);
        assert_eq!(parser.checked_index(), 14);
        assert_eq!(parser.parse(full), HttpCode::GetRequest);
    }

    #[test]
    fn line_scanner_statuses() {
        let mut parser = RequestParser::new();
        assert_eq!(parser.parse_line(b"abc"), LineStatus::Open);
        assert_eq!(parser.parse_line(b"abc\r"), LineStatus::Open);
        assert_eq!(parser.parse_line(b"abc\r\n"), LineStatus::Ok);
        assert_eq!(parser.checked_index(), 5);

        let mut parser = RequestParser::new();
        assert_eq!(parser.parse_line(b"abc\ndef"), LineStatus::Bad);
    }

    #[test]
    fn fragmentation_does_not_change_outcome() {
        let samples: [&[u8]; 6] = [
            b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n",
            b"GET /upload HTTP/1.1\r\nContent-Length: 11\r\nX-Other: 1\r\n\r\nhello world",
            b"DELETE /x HTTP/1.1\r\n\r\n",
            b"GET /x HTTP/1.1\r\nBad\nHeader\r\n\r\n",
            b"GET http://h/p?q=1 HTTP/1.0\r\n\r\n",
            b"GET / HTTP/1.1\r\nHost: a\r\n",
        ];

        for sample in samples {
            let (expected, whole) = parse_all(sample);
            for step in 1..=sample.len() {
                let (code, parser) = parse_fragmented(sample, step);
                assert_eq!(code, expected, "step {step} on {:?}", String::from_utf8_lossy(sample));
                assert_eq!(parser.request(), whole.request(), "step {step}");
            }
        }
    }

    #[test]
    fn reset_clears_previous_request() {
        let (_, mut parser) = parse_all(b"GET /a HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
        parser.reset();
        assert_eq!(parser.state(), CheckState::RequestLine);
        assert_eq!(parser.checked_index(), 0);
        assert_eq!(parser.request(), &Request::default());
    }
}
