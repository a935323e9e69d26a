// src/http.rs

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
    Trace,
    Connect,
}

impl Method {
    /// Recognize a method token. Tokens outside the HTTP/1.1 set yield `None`.
    pub fn from_bytes(b: &[u8]) -> Option<Self> {
        match b {
            b"GET" => Some(Method::Get),
            b"POST" => Some(Method::Post),
            b"PUT" => Some(Method::Put),
            b"DELETE" => Some(Method::Delete),
            b"PATCH" => Some(Method::Patch),
            b"HEAD" => Some(Method::Head),
            b"OPTIONS" => Some(Method::Options),
            b"TRACE" => Some(Method::Trace),
            b"CONNECT" => Some(Method::Connect),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
            Method::Head => "HEAD",
            Method::Options => "OPTIONS",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Version {
    Http10,
    #[default]
    Http11,
}

/// Outcome of parsing a request and resolving its resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpCode {
    /// The request is incomplete; wait for more bytes.
    NoRequest,
    /// A complete GET request was parsed.
    GetRequest,
    /// Syntax error in the request line or headers.
    BadRequest,
    /// A recognized method other than GET.
    NotImplemented,
    /// The target does not exist under the document root.
    NoResource,
    /// The target is a directory, unreadable, or escapes the document root.
    ForbiddenRequest,
    /// The target was mapped and is ready to send.
    FileRequest,
    /// The target exists but could not be served.
    InternalError,
}

impl HttpCode {
    /// Status code and reason phrase sent on the wire for a terminal outcome.
    pub fn status(&self) -> (u16, &'static str) {
        match self {
            HttpCode::FileRequest | HttpCode::GetRequest => (200, "OK"),
            HttpCode::BadRequest | HttpCode::NoRequest => (400, "Bad Request"),
            HttpCode::ForbiddenRequest => (403, "Forbidden"),
            HttpCode::NoResource => (404, "Not Found"),
            HttpCode::InternalError => (500, "Internal Error"),
            HttpCode::NotImplemented => (501, "Not Implemented"),
        }
    }

    /// Canned HTML page for error outcomes. Empty for success.
    pub fn error_page(&self) -> &'static str {
        match self {
            HttpCode::FileRequest | HttpCode::GetRequest => "",
            HttpCode::BadRequest | HttpCode::NoRequest => {
                "<html><body><h1>400 Bad Request</h1><p>Your request has bad syntax or is inherently impossible to satisfy.</p></body></html>\n"
            }
            HttpCode::ForbiddenRequest => {
                "<html><body><h1>403 Forbidden</h1><p>You do not have permission to get this file from this server.</p></body></html>\n"
            }
            HttpCode::NoResource => {
                "<html><body><h1>404 Not Found</h1><p>The requested file was not found on this server.</p></body></html>\n"
            }
            HttpCode::InternalError => {
                "<html><body><h1>500 Internal Error</h1><p>There was an unusual problem serving the requested file.</p></body></html>\n"
            }
            HttpCode::NotImplemented => {
                "<html><body><h1>501 Not Implemented</h1><p>Only GET is supported by this server.</p></body></html>\n"
            }
        }
    }
}

const CONTENT_TYPES: &[(&str, &str)] = &[
    ("html", "text/html; charset=utf-8"),
    ("htm", "text/html; charset=utf-8"),
    ("css", "text/css; charset=utf-8"),
    ("js", "application/javascript; charset=utf-8"),
    ("mjs", "application/javascript; charset=utf-8"),
    ("json", "application/json"),
    ("txt", "text/plain; charset=utf-8"),
    ("xml", "application/xml"),
    ("svg", "image/svg+xml"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("ico", "image/x-icon"),
    ("webp", "image/webp"),
    ("pdf", "application/pdf"),
    ("wasm", "application/wasm"),
    ("mp4", "video/mp4"),
    ("mp3", "audio/mpeg"),
    ("woff", "font/woff"),
    ("woff2", "font/woff2"),
];

pub const DEFAULT_CONTENT_TYPE: &str = "application/octet-stream";
pub const HTML_CONTENT_TYPE: &str = "text/html; charset=utf-8";

/// Infer a Content-Type from the extension of `path`.
pub fn content_type_for(path: &str) -> &'static str {
    let file_name = path.rsplit('/').next().unwrap_or(path);
    let Some((_, ext)) = file_name.rsplit_once('.') else {
        return DEFAULT_CONTENT_TYPE;
    };
    CONTENT_TYPES
        .iter()
        .find(|(known, _)| known.eq_ignore_ascii_case(ext))
        .map(|(_, ct)| *ct)
        .unwrap_or(DEFAULT_CONTENT_TYPE)
}
