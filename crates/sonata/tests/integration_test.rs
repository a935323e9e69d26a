use sonata::{HttpCode, Server};
use std::io::{self, BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::thread;
use std::time::{Duration, Instant};

struct Response {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl Response {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Read exactly one response off a (possibly kept-alive) stream.
fn read_response(reader: &mut BufReader<TcpStream>) -> Response {
    let mut line = String::new();
    reader.read_line(&mut line).unwrap();
    let status = line
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| panic!("bad status line {line:?}"));

    let mut headers = Vec::new();
    loop {
        line.clear();
        reader.read_line(&mut line).unwrap();
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        let (k, v) = trimmed.split_once(':').unwrap();
        headers.push((k.trim().to_string(), v.trim().to_string()));
    }

    let mut response = Response {
        status,
        headers,
        body: Vec::new(),
    };
    let len: usize = response.header("Content-Length").unwrap().parse().unwrap();
    response.body = vec![0; len];
    reader.read_exact(&mut response.body).unwrap();
    response
}

fn connect(addr: SocketAddr) -> BufReader<TcpStream> {
    let stream = TcpStream::connect(addr).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(10))).unwrap();
    BufReader::new(stream)
}

fn request(addr: SocketAddr, raw: &[u8]) -> Response {
    let mut reader = connect(addr);
    reader.get_mut().write_all(raw).unwrap();
    read_response(&mut reader)
}

/// Wait for EOF, returning how long it took.
fn wait_for_close(reader: &mut BufReader<TcpStream>) -> Duration {
    let started = Instant::now();
    let mut buf = [0u8; 64];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => return started.elapsed(),
            Ok(n) => panic!("unexpected {n} bytes on an idle connection"),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => panic!("idle connection was never closed: {e}"),
        }
    }
}

#[test]
fn test_serves_static_files_end_to_end() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("index.html"), "<h1>sonata</h1>").unwrap();
    std::fs::write(root.path().join("notes.txt"), "plain text").unwrap();
    let big: Vec<u8> = (0..1_048_576u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(root.path().join("big.bin"), &big).unwrap();
    std::fs::create_dir(root.path().join("docs")).unwrap();

    let server = Server::bind("127.0.0.1:0")
        .unwrap()
        .doc_root(root.path())
        .workers(4)
        .tick(1)
        .max_fd(4096);
    let addr = server.local_addr();
    let shutdown = server.shutdown_handle();
    let handle = thread::spawn(move || server.serve());

    // 1. Plain GET with Connection: close
    let res = request(
        addr,
        b"GET /index.html HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
    );
    assert_eq!(res.status, 200);
    assert_eq!(res.body, b"<h1>sonata</h1>");
    assert_eq!(res.header("Content-Type"), Some("text/html; charset=utf-8"));
    assert_eq!(res.header("Connection"), Some("close"));
    assert!(res.header("Date").is_some());
    assert!(res.header("Server").unwrap().starts_with("sonata/"));

    // 2. Missing file: canned page with an exact Content-Length
    let res = request(addr, b"GET /nope.html HTTP/1.1\r\n\r\n");
    assert_eq!(res.status, 404);
    assert_eq!(res.body, HttpCode::NoResource.error_page().as_bytes());

    // 3. Recognized but unsupported method
    let res = request(addr, b"DELETE /index.html HTTP/1.1\r\n\r\n");
    assert_eq!(res.status, 501);

    // 4. Malformed request line
    let res = request(addr, b"BREW /pot HTTP/1.1\r\n\r\n");
    assert_eq!(res.status, 400);

    // 5. Traversal and directories are forbidden
    let res = request(addr, b"GET /../etc/passwd HTTP/1.1\r\n\r\n");
    assert_eq!(res.status, 403);
    let res = request(addr, b"GET /docs HTTP/1.1\r\n\r\n");
    assert_eq!(res.status, 403);

    // 6. HTTP/1.0 and absolute-form targets
    let res = request(addr, b"GET http://localhost/notes.txt HTTP/1.0\r\n\r\n");
    assert_eq!(res.status, 200);
    assert_eq!(res.body, b"plain text");

    // 7. Keep-alive: several requests on one socket, sent in fragments
    let mut reader = connect(addr);
    for path in ["/index.html", "/notes.txt", "/missing", "/index.html"] {
        let raw = format!("GET {path} HTTP/1.1\r\nHost: localhost\r\nConnection: keep-alive\r\n\r\n");
        let (a, b) = raw.as_bytes().split_at(7);
        reader.get_mut().write_all(a).unwrap();
        thread::sleep(Duration::from_millis(5));
        reader.get_mut().write_all(b).unwrap();

        let res = read_response(&mut reader);
        assert_eq!(res.header("Connection"), Some("keep-alive"));
        match path {
            "/notes.txt" => assert_eq!(res.body, b"plain text"),
            "/missing" => assert_eq!(res.status, 404),
            _ => assert_eq!(res.body, b"<h1>sonata</h1>"),
        }
    }
    drop(reader);

    // 8. Large body goes out across several writable events
    let mut reader = connect(addr);
    reader
        .get_mut()
        .write_all(b"GET /big.bin HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    thread::sleep(Duration::from_millis(100));
    let res = read_response(&mut reader);
    assert_eq!(res.status, 200);
    assert_eq!(res.header("Content-Type"), Some("application/octet-stream"));
    assert!(res.body == big, "large body corrupted");
    reader
        .get_mut()
        .write_all(b"GET /notes.txt HTTP/1.1\r\nConnection: close\r\n\r\n")
        .unwrap();
    assert_eq!(read_response(&mut reader).body, b"plain text");
    drop(reader);

    // 9. Concurrent keep-alive clients each see their own responses in order
    let clients: Vec<_> = (0..16)
        .map(|c| {
            thread::spawn(move || {
                let mut reader = connect(addr);
                for i in 0..25 {
                    let (path, expected): (&str, &[u8]) = if (c + i) % 2 == 0 {
                        ("/index.html", b"<h1>sonata</h1>")
                    } else {
                        ("/notes.txt", b"plain text")
                    };
                    let raw = format!("GET {path}?client={c}&n={i} HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
                    reader.get_mut().write_all(raw.as_bytes()).unwrap();
                    let res = read_response(&mut reader);
                    assert_eq!(res.status, 200);
                    assert_eq!(res.body, expected);
                }
            })
        })
        .collect();
    for client in clients {
        client.join().unwrap();
    }

    // 10. A silent connection is evicted after three ticks
    let mut idle = connect(addr);
    let waited = wait_for_close(&mut idle);
    assert!(waited >= Duration::from_millis(1_500), "evicted too early: {waited:?}");
    assert!(waited < Duration::from_secs(9), "evicted too late: {waited:?}");

    // 11. Graceful stop
    shutdown.shutdown();
    let result = handle.join().unwrap();
    assert!(result.is_ok(), "serve returned {result:?}");
    assert!(TcpStream::connect(addr).is_err());
}
