use servlet_core::{
    resource_fn, Resource, Server, ServerConfig, ServerError, ServerResult, Status, UploadStatus,
};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

fn test_resource() -> Arc<dyn Resource> {
    Arc::new(resource_fn(|request, response| match request.location() {
        "hello" => response.send_body(b"Hello"),
        "silent" => Ok(()),
        "missing" => Err(ServerError::Status(Status::NotFound)),
        "status-only" => response.set_status(Status::BadRequest),
        "panic" => panic!("resource exploded"),
        "failure" => Err(ServerError::Handler("backend down".to_string())),
        "stream" => {
            response.write_all(b"no length here")?;
            Ok(())
        }
        "echo" => {
            let name = request.body_param("name").unwrap_or("nobody").to_string();
            response.send_body(name.as_bytes())
        }
        "upload" => {
            let report = match request.upload("file") {
                Some(upload) => format!("{} {:?}", upload.size(), upload.status()),
                None => "none".to_string(),
            };
            response.send_body(report.as_bytes())
        }
        "hits" => {
            let hits = request.session().map(|s| s.hits()).unwrap_or(0);
            response.send_body(hits.to_string().as_bytes())
        }
        _ => Err(ServerError::Status(Status::NotFound)),
    }))
}

struct TestServer {
    addr: SocketAddr,
    shutdown: servlet_core::ShutdownHandle,
    thread: Option<JoinHandle<ServerResult<()>>>,
}

impl TestServer {
    fn start(config: ServerConfig) -> Self {
        let config = config
            .with_address("127.0.0.1", 0)
            .with_accept_timeout(Duration::from_millis(50));
        let server = Server::bind(config, test_resource()).unwrap();
        let addr = server.local_addr();
        let shutdown = server.shutdown_handle();
        let thread = thread::spawn(move || server.run());

        Self {
            addr,
            shutdown,
            thread: Some(thread),
        }
    }

    fn connect(&self) -> (TcpStream, BufReader<TcpStream>) {
        let stream = TcpStream::connect(self.addr).unwrap();
        stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        let reader = BufReader::new(stream.try_clone().unwrap());
        (stream, reader)
    }

    fn stop(&mut self) {
        self.shutdown.shutdown();
        if let Some(thread) = self.thread.take() {
            thread.join().unwrap().unwrap();
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.shutdown.shutdown();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

struct ClientResponse {
    status_line: String,
    headers: HashMap<String, String>,
    body: Vec<u8>,
}

impl ClientResponse {
    fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }

    fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

fn read_response(reader: &mut BufReader<TcpStream>) -> Option<ClientResponse> {
    let mut status_line = String::new();
    if reader.read_line(&mut status_line).ok()? == 0 {
        return None;
    }

    let mut headers = HashMap::new();
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).ok()?;
        let line = line.trim_end();
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':')?;
        headers.insert(name.trim().to_string(), value.trim().to_string());
    }

    let mut body = Vec::new();
    match headers.get("content-length") {
        Some(length) => {
            body.resize(length.parse().ok()?, 0);
            reader.read_exact(&mut body).ok()?;
        }
        None => {
            reader.read_to_end(&mut body).ok()?;
        }
    }

    Some(ClientResponse {
        status_line: status_line.trim_end().to_string(),
        headers,
        body,
    })
}

fn get(server: &TestServer, path: &str) -> ClientResponse {
    let (mut stream, mut reader) = server.connect();
    write!(stream, "GET {} HTTP/1.1\r\nHost: test\r\n\r\n", path).unwrap();
    read_response(&mut reader).unwrap()
}

#[test]
fn test_simple_request() {
    let server = TestServer::start(ServerConfig::new());
    let response = get(&server, "/hello");

    assert_eq!(response.status_line, "HTTP/1.1 200 OK");
    assert_eq!(response.body_text(), "Hello");
    assert_eq!(response.header("connection"), Some("close"));
}

#[test]
fn test_keep_alive_stops_at_request_cap() {
    let server = TestServer::start(ServerConfig::new().with_max_requests_per_connection(3));
    let (mut stream, mut reader) = server.connect();

    for i in 1..=3 {
        stream
            .write_all(b"GET /hello HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
            .unwrap();
        let response = read_response(&mut reader).unwrap();
        assert_eq!(response.body_text(), "Hello");

        let expected = if i < 3 { "keep-alive" } else { "close" };
        assert_eq!(response.header("connection"), Some(expected), "request {}", i);
    }

    // Fourth request finds the socket closed
    let _ = stream.write_all(b"GET /hello HTTP/1.1\r\nConnection: keep-alive\r\n\r\n");
    assert!(read_response(&mut reader).is_none());
}

#[test]
fn test_stream_without_length_closes() {
    let server = TestServer::start(ServerConfig::new());
    let (mut stream, mut reader) = server.connect();

    stream
        .write_all(b"GET /stream HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let response = read_response(&mut reader).unwrap();
    assert_eq!(response.header("connection"), Some("close"));
    assert_eq!(response.body_text(), "no length here");
}

#[test]
fn test_idle_keep_alive_connection_times_out() {
    let server = TestServer::start(
        ServerConfig::new().with_keep_alive_timeout(Duration::from_secs(1)),
    );
    let (mut stream, mut reader) = server.connect();

    stream
        .write_all(b"GET /hello HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    assert!(read_response(&mut reader).is_some());

    let started = Instant::now();
    assert!(read_response(&mut reader).is_none());
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[test]
fn test_no_response_is_500() {
    let server = TestServer::start(ServerConfig::new());
    let response = get(&server, "/silent");
    assert_eq!(response.status_line, "HTTP/1.1 500 Internal Server Error");
}

#[test]
fn test_unsent_status_is_rendered() {
    let server = TestServer::start(ServerConfig::new());
    let response = get(&server, "/status-only");
    assert_eq!(response.status_line, "HTTP/1.1 400 Bad Request");
    assert!(response.body_text().contains("400 Bad Request"));
}

#[test]
fn test_resource_not_found() {
    let server = TestServer::start(ServerConfig::new());
    let response = get(&server, "/nowhere");
    assert_eq!(response.status_line, "HTTP/1.1 404 Not Found");
}

#[test]
fn test_resource_errors_become_500() {
    let server = TestServer::start(ServerConfig::new());
    assert_eq!(
        get(&server, "/failure").status_line,
        "HTTP/1.1 500 Internal Server Error"
    );
    assert_eq!(
        get(&server, "/panic").status_line,
        "HTTP/1.1 500 Internal Server Error"
    );

    // The server keeps serving after a panic
    assert_eq!(get(&server, "/hello").body_text(), "Hello");
}

#[test]
fn test_bad_method_is_405_and_closes() {
    let server = TestServer::start(ServerConfig::new());
    let (mut stream, mut reader) = server.connect();

    stream
        .write_all(b"DELETE /hello HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    let response = read_response(&mut reader).unwrap();
    assert_eq!(response.status_line, "HTTP/1.1 405 Method Not Allowed");
    assert_eq!(response.header("connection"), Some("close"));
    assert!(read_response(&mut reader).is_none());
}

#[test]
fn test_post_without_length_is_411() {
    let server = TestServer::start(ServerConfig::new());
    let (mut stream, mut reader) = server.connect();

    stream
        .write_all(b"POST /echo HTTP/1.1\r\nContent-Type: application/x-www-form-urlencoded\r\n\r\n")
        .unwrap();
    let response = read_response(&mut reader).unwrap();
    assert_eq!(response.status_line, "HTTP/1.1 411 Length Required");
}

#[test]
fn test_form_post_then_keep_alive_get() {
    let server = TestServer::start(ServerConfig::new());
    let (mut stream, mut reader) = server.connect();

    let body = "name=Ferris+the+crab";
    write!(
        stream,
        "POST /echo HTTP/1.1\r\nConnection: keep-alive\r\nContent-Type: application/x-www-form-urlencoded\r\nContent-Length: {}\r\n\r\n{}",
        body.len(),
        body
    )
    .unwrap();
    assert_eq!(read_response(&mut reader).unwrap().body_text(), "Ferris the crab");

    stream
        .write_all(b"GET /hello HTTP/1.1\r\nConnection: keep-alive\r\n\r\n")
        .unwrap();
    assert_eq!(read_response(&mut reader).unwrap().body_text(), "Hello");
}

#[test]
fn test_head_has_no_body() {
    let server = TestServer::start(ServerConfig::new());
    let (mut stream, _) = server.connect();

    stream.write_all(b"HEAD /hello HTTP/1.1\r\n\r\n").unwrap();
    let mut raw = String::new();
    stream.read_to_string(&mut raw).unwrap();

    assert!(raw.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(raw.contains("content-length: 5\r\n"));
    assert!(raw.ends_with("\r\n\r\n"));
}

#[test]
fn test_multipart_upload_over_the_wire() {
    let server = TestServer::start(ServerConfig::new().with_max_upload_size(100));
    let (mut stream, mut reader) = server.connect();

    let content = vec![b'z'; 250];
    let mut body = b"--wire\r\nContent-Disposition: form-data; name=\"file\"; filename=\"z.txt\"\r\n\r\n".to_vec();
    body.extend_from_slice(&content);
    body.extend_from_slice(b"\r\n--wire--\r\n");

    write!(
        stream,
        "POST /upload HTTP/1.1\r\nContent-Type: multipart/form-data; boundary=wire\r\nContent-Length: {}\r\n\r\n",
        body.len()
    )
    .unwrap();
    stream.write_all(&body).unwrap();

    let response = read_response(&mut reader).unwrap();
    assert_eq!(
        response.body_text(),
        format!("250 {:?}", UploadStatus::SizeExceeded)
    );
}

#[test]
fn test_session_cookie_round_trip() {
    let server = TestServer::start(ServerConfig::new());

    let first = get(&server, "/hits");
    assert_eq!(first.body_text(), "1");
    let cookie = first.header("set-cookie").unwrap().to_string();
    assert!(cookie.starts_with("SESSIONID="));
    let id = cookie
        .trim_start_matches("SESSIONID=")
        .split(';')
        .next()
        .unwrap()
        .to_string();

    let (mut stream, mut reader) = server.connect();
    write!(stream, "GET /hits HTTP/1.1\r\nCookie: SESSIONID={}\r\n\r\n", id).unwrap();
    let second = read_response(&mut reader).unwrap();
    assert_eq!(second.body_text(), "2");
    assert!(second.header("set-cookie").is_none());
}

#[test]
fn test_sessions_disabled() {
    let server = TestServer::start(ServerConfig::new().with_auto_sessions(false));
    let response = get(&server, "/hits");
    assert_eq!(response.body_text(), "0");
    assert!(response.header("set-cookie").is_none());
}

#[test]
fn test_concurrent_connections() {
    const NUM_CLIENTS: usize = 10;
    let server = TestServer::start(ServerConfig::new());
    let addr = server.addr;

    let clients: Vec<_> = (0..NUM_CLIENTS)
        .map(|_| {
            thread::spawn(move || {
                let mut stream = TcpStream::connect(addr).unwrap();
                stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
                let mut reader = BufReader::new(stream.try_clone().unwrap());
                stream.write_all(b"GET /hello HTTP/1.1\r\n\r\n").unwrap();
                read_response(&mut reader).unwrap().body_text()
            })
        })
        .collect();

    for client in clients {
        assert_eq!(client.join().unwrap(), "Hello");
    }
}

#[test]
fn test_shutdown_stops_accept_loop() {
    let mut server = TestServer::start(ServerConfig::new());
    assert_eq!(get(&server, "/hello").body_text(), "Hello");

    let started = Instant::now();
    server.stop();
    assert!(started.elapsed() < Duration::from_secs(2));
}
