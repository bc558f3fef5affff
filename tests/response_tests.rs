use servlet_core::{Cookie, Response, ServerConfig, ServerError, Status};
use std::io::Write;
use std::time::Duration;

fn config() -> ServerConfig {
    let mut config = ServerConfig::new().with_keep_alive_timeout(Duration::from_secs(7));
    config.max_keep_alive_requests = 42;
    config.server_name = "test-server".to_string();
    config
}

/// Status line and headers, each header line keeping its CRLF
fn head_of(output: &[u8]) -> String {
    let text = String::from_utf8_lossy(output);
    match text.find("\r\n\r\n") {
        Some(pos) => text[..pos + 2].to_string(),
        None => text.into_owned(),
    }
}

#[test]
fn test_headers_deferred_until_first_write() {
    let config = config();
    let mut output = Vec::new();
    {
        let mut response = Response::new(&mut output, &config, false);
        response.set_header("X-Custom", "1").unwrap();
        assert!(!response.headers_sent());
        response.flush().unwrap();
        assert!(response.headers_sent());
    }
    assert!(String::from_utf8_lossy(&output).starts_with("HTTP/1.1 200 OK\r\n"));
}

#[test]
fn test_default_headers() {
    let config = config();
    let mut output = Vec::new();
    {
        let mut response = Response::new(&mut output, &config, false);
        assert!(response.header("Date").is_some());
        write!(response, "hello").unwrap();
    }

    let head = head_of(&output);
    assert!(head.contains("server: test-server\r\n"));
    assert!(head.contains("content-type: text/html; charset=utf-8\r\n"));
    assert!(head.contains("cache-control: no-cache\r\n"));
    assert!(head.contains("pragma: no-cache\r\n"));
    assert!(head.contains("\r\ndate: "));
    assert!(String::from_utf8_lossy(&output).ends_with("\r\n\r\nhello"));
}

#[test]
fn test_ok_without_length_forces_close() {
    let config = config();
    let mut output = Vec::new();
    {
        let mut response = Response::new(&mut output, &config, true);
        assert!(response.keep_alive());
        response.write_all(b"streamed body").unwrap();
        assert!(!response.keep_alive());
    }

    let head = head_of(&output);
    assert!(head.contains("connection: close\r\n"));
    assert!(!head.contains("keep-alive"));
}

#[test]
fn test_keep_alive_with_length() {
    let config = config();
    let mut output = Vec::new();
    {
        let mut response = Response::new(&mut output, &config, true);
        response.send_body(b"12345").unwrap();
        assert!(response.keep_alive());
    }

    let head = head_of(&output);
    assert!(head.contains("content-length: 5\r\n"));
    assert!(head.contains("connection: keep-alive\r\n"));
    assert!(head.contains("keep-alive: timeout=7,max=42\r\n"));
}

#[test]
fn test_client_without_keep_alive_gets_close() {
    let config = config();
    let mut output = Vec::new();
    {
        let mut response = Response::new(&mut output, &config, false);
        response.send_body(b"12345").unwrap();
        assert!(!response.keep_alive());
    }
    assert!(head_of(&output).contains("connection: close\r\n"));
}

#[test]
fn test_mutation_after_flush_always_fails() {
    let config = config();
    let mut output = Vec::new();
    let mut response = Response::new(&mut output, &config, false);
    response.write_all(b"x").unwrap();

    for _ in 0..3 {
        assert!(matches!(
            response.set_header("x-late", "1"),
            Err(ServerError::HeadersSent(_))
        ));
        assert!(matches!(
            response.set_cookie("late", Cookie::new("1")),
            Err(ServerError::HeadersSent(_))
        ));
        assert!(matches!(
            response.set_status(Status::NotFound),
            Err(ServerError::HeadersSent(_))
        ));
        assert!(response.remove_header("server").is_err());
        assert!(response.remove_cookie("late").is_err());
    }
    assert_eq!(response.status(), Status::Ok);
}

/// A sink whose writes always fail
struct BrokenPipe;

impl Write for BrokenPipe {
    fn write(&mut self, _buf: &[u8]) -> std::io::Result<usize> {
        Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "gone"))
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[test]
fn test_failed_first_write_still_locks_headers() {
    let config = config();
    let mut sink = BrokenPipe;
    let mut response = Response::new(&mut sink, &config, false);

    assert!(response.write_all(b"x").is_err());
    assert!(response.set_header("x-late", "1").is_err());
}

#[test]
fn test_cookies_emitted_after_headers() {
    let config = config();
    let mut output = Vec::new();
    {
        let mut response = Response::new(&mut output, &config, false);
        response
            .set_cookie("theme", Cookie::new("dark mode").path("/"))
            .unwrap();
        response
            .set_cookie(
                "token",
                Cookie::new("t")
                    .expires(784_111_777_000)
                    .domain("example.com")
                    .secure(true),
            )
            .unwrap();
        response.send_body(b"").unwrap();
    }

    let head = head_of(&output);
    assert!(head.contains("set-cookie: theme=dark+mode; path=/\r\n"));
    assert!(head.contains(
        "set-cookie: token=t; expires=Sun, 06 Nov 1994 08:49:37 GMT; domain=example.com; secure"
    ));
    let last_header = head.rfind("\r\n").map(|i| &head[i + 2..]).unwrap_or_default();
    assert!(last_header.starts_with("set-cookie: "));
}

#[test]
fn test_send_error_page() {
    let config = config();
    let mut output = Vec::new();
    {
        let mut response = Response::new(&mut output, &config, true);
        response.send_error(Status::NotFound).unwrap();
        assert!(response.keep_alive());
    }

    let text = String::from_utf8_lossy(&output);
    assert!(text.starts_with("HTTP/1.1 404 Not Found\r\n"));
    assert!(text.contains("<h1>404 Not Found</h1>"));
}

#[test]
fn test_redirect() {
    let config = config();
    let mut output = Vec::new();
    {
        let mut response = Response::new(&mut output, &config, false);
        response.redirect("/elsewhere").unwrap();
    }

    let head = head_of(&output);
    assert!(head.starts_with("HTTP/1.1 301 Moved Permanently\r\n"));
    assert!(head.contains("location: /elsewhere\r\n"));
    assert!(head.contains("content-length: 0\r\n"));
}

#[test]
fn test_discarded_body_for_head() {
    let config = config();
    let mut output = Vec::new();
    {
        let mut response = Response::new(&mut output, &config, false);
        response.set_discard_body(true);
        response.send_body(b"not on the wire").unwrap();
    }

    let text = String::from_utf8_lossy(&output);
    assert!(text.contains("content-length: 15\r\n"));
    assert!(text.ends_with("\r\n\r\n"));
}

#[test]
fn test_line_breaks_rejected_in_headers_and_cookies() {
    let config = config();
    let mut output = Vec::new();
    {
        let mut response = Response::new(&mut output, &config, false);
        assert!(matches!(
            response.set_header("x-note", "a\r\nset-cookie: admin=1"),
            Err(ServerError::InvalidHeader(_))
        ));
        assert!(response.set_header("x-bad\nname", "1").is_err());
        assert!(response.redirect("/next\r\nx-injected: 1").is_err());
        assert!(matches!(
            response.set_cookie("id", Cookie::new("v").path("/\r\nx-injected: 1")),
            Err(ServerError::InvalidHeader(_))
        ));

        // Cookie values are encoded, so line breaks there are harmless
        response.set_cookie("id", Cookie::new("a\r\nb")).unwrap();
        response.send_body(b"ok").unwrap();
    }

    let text = String::from_utf8_lossy(&output);
    assert!(!text.contains("x-injected"));
    assert!(!text.contains("admin=1"));
    assert!(text.contains("set-cookie: id=a%0D%0Ab\r\n"));
}
