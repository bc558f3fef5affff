use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};
use crate::http::{encode_component, http_date, http_date_millis, Status};
use chrono::Utc;
use log::trace;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::io::{self, Write};
use std::time::Duration;

fn has_line_break(text: &str) -> bool {
    text.bytes().any(|b| b == b'\r' || b == b'\n')
}

/// A cookie to be sent with `set-cookie`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cookie {
    pub value: String,
    /// Expiry as milliseconds since the epoch; 0 means a session cookie
    pub expires: i64,
    pub domain: Option<String>,
    pub path: Option<String>,
    pub secure: bool,
}

impl Cookie {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            expires: 0,
            domain: None,
            path: None,
            secure: false,
        }
    }

    pub fn expires(mut self, epoch_ms: i64) -> Self {
        self.expires = epoch_ms;
        self
    }

    pub fn domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    pub fn path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Attributes are written verbatim, so they must not end the line or
    /// start another attribute
    fn check(&self, name: &str) -> ServerResult<()> {
        let bad_name = name.is_empty()
            || name
                .bytes()
                .any(|b| b.is_ascii_control() || b" ;=,".contains(&b));
        if bad_name {
            return Err(ServerError::InvalidHeader(format!("cookie name {}", name)));
        }
        for attr in [&self.path, &self.domain].into_iter().flatten() {
            if has_line_break(attr) || attr.contains(';') {
                return Err(ServerError::InvalidHeader(format!(
                    "cookie {} attribute {}",
                    name, attr
                )));
            }
        }
        Ok(())
    }

    fn render(&self, name: &str, out: &mut String) {
        let _ = write!(out, "set-cookie: {}={}", name, encode_component(&self.value));
        if self.expires != 0 {
            if let Some(date) = http_date_millis(self.expires) {
                let _ = write!(out, "; expires={}", date);
            }
        }
        if let Some(path) = &self.path {
            let _ = write!(out, "; path={}", path);
        }
        if let Some(domain) = &self.domain {
            let _ = write!(out, "; domain={}", domain);
        }
        if self.secure {
            out.push_str("; secure");
        }
        out.push_str("\r\n");
    }
}

/// Response bound to a client's output stream.
///
/// Status, headers and cookies are collected until the first body write
/// (or an explicit [`Response::send_headers`]), at which point the head is
/// written once. From then on every mutation fails with
/// [`ServerError::HeadersSent`].
pub struct Response<'a> {
    out: &'a mut dyn Write,
    status: Status,
    headers: Vec<(String, String)>,
    cookies: BTreeMap<String, Cookie>,
    headers_sent: bool,
    keep_alive: bool,
    discard_body: bool,
    keep_alive_timeout: Duration,
    max_keep_alive_requests: u32,
}

impl<'a> Response<'a> {
    /// Create a response for a client that asked for keep-alive or not
    pub fn new(out: &'a mut dyn Write, config: &ServerConfig, keep_alive: bool) -> Self {
        let headers = vec![
            ("date".to_string(), http_date(Utc::now())),
            ("server".to_string(), config.server_name.clone()),
            ("connection".to_string(), "close".to_string()),
            ("content-type".to_string(), "text/html; charset=utf-8".to_string()),
            ("cache-control".to_string(), "no-cache".to_string()),
            ("pragma".to_string(), "no-cache".to_string()),
        ];

        Self {
            out,
            status: Status::Ok,
            headers,
            cookies: BTreeMap::new(),
            headers_sent: false,
            keep_alive,
            discard_body: false,
            keep_alive_timeout: config.keep_alive_timeout,
            max_keep_alive_requests: config.max_keep_alive_requests,
        }
    }

    fn ensure_unsent(&self, action: &'static str) -> ServerResult<()> {
        if self.headers_sent {
            return Err(ServerError::HeadersSent(action));
        }
        Ok(())
    }

    pub fn status(&self) -> Status {
        self.status
    }

    pub fn set_status(&mut self, status: Status) -> ServerResult<()> {
        self.ensure_unsent("set status")?;
        self.status = status;
        Ok(())
    }

    /// Header lookup, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn has_header(&self, name: &str) -> bool {
        self.header(name).is_some()
    }

    /// Set or replace a header
    pub fn set_header(&mut self, name: &str, value: &str) -> ServerResult<()> {
        self.ensure_unsent("set header")?;
        if name.is_empty() || name.contains(':') || has_line_break(name) || has_line_break(value) {
            return Err(ServerError::InvalidHeader(format!("{}: {}", name, value)));
        }
        let name = name.to_ascii_lowercase();
        match self.headers.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.headers.push((name, value.to_string())),
        }
        Ok(())
    }

    pub fn remove_header(&mut self, name: &str) -> ServerResult<()> {
        self.ensure_unsent("remove header")?;
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        Ok(())
    }

    pub fn set_content_length(&mut self, length: u64) -> ServerResult<()> {
        self.set_header("content-length", &length.to_string())
    }

    pub fn set_content_type(&mut self, content_type: &str) -> ServerResult<()> {
        self.set_header("content-type", content_type)
    }

    pub fn cookie(&self, name: &str) -> Option<&Cookie> {
        self.cookies.get(name)
    }

    pub fn set_cookie(&mut self, name: &str, cookie: Cookie) -> ServerResult<()> {
        self.ensure_unsent("set cookie")?;
        cookie.check(name)?;
        self.cookies.insert(name.to_string(), cookie);
        Ok(())
    }

    pub fn remove_cookie(&mut self, name: &str) -> ServerResult<()> {
        self.ensure_unsent("remove cookie")?;
        self.cookies.remove(name);
        Ok(())
    }

    /// Whether the head has gone out
    pub fn headers_sent(&self) -> bool {
        self.headers_sent
    }

    /// Keep-alive as negotiated. Before the head is sent this is only the
    /// client's wish.
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Send headers but drop every body byte, as HEAD requires
    pub fn set_discard_body(&mut self, discard: bool) {
        self.discard_body = discard;
    }

    /// Write the status line, headers and cookies. Does nothing if they
    /// already went out.
    pub fn send_headers(&mut self) -> io::Result<()> {
        if self.headers_sent {
            return Ok(());
        }
        // Set first: a failed write must not reopen the head for changes
        self.headers_sent = true;

        // Without a length the body can only end with the connection
        if !self.has_header("content-length") {
            self.keep_alive = false;
        }

        self.headers.retain(|(n, _)| n != "connection" && n != "keep-alive");
        if self.keep_alive {
            self.headers
                .push(("connection".to_string(), "keep-alive".to_string()));
            self.headers.push((
                "keep-alive".to_string(),
                format!(
                    "timeout={},max={}",
                    self.keep_alive_timeout.as_secs(),
                    self.max_keep_alive_requests
                ),
            ));
        } else {
            self.headers
                .push(("connection".to_string(), "close".to_string()));
        }

        let mut head = String::with_capacity(256);
        let _ = write!(head, "HTTP/1.1 {} {}\r\n", self.status.code(), self.status.as_str());
        for (name, value) in &self.headers {
            let _ = write!(head, "{}: {}\r\n", name, value);
        }
        for (name, cookie) in &self.cookies {
            cookie.render(name, &mut head);
        }
        head.push_str("\r\n");

        trace!("Sending response head:\n{}", head);
        self.out.write_all(head.as_bytes())
    }

    /// Write a complete body, setting `content-length` first
    pub fn send_body(&mut self, body: &[u8]) -> ServerResult<()> {
        self.set_content_length(body.len() as u64)?;
        // An empty body never reaches write(), so send the head here
        self.send_headers()?;
        self.write_all(body)?;
        Ok(())
    }

    /// Render the canned page for `status`
    pub fn send_error(&mut self, status: Status) -> ServerResult<()> {
        self.set_status(status)?;
        self.set_content_type("text/html; charset=utf-8")?;
        let body = format!(
            "<html><head><title>{0}</title></head><body><h1>{0}</h1></body></html>\n",
            status
        );
        self.send_body(body.as_bytes())
    }

    /// Answer with a 301 to `location`
    pub fn redirect(&mut self, location: &str) -> ServerResult<()> {
        self.set_header("location", location)?;
        self.set_status(Status::MovedPermanently)?;
        self.send_body(b"")
    }
}

impl Write for Response<'_> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.send_headers()?;
        if self.discard_body {
            return Ok(buf.len());
        }
        self.out.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.send_headers()?;
        self.out.flush()
    }
}
