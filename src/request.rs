use crate::config::ServerConfig;
use crate::error::RequestError;
use crate::http::{decode_component, decode_path, Method, Params};
use crate::multipart::{parse_boundary, MultipartParser};
use crate::session::SessionHandle;
use crate::upload::FileUpload;
use log::debug;
use std::collections::HashMap;
use std::io::{self, BufRead, Read};
use std::net::SocketAddr;

/// Longest request line or header line accepted
pub const MAX_LINE_LENGTH: usize = 8 * 1024;

/// Blank lines tolerated before the request line
const MAX_LEADING_BLANK_LINES: usize = 8;

/// Read one line without its `\n` / `\r\n` terminator.
///
/// Returns `None` when the stream is already at EOF. A final line without
/// a terminator is returned as is.
pub(crate) fn read_line<R: BufRead>(
    reader: &mut R,
    limit: usize,
) -> Result<Option<String>, RequestError> {
    let mut line = Vec::new();
    // Room for the line plus its CRLF
    let read = reader
        .by_ref()
        .take(limit as u64 + 2)
        .read_until(b'\n', &mut line)?;
    if read == 0 {
        return Ok(None);
    }

    if line.last() == Some(&b'\n') {
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
    }
    if line.len() > limit {
        return Err(RequestError::LineTooLong(limit));
    }
    Ok(Some(String::from_utf8_lossy(&line).into_owned()))
}

/// Read a single byte, `None` at EOF
pub(crate) fn read_byte<R: BufRead>(reader: &mut R) -> io::Result<Option<u8>> {
    let byte = match reader.fill_buf()?.first() {
        Some(&b) => b,
        None => return Ok(None),
    };
    reader.consume(1);
    Ok(Some(byte))
}

fn is_idle_timeout(err: &RequestError) -> bool {
    match err {
        RequestError::Io(e) => matches!(
            e.kind(),
            io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
        ),
        _ => false,
    }
}

/// One parsed HTTP request.
///
/// Built empty by the connection, filled by [`Request::parse`], then handed
/// to the resource. Header names are stored lower-cased.
#[derive(Debug)]
pub struct Request {
    method: Method,
    request_line: String,
    path: String,
    location: String,
    anchor: Option<String>,
    query_raw: String,
    query: String,
    params: Params,
    body_raw: String,
    body_params: Params,
    uploads: HashMap<String, FileUpload>,
    headers: HashMap<String, String>,
    cookies: Params,
    peer_addr: Option<SocketAddr>,
    keep_alive: bool,
    session: Option<SessionHandle>,
}

impl Request {
    /// Create an empty request for a client
    pub fn new(peer_addr: Option<SocketAddr>) -> Self {
        Self {
            method: Method::Get,
            request_line: String::new(),
            path: String::new(),
            location: String::new(),
            anchor: None,
            query_raw: String::new(),
            query: String::new(),
            params: Params::new(),
            body_raw: String::new(),
            body_params: Params::new(),
            uploads: HashMap::new(),
            headers: HashMap::new(),
            cookies: Params::new(),
            peer_addr,
            keep_alive: false,
            session: None,
        }
    }

    /// Read one request off `reader`.
    ///
    /// A clean EOF or an idle read timeout before the request line yields
    /// [`RequestError::NoRequest`]. For POST the body is consumed exactly up
    /// to `content-length`, leaving the stream at the next request.
    pub fn parse<R: BufRead>(
        &mut self,
        reader: &mut R,
        config: &ServerConfig,
    ) -> Result<(), RequestError> {
        self.parse_request_line(reader)?;
        self.parse_headers(reader)?;

        if let Some(cookie) = self.headers.get("cookie") {
            self.cookies.parse_into(cookie, ';');
        }
        self.keep_alive = self
            .header("connection")
            .map(|v| v.to_ascii_lowercase().starts_with("keep-alive"))
            .unwrap_or(false);

        if self.method == Method::Post {
            self.parse_body(reader, config)?;
        }

        debug!("Parsed {} /{} from {:?}", self.method, self.location, self.peer_addr);
        Ok(())
    }

    fn parse_request_line<R: BufRead>(&mut self, reader: &mut R) -> Result<(), RequestError> {
        let mut blank_lines = 0;
        let line = loop {
            let line = match read_line(reader, MAX_LINE_LENGTH) {
                Ok(Some(line)) => line,
                Ok(None) => return Err(RequestError::NoRequest),
                Err(e) if is_idle_timeout(&e) => return Err(RequestError::NoRequest),
                Err(e) => return Err(e),
            };
            if !line.trim().is_empty() {
                break line;
            }
            blank_lines += 1;
            if blank_lines > MAX_LEADING_BLANK_LINES {
                return Err(RequestError::BadRequestLine(String::new()));
            }
        };

        let mut tokens = line.split_whitespace();
        let method = tokens.next().unwrap_or_default();
        self.method = Method::parse(method)?;
        let url = tokens
            .next()
            .ok_or_else(|| RequestError::BadRequestLine(line.clone()))?
            .to_string();
        self.request_line = line;
        self.parse_url(&url);
        Ok(())
    }

    fn parse_url(&mut self, url: &str) {
        let mut rest = url;
        if let Some(pos) = rest.find('#') {
            self.anchor = Some(decode_path(&rest[pos + 1..]));
            rest = &rest[..pos];
        }
        if let Some(pos) = rest.find('?') {
            self.query_raw = rest[pos + 1..].to_string();
            self.query = decode_component(&self.query_raw);
            self.params.parse_into(&self.query_raw, '&');
            rest = &rest[..pos];
        }
        self.path = rest.to_string();
        let decoded = decode_path(rest);
        self.location = decoded.strip_prefix('/').unwrap_or(&decoded).to_string();
    }

    fn parse_headers<R: BufRead>(&mut self, reader: &mut R) -> Result<(), RequestError> {
        loop {
            let line = read_line(reader, MAX_LINE_LENGTH)?.ok_or(RequestError::Truncated)?;
            if line.is_empty() {
                return Ok(());
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| RequestError::BadHeader(line.clone()))?;
            let name = name.trim();
            if name.is_empty() {
                return Err(RequestError::BadHeader(line.clone()));
            }
            self.headers
                .insert(name.to_ascii_lowercase(), value.trim().to_string());
        }
    }

    fn parse_body<R: BufRead>(
        &mut self,
        reader: &mut R,
        config: &ServerConfig,
    ) -> Result<(), RequestError> {
        let length = self
            .headers
            .get("content-length")
            .ok_or(RequestError::LengthRequired)?;
        let length: u64 = length
            .trim()
            .parse()
            .map_err(|_| RequestError::BadContentLength(length.clone()))?;

        let mut body = reader.by_ref().take(length);
        let content_type = self.header("content-type").unwrap_or_default();

        if content_type
            .to_ascii_lowercase()
            .starts_with("multipart/form-data")
        {
            let boundary = parse_boundary(content_type)?;
            let parser = MultipartParser::new(&boundary, config.max_upload_size, config.upload_dir());
            let form = parser.parse(&mut body)?;

            // Epilogue after the closing delimiter
            io::copy(&mut body, &mut io::sink())?;

            self.body_raw = form.raw;
            self.body_params = form.fields;
            self.uploads = form.uploads;
        } else {
            if length > config.max_body_size {
                return Err(RequestError::BodyTooLarge {
                    length,
                    limit: config.max_body_size,
                });
            }
            let mut raw = Vec::with_capacity(length.min(64 * 1024) as usize);
            body.read_to_end(&mut raw)?;
            if (raw.len() as u64) < length {
                return Err(RequestError::Truncated);
            }
            self.body_raw = String::from_utf8_lossy(&raw).into_owned();
            self.body_params.parse_into(&self.body_raw, '&');
        }
        Ok(())
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// The request line as received
    pub fn request_line(&self) -> &str {
        &self.request_line
    }

    /// Raw path without query string or fragment
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Decoded path with the leading `/` removed; this is what resources
    /// route on.
    pub fn location(&self) -> &str {
        &self.location
    }

    /// Fragment after `#`, if the client sent one
    pub fn anchor(&self) -> Option<&str> {
        self.anchor.as_deref()
    }

    pub fn query_raw(&self) -> &str {
        &self.query_raw
    }

    /// The whole query string, decoded
    pub fn query(&self) -> &str {
        &self.query
    }

    /// Query string parameters
    pub fn params(&self) -> &Params {
        &self.params
    }

    /// First value of a query parameter
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    /// The urlencoded body; for multipart bodies, the plain fields
    /// re-encoded
    pub fn body_raw(&self) -> &str {
        &self.body_raw
    }

    pub fn body_params(&self) -> &Params {
        &self.body_params
    }

    /// First value of a body parameter
    pub fn body_param(&self, name: &str) -> Option<&str> {
        self.body_params.get(name)
    }

    pub fn uploads(&self) -> &HashMap<String, FileUpload> {
        &self.uploads
    }

    pub fn upload(&self, field: &str) -> Option<&FileUpload> {
        self.uploads.get(field)
    }

    /// Take an upload out of the request, e.g. to persist its file
    pub fn take_upload(&mut self, field: &str) -> Option<FileUpload> {
        self.uploads.remove(field)
    }

    /// Header lookup, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn headers(&self) -> &HashMap<String, String> {
        &self.headers
    }

    pub fn cookies(&self) -> &Params {
        &self.cookies
    }

    pub fn cookie(&self, name: &str) -> Option<&str> {
        self.cookies.get(name)
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer_addr
    }

    /// Whether the client asked for `connection: keep-alive`
    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    /// Session attached by the server, when sessions are enabled
    pub fn session(&self) -> Option<&SessionHandle> {
        self.session.as_ref()
    }

    pub(crate) fn set_session(&mut self, session: SessionHandle) {
        self.session = Some(session);
    }
}
