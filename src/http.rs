use crate::error::RequestError;
use chrono::{DateTime, TimeZone, Utc};
use std::collections::hash_map::{self, HashMap};
use std::fmt;

/// HTTP status codes this server produces
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Status {
    Ok = 200,
    MovedPermanently = 301,
    BadRequest = 400,
    NotFound = 404,
    MethodNotAllowed = 405,
    LengthRequired = 411,
    InternalServerError = 500,
}

impl Status {
    /// Look up a status by its numeric code
    pub fn from_code(code: u16) -> Option<Self> {
        match code {
            200 => Some(Status::Ok),
            301 => Some(Status::MovedPermanently),
            400 => Some(Status::BadRequest),
            404 => Some(Status::NotFound),
            405 => Some(Status::MethodNotAllowed),
            411 => Some(Status::LengthRequired),
            500 => Some(Status::InternalServerError),
            _ => None,
        }
    }

    /// Numeric status code
    pub fn code(&self) -> u16 {
        *self as u16
    }

    /// Get the reason phrase for this status code
    pub fn as_str(&self) -> &'static str {
        match *self {
            Status::Ok => "OK",
            Status::MovedPermanently => "Moved Permanently",
            Status::BadRequest => "Bad Request",
            Status::NotFound => "Not Found",
            Status::MethodNotAllowed => "Method Not Allowed",
            Status::LengthRequired => "Length Required",
            Status::InternalServerError => "Internal Server Error",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code(), self.as_str())
    }
}

/// HTTP Methods
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Head,
    Post,
}

impl Method {
    /// Parse a method token, ignoring case
    pub fn parse(token: &str) -> Result<Self, RequestError> {
        match token.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "HEAD" => Ok(Method::Head),
            "POST" => Ok(Method::Post),
            _ => Err(RequestError::BadMethod(token.to_string())),
        }
    }

    /// Convert the method to a string
    pub fn as_str(&self) -> &'static str {
        match *self {
            Method::Get => "GET",
            Method::Head => "HEAD",
            Method::Post => "POST",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parameter value: a single string until the same name is seen again,
/// after which it becomes an ordered list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParamValue {
    Single(String),
    Multi(Vec<String>),
}

impl ParamValue {
    /// The first value received under this name
    pub fn first(&self) -> &str {
        match self {
            ParamValue::Single(value) => value,
            // Lists are only created from an existing value, so never empty
            ParamValue::Multi(values) => values.first().map(String::as_str).unwrap_or(""),
        }
    }

    /// All values in arrival order
    pub fn values(&self) -> Vec<&str> {
        match self {
            ParamValue::Single(value) => vec![value.as_str()],
            ParamValue::Multi(values) => values.iter().map(String::as_str).collect(),
        }
    }

    pub fn is_multi(&self) -> bool {
        matches!(self, ParamValue::Multi(_))
    }

    fn push(&mut self, value: String) {
        match self {
            ParamValue::Single(existing) => {
                let first = std::mem::take(existing);
                *self = ParamValue::Multi(vec![first, value]);
            }
            ParamValue::Multi(values) => values.push(value),
        }
    }
}

/// Name to value(s) mapping used for query, body and cookie parameters.
///
/// Values are only ever appended; a list never loses entries.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Params {
    entries: HashMap<String, ParamValue>,
}

impl Params {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a value, promoting an existing single value to a list
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let value = value.into();
        match self.entries.entry(name.into()) {
            hash_map::Entry::Occupied(mut slot) => slot.get_mut().push(value),
            hash_map::Entry::Vacant(slot) => {
                slot.insert(ParamValue::Single(value));
            }
        }
    }

    /// First value for a name
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(ParamValue::first)
    }

    /// Every value for a name, in arrival order
    pub fn get_all(&self, name: &str) -> Vec<&str> {
        self.entries.get(name).map(ParamValue::values).unwrap_or_default()
    }

    pub fn value(&self, name: &str) -> Option<&ParamValue> {
        self.entries.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ParamValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Parse `key=value` pairs separated by `separator`, decoding both sides.
    ///
    /// The query string and urlencoded bodies use `&`, cookies use `;`.
    pub fn parse_into(&mut self, raw: &str, separator: char) {
        for pair in raw.split(separator) {
            let pair = pair.trim_start();
            if pair.is_empty() {
                continue;
            }
            let (key, value) = match pair.find('=') {
                Some(pos) => (&pair[..pos], &pair[pos + 1..]),
                None => (pair, ""),
            };
            self.append(decode_component(key), decode_component(value));
        }
    }

    /// Convenience for a fresh `&`-separated mapping
    pub fn parse(raw: &str) -> Self {
        let mut params = Self::new();
        params.parse_into(raw, '&');
        params
    }
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn percent_decode(input: &str, plus_as_space: bool) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                match (hex_value(bytes[i + 1]), hex_value(bytes[i + 2])) {
                    (Some(hi), Some(lo)) => {
                        out.push(hi << 4 | lo);
                        i += 3;
                    }
                    _ => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' if plus_as_space => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

/// Decode a form-encoded component: `%XX` escapes and `+` as space.
/// Malformed escapes are kept literally.
pub fn decode_component(input: &str) -> String {
    percent_decode(input, true)
}

/// Decode a URL path; `+` is left alone.
pub fn decode_path(input: &str) -> String {
    percent_decode(input, false)
}

/// Form-encode a component. Alphanumerics and `.-*_` pass through, space
/// becomes `+`, every other byte of the UTF-8 encoding becomes `%XX`.
pub fn encode_component(input: &str) -> String {
    const HEX: &[u8; 16] = b"0123456789ABCDEF";
    let mut out = String::with_capacity(input.len());
    for &b in input.as_bytes() {
        match b {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'.' | b'-' | b'*' | b'_' => out.push(b as char),
            b' ' => out.push('+'),
            _ => {
                out.push('%');
                out.push(HEX[(b >> 4) as usize] as char);
                out.push(HEX[(b & 0x0f) as usize] as char);
            }
        }
    }
    out
}

/// Render a timestamp in the RFC 1123 form used by `date` and `expires`.
pub fn http_date(time: DateTime<Utc>) -> String {
    time.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Render milliseconds since the epoch as an HTTP date
pub fn http_date_millis(epoch_ms: i64) -> Option<String> {
    Utc.timestamp_millis_opt(epoch_ms).single().map(http_date)
}
