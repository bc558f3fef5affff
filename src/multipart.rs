//! `multipart/form-data` body scanning.
//!
//! Plain fields are read line by line. File parts are streamed straight
//! into a temporary file through a window the size of `CRLF--boundary`
//! that slides one byte at a time, so no part is ever buffered whole.

use crate::error::RequestError;
use crate::http::{encode_component, Params};
use crate::request::{read_byte, read_line};
use crate::upload::{FileUpload, TempFile, UploadStatus};
use log::{debug, warn};
use std::collections::HashMap;
use std::io::{BufRead, BufWriter, Write};
use std::path::PathBuf;

pub const MIN_BOUNDARY_LENGTH: usize = 2;
pub const MAX_BOUNDARY_LENGTH: usize = 80;

/// Longest single line accepted inside a plain field
const MAX_FIELD_LINE: usize = 1024 * 1024;
const MAX_PART_HEADER_LINE: usize = 8 * 1024;

/// Pull the boundary token out of a `multipart/form-data` content type
pub fn parse_boundary(content_type: &str) -> Result<String, RequestError> {
    let boundary = content_type
        .split(';')
        .skip(1)
        .filter_map(|param| param.split_once('='))
        .find(|(key, _)| key.trim().eq_ignore_ascii_case("boundary"))
        .map(|(_, value)| value.trim().trim_matches('"').to_string())
        .ok_or_else(|| RequestError::BadBoundary("missing boundary attribute".to_string()))?;

    if !(MIN_BOUNDARY_LENGTH..=MAX_BOUNDARY_LENGTH).contains(&boundary.len()) {
        return Err(RequestError::BadBoundary(boundary));
    }
    Ok(boundary)
}

/// Split a header value on `;` outside of double quotes and return the
/// `key=value` parameters with quotes removed and keys lower-cased.
fn header_params(value: &str) -> Vec<(String, String)> {
    let mut segments = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;

    for c in value.chars() {
        match c {
            _ if escaped => {
                current.push(c);
                escaped = false;
            }
            '\\' if in_quotes => escaped = true,
            '"' => in_quotes = !in_quotes,
            ';' if !in_quotes => segments.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    segments.push(current);

    segments
        .into_iter()
        .filter_map(|segment| {
            let (key, value) = segment.split_once('=')?;
            Some((key.trim().to_ascii_lowercase(), value.trim().to_string()))
        })
        .collect()
}

/// Headers of one part
#[derive(Debug, Default)]
struct PartHeaders {
    name: Option<String>,
    filename: Option<String>,
    content_type: Option<String>,
}

impl PartHeaders {
    fn read<R: BufRead>(reader: &mut R) -> Result<Self, RequestError> {
        let mut headers = PartHeaders::default();
        loop {
            let line = read_line(reader, MAX_PART_HEADER_LINE)?.ok_or(RequestError::Truncated)?;
            if line.is_empty() {
                return Ok(headers);
            }
            let (name, value) = line
                .split_once(':')
                .ok_or_else(|| RequestError::BadMultipart(format!("bad part header: {}", line)))?;

            match name.trim().to_ascii_lowercase().as_str() {
                "content-disposition" => {
                    for (key, param) in header_params(value) {
                        match key.as_str() {
                            "name" => headers.name = Some(param),
                            "filename" => headers.filename = Some(param),
                            _ => {}
                        }
                    }
                }
                "content-type" => headers.content_type = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }
}

/// Fixed-size ring holding the last `target.len()` bytes read.
pub(crate) struct BoundaryWindow {
    target: Vec<u8>,
    buf: Vec<u8>,
    head: usize,
}

impl BoundaryWindow {
    /// Seed the window with the next `target.len()` bytes of the stream
    pub(crate) fn fill<R: BufRead>(target: Vec<u8>, reader: &mut R) -> Result<Self, RequestError> {
        let mut buf = vec![0; target.len()];
        reader.read_exact(&mut buf)?;
        Ok(Self { target, buf, head: 0 })
    }

    pub(crate) fn matches(&self) -> bool {
        let len = self.buf.len();
        (0..len).all(|i| self.buf[(self.head + i) % len] == self.target[i])
    }

    /// Append `byte` and return the byte that fell out of the window
    pub(crate) fn push(&mut self, byte: u8) -> u8 {
        let oldest = self.buf[self.head];
        self.buf[self.head] = byte;
        self.head = (self.head + 1) % self.buf.len();
        oldest
    }
}

/// Everything a multipart body yields
#[derive(Debug, Default)]
pub struct MultipartForm {
    pub fields: Params,
    /// Plain fields re-encoded as an urlencoded string
    pub raw: String,
    pub uploads: HashMap<String, FileUpload>,
}

/// Scanner for one multipart body
pub struct MultipartParser {
    delimiter: String,
    max_upload_size: u64,
    upload_dir: PathBuf,
}

impl MultipartParser {
    pub fn new(boundary: &str, max_upload_size: u64, upload_dir: PathBuf) -> Self {
        Self {
            delimiter: format!("--{}", boundary),
            max_upload_size,
            upload_dir,
        }
    }

    /// Read parts until the closing delimiter.
    ///
    /// `reader` must be limited to the request body; running out of bytes
    /// before the closing delimiter is a truncation error.
    pub fn parse<R: BufRead>(&self, reader: &mut R) -> Result<MultipartForm, RequestError> {
        let closing = format!("{}--", self.delimiter);
        let mut form = MultipartForm::default();

        // Anything before the first delimiter is preamble
        loop {
            let line = read_line(reader, MAX_FIELD_LINE)?.ok_or(RequestError::Truncated)?;
            if line == self.delimiter {
                break;
            }
            if line == closing {
                return Ok(form);
            }
        }

        loop {
            let headers = PartHeaders::read(reader)?;
            let name = headers
                .name
                .ok_or_else(|| RequestError::BadMultipart("part without a name".to_string()))?;

            let last = match headers.filename {
                None => self.read_field(reader, &closing, name, &mut form)?,
                Some(filename) => {
                    let (upload, last) = self.read_file(reader, filename, headers.content_type)?;
                    debug!(
                        "Received upload {:?} for {} ({} bytes, {:?})",
                        upload.filename(),
                        name,
                        upload.size(),
                        upload.status()
                    );
                    form.uploads.insert(name, upload);
                    last
                }
            };
            if last {
                return Ok(form);
            }
        }
    }

    /// Returns true when the closing delimiter ended the field
    fn read_field<R: BufRead>(
        &self,
        reader: &mut R,
        closing: &str,
        name: String,
        form: &mut MultipartForm,
    ) -> Result<bool, RequestError> {
        let mut lines = Vec::new();
        let last = loop {
            let line = read_line(reader, MAX_FIELD_LINE)?.ok_or(RequestError::Truncated)?;
            if line == self.delimiter {
                break false;
            }
            if line == closing {
                break true;
            }
            lines.push(line);
        };
        let value = lines.join("\r\n");

        if !form.raw.is_empty() {
            form.raw.push('&');
        }
        form.raw.push_str(&encode_component(&name));
        form.raw.push('=');
        form.raw.push_str(&encode_component(&value));
        form.fields.append(name, value);
        Ok(last)
    }

    fn read_file<R: BufRead>(
        &self,
        reader: &mut R,
        filename: String,
        content_type: Option<String>,
    ) -> Result<(FileUpload, bool), RequestError> {
        let mut failed = false;
        let (temp, mut sink) = if filename.is_empty() {
            (None, None)
        } else {
            match TempFile::create_in(&self.upload_dir) {
                Ok((temp, file)) => (Some(temp), Some(BufWriter::new(file))),
                Err(e) => {
                    warn!("Cannot create upload file in {}: {}", self.upload_dir.display(), e);
                    failed = true;
                    (None, None)
                }
            }
        };

        let target = format!("\r\n{}", self.delimiter).into_bytes();
        let mut window = BoundaryWindow::fill(target, reader)?;
        let mut size = 0u64;

        while !window.matches() {
            let next = read_byte(reader)?.ok_or(RequestError::Truncated)?;
            let byte = window.push(next);

            // Past the limit the byte is read and dropped
            if size < self.max_upload_size {
                if let Some(out) = sink.as_mut() {
                    if let Err(e) = out.write_all(&[byte]) {
                        warn!("Write to upload file failed: {}", e);
                        failed = true;
                        sink = None;
                    }
                }
            }
            size += 1;
        }

        if let Some(mut out) = sink {
            if let Err(e) = out.flush() {
                warn!("Flush of upload file failed: {}", e);
                failed = true;
            }
        }

        let status = if filename.is_empty() {
            UploadStatus::NoFile
        } else if failed {
            UploadStatus::Partial
        } else if size > self.max_upload_size {
            UploadStatus::SizeExceeded
        } else {
            UploadStatus::Ok
        };

        let mut tail = [0u8; 2];
        reader.read_exact(&mut tail)?;
        let last = match &tail {
            b"\r\n" => false,
            b"--" => true,
            _ => {
                return Err(RequestError::BadMultipart(
                    "garbage after boundary".to_string(),
                ))
            }
        };

        Ok((FileUpload::new(filename, content_type, temp, size, status), last))
    }
}
