use log::{debug, warn};
use rand::RngCore;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

/// Outcome of receiving one file part
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadStatus {
    /// The whole part was stored
    Ok,
    /// The part was larger than the configured limit; the file holds the
    /// first `max_upload_size` bytes only
    SizeExceeded,
    /// Storing failed part way; the file, if any, is incomplete
    Partial,
    /// The client sent the part with an empty filename
    NoFile,
}

/// A file in the upload directory that is removed when dropped, unless
/// it has been persisted.
#[derive(Debug)]
pub struct TempFile {
    path: PathBuf,
    keep: bool,
}

impl TempFile {
    /// Create a fresh, uniquely named file in `dir`
    pub fn create_in(dir: &Path) -> io::Result<(Self, File)> {
        let mut suffix = [0u8; 8];
        loop {
            rand::thread_rng().fill_bytes(&mut suffix);
            let name = format!("upload-{}.tmp", u64::from_be_bytes(suffix));
            let path = dir.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(file) => return Ok((Self { path, keep: false }, file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(e),
            }
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the stored contents for reading
    pub fn open(&self) -> io::Result<File> {
        File::open(&self.path)
    }

    /// Current size on disk
    pub fn len(&self) -> io::Result<u64> {
        Ok(fs::metadata(&self.path)?.len())
    }

    /// Move the file to `dest` and stop tracking it.
    pub fn persist<P: AsRef<Path>>(mut self, dest: P) -> io::Result<PathBuf> {
        let dest = dest.as_ref();
        if fs::rename(&self.path, dest).is_err() {
            // Rename fails across filesystems
            fs::copy(&self.path, dest)?;
            fs::remove_file(&self.path)?;
        }
        self.keep = true;
        Ok(dest.to_path_buf())
    }
}

impl Drop for TempFile {
    fn drop(&mut self) {
        if self.keep {
            return;
        }
        match fs::remove_file(&self.path) {
            Ok(()) => debug!("Removed temporary upload {}", self.path.display()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => warn!("Failed to remove {}: {}", self.path.display(), e),
        }
    }
}

/// What the server made of one uploaded file part
#[derive(Debug)]
pub struct FileUpload {
    filename: String,
    content_type: Option<String>,
    file: Option<TempFile>,
    size: u64,
    status: UploadStatus,
}

impl FileUpload {
    pub(crate) fn new(
        filename: String,
        content_type: Option<String>,
        file: Option<TempFile>,
        size: u64,
        status: UploadStatus,
    ) -> Self {
        Self {
            filename,
            content_type,
            file,
            size,
            status,
        }
    }

    /// Filename as sent by the client
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// The part's own `content-type` header, when present
    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }

    pub fn file(&self) -> Option<&TempFile> {
        self.file.as_ref()
    }

    /// Take ownership of the temporary file
    pub fn take_file(&mut self) -> Option<TempFile> {
        self.file.take()
    }

    /// Number of bytes the client sent for this part, including any that
    /// were discarded past the size limit
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn status(&self) -> UploadStatus {
        self.status
    }

    pub fn is_ok(&self) -> bool {
        self.status == UploadStatus::Ok
    }
}
