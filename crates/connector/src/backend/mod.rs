//! File backend capability.
//!
//! The connector never touches a share directly. Processors go through a
//! [`BackendConnector`] that adopts the request credentials and hands back a
//! [`FileBackend`] for the addressed server. Every failure carries the OS
//! error number so it can be reported in a status packet.
//!
//! URLs have the form `[smb://]server/share/path`. A URL with no `/` names
//! the server itself and lists its shares.

mod local;

pub use local::{LocalBackend, LocalConnector};

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use nix::errno::Errno;
use protocol::{
    Credentials, FileInformation, FILE_ATTRIBUTE_DIRECTORY, FILE_ATTRIBUTE_HIDDEN,
    FILE_ATTRIBUTE_NORMAL,
};
use thiserror::Error;

/// URL scheme accepted (and ignored) in front of a share URL.
pub const URL_SCHEME: &str = "smb://";

/// A failed backend operation.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{op} {url}: {}", .errno.desc())]
pub struct BackendError {
    /// Operation that failed.
    pub op: &'static str,
    /// URL the operation addressed.
    pub url: String,
    /// OS error number.
    pub errno: Errno,
}

impl BackendError {
    /// Create a new backend error.
    pub fn new(op: &'static str, url: impl Into<String>, errno: Errno) -> Self {
        Self {
            op,
            url: url.into(),
            errno,
        }
    }

    /// Build from an I/O error, falling back to `EIO` when it has no OS code.
    pub fn from_io(op: &'static str, url: impl Into<String>, err: &std::io::Error) -> Self {
        let errno = err.raw_os_error().map(Errno::from_raw).unwrap_or(Errno::EIO);
        Self::new(op, url, errno)
    }

    /// Positive error number sent in status packets.
    pub fn code(&self) -> i32 {
        self.errno as i32
    }

    /// OS description of the error number.
    pub fn description(&self) -> &'static str {
        self.errno.desc()
    }
}

/// Result type alias for backend operations.
pub type BackendResult<T> = Result<T, BackendError>;

/// Metadata of a file, directory or share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileStat {
    pub is_directory: bool,
    /// Set only by [`FileBackend::lstat`] and directory listings.
    pub is_symlink: bool,
    pub hidden: bool,
    pub size: u64,
    /// Milliseconds since the Unix epoch.
    pub create_time: i64,
    /// Milliseconds since the Unix epoch.
    pub modified_time: i64,
}

impl FileStat {
    /// Attribute bits for this entry.
    pub fn resource_type(&self) -> u32 {
        let mut bits = if self.is_directory {
            FILE_ATTRIBUTE_DIRECTORY
        } else {
            FILE_ATTRIBUTE_NORMAL
        };
        if self.hidden {
            bits |= FILE_ATTRIBUTE_HIDDEN;
        }
        bits
    }

    /// Wire metadata for an entry called `name`.
    pub fn to_file_information(&self, name: impl Into<String>) -> FileInformation {
        FileInformation {
            name: name.into(),
            is_directory: self.is_directory,
            size: self.size,
            create_time: self.create_time,
            modified_time: self.modified_time,
            resource_type: self.resource_type(),
        }
    }
}

/// One directory entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub stat: FileStat,
}

/// How a file is opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Read-only.
    Read,
    /// Write-only, created or truncated.
    Create,
}

/// An open directory.
pub trait DirHandle: Send {
    /// Next entry, or `None` once the directory is exhausted.
    fn next_entry(&mut self) -> BackendResult<Option<DirEntry>>;
}

/// An open file.
pub trait FileHandle: Send {
    fn stat(&self) -> BackendResult<FileStat>;

    /// Move the cursor to `offset` bytes from the start.
    fn seek(&mut self, offset: u64) -> BackendResult<u64>;

    /// Read into `buf`. Returns 0 at end of file.
    fn read(&mut self, buf: &mut [u8]) -> BackendResult<usize>;

    fn write(&mut self, data: &[u8]) -> BackendResult<usize>;

    /// Flush and release the handle. Further calls fail with `EBADF`.
    fn close(&mut self) -> BackendResult<()>;
}

/// Operations on one server's shares.
pub trait FileBackend: Send + Sync {
    fn open_dir(&self, url: &str) -> BackendResult<Box<dyn DirHandle>>;
    fn open_file(&self, url: &str, mode: OpenMode) -> BackendResult<Box<dyn FileHandle>>;
    fn stat(&self, url: &str) -> BackendResult<FileStat>;
    /// Like [`stat`](FileBackend::stat), but a symbolic link describes itself.
    fn lstat(&self, url: &str) -> BackendResult<FileStat>;
    fn mkdir(&self, url: &str) -> BackendResult<()>;
    fn rmdir(&self, url: &str) -> BackendResult<()>;
    fn unlink(&self, url: &str) -> BackendResult<()>;
    fn rename(&self, from: &str, to: &str) -> BackendResult<()>;
}

/// Adopts credentials and yields a backend for the addressed server.
pub trait BackendConnector: Send + Sync {
    fn connect(&self, credentials: &Credentials) -> BackendResult<Arc<dyn FileBackend>>;
}

/// Strip the optional scheme and surrounding slashes from a URL.
pub fn normalize_url(url: &str) -> &str {
    url.strip_prefix(URL_SCHEME)
        .unwrap_or(url)
        .trim_matches('/')
}

/// Whether the URL names a server rather than a path inside a share.
pub fn is_server_url(url: &str) -> bool {
    !normalize_url(url).contains('/')
}

/// Last path segment of a URL.
pub fn last_segment(url: &str) -> &str {
    let url = normalize_url(url);
    url.rsplit('/').next().unwrap_or(url)
}

/// Parent URL, or `None` for a bare server.
pub fn parent_url(url: &str) -> Option<&str> {
    let url = normalize_url(url);
    url.rfind('/').map(|idx| &url[..idx])
}

/// Append a child name to a URL.
pub fn join_url(url: &str, name: &str) -> String {
    format!("{}/{}", normalize_url(url), name)
}

/// Create a directory and any missing parents.
///
/// An already existing directory counts as success.
pub fn create_dir_recursive(backend: &dyn FileBackend, url: &str) -> BackendResult<()> {
    match backend.mkdir(url) {
        Ok(()) => {
            tracing::debug!("Directory {} created", url);
            Ok(())
        }
        Err(err) if err.errno == Errno::EEXIST => Ok(()),
        Err(err) if err.errno == Errno::ENOENT => {
            // Parent is missing, create it and retry once
            let parent = parent_url(url).ok_or_else(|| err.clone())?;
            if is_server_url(parent) {
                return Err(err);
            }
            create_dir_recursive(backend, parent)?;
            match backend.mkdir(url) {
                Err(err) if err.errno != Errno::EEXIST => Err(err),
                _ => Ok(()),
            }
        }
        Err(err) => Err(err),
    }
}

/// Convert a timestamp to milliseconds since the Unix epoch.
pub(crate) fn system_time_ms(time: SystemTime) -> i64 {
    match time.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_millis() as i64,
        Err(e) => -(e.duration().as_millis() as i64),
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fault-injecting backend wrapper for processor tests.

    use super::*;
    use std::sync::Mutex;

    /// Which calls to fail.
    #[derive(Debug, Default, Clone)]
    pub struct Faults {
        /// Fail `open_dir` for URLs ending with any of these suffixes.
        pub open_dir: Vec<(String, Errno)>,
        /// Fail `write` after this many successful writes.
        pub write_after: Option<(usize, Errno)>,
        /// Fail `read` after this many successful reads.
        pub read_after: Option<(usize, Errno)>,
        /// Fail `rename` with this errno.
        pub rename: Option<Errno>,
    }

    /// Wraps another backend and injects configured failures.
    pub struct FaultyBackend {
        inner: Arc<dyn FileBackend>,
        faults: Faults,
        pub unlinked: Mutex<Vec<String>>,
    }

    impl FaultyBackend {
        pub fn new(inner: Arc<dyn FileBackend>, faults: Faults) -> Self {
            Self {
                inner,
                faults,
                unlinked: Mutex::new(Vec::new()),
            }
        }
    }

    struct FaultyFile {
        inner: Box<dyn FileHandle>,
        url: String,
        writes: usize,
        reads: usize,
        write_after: Option<(usize, Errno)>,
        read_after: Option<(usize, Errno)>,
    }

    impl FileHandle for FaultyFile {
        fn stat(&self) -> BackendResult<FileStat> {
            self.inner.stat()
        }

        fn seek(&mut self, offset: u64) -> BackendResult<u64> {
            self.inner.seek(offset)
        }

        fn read(&mut self, buf: &mut [u8]) -> BackendResult<usize> {
            if let Some((after, errno)) = self.read_after {
                if self.reads >= after {
                    return Err(BackendError::new("read", self.url.clone(), errno));
                }
            }
            self.reads += 1;
            self.inner.read(buf)
        }

        fn write(&mut self, data: &[u8]) -> BackendResult<usize> {
            if let Some((after, errno)) = self.write_after {
                if self.writes >= after {
                    return Err(BackendError::new("write", self.url.clone(), errno));
                }
            }
            self.writes += 1;
            self.inner.write(data)
        }

        fn close(&mut self) -> BackendResult<()> {
            self.inner.close()
        }
    }

    impl FileBackend for FaultyBackend {
        fn open_dir(&self, url: &str) -> BackendResult<Box<dyn DirHandle>> {
            for (suffix, errno) in &self.faults.open_dir {
                if url.ends_with(suffix.as_str()) {
                    return Err(BackendError::new("opendir", url, *errno));
                }
            }
            self.inner.open_dir(url)
        }

        fn open_file(&self, url: &str, mode: OpenMode) -> BackendResult<Box<dyn FileHandle>> {
            let inner = self.inner.open_file(url, mode)?;
            Ok(Box::new(FaultyFile {
                inner,
                url: url.to_string(),
                writes: 0,
                reads: 0,
                write_after: self.faults.write_after,
                read_after: self.faults.read_after,
            }))
        }

        fn stat(&self, url: &str) -> BackendResult<FileStat> {
            self.inner.stat(url)
        }

        fn lstat(&self, url: &str) -> BackendResult<FileStat> {
            self.inner.lstat(url)
        }

        fn mkdir(&self, url: &str) -> BackendResult<()> {
            self.inner.mkdir(url)
        }

        fn rmdir(&self, url: &str) -> BackendResult<()> {
            self.inner.rmdir(url)
        }

        fn unlink(&self, url: &str) -> BackendResult<()> {
            self.unlinked.lock().unwrap().push(url.to_string());
            self.inner.unlink(url)
        }

        fn rename(&self, from: &str, to: &str) -> BackendResult<()> {
            if let Some(errno) = self.faults.rename {
                return Err(BackendError::new("rename", from, errno));
            }
            self.inner.rename(from, to)
        }
    }

    /// Connector that always hands out the same backend.
    pub struct FixedConnector(pub Arc<dyn FileBackend>);

    impl BackendConnector for FixedConnector {
        fn connect(&self, _credentials: &Credentials) -> BackendResult<Arc<dyn FileBackend>> {
            Ok(self.0.clone())
        }
    }
}
