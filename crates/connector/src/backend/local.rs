//! Backend serving shares from a local directory tree.
//!
//! The root directory holds one subdirectory per server, each holding one
//! subdirectory per share: `root/server/share/path`.

use std::fs::{self, File, OpenOptions, ReadDir};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use nix::errno::Errno;
use protocol::Credentials;

use super::{
    normalize_url, system_time_ms, BackendConnector, BackendError, BackendResult, DirEntry,
    DirHandle, FileBackend, FileHandle, FileStat, OpenMode,
};

/// Connector handing out [`LocalBackend`]s rooted at one directory.
#[derive(Debug, Clone)]
pub struct LocalConnector {
    root: PathBuf,
}

impl LocalConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl BackendConnector for LocalConnector {
    fn connect(&self, credentials: &Credentials) -> BackendResult<Arc<dyn FileBackend>> {
        if normalize_url(&credentials.url).is_empty() {
            return Err(BackendError::new("connect", &credentials.url, Errno::EINVAL));
        }

        tracing::debug!(
            "Adopting credentials for {} (user: {:?}, workgroup: {:?}, kerberos: {})",
            credentials.url,
            credentials.username,
            credentials.workgroup,
            credentials.kerberos
        );

        Ok(Arc::new(LocalBackend::new(&self.root)))
    }
}

/// File backend over a local directory tree.
#[derive(Debug, Clone)]
pub struct LocalBackend {
    root: PathBuf,
}

impl LocalBackend {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    /// Map a share URL to a path under the root.
    ///
    /// Only plain name components are accepted.
    fn resolve(&self, op: &'static str, url: &str) -> BackendResult<PathBuf> {
        let relative = normalize_url(url);
        if relative.is_empty() {
            return Err(BackendError::new(op, url, Errno::EINVAL));
        }

        let mut path = self.root.clone();
        for segment in relative.split('/').filter(|s| !s.is_empty()) {
            match Path::new(segment).components().next() {
                Some(Component::Normal(_)) if segment != "." => path.push(segment),
                _ => return Err(BackendError::new(op, url, Errno::EACCES)),
            }
        }
        Ok(path)
    }
}

fn stat_from_metadata(name: &str, meta: &fs::Metadata) -> FileStat {
    let modified = meta.modified().ok().map(system_time_ms).unwrap_or(0);
    let created = meta
        .created()
        .ok()
        .map(system_time_ms)
        .unwrap_or(modified);

    FileStat {
        is_directory: meta.is_dir(),
        is_symlink: meta.file_type().is_symlink(),
        hidden: name.starts_with('.'),
        size: if meta.is_dir() { 0 } else { meta.len() },
        create_time: created,
        modified_time: modified,
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default()
}

struct LocalDir {
    url: String,
    entries: ReadDir,
}

impl DirHandle for LocalDir {
    fn next_entry(&mut self) -> BackendResult<Option<DirEntry>> {
        let Some(entry) = self.entries.next() else {
            return Ok(None);
        };
        let entry = entry.map_err(|e| BackendError::from_io("readdir", &self.url, &e))?;
        let name = entry.file_name().to_string_lossy().into_owned();

        let stat = match entry.metadata() {
            Ok(meta) => stat_from_metadata(&name, &meta),
            Err(e) => {
                // Entry vanished between readdir and stat
                tracing::debug!("stat of {} in {} failed: {}", name, self.url, e);
                FileStat {
                    is_directory: entry.file_type().map(|t| t.is_dir()).unwrap_or(false),
                    is_symlink: entry.file_type().map(|t| t.is_symlink()).unwrap_or(false),
                    hidden: name.starts_with('.'),
                    ..Default::default()
                }
            }
        };

        Ok(Some(DirEntry { name, stat }))
    }
}

struct LocalFile {
    url: String,
    name: String,
    file: Option<File>,
}

impl LocalFile {
    fn file(&mut self, op: &'static str) -> BackendResult<&mut File> {
        let url = &self.url;
        self.file
            .as_mut()
            .ok_or_else(|| BackendError::new(op, url.clone(), Errno::EBADF))
    }
}

impl FileHandle for LocalFile {
    fn stat(&self) -> BackendResult<FileStat> {
        let file = self
            .file
            .as_ref()
            .ok_or_else(|| BackendError::new("fstat", &self.url, Errno::EBADF))?;
        let meta = file
            .metadata()
            .map_err(|e| BackendError::from_io("fstat", &self.url, &e))?;
        Ok(stat_from_metadata(&self.name, &meta))
    }

    fn seek(&mut self, offset: u64) -> BackendResult<u64> {
        let url = self.url.clone();
        self.file("lseek")?
            .seek(SeekFrom::Start(offset))
            .map_err(|e| BackendError::from_io("lseek", url, &e))
    }

    fn read(&mut self, buf: &mut [u8]) -> BackendResult<usize> {
        let url = self.url.clone();
        self.file("read")?
            .read(buf)
            .map_err(|e| BackendError::from_io("read", url, &e))
    }

    fn write(&mut self, data: &[u8]) -> BackendResult<usize> {
        let url = self.url.clone();
        let file = self.file("write")?;
        file.write_all(data)
            .map_err(|e| BackendError::from_io("write", url, &e))?;
        Ok(data.len())
    }

    fn close(&mut self) -> BackendResult<()> {
        let url = self.url.clone();
        let mut file = self
            .file
            .take()
            .ok_or_else(|| BackendError::new("close", url.clone(), Errno::EBADF))?;
        file.flush()
            .map_err(|e| BackendError::from_io("close", url, &e))
    }
}

impl FileBackend for LocalBackend {
    fn open_dir(&self, url: &str) -> BackendResult<Box<dyn DirHandle>> {
        let path = self.resolve("opendir", url)?;
        let entries = fs::read_dir(&path).map_err(|e| BackendError::from_io("opendir", url, &e))?;
        Ok(Box::new(LocalDir {
            url: url.to_string(),
            entries,
        }))
    }

    fn open_file(&self, url: &str, mode: OpenMode) -> BackendResult<Box<dyn FileHandle>> {
        let path = self.resolve("open", url)?;
        let file = match mode {
            OpenMode::Read => File::open(&path),
            OpenMode::Create => OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path),
        }
        .map_err(|e| BackendError::from_io("open", url, &e))?;

        // Opening a directory for reading succeeds on Linux
        if mode == OpenMode::Read {
            let is_dir = file
                .metadata()
                .map(|m| m.is_dir())
                .map_err(|e| BackendError::from_io("open", url, &e))?;
            if is_dir {
                return Err(BackendError::new("open", url, Errno::EISDIR));
            }
        }

        Ok(Box::new(LocalFile {
            url: url.to_string(),
            name: file_name(&path),
            file: Some(file),
        }))
    }

    fn stat(&self, url: &str) -> BackendResult<FileStat> {
        let path = self.resolve("stat", url)?;
        let meta = fs::metadata(&path).map_err(|e| BackendError::from_io("stat", url, &e))?;
        Ok(stat_from_metadata(&file_name(&path), &meta))
    }

    fn lstat(&self, url: &str) -> BackendResult<FileStat> {
        let path = self.resolve("lstat", url)?;
        let meta =
            fs::symlink_metadata(&path).map_err(|e| BackendError::from_io("lstat", url, &e))?;
        Ok(stat_from_metadata(&file_name(&path), &meta))
    }

    fn mkdir(&self, url: &str) -> BackendResult<()> {
        let path = self.resolve("mkdir", url)?;
        fs::create_dir(&path).map_err(|e| BackendError::from_io("mkdir", url, &e))
    }

    fn rmdir(&self, url: &str) -> BackendResult<()> {
        let path = self.resolve("rmdir", url)?;
        fs::remove_dir(&path).map_err(|e| BackendError::from_io("rmdir", url, &e))
    }

    fn unlink(&self, url: &str) -> BackendResult<()> {
        let path = self.resolve("unlink", url)?;
        fs::remove_file(&path).map_err(|e| BackendError::from_io("unlink", url, &e))
    }

    fn rename(&self, from: &str, to: &str) -> BackendResult<()> {
        let src = self.resolve("rename", from)?;
        let dst = self.resolve("rename", to)?;
        fs::rename(&src, &dst).map_err(|e| BackendError::from_io("rename", from, &e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn setup() -> (TempDir, LocalBackend) {
        let root = TempDir::new().unwrap();
        let share = root.path().join("srv").join("share");
        fs::create_dir_all(share.join("docs")).unwrap();
        fs::write(share.join("a.txt"), b"hello").unwrap();
        fs::write(share.join(".hidden"), b"x").unwrap();
        let backend = LocalBackend::new(root.path());
        (root, backend)
    }

    fn names(backend: &LocalBackend, url: &str) -> Vec<String> {
        let mut dir = backend.open_dir(url).unwrap();
        let mut names = Vec::new();
        while let Some(entry) = dir.next_entry().unwrap() {
            names.push(entry.name);
        }
        names.sort();
        names
    }

    #[test]
    fn test_list_share() {
        let (_root, backend) = setup();
        assert_eq!(names(&backend, "srv/share"), vec![".hidden", "a.txt", "docs"]);
    }

    #[test]
    fn test_list_server_shares() {
        let (_root, backend) = setup();
        assert_eq!(names(&backend, "smb://srv"), vec!["share"]);
    }

    #[test]
    fn test_entry_metadata() {
        let (_root, backend) = setup();
        let mut dir = backend.open_dir("srv/share").unwrap();
        while let Some(entry) = dir.next_entry().unwrap() {
            match entry.name.as_str() {
                "a.txt" => {
                    assert_eq!(entry.stat.size, 5);
                    assert!(!entry.stat.is_directory);
                    assert!(entry.stat.modified_time > 0);
                }
                "docs" => assert!(entry.stat.is_directory),
                ".hidden" => assert!(entry.stat.hidden),
                other => panic!("unexpected entry {}", other),
            }
        }
    }

    #[test]
    fn test_lstat_describes_link_itself() {
        let (root, backend) = setup();
        std::os::unix::fs::symlink(
            root.path().join("srv/share/docs"),
            root.path().join("srv/share/docs-link"),
        )
        .unwrap();

        let followed = backend.stat("srv/share/docs-link").unwrap();
        assert!(followed.is_directory);
        assert!(!followed.is_symlink);

        let link = backend.lstat("srv/share/docs-link").unwrap();
        assert!(link.is_symlink);
        assert!(!link.is_directory);

        assert!(!backend.lstat("srv/share/docs").unwrap().is_symlink);
    }

    #[test]
    fn test_open_dir_on_file_is_enotdir() {
        let (_root, backend) = setup();
        let err = backend.open_dir("srv/share/a.txt").err().unwrap();
        assert_eq!(err.errno, Errno::ENOTDIR);
    }

    #[test]
    fn test_open_missing_is_enoent() {
        let (_root, backend) = setup();
        let err = backend.open_dir("srv/share/nope").err().unwrap();
        assert_eq!(err.errno, Errno::ENOENT);
        let err = backend.open_file("srv/share/nope", OpenMode::Read).err().unwrap();
        assert_eq!(err.errno, Errno::ENOENT);
    }

    #[test]
    fn test_open_directory_as_file_is_eisdir() {
        let (_root, backend) = setup();
        let err = backend.open_file("srv/share/docs", OpenMode::Read).err().unwrap();
        assert_eq!(err.errno, Errno::EISDIR);
    }

    #[test]
    fn test_parent_components_rejected() {
        let (_root, backend) = setup();
        let err = backend.stat("srv/share/../../etc").unwrap_err();
        assert_eq!(err.errno, Errno::EACCES);
        let err = backend.stat("srv/./share").unwrap_err();
        assert_eq!(err.errno, Errno::EACCES);
    }

    #[test]
    fn test_empty_url_rejected() {
        let (_root, backend) = setup();
        assert_eq!(backend.stat("").unwrap_err().errno, Errno::EINVAL);
    }

    #[test]
    fn test_read_with_seek() {
        let (_root, backend) = setup();
        let mut file = backend.open_file("srv/share/a.txt", OpenMode::Read).unwrap();
        assert_eq!(file.stat().unwrap().size, 5);
        file.seek(2).unwrap();
        let mut buf = [0u8; 16];
        let n = file.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"llo");
        assert_eq!(file.read(&mut buf).unwrap(), 0);
        file.close().unwrap();
        assert_eq!(file.read(&mut buf).unwrap_err().errno, Errno::EBADF);
    }

    #[test]
    fn test_write_rename_unlink() {
        let (root, backend) = setup();
        let mut file = backend
            .open_file("srv/share/docs/.tmp", OpenMode::Create)
            .unwrap();
        file.write(b"data").unwrap();
        file.close().unwrap();

        backend
            .rename("srv/share/docs/.tmp", "srv/share/docs/final.bin")
            .unwrap();
        let share = root.path().join("srv/share/docs");
        assert_eq!(fs::read(share.join("final.bin")).unwrap(), b"data");
        assert!(!share.join(".tmp").exists());

        backend.unlink("srv/share/docs/final.bin").unwrap();
        assert!(!share.join("final.bin").exists());
    }

    #[test]
    fn test_mkdir_rmdir() {
        let (root, backend) = setup();
        backend.mkdir("srv/share/new").unwrap();
        assert!(root.path().join("srv/share/new").is_dir());
        assert_eq!(
            backend.mkdir("srv/share/new").unwrap_err().errno,
            Errno::EEXIST
        );
        backend.rmdir("srv/share/new").unwrap();
        assert_eq!(
            backend.rmdir("srv/share/docs/missing").unwrap_err().errno,
            Errno::ENOENT
        );
    }

    #[test]
    fn test_connector_rejects_empty_url() {
        let root = TempDir::new().unwrap();
        let connector = LocalConnector::new(root.path());
        let creds = Credentials::default();
        assert_eq!(
            connector.connect(&creds).err().unwrap().errno,
            Errno::EINVAL
        );

        let creds = Credentials {
            url: "srv/share".into(),
            ..Default::default()
        };
        assert!(connector.connect(&creds).is_ok());
    }
}
