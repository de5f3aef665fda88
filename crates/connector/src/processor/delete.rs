//! Resource deletion.
//!
//! Directories are emptied depth-first before they are removed. Failures on
//! children are logged and skipped; only the target itself decides the reply.

use nix::errno::Errno;
use protocol::{
    Command, FileInformation, Message, ResponsePacket, FILE_ATTRIBUTE_DIRECTORY,
    FILE_ATTRIBUTE_NORMAL,
};
use tracing::{debug, info, warn};

use super::{remote_error, ExchangeOutcome, ProcessError, ProcessorContext};
use crate::backend::{join_url, last_segment, BackendError, DirHandle, FileBackend};

pub struct Delete;

impl Delete {
    pub(super) fn handle(
        &mut self,
        ctx: &ProcessorContext,
        request_id: &str,
        command: Command,
        message: Message,
    ) -> Result<(), ProcessError> {
        match command {
            Command::DeleteInitReq => {
                let (backend, url) = ctx.connect(&message)?;

                // A link is removed itself, never the tree behind it
                let listing = match backend.lstat(&url) {
                    Ok(stat) if stat.is_symlink => {
                        Err(BackendError::new("opendir", &url, Errno::ENOTDIR))
                    }
                    _ => backend.open_dir(&url),
                };
                let is_directory = match listing {
                    Ok(dir) => {
                        remove_children(backend.as_ref(), &url, dir);
                        backend.rmdir(&url)?;
                        true
                    }
                    Err(err) => {
                        debug!("{} is not a directory ({}), unlinking", url, err);
                        backend.unlink(&url)?;
                        false
                    }
                };
                info!(
                    "Deleted {} {}",
                    if is_directory { "directory" } else { "file" },
                    url
                );

                let resource = FileInformation {
                    name: last_segment(&url).to_string(),
                    is_directory,
                    resource_type: if is_directory {
                        FILE_ATTRIBUTE_DIRECTORY
                    } else {
                        FILE_ATTRIBUTE_NORMAL
                    },
                    ..Default::default()
                };
                ctx.send(&Message::response(
                    request_id,
                    Command::DeleteInitResp,
                    ResponsePacket::DeleteResource(resource),
                ))
            }
            Command::DeleteInitResp => {
                let entries = match message.response_packet() {
                    Some(ResponsePacket::DeleteResource(info)) => vec![info.clone()],
                    _ => Vec::new(),
                };
                ctx.report(ExchangeOutcome::completed(entries, 0));
                Ok(())
            }
            Command::DeleteErrorResp => Err(remote_error(command, &message)),
            other => Err(ProcessError::UnexpectedCommand(other.code())),
        }
    }
}

/// Remove everything below `url`, best effort.
fn remove_children(backend: &dyn FileBackend, url: &str, mut dir: Box<dyn DirHandle>) {
    loop {
        let entry = match dir.next_entry() {
            Ok(Some(entry)) => entry,
            Ok(None) => break,
            Err(err) => {
                warn!("Listing {} failed: {}", url, err);
                break;
            }
        };
        if entry.name == "." || entry.name == ".." {
            continue;
        }

        let child = join_url(url, &entry.name);
        if entry.stat.is_directory && !entry.stat.is_symlink {
            match backend.open_dir(&child) {
                Ok(sub) => remove_children(backend, &child, sub),
                Err(err) => warn!("Skipping contents of {}: {}", child, err),
            }
            if let Err(err) = backend.rmdir(&child) {
                warn!("Could not remove directory {}: {}", child, err);
            }
        } else if let Err(err) = backend.unlink(&child) {
            warn!("Could not remove {}: {}", child, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::*;
    use std::sync::Arc;

    use protocol::{Family, RequestParams};
    use tempfile::TempDir;

    use crate::backend::testing::{Faults, FaultyBackend};
    use crate::backend::LocalBackend;

    fn delete(harness: &Harness, url: &str) -> Result<(), ProcessError> {
        let mut processor = harness.processor(Family::Delete);
        processor.process_request(
            &harness.ctx,
            request(Command::DeleteInitReq, url, RequestParams::None),
        )
    }

    fn deleted_resource(harness: &Harness) -> FileInformation {
        match harness.sent()[0].response_packet() {
            Some(ResponsePacket::DeleteResource(info)) => info.clone(),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_delete_file() {
        let harness = Harness::responder();
        harness.write_file("srv/share/f.txt", b"x");

        delete(&harness, "srv/share/f.txt").unwrap();

        assert!(!harness.path("srv/share/f.txt").exists());
        let info = deleted_resource(&harness);
        assert_eq!(info.name, "f.txt");
        assert!(!info.is_directory);
    }

    #[test]
    fn test_delete_tree() {
        let harness = Harness::responder();
        harness.write_file("srv/share/tree/a.txt", b"a");
        harness.write_file("srv/share/tree/sub/b.txt", b"b");
        harness.write_file("srv/share/tree/sub/deeper/c.txt", b"c");

        delete(&harness, "srv/share/tree").unwrap();

        assert!(!harness.path("srv/share/tree").exists());
        assert!(deleted_resource(&harness).is_directory);
    }

    #[test]
    fn test_child_failure_is_ignored() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("srv/share/dir/stubborn")).unwrap();
        std::fs::write(root.path().join("srv/share/dir/f.txt"), b"x").unwrap();
        let inner: Arc<dyn FileBackend> = Arc::new(LocalBackend::new(root.path()));
        let backend = Arc::new(FaultyBackend::new(
            inner,
            Faults {
                open_dir: vec![("stubborn".to_string(), Errno::EACCES)],
                ..Default::default()
            },
        ));
        let harness = Harness::responder_with(root, backend.clone());

        delete(&harness, "srv/share/dir").unwrap();

        assert!(!harness.path("srv/share/dir").exists());
        assert!(deleted_resource(&harness).is_directory);
        assert_eq!(
            *backend.unlinked.lock().unwrap(),
            vec!["srv/share/dir/f.txt".to_string()]
        );
    }

    #[test]
    fn test_non_empty_leftover_reports_errno() {
        let root = TempDir::new().unwrap();
        std::fs::create_dir_all(root.path().join("srv/share/dir/stubborn")).unwrap();
        std::fs::write(root.path().join("srv/share/dir/stubborn/keep.txt"), b"x").unwrap();
        let inner: Arc<dyn FileBackend> = Arc::new(LocalBackend::new(root.path()));
        let backend = Arc::new(FaultyBackend::new(
            inner,
            Faults {
                open_dir: vec![("stubborn".to_string(), Errno::EACCES)],
                ..Default::default()
            },
        ));
        let harness = Harness::responder_with(root, backend);

        assert!(delete(&harness, "srv/share/dir").is_err());

        let sent = harness.sent();
        assert_eq!(commands(&sent), vec![Command::DeleteErrorResp]);
        assert_eq!(sent[0].status_body().unwrap().code, Errno::ENOTEMPTY as i32);
        assert!(harness.path("srv/share/dir/stubborn/keep.txt").exists());
    }

    #[test]
    fn test_linked_directory_is_unlinked_not_emptied() {
        let harness = Harness::responder();
        harness.write_file("outside/keep.txt", b"x");
        std::fs::create_dir_all(harness.path("srv/share")).unwrap();
        std::os::unix::fs::symlink(harness.path("outside"), harness.path("srv/share/link"))
            .unwrap();

        delete(&harness, "srv/share/link").unwrap();

        assert!(std::fs::symlink_metadata(harness.path("srv/share/link")).is_err());
        assert!(harness.path("outside/keep.txt").exists());
        assert!(!deleted_resource(&harness).is_directory);
    }

    #[test]
    fn test_links_inside_tree_are_not_followed() {
        let harness = Harness::responder();
        harness.write_file("outside/keep.txt", b"x");
        harness.write_file("srv/share/tree/a.txt", b"a");
        std::os::unix::fs::symlink(harness.path("outside"), harness.path("srv/share/tree/link"))
            .unwrap();

        delete(&harness, "srv/share/tree").unwrap();

        assert!(!harness.path("srv/share/tree").exists());
        assert!(harness.path("outside/keep.txt").exists());
    }

    #[test]
    fn test_missing_target() {
        let harness = Harness::responder();
        assert!(delete(&harness, "srv/share/ghost").is_err());
        assert_eq!(
            harness.sent()[0].status_body().unwrap().code,
            Errno::ENOENT as i32
        );
    }
}
