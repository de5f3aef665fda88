//! Reachability check for a share URL.

use nix::errno::Errno;
use protocol::{Command, Message, ResponsePacket};
use tracing::info;

use super::{remote_error, ExchangeOutcome, ProcessError, ProcessorContext};
use crate::backend::{last_segment, FileStat, OpenMode};

#[derive(Default)]
pub struct TestConnection;

impl TestConnection {
    pub(super) fn handle(
        &mut self,
        ctx: &ProcessorContext,
        request_id: &str,
        command: Command,
        message: Message,
    ) -> Result<(), ProcessError> {
        match command {
            Command::TestConnectionInitReq => {
                let (backend, url) = ctx.connect(&message)?;

                let stat = match backend.open_dir(&url) {
                    Ok(_) => backend.stat(&url).unwrap_or(FileStat {
                        is_directory: true,
                        ..Default::default()
                    }),
                    Err(err) if err.errno == Errno::ENOTDIR => {
                        let mut file = backend.open_file(&url, OpenMode::Read)?;
                        let stat = file.stat()?;
                        file.close()?;
                        stat
                    }
                    Err(err) => return Err(err.into()),
                };

                ctx.send(&Message::response(
                    request_id,
                    Command::TestConnectionInitResp,
                    ResponsePacket::TestConnection(stat.to_file_information(last_segment(&url))),
                ))
            }
            Command::TestConnectionInitResp => {
                let entries = match message.response_packet() {
                    Some(ResponsePacket::TestConnection(info)) => {
                        info!(
                            "Reached {} ({})",
                            info.name,
                            if info.is_directory { "directory" } else { "file" }
                        );
                        vec![info.clone()]
                    }
                    _ => Vec::new(),
                };
                ctx.report(ExchangeOutcome::completed(entries, 0));
                Ok(())
            }
            Command::TestConnectionErrorResp => Err(remote_error(command, &message)),
            other => Err(ProcessError::UnexpectedCommand(other.code())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::*;
    use super::super::TransferSettings;
    use super::*;
    use protocol::{Family, FileInformation, RequestParams};

    fn connect_to(harness: &Harness, url: &str) -> Result<(), ProcessError> {
        let mut processor = harness.processor(Family::TestConnection);
        processor.process_request(
            &harness.ctx,
            request(Command::TestConnectionInitReq, url, RequestParams::None),
        )
    }

    fn reported(harness: &Harness) -> FileInformation {
        match harness.sent()[0].response_packet() {
            Some(ResponsePacket::TestConnection(info)) => info.clone(),
            other => panic!("unexpected body {:?}", other),
        }
    }

    #[test]
    fn test_share_directory() {
        let harness = Harness::responder();
        connect_to(&harness, "smb://srv/share").unwrap();
        let info = reported(&harness);
        assert_eq!(info.name, "share");
        assert!(info.is_directory);
    }

    #[test]
    fn test_file_target() {
        let harness = Harness::responder();
        harness.write_file("srv/share/notes.txt", b"12345");
        connect_to(&harness, "srv/share/notes.txt").unwrap();
        let info = reported(&harness);
        assert_eq!(info.name, "notes.txt");
        assert_eq!(info.size, 5);
        assert!(!info.is_directory);
    }

    #[test]
    fn test_unreachable_target() {
        let harness = Harness::responder();
        assert!(connect_to(&harness, "other/share").is_err());
        let sent = harness.sent();
        assert_eq!(commands(&sent), vec![Command::TestConnectionErrorResp]);
        assert_eq!(sent[0].status_body().unwrap().code, Errno::ENOENT as i32);
    }

    #[test]
    fn test_initiator_success() {
        let harness = Harness::initiator(TransferSettings::default());
        let mut processor = harness.processor(Family::TestConnection);
        processor
            .process_request(
                &harness.ctx,
                Message::response(
                    REQUEST_ID,
                    Command::TestConnectionInitResp,
                    ResponsePacket::TestConnection(FileInformation {
                        name: "share".to_string(),
                        is_directory: true,
                        ..Default::default()
                    }),
                ),
            )
            .unwrap();
        assert!(harness.outcome().unwrap().is_success());
    }
}
