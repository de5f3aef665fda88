//! Folder creation.

use protocol::{Command, Message, ResponsePacket};
use tracing::info;

use super::{remote_error, ExchangeOutcome, ProcessError, ProcessorContext};
use crate::backend::last_segment;

pub struct AddFolder;

impl AddFolder {
    pub(super) fn handle(
        &mut self,
        ctx: &ProcessorContext,
        request_id: &str,
        command: Command,
        message: Message,
    ) -> Result<(), ProcessError> {
        match command {
            Command::AddFolderInitReq => {
                let (backend, url) = ctx.connect(&message)?;
                backend.mkdir(&url)?;
                let stat = backend.stat(&url)?;
                info!("Created folder {}", url);

                ctx.send(&Message::response(
                    request_id,
                    Command::AddFolderInitResp,
                    ResponsePacket::AddFolder(stat.to_file_information(last_segment(&url))),
                ))
            }
            Command::AddFolderInitResp => {
                let entries = match message.response_packet() {
                    Some(ResponsePacket::AddFolder(info)) => vec![info.clone()],
                    _ => Vec::new(),
                };
                ctx.report(ExchangeOutcome::completed(entries, 0));
                Ok(())
            }
            Command::AddFolderErrorResp => Err(remote_error(command, &message)),
            other => Err(ProcessError::UnexpectedCommand(other.code())),
        }
    }
}
