//! Directory listing.
//!
//! The responder pages entries out of an async worker, `page_size` entries
//! per `GET_STRUCTURE_INIT_RESP`, followed by one `GET_STRUCTURE_END_RESP`.

use nix::errno::Errno;
use protocol::{
    Command, Family, FileInformation, FolderStructureRequest, Message, RequestParams,
    ResponsePacket,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::upload::is_upload_marker;
use super::worker::{send_with_backpressure, AsyncWorker};
use super::{remote_error, ExchangeOutcome, ProcessError, ProcessorContext, TransferSettings};
use crate::backend::{last_segment, DirEntry, DirHandle, OpenMode};

/// Listing parameters sent by a client.
pub(super) fn request_params(settings: &TransferSettings) -> RequestParams {
    RequestParams::FolderStructure(FolderStructureRequest {
        page_size: settings.request.page_size,
        show_only_folders: settings.request.show_only_folders,
        show_hidden_files: settings.request.show_hidden_files,
    })
}

#[derive(Default)]
pub struct ListStructure {
    worker: Option<AsyncWorker>,
    /// Entries collected by the initiator.
    entries: Vec<FileInformation>,
}

impl ListStructure {
    pub(super) fn handle(
        &mut self,
        ctx: &ProcessorContext,
        request_id: &str,
        command: Command,
        message: Message,
    ) -> Result<(), ProcessError> {
        match command {
            Command::GetStructureInitReq => self.start(ctx, request_id, &message),
            Command::GetStructureInitResp => {
                if let Some(ResponsePacket::FolderStructure(page)) = message.response_packet() {
                    for entry in page {
                        info!(
                            "{:<40} {:>5} {:>12} {}",
                            entry.name,
                            if entry.is_directory { "dir" } else { "file" },
                            entry.size,
                            entry.modified_time
                        );
                    }
                    self.entries.extend(page.iter().cloned());
                }
                Ok(())
            }
            Command::GetStructureEndResp => {
                let entries = std::mem::take(&mut self.entries);
                ctx.report(ExchangeOutcome::completed(entries, 0));
                Ok(())
            }
            Command::GetStructureErrorResp => Err(remote_error(command, &message)),
            other => Err(ProcessError::UnexpectedCommand(other.code())),
        }
    }

    fn start(
        &mut self,
        ctx: &ProcessorContext,
        request_id: &str,
        message: &Message,
    ) -> Result<(), ProcessError> {
        let options = match message.request_packet().map(|r| &r.params) {
            Some(RequestParams::FolderStructure(options)) => *options,
            _ => return Err(ProcessError::MissingBody(Command::GetStructureInitReq)),
        };
        if options.page_size == 0 {
            return Err(ProcessError::InvalidParameter("page_size"));
        }

        let (backend, url) = ctx.connect(message)?;

        let dir = match backend.open_dir(&url) {
            Ok(dir) => dir,
            Err(err) if matches!(err.errno, Errno::ENOTDIR | Errno::EINVAL) => {
                // A file target lists as itself
                let mut file = backend.open_file(&url, OpenMode::Read)?;
                let stat = file.stat()?;
                if let Err(err) = file.close() {
                    debug!("Closing {} failed: {}", url, err);
                }

                let page = vec![stat.to_file_information(last_segment(&url))];
                ctx.send(&Message::response(
                    request_id,
                    Command::GetStructureInitResp,
                    ResponsePacket::FolderStructure(page),
                ))?;
                ctx.send(&Message::bare(request_id, Command::GetStructureEndResp))?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        self.stop_worker();

        let worker_ctx = ctx.clone();
        let id = request_id.to_string();
        let worker = AsyncWorker::spawn(
            "list-worker",
            ctx.session.cancel_token(),
            move |cancel| {
                if let Err(err) = enumerate(&worker_ctx, &id, dir, options, &cancel) {
                    worker_ctx.fail(Family::GetStructure, &id, &err);
                }
            },
        )?;
        self.worker = Some(worker);
        Ok(())
    }

    fn stop_worker(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
    }

    pub(super) fn quit(&mut self) {
        self.stop_worker();
    }
}

/// Whether a directory entry belongs in the listing.
fn is_listed(entry: &DirEntry, options: &FolderStructureRequest) -> bool {
    if entry.name == "." || entry.name == ".." || is_upload_marker(&entry.name) {
        return false;
    }
    if entry.stat.hidden && !options.show_hidden_files {
        return false;
    }
    !(options.show_only_folders && !entry.stat.is_directory)
}

fn enumerate(
    ctx: &ProcessorContext,
    request_id: &str,
    mut dir: Box<dyn DirHandle>,
    options: FolderStructureRequest,
    cancel: &CancellationToken,
) -> Result<(), ProcessError> {
    let page_size = options.page_size as usize;
    let mut page = Vec::with_capacity(page_size);
    let mut total = 0usize;

    while let Some(entry) = dir.next_entry()? {
        if cancel.is_cancelled() {
            return Ok(());
        }
        if !is_listed(&entry, &options) {
            continue;
        }

        page.push(entry.stat.to_file_information(entry.name));
        if page.len() == page_size {
            total += page.len();
            if !send_page(ctx, request_id, std::mem::take(&mut page), cancel)? {
                return Ok(());
            }
        }
    }

    if !page.is_empty() {
        total += page.len();
        if !send_page(ctx, request_id, page, cancel)? {
            return Ok(());
        }
    }

    debug!("Listed {} entries for {}", total, request_id);
    send_with_backpressure(
        ctx,
        cancel,
        &Message::bare(request_id, Command::GetStructureEndResp),
    )?;
    Ok(())
}

fn send_page(
    ctx: &ProcessorContext,
    request_id: &str,
    page: Vec<FileInformation>,
    cancel: &CancellationToken,
) -> Result<bool, ProcessError> {
    let message = Message::response(
        request_id,
        Command::GetStructureInitResp,
        ResponsePacket::FolderStructure(page),
    );
    send_with_backpressure(ctx, cancel, &message)
}
