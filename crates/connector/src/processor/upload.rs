//! Chunked upload through a hidden temporary sibling.
//!
//! The responder writes into `.<token>.connector-tmp` next to the target and
//! renames it into place on `UPLOAD_END_REQ`. An unfinished upload never
//! leaves the temporary file behind.

use std::fs::File;
use std::io::Read;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use nix::errno::Errno;
use protocol::status::SMB_NOT_FOUND;
use protocol::{Command, Family, Message, RequestPacket, RequestParams, Status};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::worker::{send_with_backpressure, AsyncWorker};
use super::{remote_error, ExchangeOutcome, ProcessError, ProcessorContext, Role};
use crate::backend::{
    create_dir_recursive, is_server_url, join_url, parent_url, BackendError, FileBackend,
    FileHandle, OpenMode,
};

/// Suffix of temporary upload files.
pub const UPLOAD_TEMP_SUFFIX: &str = ".connector-tmp";

/// Whether `name` is a temporary upload file.
pub fn is_upload_marker(name: &str) -> bool {
    name.len() > UPLOAD_TEMP_SUFFIX.len() + 1
        && name.starts_with('.')
        && name.ends_with(UPLOAD_TEMP_SUFFIX)
}

fn temp_name() -> String {
    format!(".{}{}", Uuid::new_v4().simple(), UPLOAD_TEMP_SUFFIX)
}

/// Responder-side state of one upload.
struct Receiving {
    backend: Arc<dyn FileBackend>,
    target: String,
    temp: String,
    file: Option<Box<dyn FileHandle>>,
    written: u64,
}

impl Receiving {
    fn write_chunk(&mut self, data: &[u8]) -> Result<(), ProcessError> {
        let file = self
            .file
            .as_mut()
            .ok_or(ProcessError::UnexpectedCommand(Command::UploadDataReq.code()))?;

        let mut offset = 0;
        while offset < data.len() {
            let n = file.write(&data[offset..])?;
            if n == 0 {
                return Err(BackendError::new("write", self.temp.clone(), Errno::EIO).into());
            }
            offset += n;
        }
        self.written += data.len() as u64;
        Ok(())
    }

    fn commit(&mut self) -> Result<u64, ProcessError> {
        if let Some(mut file) = self.file.take() {
            file.close()?;
        }
        self.backend.rename(&self.temp, &self.target)?;
        Ok(self.written)
    }

    /// Drop the temporary file.
    fn discard(&mut self) {
        if let Some(mut file) = self.file.take() {
            if let Err(err) = file.close() {
                debug!("Closing {} failed: {}", self.temp, err);
            }
        }
        match self.backend.unlink(&self.temp) {
            Ok(()) => debug!("Removed temporary file {}", self.temp),
            Err(err) => warn!("Failed to remove {}: {}", self.temp, err),
        }
    }
}

#[derive(Default)]
pub struct Upload {
    receiving: Option<Receiving>,
    /// Set once the stream failed. Later data is dropped silently.
    failed: bool,
    finished: bool,

    // Initiator
    worker: Option<AsyncWorker>,
    sent: Arc<AtomicU64>,
}

impl Upload {
    pub(super) fn handle(
        &mut self,
        ctx: &ProcessorContext,
        request_id: &str,
        command: Command,
        message: Message,
    ) -> Result<(), ProcessError> {
        match command {
            Command::UploadInitReq => self.open(ctx, request_id, &message),
            Command::UploadDataReq => {
                if self.failed {
                    return Ok(());
                }
                let data = message
                    .into_upload_data()
                    .ok_or(ProcessError::MissingBody(command))?;
                let result = match self.receiving.as_mut() {
                    Some(receiving) => receiving.write_chunk(&data),
                    None => Err(ProcessError::UnexpectedCommand(command.code())),
                };
                result.map_err(|err| self.abort(err))
            }
            Command::UploadEndReq => {
                if self.failed {
                    return Ok(());
                }
                let result = match self.receiving.as_mut() {
                    Some(receiving) => receiving.commit(),
                    None => Err(ProcessError::UnexpectedCommand(command.code())),
                };
                let written = result.map_err(|err| self.abort(err))?;

                self.finished = true;
                self.receiving = None;
                info!("Upload complete, {} bytes", written);
                ctx.send(&Message::status(
                    request_id,
                    Command::UploadEndResp,
                    Status::success(),
                ))
            }
            Command::UploadInitResp => {
                if let Some(status) = message.status_body().filter(|s| !s.is_success()) {
                    return Err(ProcessError::Remote {
                        command,
                        status: status.clone(),
                    });
                }
                self.start_sending(ctx, request_id)
            }
            Command::UploadEndResp => {
                self.stop_worker();
                let bytes = self.sent.load(Ordering::SeqCst);
                ctx.report(ExchangeOutcome::completed(Vec::new(), bytes));
                Ok(())
            }
            Command::UploadError if ctx.role == Role::Responder => {
                match message.status_body() {
                    Some(status) => info!("Upload abandoned: {} ({})", status.msg, status.code),
                    None => info!("Upload abandoned"),
                }
                if let Some(mut receiving) = self.receiving.take() {
                    receiving.discard();
                }
                self.failed = true;
                self.finished = true;
                Ok(())
            }
            Command::UploadError => {
                self.stop_worker();
                Err(remote_error(command, &message))
            }
            other => Err(ProcessError::UnexpectedCommand(other.code())),
        }
    }

    fn open(
        &mut self,
        ctx: &ProcessorContext,
        request_id: &str,
        message: &Message,
    ) -> Result<(), ProcessError> {
        let (backend, url) = ctx.connect(message)?;
        let parent = parent_url(&url)
            .filter(|parent| !is_server_url(parent))
            .ok_or(ProcessError::InvalidParameter("upload target must be inside a share"))?;

        if let Err(err) = create_dir_recursive(backend.as_ref(), parent) {
            debug!("Could not create {}: {}", parent, err);
        }

        let temp = join_url(parent, &temp_name());
        let file = backend.open_file(&temp, OpenMode::Create)?;
        debug!("Receiving {} into {}", url, temp);

        if let Some(mut previous) = self.receiving.take() {
            previous.discard();
        }
        self.receiving = Some(Receiving {
            backend,
            target: url,
            temp,
            file: Some(file),
            written: 0,
        });
        self.failed = false;
        self.finished = false;

        ctx.send(&Message::status(
            request_id,
            Command::UploadInitResp,
            Status::success(),
        ))
    }

    /// Remove the temporary file and ignore the rest of the stream.
    fn abort(&mut self, err: ProcessError) -> ProcessError {
        if let Some(mut receiving) = self.receiving.take() {
            receiving.discard();
        }
        self.failed = true;
        err
    }

    fn start_sending(&mut self, ctx: &ProcessorContext, request_id: &str) -> Result<(), ProcessError> {
        let path = ctx.settings.request.input_file.clone();
        let source = match File::open(&path) {
            Ok(source) => source,
            Err(err) => {
                warn!("Cannot open upload source {}: {}", path.display(), err);
                let status = Status::new(SMB_NOT_FOUND, format!("{}: {}", path.display(), err));
                ctx.send(&Message::status(request_id, Command::UploadError, status))?;
                return Err(err.into());
            }
        };
        info!("Uploading {} to {}", path.display(), ctx.settings.request.url);

        self.stop_worker();
        let worker_ctx = ctx.clone();
        let id = request_id.to_string();
        let sent = self.sent.clone();
        let chunk = ctx.settings.write_buffer.max(1);

        let worker = AsyncWorker::spawn(
            "upload-worker",
            ctx.session.cancel_token(),
            move |cancel| {
                if let Err(err) = stream_source(&worker_ctx, &id, source, chunk, &sent, &cancel) {
                    worker_ctx.fail(Family::Upload, &id, &err);
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
        if !self.finished {
            if let Some(mut receiving) = self.receiving.take() {
                receiving.discard();
            }
        }
    }
}

fn stream_source(
    ctx: &ProcessorContext,
    request_id: &str,
    mut source: File,
    chunk: usize,
    sent: &AtomicU64,
    cancel: &CancellationToken,
) -> Result<(), ProcessError> {
    let mut buf = vec![0u8; chunk];
    loop {
        if cancel.is_cancelled() {
            return Ok(());
        }
        let n = source.read(&mut buf)?;
        if n == 0 {
            break;
        }
        let message = Message::request(
            request_id,
            Command::UploadDataReq,
            RequestPacket {
                credentials: None,
                params: RequestParams::UploadData(buf[..n].to_vec()),
            },
        );
        if !send_with_backpressure(ctx, cancel, &message)? {
            return Ok(());
        }
        sent.fetch_add(n as u64, Ordering::SeqCst);
    }

    debug!("Upload source exhausted after {} bytes", sent.load(Ordering::SeqCst));
    send_with_backpressure(ctx, cancel, &Message::bare(request_id, Command::UploadEndReq))?;
    Ok(())
}
