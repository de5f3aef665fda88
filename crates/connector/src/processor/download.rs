//! Ranged file download.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::sync::{Arc, Mutex};

use protocol::{
    Command, Family, FileInformation, Message, RangeDownloadRequest, RequestPacket,
    RequestParams, ResponsePacket,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::worker::{send_with_backpressure, AsyncWorker};
use super::{remote_error, ExchangeOutcome, ProcessError, ProcessorContext};
use crate::backend::{last_segment, FileHandle, OpenMode};
use crate::sync::lock;

type SharedFile = Arc<Mutex<Box<dyn FileHandle>>>;

/// Clamp a requested range to a file of `size` bytes.
///
/// Both ends are inclusive; an `end` past the last byte is cut back to it.
/// Returns `None` when nothing is left to send.
pub(crate) fn clamp_range(start: u64, end: u64, size: u64) -> Option<(u64, u64)> {
    let last = size.checked_sub(1)?;
    let end = end.min(last);
    (start <= end).then_some((start, end))
}

#[derive(Default)]
pub struct Download {
    // Responder
    file: Option<SharedFile>,
    size: u64,
    worker: Option<AsyncWorker>,

    // Initiator
    info: Option<FileInformation>,
    sink: Option<BufWriter<File>>,
    received: u64,
}

impl Download {
    pub(super) fn handle(
        &mut self,
        ctx: &ProcessorContext,
        request_id: &str,
        command: Command,
        message: Message,
    ) -> Result<(), ProcessError> {
        match command {
            Command::DownloadInitReq => self.open(ctx, request_id, &message),
            Command::DownloadDataReq => self.serve(ctx, request_id, &message),
            Command::DownloadInitResp => self.begin(ctx, request_id, &message),
            Command::DownloadDataResp => {
                let sink = self
                    .sink
                    .as_mut()
                    .ok_or(ProcessError::UnexpectedCommand(command.code()))?;
                let data = message
                    .into_download_data()
                    .ok_or(ProcessError::MissingBody(command))?;
                sink.write_all(&data)?;
                self.received += data.len() as u64;
                Ok(())
            }
            Command::DownloadEndResp => {
                if let Some(mut sink) = self.sink.take() {
                    sink.flush()?;
                }
                info!("Download finished, {} bytes received", self.received);
                let entries = self.info.take().into_iter().collect();
                ctx.report(ExchangeOutcome::completed(entries, self.received));
                Ok(())
            }
            Command::DownloadError => {
                self.sink = None;
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
        let file = backend.open_file(&url, OpenMode::Read)?;
        let stat = file.stat()?;

        debug!("Serving {} ({} bytes)", url, stat.size);
        self.stop_worker();
        self.close_file();
        self.size = stat.size;
        self.file = Some(Arc::new(Mutex::new(file)));

        ctx.send(&Message::response(
            request_id,
            Command::DownloadInitResp,
            ResponsePacket::DownloadInit(stat.to_file_information(last_segment(&url))),
        ))
    }

    fn serve(
        &mut self,
        ctx: &ProcessorContext,
        request_id: &str,
        message: &Message,
    ) -> Result<(), ProcessError> {
        let range = match message.request_packet().map(|r| &r.params) {
            Some(RequestParams::RangeDownload(range)) => *range,
            _ => return Err(ProcessError::MissingBody(Command::DownloadDataReq)),
        };
        let file = self
            .file
            .clone()
            .ok_or(ProcessError::UnexpectedCommand(Command::DownloadDataReq.code()))?;

        self.stop_worker();

        let Some((start, end)) = clamp_range(range.start, range.end, self.size) else {
            debug!(
                "Empty range {}..={} of {} bytes",
                range.start, range.end, self.size
            );
            return ctx.send(&Message::bare(request_id, Command::DownloadEndResp));
        };

        lock(&file).seek(start)?;

        let chunk_size = match range.chunk_size as usize {
            0 => ctx.settings.chunk_size,
            n => n,
        }
        .max(1);
        let read_buffer = ctx.settings.read_buffer.max(1);

        let worker_ctx = ctx.clone();
        let id = request_id.to_string();
        let worker = AsyncWorker::spawn(
            "download-worker",
            ctx.session.cancel_token(),
            move |cancel| {
                let plan = Transfer {
                    start,
                    end,
                    chunk_size,
                    read_buffer,
                };
                if let Err(err) = stream_range(&worker_ctx, &id, &file, plan, &cancel) {
                    worker_ctx.fail(Family::Download, &id, &err);
                }
            },
        )?;
        self.worker = Some(worker);
        Ok(())
    }

    fn begin(
        &mut self,
        ctx: &ProcessorContext,
        request_id: &str,
        message: &Message,
    ) -> Result<(), ProcessError> {
        let info = match message.response_packet() {
            Some(ResponsePacket::DownloadInit(info)) => info.clone(),
            _ => return Err(ProcessError::MissingBody(Command::DownloadInitResp)),
        };
        let request = &ctx.settings.request;
        let chunk_size = u32::try_from(ctx.settings.chunk_size)
            .map_err(|_| ProcessError::InvalidParameter("chunk size does not fit in 32 bits"))?;

        info!(
            "Downloading {} ({} bytes) to {}",
            info.name,
            info.size,
            request.output_file.display()
        );
        self.sink = Some(BufWriter::new(File::create(&request.output_file)?));

        // A zero end offset from the command line means the whole file
        let end = match request.end_offset {
            0 => info.size.saturating_sub(1),
            end => end,
        };
        let range = RangeDownloadRequest {
            start: request.start_offset,
            end,
            chunk_size,
        };
        self.info = Some(info);

        ctx.send(&Message::request(
            request_id,
            Command::DownloadDataReq,
            RequestPacket {
                credentials: None,
                params: RequestParams::RangeDownload(range),
            },
        ))
    }

    fn stop_worker(&mut self) {
        if let Some(mut worker) = self.worker.take() {
            worker.stop();
        }
    }

    fn close_file(&mut self) {
        if let Some(file) = self.file.take() {
            if let Err(err) = lock(&file).close() {
                debug!("Closing download source failed: {}", err);
            }
        }
    }

    pub(super) fn quit(&mut self) {
        self.stop_worker();
        self.close_file();
        self.sink = None;
    }
}

#[derive(Debug, Clone, Copy)]
struct Transfer {
    start: u64,
    end: u64,
    chunk_size: usize,
    read_buffer: usize,
}

fn stream_range(
    ctx: &ProcessorContext,
    request_id: &str,
    file: &SharedFile,
    plan: Transfer,
    cancel: &CancellationToken,
) -> Result<(), ProcessError> {
    let mut buf = vec![0u8; plan.read_buffer];
    let mut position = plan.start;

    while position <= plan.end {
        if cancel.is_cancelled() {
            return Ok(());
        }
        ctx.session.reset_timer();

        let want = (plan.end - position + 1).min(buf.len() as u64) as usize;
        let read = lock(file).read(&mut buf[..want])?;
        if read == 0 {
            break;
        }

        for chunk in buf[..read].chunks(plan.chunk_size) {
            let message = Message::response(
                request_id,
                Command::DownloadDataResp,
                ResponsePacket::DownloadData(chunk.to_vec()),
            );
            if !send_with_backpressure(ctx, cancel, &message)? {
                return Ok(());
            }
        }
        position += read as u64;
    }

    debug!(
        "Sent {} bytes of range {}..={}",
        position - plan.start,
        plan.start,
        plan.end
    );
    send_with_backpressure(
        ctx,
        cancel,
        &Message::bare(request_id, Command::DownloadEndResp),
    )?;
    Ok(())
}
