//! Processing worker: hands complete requests to the processor.

use std::time::Duration;

use protocol::command_name;
use tracing::{debug, warn};

use crate::processor::{Processor, ProcessorContext};

/// Upper bound on one idle wait.
pub(crate) const WORKER_WAIT: Duration = Duration::from_secs(5);

/// Worker thread body.
///
/// Runs until the session is cancelled, then quits the processor.
pub(super) fn run(ctx: ProcessorContext, mut processor: Option<Processor>) {
    let session = ctx.session.clone();
    debug!("Processing worker started");

    while !session.is_cancelled() {
        if session.wait_for_work(WORKER_WAIT) {
            session.reset_timer();
        }

        while let Some(packet) = session.pop_complete_request() {
            if session.is_cancelled() {
                break;
            }

            let message = match packet.decode_message() {
                Ok(message) => message,
                Err(err) => {
                    warn!(
                        "Dropping undecodable packet ({} bytes): {}",
                        packet.payload_length(),
                        err
                    );
                    break;
                }
            };
            debug!(
                "Received {} (request id {}, {} bytes)",
                command_name(message.command.code),
                message.request_id(),
                packet.payload_length()
            );

            if processor.is_none() {
                match session.init_processor(&message) {
                    Ok(p) => processor = Some(p),
                    Err(err) => {
                        warn!("Dropping packet: {}", err);
                        break;
                    }
                }
            }

            if let Some(p) = processor.as_mut() {
                if let Err(err) = p.process_request(&ctx, message) {
                    debug!("{} request rejected: {}", p.family(), err);
                }
            }
        }
    }

    if let Some(mut p) = processor {
        p.quit();
    }
    debug!("Processing worker stopped");
}
