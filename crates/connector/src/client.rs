//! Client role: run one exchange against a server and report its outcome.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use protocol::status::SMB_RESET;
use protocol::Packet;
use tokio::net::UnixStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::processor::{ExchangeOutcome, Processor, ProcessorContext, Role, TransferSettings};
use crate::reactor::drive;
use crate::session::{IdleTimer, SessionManager, SessionSettings};
use crate::transport::{Transport, UnixTransport};

/// Run the exchange described by `config.request`.
///
/// The first request is queued before the socket is connected so it is the
/// first packet on the wire. Returns once the exchange has an outcome or the
/// connection is lost, which counts as a failed exchange.
pub async fn run(config: &Config) -> Result<ExchangeOutcome> {
    let request = &config.request;
    let mut processor = Processor::for_operation(request.op_code)
        .ok_or_else(|| anyhow!("no operation selected (op_code {})", request.op_code))?;
    processor.init(request.request_id.clone());

    let settings = TransferSettings::from_config(config);
    let session = Arc::new(SessionManager::new(
        SessionSettings::from(&config.buffers),
        Arc::new(IdleTimer::new()),
        CancellationToken::new(),
    ));

    let first = processor.initial_request(&settings);
    session.push_response_again(Packet::from_message(&first)?);
    info!(
        "Starting {} exchange for {} (request id {})",
        processor.family(),
        request.url,
        request.request_id
    );

    let socket_path = &config.connector.socket_path;
    let stream = UnixStream::connect(socket_path)
        .await
        .with_context(|| format!("Failed to connect to {}", socket_path.display()))?;
    let transport = Arc::new(UnixTransport::new(stream));
    session.init(transport.clone());

    let (ctx, outcome) = ProcessorContext::new(session.clone(), None, settings, Role::Initiator);
    session
        .start_worker(ctx, Some(processor))
        .context("Failed to start processing worker")?;

    let cancel = session.cancel_token().clone();
    let mut watcher = outcome.clone();
    let reported = tokio::select! {
        finished = watcher.wait_for(Option::is_some) => {
            finished.ok().and_then(|current| current.clone())
        }
        ended = drive(&transport, &session, &cancel) => {
            match ended {
                Ok(()) => debug!("Session cancelled"),
                Err(err) => warn!("Connection lost: {}", err),
            }
            outcome.borrow().clone()
        }
    };

    transport.shutdown();
    let quitting = session.clone();
    if let Err(err) = tokio::task::spawn_blocking(move || quitting.quit()).await {
        warn!("Session teardown failed: {}", err);
    }

    Ok(reported.unwrap_or_else(|| ExchangeOutcome::Failed {
        code: SMB_RESET,
        message: "connection closed before the exchange finished".to_string(),
    }))
}
