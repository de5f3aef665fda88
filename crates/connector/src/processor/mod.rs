//! Request processors.
//!
//! One processor handles one exchange. The responder half runs in the
//! server and talks to the file backend; the initiator half runs in the
//! client and reports the result through an [`ExchangeOutcome`].
//!
//! ## Lifecycle
//!
//! ```text
//! for_family / for_operation ──► init(request_id) ──► process_request* ──► quit
//! ```
//!
//! Every message is checked against the bound request id and against the
//! processor's family and role before it is dispatched. A rejected message
//! gets the family's error command (responder) or fails the exchange
//! (initiator). The connection stays open either way.

mod add_folder;
mod delete;
mod download;
mod list;
mod test_connection;
mod upload;
mod worker;

pub use upload::{is_upload_marker, UPLOAD_TEMP_SUFFIX};
pub use worker::AsyncWorker;

use std::fmt;
use std::io;
use std::sync::Arc;

use nix::errno::Errno;
use protocol::status::{SMB_ERROR, SMB_INVALID_PACKET, SMB_SUCCESS};
use protocol::{
    command_name, Command, Credentials, Family, FileInformation, Message, ProtocolError,
    RequestPacket, RequestParams, Status,
};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::{BackendConnector, BackendError, FileBackend};
use crate::config::{Config, RequestConfig};
use crate::session::{SessionError, SessionManager};

use add_folder::AddFolder;
use delete::Delete;
use download::Download;
use list::ListStructure;
use test_connection::TestConnection;
use upload::Upload;

/// Errors raised while handling one message.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("request id mismatch: expected {expected:?}, got {got:?}")]
    RequestIdMismatch { expected: String, got: String },

    #[error("unexpected command {}", command_name(*.0))]
    UnexpectedCommand(i32),

    #[error("{0} carries no usable body")]
    MissingBody(Command),

    #[error("invalid parameter: {0}")]
    InvalidParameter(&'static str),

    /// The peer answered with an error status.
    #[error("peer reported {command}: {} ({})", .status.msg, .status.code)]
    Remote { command: Command, status: Status },

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("session error: {0}")]
    Session(#[from] SessionError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("local I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProcessError {
    /// Status code reported for this error.
    ///
    /// Backend failures carry the positive OS errno; everything else maps to
    /// an internal `SMB_*` code.
    pub fn status_code(&self) -> i32 {
        match self {
            ProcessError::RequestIdMismatch { .. }
            | ProcessError::UnexpectedCommand(_)
            | ProcessError::Session(_) => SMB_ERROR,
            ProcessError::MissingBody(_)
            | ProcessError::InvalidParameter(_)
            | ProcessError::Protocol(_) => SMB_INVALID_PACKET,
            ProcessError::Remote { status, .. } => status.code,
            ProcessError::Backend(err) => err.code(),
            ProcessError::Io(err) => err.raw_os_error().unwrap_or(SMB_ERROR),
        }
    }

    /// Status message reported for this error.
    pub fn status_message(&self) -> String {
        match self {
            ProcessError::Backend(err) => err.description().to_string(),
            ProcessError::Remote { status, .. } => status.msg.clone(),
            ProcessError::Io(err) => match err.raw_os_error() {
                Some(code) => Errno::from_raw(code).desc().to_string(),
                None => err.to_string(),
            },
            other => other.to_string(),
        }
    }

    /// Error status for this failure.
    pub fn to_status(&self) -> Status {
        Status::new(self.status_code(), self.status_message())
    }
}

/// Which end of the exchange this process plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Server: executes requests against the backend.
    Responder,
    /// Client: sends requests and collects the result.
    Initiator,
}

/// Buffer sizes and client request parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSettings {
    /// Bytes read from the backend per download step.
    pub read_buffer: usize,
    /// Bytes read from the upload source per step.
    pub write_buffer: usize,
    /// Maximum data bytes per packet.
    pub chunk_size: usize,
    /// Client request parameters.
    pub request: RequestConfig,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self::from_config(&Config::default())
    }
}

impl TransferSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            read_buffer: config.buffers.backend_read_buffer,
            write_buffer: config.buffers.backend_write_buffer,
            chunk_size: config.buffers.unix_sock_buffer,
            request: config.request.clone(),
        }
    }

    /// Credentials sent with the first request of an exchange.
    pub fn credentials(&self) -> Credentials {
        Credentials {
            url: self.request.url.clone(),
            workgroup: self.request.workgroup.clone(),
            username: self.request.user_name.clone(),
            password: self.request.password.clone(),
            kerberos: self.request.kerberos,
        }
    }
}

/// Final result of an exchange, as seen by the initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExchangeOutcome {
    Completed {
        /// Entries returned by the responder (listing, metadata).
        entries: Vec<FileInformation>,
        /// Payload bytes transferred.
        bytes: u64,
    },
    Failed {
        code: i32,
        message: String,
    },
}

impl ExchangeOutcome {
    pub fn completed(entries: Vec<FileInformation>, bytes: u64) -> Self {
        ExchangeOutcome::Completed { entries, bytes }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExchangeOutcome::Completed { .. })
    }

    /// Status code to log for this outcome.
    pub fn code(&self) -> i32 {
        match self {
            ExchangeOutcome::Completed { .. } => SMB_SUCCESS,
            ExchangeOutcome::Failed { code, .. } => *code,
        }
    }
}

impl fmt::Display for ExchangeOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExchangeOutcome::Completed { entries, bytes } => {
                write!(f, "completed ({} entries, {} bytes)", entries.len(), bytes)
            }
            ExchangeOutcome::Failed { code, message } => {
                write!(f, "failed with status {}: {}", code, message)
            }
        }
    }
}

/// Everything a processor needs besides its own state.
#[derive(Clone)]
pub struct ProcessorContext {
    pub session: Arc<SessionManager>,
    /// Absent on the initiator side.
    pub connector: Option<Arc<dyn BackendConnector>>,
    pub settings: Arc<TransferSettings>,
    pub role: Role,
    outcome: Arc<watch::Sender<Option<ExchangeOutcome>>>,
}

impl ProcessorContext {
    /// Create a context and the receiver its outcome is reported on.
    pub fn new(
        session: Arc<SessionManager>,
        connector: Option<Arc<dyn BackendConnector>>,
        settings: TransferSettings,
        role: Role,
    ) -> (Self, watch::Receiver<Option<ExchangeOutcome>>) {
        let (tx, rx) = watch::channel(None);
        let ctx = Self {
            session,
            connector,
            settings: Arc::new(settings),
            role,
            outcome: Arc::new(tx),
        };
        (ctx, rx)
    }

    /// Encode and queue a message, flushing what the transport accepts.
    pub fn send(&self, message: &Message) -> Result<(), ProcessError> {
        self.session.send_message(message)?;
        Ok(())
    }

    /// Record the outcome of the exchange. Only the first report counts.
    pub fn report(&self, outcome: ExchangeOutcome) {
        info!("Exchange {}", outcome);
        self.outcome.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(outcome);
                true
            } else {
                false
            }
        });
    }

    /// Adopt the credentials carried by `message` and open the backend.
    pub fn connect(
        &self,
        message: &Message,
    ) -> Result<(Arc<dyn FileBackend>, String), ProcessError> {
        let command = message
            .command()
            .ok_or(ProcessError::UnexpectedCommand(message.command.code))?;
        let credentials = message
            .credentials()
            .ok_or(ProcessError::MissingBody(command))?;
        let connector = self
            .connector
            .as_ref()
            .ok_or(ProcessError::InvalidParameter("no backend configured"))?;

        let backend = connector.connect(credentials)?;
        Ok((backend, credentials.url.clone()))
    }

    /// Report a failed step of the exchange.
    ///
    /// A responder answers with the family's error command; an initiator
    /// fails the exchange. Session failures are only logged since the
    /// connection is already going away.
    pub fn fail(&self, family: Family, request_id: &str, err: &ProcessError) {
        match (self.role, err) {
            (_, ProcessError::Session(session_err)) => {
                warn!("{} exchange aborted: {}", family, session_err);
                if self.role == Role::Initiator {
                    self.report(ExchangeOutcome::Failed {
                        code: err.status_code(),
                        message: err.status_message(),
                    });
                }
            }
            (Role::Responder, _) => {
                warn!("{} request {} failed: {}", family, request_id, err);
                let reply = Message::status(request_id, family.error_command(), err.to_status());
                if let Err(send_err) = self.send(&reply) {
                    warn!("Failed to send error status: {}", send_err);
                }
            }
            (Role::Initiator, _) => {
                self.report(ExchangeOutcome::Failed {
                    code: err.status_code(),
                    message: err.status_message(),
                });
            }
        }
    }
}

/// Map a client operation code to its family.
///
/// 1 list, 2 download, 3 upload, 4 add-folder, 5 delete, 6 test-connection.
pub fn family_for_operation(op_code: u8) -> Option<Family> {
    match op_code {
        1 => Some(Family::GetStructure),
        2 => Some(Family::Download),
        3 => Some(Family::Upload),
        4 => Some(Family::AddFolder),
        5 => Some(Family::Delete),
        6 => Some(Family::TestConnection),
        _ => None,
    }
}

/// Per-family processor state.
pub enum ProcessorState {
    TestConnection(TestConnection),
    ListStructure(ListStructure),
    Download(Download),
    Upload(Upload),
    AddFolder(AddFolder),
    Delete(Delete),
}

/// Processor for one exchange.
pub struct Processor {
    request_id: String,
    state: ProcessorState,
}

impl Processor {
    /// Fresh processor for a family. Call [`init`](Self::init) before use.
    pub fn for_family(family: Family) -> Self {
        let state = match family {
            Family::TestConnection => ProcessorState::TestConnection(TestConnection::default()),
            Family::GetStructure => ProcessorState::ListStructure(ListStructure::default()),
            Family::Download => ProcessorState::Download(Download::default()),
            Family::Upload => ProcessorState::Upload(Upload::default()),
            Family::AddFolder => ProcessorState::AddFolder(AddFolder),
            Family::Delete => ProcessorState::Delete(Delete),
        };
        Self {
            request_id: String::new(),
            state,
        }
    }

    /// Processor for a client operation code.
    pub fn for_operation(op_code: u8) -> Option<Self> {
        family_for_operation(op_code).map(Self::for_family)
    }

    /// Bind the request id every later message must carry.
    pub fn init(&mut self, request_id: impl Into<String>) {
        self.request_id = request_id.into();
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn family(&self) -> Family {
        match &self.state {
            ProcessorState::TestConnection(_) => Family::TestConnection,
            ProcessorState::ListStructure(_) => Family::GetStructure,
            ProcessorState::Download(_) => Family::Download,
            ProcessorState::Upload(_) => Family::Upload,
            ProcessorState::AddFolder(_) => Family::AddFolder,
            ProcessorState::Delete(_) => Family::Delete,
        }
    }

    /// First message an initiator sends.
    pub fn initial_request(&self, settings: &TransferSettings) -> Message {
        let params = match &self.state {
            ProcessorState::ListStructure(_) => list::request_params(settings),
            _ => RequestParams::None,
        };
        Message::request(
            self.request_id.clone(),
            self.family().init_request(),
            RequestPacket {
                credentials: Some(settings.credentials()),
                params,
            },
        )
    }

    /// Handle one message of the exchange.
    ///
    /// Failures have already been reported to the peer or the outcome when
    /// this returns `Err`.
    pub fn process_request(
        &mut self,
        ctx: &ProcessorContext,
        message: Message,
    ) -> Result<(), ProcessError> {
        let family = self.family();
        let reply_id = message.request_id().to_string();

        let result = self
            .check(ctx, &message)
            .and_then(|command| self.dispatch(ctx, command, message));

        if let Err(err) = &result {
            ctx.fail(family, &reply_id, err);
        }
        result
    }

    fn check(&self, ctx: &ProcessorContext, message: &Message) -> Result<Command, ProcessError> {
        if message.request_id() != self.request_id {
            return Err(ProcessError::RequestIdMismatch {
                expected: self.request_id.clone(),
                got: message.request_id().to_string(),
            });
        }

        let command = message
            .command()
            .filter(|c| c.family() == self.family())
            .filter(|c| c.is_two_way() || c.is_request() == (ctx.role == Role::Responder))
            .ok_or(ProcessError::UnexpectedCommand(message.command.code))?;

        debug!(
            "Processing {} for request id {}",
            command,
            message.request_id()
        );
        Ok(command)
    }

    fn dispatch(
        &mut self,
        ctx: &ProcessorContext,
        command: Command,
        message: Message,
    ) -> Result<(), ProcessError> {
        let id = self.request_id.as_str();
        match &mut self.state {
            ProcessorState::TestConnection(state) => state.handle(ctx, id, command, message),
            ProcessorState::ListStructure(state) => state.handle(ctx, id, command, message),
            ProcessorState::Download(state) => state.handle(ctx, id, command, message),
            ProcessorState::Upload(state) => state.handle(ctx, id, command, message),
            ProcessorState::AddFolder(state) => state.handle(ctx, id, command, message),
            ProcessorState::Delete(state) => state.handle(ctx, id, command, message),
        }
    }

    /// Stop any worker and release backend handles.
    pub fn quit(&mut self) {
        debug!("Quitting {} processor for {}", self.family(), self.request_id);
        match &mut self.state {
            ProcessorState::ListStructure(state) => state.quit(),
            ProcessorState::Download(state) => state.quit(),
            ProcessorState::Upload(state) => state.quit(),
            ProcessorState::TestConnection(_)
            | ProcessorState::AddFolder(_)
            | ProcessorState::Delete(_) => {}
        }
    }
}

/// Turn an error status from the peer into a [`ProcessError`].
pub(crate) fn remote_error(command: Command, message: &Message) -> ProcessError {
    let status = message
        .status_body()
        .cloned()
        .unwrap_or_else(|| Status::internal(SMB_ERROR));
    ProcessError::Remote { command, status }
}
