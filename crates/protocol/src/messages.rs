//! Logical message shapes carried inside a packet payload.
//!
//! Every message has a command header (request id + command code) and at most
//! one body: a request, a response or a status. Messages are serialized with
//! MessagePack.

use serde::{Deserialize, Serialize};

use crate::commands::Command;
use crate::status;

/// Attribute bit set on hidden entries.
pub const FILE_ATTRIBUTE_HIDDEN: u32 = 0x2;
/// Attribute bit set on directories.
pub const FILE_ATTRIBUTE_DIRECTORY: u32 = 0x10;
/// Attribute value for plain files.
pub const FILE_ATTRIBUTE_NORMAL: u32 = 0x80;

/// Command header present on every message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandHeader {
    /// Correlation token chosen by the initiator.
    pub request_id: String,
    /// Wire command code. Kept raw so unknown codes still decode.
    pub code: i32,
}

/// A decoded packet payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    /// Request id and command code.
    pub command: CommandHeader,
    /// Optional body.
    pub body: Body,
}

/// The one-of body of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Body {
    /// Nothing beyond the command header.
    #[default]
    Empty,
    /// Initiator-to-responder payload.
    Request(RequestPacket),
    /// Responder-to-initiator payload.
    Response(ResponsePacket),
    /// Outcome of an operation.
    Status(Status),
}

/// Share credentials adopted by the responder before touching the backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Credentials {
    /// Target URL, `server/share/path`.
    pub url: String,
    /// Workgroup or domain.
    pub workgroup: String,
    /// User name.
    pub username: String,
    /// Password.
    pub password: String,
    /// Whether kerberos authentication is requested.
    pub kerberos: bool,
}

/// Request body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct RequestPacket {
    /// Present on the first packet of every exchange.
    pub credentials: Option<Credentials>,
    /// Operation-specific parameters.
    pub params: RequestParams,
}

/// Operation-specific request parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RequestParams {
    /// No parameters.
    #[default]
    None,
    /// Directory listing options.
    FolderStructure(FolderStructureRequest),
    /// Inclusive byte range to download.
    RangeDownload(RangeDownloadRequest),
    /// One chunk of upload data.
    UploadData(#[serde(with = "serde_bytes")] Vec<u8>),
}

/// Directory listing options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FolderStructureRequest {
    /// Maximum entries per response packet.
    pub page_size: u32,
    /// Skip everything that is not a directory.
    pub show_only_folders: bool,
    /// Include hidden entries.
    pub show_hidden_files: bool,
}

/// Inclusive download range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RangeDownloadRequest {
    /// First byte offset.
    pub start: u64,
    /// Last byte offset (inclusive).
    pub end: u64,
    /// Maximum data bytes per response packet.
    pub chunk_size: u32,
}

/// Response body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponsePacket {
    /// One page of a directory listing.
    FolderStructure(Vec<FileInformation>),
    /// Metadata of the file about to be downloaded.
    DownloadInit(FileInformation),
    /// One chunk of downloaded data.
    DownloadData(#[serde(with = "serde_bytes")] Vec<u8>),
    /// Metadata of the created folder.
    AddFolder(FileInformation),
    /// Metadata of the tested target.
    TestConnection(FileInformation),
    /// Which kind of resource was deleted.
    DeleteResource(FileInformation),
}

/// Metadata for a single file or directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct FileInformation {
    /// Entry name (last path segment).
    pub name: String,
    /// Whether the entry is a directory.
    pub is_directory: bool,
    /// Size in bytes.
    pub size: u64,
    /// Creation time in milliseconds since the Unix epoch.
    pub create_time: i64,
    /// Last modification time in milliseconds since the Unix epoch.
    pub modified_time: i64,
    /// Attribute bits (`FILE_ATTRIBUTE_*`).
    pub resource_type: u32,
}

/// Operation status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    /// Internal status or OS errno.
    pub code: i32,
    /// Human-readable description.
    pub msg: String,
}

impl Status {
    /// Create a status with an explicit message.
    pub fn new(code: i32, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
        }
    }

    /// Create a status for an internal code, using its registered name.
    pub fn internal(code: i32) -> Self {
        Self::new(code, status::status_name(code).unwrap_or("NONE"))
    }

    /// Success status.
    pub fn success() -> Self {
        Self::internal(status::SMB_SUCCESS)
    }

    /// Whether this status reports success.
    pub fn is_success(&self) -> bool {
        status::is_success(self.code)
    }
}

impl Message {
    /// Create a message with an explicit body.
    pub fn new(request_id: impl Into<String>, command: Command, body: Body) -> Self {
        Self {
            command: CommandHeader {
                request_id: request_id.into(),
                code: command.code(),
            },
            body,
        }
    }

    /// Message carrying only the command header.
    pub fn bare(request_id: impl Into<String>, command: Command) -> Self {
        Self::new(request_id, command, Body::Empty)
    }

    /// Message carrying a request body.
    pub fn request(request_id: impl Into<String>, command: Command, request: RequestPacket) -> Self {
        Self::new(request_id, command, Body::Request(request))
    }

    /// Message carrying a response body.
    pub fn response(
        request_id: impl Into<String>,
        command: Command,
        response: ResponsePacket,
    ) -> Self {
        Self::new(request_id, command, Body::Response(response))
    }

    /// Message carrying a status.
    pub fn status(request_id: impl Into<String>, command: Command, status: Status) -> Self {
        Self::new(request_id, command, Body::Status(status))
    }

    /// The command, if the code is known.
    pub fn command(&self) -> Option<Command> {
        Command::from_code(self.command.code)
    }

    /// Request id of this message.
    pub fn request_id(&self) -> &str {
        &self.command.request_id
    }

    /// Request body, if present.
    pub fn request_packet(&self) -> Option<&RequestPacket> {
        match &self.body {
            Body::Request(req) => Some(req),
            _ => None,
        }
    }

    /// Response body, if present.
    pub fn response_packet(&self) -> Option<&ResponsePacket> {
        match &self.body {
            Body::Response(resp) => Some(resp),
            _ => None,
        }
    }

    /// Status body, if present.
    pub fn status_body(&self) -> Option<&Status> {
        match &self.body {
            Body::Status(status) => Some(status),
            _ => None,
        }
    }

    /// Credentials carried by a request body.
    pub fn credentials(&self) -> Option<&Credentials> {
        self.request_packet().and_then(|req| req.credentials.as_ref())
    }

    /// Consume the message and take the upload data chunk, if any.
    pub fn into_upload_data(self) -> Option<Vec<u8>> {
        match self.body {
            Body::Request(RequestPacket {
                params: RequestParams::UploadData(data),
                ..
            }) => Some(data),
            _ => None,
        }
    }

    /// Consume the message and take the download data chunk, if any.
    pub fn into_download_data(self) -> Option<Vec<u8>> {
        match self.body {
            Body::Response(ResponsePacket::DownloadData(data)) => Some(data),
            _ => None,
        }
    }

    /// Serialize the message to MessagePack bytes.
    pub fn to_msgpack(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    /// Deserialize a message from MessagePack bytes.
    pub fn from_msgpack(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

impl FileInformation {
    /// Whether the hidden attribute bit is set.
    pub fn is_hidden(&self) -> bool {
        self.resource_type & FILE_ATTRIBUTE_HIDDEN != 0
    }
}
