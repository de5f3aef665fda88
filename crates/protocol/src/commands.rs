//! Command codes carried in every message header.
//!
//! Codes live in one global numeric namespace grouped by operation family.
//! A family always has an `INIT_REQ`, an `INIT_RESP` and an error code; the
//! transfer families add data and end phases.

use std::fmt;

/// Name reported for codes outside the known set.
pub const INVALID_COMMAND: &str = "INVALID_COMMAND";

/// Every command understood by the connector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum Command {
    TestConnectionInitReq = 1,
    TestConnectionInitResp = 2,
    TestConnectionErrorResp = 3,

    GetStructureInitReq = 11,
    GetStructureInitResp = 12,
    GetStructureEndResp = 13,
    GetStructureErrorResp = 14,

    UploadInitReq = 21,
    UploadInitResp = 22,
    UploadDataReq = 23,
    UploadError = 24,
    UploadEndReq = 26,
    UploadEndResp = 27,

    DownloadInitReq = 31,
    DownloadInitResp = 32,
    DownloadDataReq = 33,
    DownloadDataResp = 34,
    DownloadEndResp = 35,
    DownloadError = 36,

    AddFolderInitReq = 41,
    AddFolderInitResp = 42,
    AddFolderErrorResp = 43,

    DeleteInitReq = 51,
    DeleteInitResp = 52,
    DeleteErrorResp = 53,
}

impl Command {
    /// All commands in code order.
    pub const ALL: [Command; 25] = [
        Command::TestConnectionInitReq,
        Command::TestConnectionInitResp,
        Command::TestConnectionErrorResp,
        Command::GetStructureInitReq,
        Command::GetStructureInitResp,
        Command::GetStructureEndResp,
        Command::GetStructureErrorResp,
        Command::UploadInitReq,
        Command::UploadInitResp,
        Command::UploadDataReq,
        Command::UploadError,
        Command::UploadEndReq,
        Command::UploadEndResp,
        Command::DownloadInitReq,
        Command::DownloadInitResp,
        Command::DownloadDataReq,
        Command::DownloadDataResp,
        Command::DownloadEndResp,
        Command::DownloadError,
        Command::AddFolderInitReq,
        Command::AddFolderInitResp,
        Command::AddFolderErrorResp,
        Command::DeleteInitReq,
        Command::DeleteInitResp,
        Command::DeleteErrorResp,
    ];

    /// Look up a command by its wire code.
    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.iter().copied().find(|cmd| cmd.code() == code)
    }

    /// Wire code of this command.
    #[inline]
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Diagnostic name, e.g. `DOWNLOAD_DATA_RESP`.
    pub fn name(self) -> &'static str {
        match self {
            Command::TestConnectionInitReq => "TEST_CONNECTION_INIT_REQ",
            Command::TestConnectionInitResp => "TEST_CONNECTION_INIT_RESP",
            Command::TestConnectionErrorResp => "TEST_CONNECTION_ERROR_RESP",
            Command::GetStructureInitReq => "GET_STRUCTURE_INIT_REQ",
            Command::GetStructureInitResp => "GET_STRUCTURE_INIT_RESP",
            Command::GetStructureEndResp => "GET_STRUCTURE_END_RESP",
            Command::GetStructureErrorResp => "GET_STRUCTURE_ERROR_RESP",
            Command::UploadInitReq => "UPLOAD_INIT_REQ",
            Command::UploadInitResp => "UPLOAD_INIT_RESP",
            Command::UploadDataReq => "UPLOAD_DATA_REQ",
            Command::UploadError => "UPLOAD_ERROR",
            Command::UploadEndReq => "UPLOAD_END_REQ",
            Command::UploadEndResp => "UPLOAD_END_RESP",
            Command::DownloadInitReq => "DOWNLOAD_INIT_REQ",
            Command::DownloadInitResp => "DOWNLOAD_INIT_RESP",
            Command::DownloadDataReq => "DOWNLOAD_DATA_REQ",
            Command::DownloadDataResp => "DOWNLOAD_DATA_RESP",
            Command::DownloadEndResp => "DOWNLOAD_END_RESP",
            Command::DownloadError => "DOWNLOAD_ERROR",
            Command::AddFolderInitReq => "ADD_FOLDER_INIT_REQ",
            Command::AddFolderInitResp => "ADD_FOLDER_INIT_RESP",
            Command::AddFolderErrorResp => "ADD_FOLDER_ERROR_RESP",
            Command::DeleteInitReq => "DELETE_INIT_REQ",
            Command::DeleteInitResp => "DELETE_INIT_RESP",
            Command::DeleteErrorResp => "DELETE_ERROR_RESP",
        }
    }

    /// Operation family this command belongs to.
    pub fn family(self) -> Family {
        match self.code() {
            1..=3 => Family::TestConnection,
            11..=14 => Family::GetStructure,
            21..=27 => Family::Upload,
            31..=36 => Family::Download,
            41..=43 => Family::AddFolder,
            _ => Family::Delete,
        }
    }

    /// Whether this command opens a new exchange.
    pub fn is_init_request(self) -> bool {
        self == self.family().init_request()
    }

    /// Whether this command reports a failure.
    pub fn is_error(self) -> bool {
        self == self.family().error_command()
    }

    /// Whether this command travels from initiator to responder.
    pub fn is_request(self) -> bool {
        matches!(
            self,
            Command::TestConnectionInitReq
                | Command::GetStructureInitReq
                | Command::UploadInitReq
                | Command::UploadDataReq
                | Command::UploadEndReq
                | Command::DownloadInitReq
                | Command::DownloadDataReq
                | Command::AddFolderInitReq
                | Command::DeleteInitReq
        )
    }

    /// Whether either side may send this command.
    ///
    /// `UPLOAD_ERROR` also lets the initiator abandon an upload it cannot
    /// feed, so the responder drops its temporary file.
    pub fn is_two_way(self) -> bool {
        self == Command::UploadError
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<i32> for Command {
    type Error = i32;

    fn try_from(code: i32) -> Result<Self, Self::Error> {
        Command::from_code(code).ok_or(code)
    }
}

/// Map any wire code to a diagnostic name.
///
/// Total over `i32`: unknown codes map to [`INVALID_COMMAND`]. Never use the
/// result for control flow.
pub fn command_name(code: i32) -> &'static str {
    Command::from_code(code)
        .map(Command::name)
        .unwrap_or(INVALID_COMMAND)
}

/// Operation families, one per request processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Family {
    TestConnection,
    GetStructure,
    Upload,
    Download,
    AddFolder,
    Delete,
}

impl Family {
    /// Command that opens an exchange of this family.
    pub fn init_request(self) -> Command {
        match self {
            Family::TestConnection => Command::TestConnectionInitReq,
            Family::GetStructure => Command::GetStructureInitReq,
            Family::Upload => Command::UploadInitReq,
            Family::Download => Command::DownloadInitReq,
            Family::AddFolder => Command::AddFolderInitReq,
            Family::Delete => Command::DeleteInitReq,
        }
    }

    /// Command used to report a failure in this family.
    pub fn error_command(self) -> Command {
        match self {
            Family::TestConnection => Command::TestConnectionErrorResp,
            Family::GetStructure => Command::GetStructureErrorResp,
            Family::Upload => Command::UploadError,
            Family::Download => Command::DownloadError,
            Family::AddFolder => Command::AddFolderErrorResp,
            Family::Delete => Command::DeleteErrorResp,
        }
    }

    /// Short lowercase name used in logs and on the command line.
    pub fn as_str(self) -> &'static str {
        match self {
            Family::TestConnection => "test-connection",
            Family::GetStructure => "list",
            Family::Upload => "upload",
            Family::Download => "download",
            Family::AddFolder => "add-folder",
            Family::Delete => "delete",
        }
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
