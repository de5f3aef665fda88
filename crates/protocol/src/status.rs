//! Status codes carried in status packets.
//!
//! Negative values are connector-internal failures, `0` and `1` are success
//! values. Positive values other than `1` are OS error numbers reported by the
//! file backend.

pub const SMB_SUCCESS: i32 = 0;
pub const SMB_CREATE_SUCCESS: i32 = 1;

pub const SMB_ERROR: i32 = -11;
pub const SMB_INIT_FAILED: i32 = -12;
pub const SMB_OPEN_FAILED: i32 = -13;
pub const SMB_INVALID_SERVER: i32 = -14;
pub const SMB_AGAIN: i32 = -15;
pub const SMB_RESET: i32 = -16;
pub const SMB_EOF: i32 = -17;
pub const SMB_NOT_FOUND: i32 = -18;
pub const SMB_TIMEOUT: i32 = -19;
pub const SMB_ALLOCATION_FAILED: i32 = -20;
pub const SMB_FILE_CREATE_FAILED: i32 = -21;
pub const SMB_INVALID_PACKET: i32 = -28;

/// Human-readable name of an internal status code.
///
/// Returns `None` for codes that are not connector-internal (OS errors).
pub fn status_name(code: i32) -> Option<&'static str> {
    let name = match code {
        SMB_SUCCESS => "SMB_SUCCESS",
        SMB_CREATE_SUCCESS => "SMB_CREATE_SUCCESS",
        SMB_ERROR => "SMB_ERROR",
        SMB_INIT_FAILED => "SMB_INIT_FAILED",
        SMB_OPEN_FAILED => "SMB_OPEN_FAILED",
        SMB_INVALID_SERVER => "SMB_INVALID_SERVER",
        SMB_AGAIN => "SMB_AGAIN",
        SMB_RESET => "SMB_RESET",
        SMB_EOF => "SMB_EOF",
        SMB_NOT_FOUND => "SMB_NOT_FOUND",
        SMB_TIMEOUT => "SMB_TIMEOUT",
        SMB_ALLOCATION_FAILED => "SMB_ALLOCATION_FAILED",
        SMB_FILE_CREATE_FAILED => "SMB_FILE_CREATE_FAILED",
        SMB_INVALID_PACKET => "SMB_INVALID_PACKET",
        _ => return None,
    };
    Some(name)
}

/// Whether a status code reports success.
#[inline]
pub fn is_success(code: i32) -> bool {
    code == SMB_SUCCESS || code == SMB_CREATE_SUCCESS
}
