use std::path::Path;

use crate::TransferError;

const MAX_NAME_LEN: usize = 255;

/// Validates a client-supplied file name before it is used as a publish
/// path component.
///
/// Rejects:
/// - Empty names and the special names `.` and `..`
/// - Path separators (`/` or `\`) and any `..` sequence
/// - Control characters
/// - Names longer than 255 bytes
pub fn validate_file_name(name: &str) -> Result<(), TransferError> {
    if name.is_empty() {
        return Err(TransferError::InvalidName("empty name".into()));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(TransferError::InvalidName(format!(
            "name longer than {MAX_NAME_LEN} bytes"
        )));
    }
    if name == "." || name.contains("..") {
        return Err(TransferError::InvalidName(format!(
            "parent directory traversal not allowed: {name}"
        )));
    }
    if name.contains(['/', '\\']) {
        return Err(TransferError::InvalidName(format!(
            "path separator not allowed: {name}"
        )));
    }
    if name.chars().any(char::is_control) {
        return Err(TransferError::InvalidName(
            "control characters not allowed".into(),
        ));
    }
    Ok(())
}

/// Validates a staging key (session id) used as a directory name.
///
/// Only ASCII alphanumerics, `-` and `_` are allowed.
pub fn validate_staging_key(key: &str) -> Result<(), TransferError> {
    if key.is_empty() || key.len() > 128 {
        return Err(TransferError::InvalidName(format!(
            "invalid staging key length: {}",
            key.len()
        )));
    }
    if !key
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(TransferError::InvalidName(format!(
            "invalid staging key: {key}"
        )));
    }
    Ok(())
}

/// Detects an image MIME type from a file name's extension.
///
/// Returns `None` for extensions that are not a supported image format.
pub fn detect_image_type(name: &str) -> Option<&'static str> {
    let ext = Path::new(name).extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "gif" => Some("image/gif"),
        "webp" => Some("image/webp"),
        "svg" => Some("image/svg+xml"),
        "avif" => Some("image/avif"),
        "bmp" => Some("image/bmp"),
        "ico" => Some("image/x-icon"),
        _ => None,
    }
}
