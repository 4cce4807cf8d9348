use std::{
    io,
    path::{Path, PathBuf},
};

use chrono::Utc;

pub const ALLOWED_EXTENSIONS: [&str; 3] = ["jpg", "jpeg", "png"];

/// Client file name without any directory part it may carry.
pub fn base_name(original: &str) -> &str {
    original.rsplit(|c: char| c == '/' || c == '\\').next().unwrap_or(original)
}

/// Extension is whatever follows the last `.` of the name. The name is
/// stored behind a timestamp prefix, so a bare `.png` still counts as png.
pub fn has_allowed_extension(file_name: &str) -> bool {
    base_name(file_name)
        .rsplit_once('.')
        .map(|(_, ext)| {
            ALLOWED_EXTENSIONS
                .iter()
                .any(|allowed| allowed.eq_ignore_ascii_case(ext))
        })
        .unwrap_or(false)
}

pub fn stored_name(original: &str, epoch_millis: i64) -> String {
    format!("{}-{}", epoch_millis, base_name(original))
}

/// Saves the upload as `<epoch-millis>-<name>` under `uploads_dir`.
pub async fn store(uploads_dir: &Path, original: &str, bytes: &[u8]) -> io::Result<PathBuf> {
    tokio::fs::create_dir_all(uploads_dir).await?;
    let path = uploads_dir.join(stored_name(original, Utc::now().timestamp_millis()));
    tokio::fs::write(&path, bytes).await?;
    Ok(path)
}
