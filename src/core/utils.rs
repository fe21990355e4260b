use std::path::Path;

use tokio::fs::File;
use tokio::io::AsyncReadExt;

/// Suffix appended to output that hit its ceiling
pub const TRUNCATION_MARKER: &str = "\n[output truncated]";

/// Text read back from a capped file
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CapturedOutput {
    pub text: String,
    pub truncated: bool,
}

/// Read at most `limit` bytes of a file as text.
///
/// Larger files are cut to exactly `limit` bytes and get `TRUNCATION_MARKER`
/// appended. Invalid UTF-8 is replaced rather than rejected. A missing file
/// reads as empty, since a program that never wrote output leaves none behind.
pub async fn read_capped(path: &Path, limit: u64) -> std::io::Result<CapturedOutput> {
    let file = match File::open(path).await {
        Ok(file) => file,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(CapturedOutput::default())
        }
        Err(e) => return Err(e),
    };

    let size = file.metadata().await?.len();
    let mut buf = Vec::with_capacity(size.min(limit) as usize);
    file.take(limit).read_to_end(&mut buf).await?;

    let truncated = size > limit;
    let mut text = String::from_utf8_lossy(&buf).into_owned();
    if truncated {
        text.push_str(TRUNCATION_MARKER);
    }

    Ok(CapturedOutput { text, truncated })
}
