use tokio::io::{AsyncRead, AsyncReadExt};

/// Default per-stream capture limit.
pub const DEFAULT_MAX_OUTPUT_SIZE: usize = 1 << 20;

pub const TRUNCATION_MARKER: &str = "\n... [output truncated]";

/// Bytes captured from one output stream.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CapturedOutput {
    pub bytes: Vec<u8>,
    pub truncated: bool,
}

impl CapturedOutput {
    pub fn into_string(self) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.truncated {
            text.push_str(TRUNCATION_MARKER);
        }
        text
    }
}

/// Read `reader` to EOF, keeping at most `limit` bytes.
///
/// The rest is drained and dropped so the child never blocks on a full pipe.
pub async fn read_capped<R>(mut reader: R, limit: usize) -> std::io::Result<CapturedOutput>
where
    R: AsyncRead + Unpin,
{
    let mut out = CapturedOutput::default();
    let mut buf = [0u8; 8192];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let room = limit.saturating_sub(out.bytes.len());
        if n > room {
            out.truncated = true;
        }
        out.bytes.extend_from_slice(&buf[..n.min(room)]);
    }
    Ok(out)
}
