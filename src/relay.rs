/// Output relay: forward a child's stdout/stderr chunks into the log sink.
///
/// Each pipe is drained by its own task, so chunks on one stream keep their
/// arrival order while the two streams interleave freely. Nothing is buffered
/// beyond a partial UTF-8 sequence split across two reads.
use crate::sink::LogSink;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};

const CHUNK_SIZE: usize = 4096;

/// Which pipe a relay is attached to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stream {
    Stdout,
    Stderr,
}

/// Drain `reader` until EOF, forwarding every chunk to `sink`.
///
/// Stdout chunks go to `info`, stderr chunks to `error`, trimmed and skipped
/// when blank. `inspect` sees each decoded chunk untrimmed, after it has been
/// forwarded. Returns the number of bytes read.
pub async fn relay<R, F>(
    mut reader: R,
    stream: Stream,
    sink: Arc<dyn LogSink>,
    mut inspect: F,
) -> u64
where
    R: AsyncRead + Unpin,
    F: FnMut(&str),
{
    let mut buf = [0u8; CHUNK_SIZE];
    let mut pending: Vec<u8> = Vec::new();
    let mut total: u64 = 0;

    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::debug!(?stream, error = %e, "pipe read failed, closing relay");
                break;
            }
        };
        total += n as u64;
        pending.extend_from_slice(&buf[..n]);

        let text = take_text(&mut pending);
        if !text.is_empty() {
            forward(&text, stream, sink.as_ref(), &mut inspect);
        }
    }

    // A truncated sequence at EOF will never complete.
    if !pending.is_empty() {
        let text = String::from_utf8_lossy(&pending).into_owned();
        forward(&text, stream, sink.as_ref(), &mut inspect);
    }

    tracing::debug!(?stream, bytes = total, "relay closed");
    total
}

fn forward<F: FnMut(&str)>(text: &str, stream: Stream, sink: &dyn LogSink, inspect: &mut F) {
    let trimmed = text.trim();
    if !trimmed.is_empty() {
        match stream {
            Stream::Stdout => sink.info(trimmed),
            Stream::Stderr => sink.error(trimmed),
        }
    }
    inspect(text);
}

/// Decode as much of `pending` as possible, leaving an incomplete trailing
/// UTF-8 sequence in place for the next read. Invalid bytes are replaced.
fn take_text(pending: &mut Vec<u8>) -> String {
    let decoded = std::str::from_utf8(pending).map(str::to_owned);
    match decoded {
        Ok(text) => {
            pending.clear();
            text
        }
        Err(e) if e.error_len().is_none() => {
            let tail = pending.split_off(e.valid_up_to());
            let text = String::from_utf8_lossy(pending).into_owned();
            *pending = tail;
            text
        }
        Err(_) => {
            let text = String::from_utf8_lossy(pending).into_owned();
            pending.clear();
            text
        }
    }
}
