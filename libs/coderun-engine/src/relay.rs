/// Stream Relay
///
/// One relay task per output channel. Each reads up to the next line break,
/// wraps the line in an [`OutputFrame`] and hands it to the session registry.
/// Lines are forwarded as soon as they are read and never retained.
///
/// A relay ends when its pipe reaches EOF (the child and every descendant
/// holding the descriptor have exited) or when the coordinator aborts the task.

use crate::registry::SessionRegistry;
use coderun_common::config::MIN_LINE_BYTES;
use coderun_common::types::{timestamp_now, ExecutionEvent, OutputFrame, SessionId, StreamKind};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tracing::{trace, warn};
use uuid::Uuid;

/// Where a relay's frames go: one session, one job, one channel.
#[derive(Clone)]
pub struct FrameTarget {
    pub registry: Arc<SessionRegistry>,
    pub session_id: SessionId,
    pub job_id: Uuid,
    pub stream_kind: StreamKind,
    /// Upper bound on the bytes held for one frame.
    pub max_line_bytes: usize,
}

impl FrameTarget {
    fn send(&self, sequence: u64, text: String) {
        trace!(job_id = %self.job_id, stream = %self.stream_kind, sequence, "Relaying line");
        self.registry.deliver(
            &self.session_id,
            ExecutionEvent::OutputFrame(OutputFrame {
                job_id: self.job_id,
                stream_kind: self.stream_kind,
                text,
                sequence,
                timestamp: timestamp_now(),
            }),
        );
    }
}

/// Pump `reader` line by line into `target`. Returns the number of frames sent.
///
/// Bytes are decoded lossily so a stray invalid UTF-8 sequence does not end
/// the stream. A final fragment without a trailing newline is still flushed.
/// A line longer than `max_line_bytes` goes out as several consecutive frames,
/// split on character boundaries, so memory per relay stays bounded.
pub async fn relay_lines<R>(reader: R, target: FrameTarget) -> u64
where
    R: AsyncRead + Unpin,
{
    let cap = target.max_line_bytes.max(MIN_LINE_BYTES);
    let mut reader = BufReader::new(reader);
    let mut buf: Vec<u8> = Vec::with_capacity(cap.min(8 * 1024));
    let mut sequence = 0u64;
    // Set after a frame was cut at the cap; the newline that ends the line
    // must not produce an extra empty frame.
    let mut continued = false;

    loop {
        let room = (cap - buf.len()) as u64;
        match (&mut reader).take(room).read_until(b'\n', &mut buf).await {
            Ok(0) => {
                // EOF; only an incomplete character can be left over.
                if !buf.is_empty() {
                    target.send(sequence, decode_line(&buf));
                    sequence += 1;
                }
                break;
            }
            Ok(_) if buf.last() == Some(&b'\n') => {
                let text = decode_line(&buf);
                buf.clear();
                if continued && text.is_empty() {
                    continued = false;
                    continue;
                }
                continued = false;
                target.send(sequence, text);
                sequence += 1;
            }
            Ok(_) if buf.len() >= cap => {
                let carry = buf.split_off(buf.len() - incomplete_tail(&buf));
                target.send(sequence, String::from_utf8_lossy(&buf).into_owned());
                sequence += 1;
                buf = carry;
                continued = true;
            }
            Ok(_) => {
                // Short read without a newline: the pipe hit EOF mid-line.
                target.send(sequence, decode_line(&buf));
                sequence += 1;
                buf.clear();
                continued = false;
            }
            Err(e) => {
                warn!(job_id = %target.job_id, stream = %target.stream_kind, error = %e, "Error reading child output");
                break;
            }
        }
    }

    sequence
}

fn decode_line(raw: &[u8]) -> String {
    let mut end = raw.len();
    if end > 0 && raw[end - 1] == b'\n' {
        end -= 1;
        if end > 0 && raw[end - 1] == b'\r' {
            end -= 1;
        }
    }
    String::from_utf8_lossy(&raw[..end]).into_owned()
}

/// Length of a UTF-8 sequence cut off at the end of `raw`, 0 if none.
fn incomplete_tail(raw: &[u8]) -> usize {
    let start = raw.len().saturating_sub(3);
    for i in (start..raw.len()).rev() {
        let byte = raw[i];
        if byte & 0xC0 == 0x80 {
            continue;
        }
        let width = match byte {
            0xF0..=0xFF => 4,
            0xE0..=0xEF => 3,
            0xC0..=0xDF => 2,
            _ => 1,
        };
        let have = raw.len() - i;
        return if have < width { have } else { 0 };
    }
    0
}
