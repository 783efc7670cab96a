use std::io::BufRead;
use std::io::Write;

use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("channel closed")]
    Closed,
    #[error("transport failure: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Serialize one message as a single JSON line and flush it. Flushing per
/// message keeps pipe delivery prompt; callers batch by coalescing upstream.
pub fn write_msg<W, T>(writer: &mut W, msg: &T) -> Result<(), WireError>
where
    W: Write,
    T: Serialize,
{
    let mut line = serde_json::to_string(msg)?;
    line.push('\n');
    writer.write_all(line.as_bytes())?;
    writer.flush()?;
    Ok(())
}

/// Read the next JSON-line message, skipping blank lines. EOF maps to
/// [`WireError::Closed`] so callers can distinguish an orderly shutdown
/// from a parse failure.
pub fn read_msg<R, T>(reader: &mut R) -> Result<T, WireError>
where
    R: BufRead,
    T: DeserializeOwned,
{
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Err(WireError::Closed);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        return Ok(serde_json::from_str(trimmed)?);
    }
}

#[cfg(test)]
mod tests {
    use std::io::BufReader;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::CorrelationId;
    use crate::SessionMsg;
    use crate::WorkerMsg;

    #[test]
    fn round_trips_messages_one_per_line() {
        let mut buf: Vec<u8> = Vec::new();
        let id = CorrelationId::new();
        write_msg(&mut buf, &WorkerMsg::Ready { pid: 42 }).expect("write");
        write_msg(
            &mut buf,
            &WorkerMsg::Log {
                id,
                text: "line one\n".to_string(),
            },
        )
        .expect("write");

        let mut reader = BufReader::new(buf.as_slice());
        let first: WorkerMsg = read_msg(&mut reader).expect("read");
        assert_eq!(first, WorkerMsg::Ready { pid: 42 });
        let second: WorkerMsg = read_msg(&mut reader).expect("read");
        match second {
            WorkerMsg::Log { id: got, text } => {
                assert_eq!(got, id);
                assert_eq!(text, "line one\n");
            }
            other => panic!("expected log, got {other:?}"),
        }
        match read_msg::<_, WorkerMsg>(&mut reader) {
            Err(WireError::Closed) => {}
            other => panic!("expected closed channel, got {other:?}"),
        }
    }

    #[test]
    fn blank_lines_are_skipped() {
        let input = b"\n\n{\"kind\":\"stop\"}\n";
        let mut reader = BufReader::new(input.as_slice());
        let msg: SessionMsg = read_msg(&mut reader).expect("read");
        assert_eq!(msg, SessionMsg::Stop);
    }
}
