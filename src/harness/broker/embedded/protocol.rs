//! Minimal codec for the Redis serialization protocol (RESP2)

use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Upper bound for a single bulk string, larger payloads are rejected
const MAX_BULK_LENGTH: usize = 64 * 1024 * 1024;
/// Upper bound for the number of arguments of a single command
const MAX_ARGUMENTS: usize = 1024 * 1024;

/// Errors while reading commands from a client
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// Underlying socket failed
    #[error("connection failed")]
    Io(#[from] std::io::Error),
    /// Client sent something that is not valid RESP
    #[error("protocol error: {0}")]
    Malformed(String),
}

/// Value sent to a client
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// `+OK`
    Simple(&'static str),
    /// `-ERR ...`
    Error(String),
    /// `:42`
    Integer(i64),
    /// `$3\r\nfoo`, `None` encodes the null bulk string
    Bulk(Option<Vec<u8>>),
    /// `*2\r\n...`
    Array(Vec<Frame>),
}

impl Frame {
    /// Shorthand for a non-null bulk string
    pub fn bulk(data: impl Into<Vec<u8>>) -> Self {
        Frame::Bulk(Some(data.into()))
    }

    /// Appends the wire representation to the buffer
    pub fn encode(&self, buffer: &mut Vec<u8>) {
        match self {
            Frame::Simple(text) => {
                buffer.push(b'+');
                buffer.extend_from_slice(text.as_bytes());
            }
            Frame::Error(text) => {
                buffer.push(b'-');
                buffer.extend_from_slice(text.replace(&['\r', '\n'][..], " ").as_bytes());
            }
            Frame::Integer(value) => {
                buffer.extend_from_slice(format!(":{}", value).as_bytes());
            }
            Frame::Bulk(None) => buffer.extend_from_slice(b"$-1"),
            Frame::Bulk(Some(data)) => {
                buffer.extend_from_slice(format!("${}\r\n", data.len()).as_bytes());
                buffer.extend_from_slice(data);
            }
            Frame::Array(frames) => {
                buffer.extend_from_slice(format!("*{}\r\n", frames.len()).as_bytes());
                for frame in frames {
                    frame.encode(buffer);
                }
                return;
            }
        }

        buffer.extend_from_slice(b"\r\n");
    }
}

/// Reads the next command sent by a client
///
/// Both the array form used by client libraries and the inline form typed into a terminal are understood.
/// Returns `None` once the client closed the connection.
pub async fn read_command<R>(reader: &mut R) -> Result<Option<Vec<Vec<u8>>>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let line = match read_line(reader).await? {
            Some(line) => line,
            None => return Ok(None),
        };

        if line.is_empty() {
            continue;
        }

        if line[0] != b'*' {
            return Ok(Some(
                line.split(|byte| byte.is_ascii_whitespace())
                    .filter(|part| !part.is_empty())
                    .map(<[u8]>::to_vec)
                    .collect(),
            ));
        }

        let count = parse_length(&line[1..], MAX_ARGUMENTS)?;
        let mut arguments = Vec::with_capacity(count.min(64));

        for _ in 0..count {
            let header = read_line(reader)
                .await?
                .ok_or_else(|| ProtocolError::Malformed("unexpected end of command".into()))?;

            if header.first() != Some(&b'$') {
                return Err(ProtocolError::Malformed(
                    "expected bulk string argument".into(),
                ));
            }

            let length = parse_length(&header[1..], MAX_BULK_LENGTH)?;
            let mut data = vec![0; length + 2];
            reader.read_exact(&mut data).await?;

            if !data.ends_with(b"\r\n") {
                return Err(ProtocolError::Malformed(
                    "bulk string not terminated by CRLF".into(),
                ));
            }

            data.truncate(length);
            arguments.push(data);
        }

        return Ok(Some(arguments));
    }
}

async fn read_line<R>(reader: &mut R) -> Result<Option<Vec<u8>>, ProtocolError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();

    if reader.read_until(b'\n', &mut line).await? == 0 {
        return Ok(None);
    }

    while matches!(line.last(), Some(b'\n') | Some(b'\r')) {
        line.pop();
    }

    Ok(Some(line))
}

fn parse_length(digits: &[u8], maximum: usize) -> Result<usize, ProtocolError> {
    let length = std::str::from_utf8(digits)
        .ok()
        .and_then(|text| text.parse::<usize>().ok())
        .ok_or_else(|| {
            ProtocolError::Malformed(format!(
                "invalid length '{}'",
                String::from_utf8_lossy(digits)
            ))
        })?;

    if length > maximum {
        return Err(ProtocolError::Malformed(format!(
            "length {} exceeds limit of {}",
            length, maximum
        )));
    }

    Ok(length)
}

#[cfg(test)]
mod does {
    use super::*;
    use pretty_assertions::assert_eq;

    fn encoded(frame: Frame) -> String {
        let mut buffer = Vec::new();
        frame.encode(&mut buffer);
        String::from_utf8(buffer).unwrap()
    }

    #[test]
    fn encode_pubsub_messages() {
        let frame = Frame::Array(vec![
            Frame::bulk("message"),
            Frame::bulk("evaluation.statistics"),
            Frame::bulk("{}"),
        ]);

        assert_eq!(
            encoded(frame),
            "*3\r\n$7\r\nmessage\r\n$21\r\nevaluation.statistics\r\n$2\r\n{}\r\n"
        );
    }

    #[test]
    fn encode_scalars() {
        assert_eq!(encoded(Frame::Simple("OK")), "+OK\r\n");
        assert_eq!(encoded(Frame::Integer(2)), ":2\r\n");
        assert_eq!(encoded(Frame::Bulk(None)), "$-1\r\n");
        assert_eq!(encoded(Frame::Error("ERR a\nb".into())), "-ERR a b\r\n");
    }

    #[tokio::test]
    async fn read_array_commands() {
        let mut input: &[u8] = b"*3\r\n$7\r\nPUBLISH\r\n$4\r\nchan\r\n$5\r\nhe\r\nl\r\n";

        let command = read_command(&mut input).await.unwrap().unwrap();

        assert_eq!(
            command,
            vec![b"PUBLISH".to_vec(), b"chan".to_vec(), b"he\r\nl".to_vec()]
        );
        assert!(read_command(&mut input).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_inline_commands() {
        let mut input: &[u8] = b"PING  hello\r\n";

        let command = read_command(&mut input).await.unwrap().unwrap();

        assert_eq!(command, vec![b"PING".to_vec(), b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn reject_malformed_lengths() {
        let mut input: &[u8] = b"*1\r\n$abc\r\n";

        assert!(matches!(
            read_command(&mut input).await,
            Err(ProtocolError::Malformed(_))
        ));
    }
}
