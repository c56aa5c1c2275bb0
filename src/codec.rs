//! Line reading and the length-prefixed `CONFIG` frame used by the cluster configuration
//! protocol.
//!
//! The same frame is spoken by the upstream configuration endpoints and by the listeners this
//! crate serves, so a single decode path ([`parse_response`]) and a single encode path
//! ([`encode_response`]) are used for both directions.

use std::{error::Error, fmt::Display, io};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

/// Line terminator of the protocol.
pub const CRLF: &[u8] = b"\r\n";

/// Sent in place of a `CONFIG` header when no data is available.
pub const RESULT_END: &[u8] = b"END\r\n";

/// Reads a single `\n`-terminated line into `buf`.
///
/// The terminator and an optional preceding `\r` are stripped. The buffer grows as needed, so
/// lines longer than the internal buffer of `reader` are returned unabridged.
///
/// Returns `Ok(false)` if the stream ended before any byte was read. An empty line is a
/// successful read; what to do with it is up to the caller.
pub async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> io::Result<bool>
where
    R: AsyncBufRead + Unpin,
{
    buf.clear();
    if reader.read_until(b'\n', buf).await? == 0 {
        return Ok(false);
    }

    if buf.last() == Some(&b'\n') {
        buf.pop();
        if buf.last() == Some(&b'\r') {
            buf.pop();
        }
    }

    Ok(true)
}

/// Reads one `CONFIG <key> <flags> <size>` frame and returns its `size` value bytes.
///
/// Only the header line and the `<value>\r\n` section are consumed from `reader`; the trailing
/// blank line and `END\r\n` are left in the stream.
pub async fn parse_response<R>(reader: &mut R) -> Result<Vec<u8>, FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = Vec::new();
    if reader.read_until(b'\n', &mut line).await? == 0 {
        return Err(FrameError::Io(io::ErrorKind::UnexpectedEof.into()));
    }

    if line == RESULT_END {
        return Err(FrameError::EndOfResults);
    }

    let size = parse_header(&line)?;
    let expected = size
        .checked_add(CRLF.len())
        .ok_or_else(|| FrameError::MalformedHeader(lossy(&line)))?;

    let mut value = Vec::new();
    reader
        .take(expected as u64)
        .read_to_end(&mut value)
        .await?;

    if value.len() < expected {
        return Err(FrameError::TruncatedPayload {
            expected,
            received: value.len(),
        });
    }
    if !value.ends_with(CRLF) {
        return Err(FrameError::CorruptPayload);
    }

    value.truncate(size);
    Ok(value)
}

/// Parses a header line and returns the declared value size.
///
/// The line must be `\n`-terminated and consist of exactly the literal `CONFIG`, a key, a
/// numeric flags field, and a numeric size field.
fn parse_header(line: &[u8]) -> Result<usize, FrameError> {
    let malformed = || FrameError::MalformedHeader(lossy(line));

    let content = line.strip_suffix(b"\n").ok_or_else(malformed)?;
    let content = content.strip_suffix(b"\r").unwrap_or(content);
    let content = std::str::from_utf8(content).map_err(|_| malformed())?;

    let fields: Vec<_> = content.split_ascii_whitespace().collect();
    match fields.as_slice() {
        ["CONFIG", _key, flags, size] => {
            flags.parse::<u32>().map_err(|_| malformed())?;
            size.parse::<usize>().map_err(|_| malformed())
        }
        _ => Err(malformed()),
    }
}

/// Wraps `value` into a complete response frame, including the `END` terminator.
pub fn encode_response(value: &[u8]) -> Vec<u8> {
    let header = format!("CONFIG cluster 0 {}\r\n", value.len());

    let mut frame = Vec::with_capacity(header.len() + value.len() + 9);
    frame.extend_from_slice(header.as_bytes());
    frame.extend_from_slice(value);
    frame.extend_from_slice(CRLF);
    frame.extend_from_slice(CRLF);
    frame.extend_from_slice(RESULT_END);
    frame
}

/// Encodes a `config get cluster` reply carrying the given config version and the
/// space-separated node list.
pub fn encode_config(version: u32, nodes: &str) -> Vec<u8> {
    encode_response(format!("{}\r\n{}", version, nodes).as_bytes())
}

fn lossy(line: &[u8]) -> String {
    String::from_utf8_lossy(line).into_owned()
}

/// Errors that can occur while decoding a response frame.
#[derive(Debug)]
pub enum FrameError {
    /// Reading from the stream failed, or it ended before a header was received.
    Io(io::Error),
    /// The stream sent `END` instead of a `CONFIG` header, i.e. there is no data.
    EndOfResults,
    /// The header line is not of the form `CONFIG <key> <flags> <size>`.
    MalformedHeader(String),
    /// The stream ended before the declared number of value bytes arrived.
    TruncatedPayload {
        /// Declared value size plus the trailing terminator.
        expected: usize,
        /// Number of bytes actually read.
        received: usize,
    },
    /// The value section was not terminated by `\r\n`.
    CorruptPayload,
}

impl Display for FrameError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Io(err) => write!(f, "failed to read response: {}", err),
            Self::EndOfResults => write!(f, "no results available"),
            Self::MalformedHeader(line) => {
                write!(f, "unexpected line in get response: {:?}", line)
            }
            Self::TruncatedPayload { expected, received } => write!(
                f,
                "truncated get response: expected {} bytes, got {}",
                expected, received
            ),
            Self::CorruptPayload => write!(f, "corrupt get result read"),
        }
    }
}

impl Error for FrameError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for FrameError {
    fn from(err: io::Error) -> Self {
        Self::Io(err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tokio::io::BufReader;

    async fn decode(input: &[u8]) -> Result<Vec<u8>, FrameError> {
        let mut reader = BufReader::new(input);
        parse_response(&mut reader).await
    }

    #[tokio::test]
    async fn decodes_value() {
        let value = decode(b"CONFIG k 0 5\r\nhello\r\n").await.unwrap();
        assert_eq!(value, b"hello");
    }

    #[tokio::test]
    async fn leaves_trailer_in_stream() {
        let input: &[u8] = b"CONFIG cluster 0 3\r\nabc\r\n\r\nEND\r\n";
        let mut reader = BufReader::new(input);
        assert_eq!(parse_response(&mut reader).await.unwrap(), b"abc");

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(rest, b"\r\nEND\r\n");
    }

    #[tokio::test]
    async fn short_payload_is_truncated() {
        let err = decode(b"CONFIG k 0 5\r\nhell\r\n").await.unwrap_err();
        assert!(
            matches!(
                err,
                FrameError::TruncatedPayload {
                    expected: 7,
                    received: 6
                }
            ),
            "{:?}",
            err
        );
    }

    #[tokio::test]
    async fn end_line_signals_no_results() {
        let err = decode(b"END\r\n").await.unwrap_err();
        assert!(matches!(err, FrameError::EndOfResults), "{:?}", err);
    }

    #[tokio::test]
    async fn rejects_malformed_headers() {
        for header in [
            &b"CONFIG k 0\r\n"[..],
            b"CONFIG k 0 5 extra\r\n",
            b"VALUE k 0 5\r\n",
            b"CONFIG k x 5\r\n",
            b"CONFIG k 0 -5\r\n",
            b"CONFIG k 0 5",
            b"END\n",
        ] {
            let err = decode(header).await.unwrap_err();
            assert!(
                matches!(err, FrameError::MalformedHeader(_)),
                "{:?}: {:?}",
                String::from_utf8_lossy(header),
                err
            );
        }
    }

    #[tokio::test]
    async fn rejects_huge_size_without_allocating() {
        let input = format!("CONFIG k 0 {}\r\n", usize::MAX);
        let err = decode(input.as_bytes()).await.unwrap_err();
        assert!(matches!(err, FrameError::MalformedHeader(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn missing_terminator_is_corrupt() {
        let err = decode(b"CONFIG k 0 5\r\nhelloXY").await.unwrap_err();
        assert!(matches!(err, FrameError::CorruptPayload), "{:?}", err);
    }

    #[tokio::test]
    async fn empty_stream_is_io_error() {
        let err = decode(b"").await.unwrap_err();
        assert!(matches!(err, FrameError::Io(_)), "{:?}", err);
    }

    #[test]
    fn encodes_config_reply() {
        assert_eq!(
            encode_config(1, "10.0.0.1:11211"),
            b"CONFIG cluster 0 17\r\n1\r\n10.0.0.1:11211\r\n\r\nEND\r\n".to_vec()
        );
        assert_eq!(
            encode_config(1, ""),
            b"CONFIG cluster 0 3\r\n1\r\n\r\n\r\nEND\r\n".to_vec()
        );
    }

    #[tokio::test]
    async fn decodes_what_it_encodes() {
        let binary: Vec<u8> = (0..=255).collect();
        let values = [
            &b""[..],
            b"1\r\nhost|10.0.0.1|11211",
            b"\r\n\r\nEND\r\n",
            binary.as_slice(),
        ];
        for value in values {
            assert_eq!(decode(&encode_response(value)).await.unwrap(), value);
        }
    }

    #[tokio::test]
    async fn reads_lines_with_either_terminator() {
        let input: &[u8] = b"config get cluster\r\nsecond\n\r\nlast";
        let mut reader = BufReader::new(input);
        let mut line = Vec::new();

        assert!(read_line(&mut reader, &mut line).await.unwrap());
        assert_eq!(line, b"config get cluster");
        assert!(read_line(&mut reader, &mut line).await.unwrap());
        assert_eq!(line, b"second");
        assert!(read_line(&mut reader, &mut line).await.unwrap());
        assert_eq!(line, b"");
        assert!(read_line(&mut reader, &mut line).await.unwrap());
        assert_eq!(line, b"last");
        assert!(!read_line(&mut reader, &mut line).await.unwrap());
    }

    #[tokio::test]
    async fn reads_lines_longer_than_the_buffer() {
        let long = "x".repeat(10_000);
        let input = format!("{}\r\n", long);
        let mut reader = BufReader::with_capacity(16, input.as_bytes());
        let mut line = Vec::new();

        assert!(read_line(&mut reader, &mut line).await.unwrap());
        assert_eq!(line.len(), long.len());
        assert_eq!(line, long.as_bytes());
    }
}
