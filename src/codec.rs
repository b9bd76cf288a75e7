use bytes::{Buf, BytesMut};
use nom::branch::alt;
use nom::bytes::streaming::{tag, take, take_until};
use nom::sequence::terminated;
use nom::IResult;
use std::str::from_utf8;
use tokio::io::{ReadHalf, WriteHalf};
use tokio_util::codec::{Decoder, Encoder, FramedRead, FramedWrite};

use crate::error::{Error, Result};
use crate::frame::{Command, Frame, Transmission};
use crate::header::{Header, HeaderList};

/// Reads frames and heart-beats off one half of a transport.
pub type FrameReader<T> = FramedRead<ReadHalf<T>, StompCodec>;
/// Writes frames and heart-beats onto one half of a transport.
pub type FrameWriter<T> = FramedWrite<WriteHalf<T>, StompCodec>;

/// Splits a transport into its frame reader and writer.
pub fn split<T>(transport: T) -> (FrameReader<T>, FrameWriter<T>)
where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
    let (read_half, write_half) = tokio::io::split(transport);
    (
        FramedRead::new(read_half, StompCodec::new()),
        FramedWrite::new(write_half, StompCodec::new()),
    )
}

/// Largest frame, headers included, a reader buffers before giving up.
pub const DEFAULT_MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct StompCodec {
    max_frame_size: usize,
    /// Leading bytes of the read buffer already searched for a NUL.
    scanned: usize,
    /// Buffer length the pending frame needs before it can parse.
    wanted: usize,
}

impl Default for StompCodec {
    fn default() -> StompCodec {
        StompCodec::new()
    }
}

impl StompCodec {
    pub fn new() -> StompCodec {
        StompCodec::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    pub fn with_max_frame_size(max_frame_size: usize) -> StompCodec {
        StompCodec {
            max_frame_size,
            scanned: 0,
            wanted: 0,
        }
    }

    fn incomplete(&self, needed: usize) -> Result<Option<Transmission>> {
        if needed > self.max_frame_size {
            return Err(Error::Frame(format!(
                "frame larger than {} bytes",
                self.max_frame_size
            )));
        }
        Ok(None)
    }
}

/// Raw pieces of a frame, borrowed from the read buffer.
struct RawFrame<'a> {
    command: &'a [u8],
    headers: Vec<(&'a [u8], &'a [u8])>,
    body: &'a [u8],
}

enum Parsed<'a> {
    HeartBeat,
    Frame(RawFrame<'a>),
}

fn line(input: &[u8]) -> IResult<&[u8], &[u8]> {
    let (rest, line) = terminated(take_until("\n"), tag("\n"))(input)?;
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    Ok((rest, line))
}

fn header_line(input: &[u8]) -> IResult<&[u8], Option<(&[u8], &[u8])>> {
    let (rest, line) = line(input)?;
    if line.is_empty() {
        return Ok((rest, None));
    }
    match line.iter().position(|b| *b == b':') {
        Some(colon) => Ok((rest, Some((&line[..colon], &line[colon + 1..])))),
        None => Err(nom::Err::Failure(nom::error::Error::new(
            input,
            nom::error::ErrorKind::Char,
        ))),
    }
}

fn content_length(headers: &[(&[u8], &[u8])]) -> Option<std::result::Result<usize, ()>> {
    headers
        .iter()
        .find(|(key, _)| *key == b"content-length")
        .map(|(_, value)| {
            from_utf8(value)
                .ok()
                .and_then(|v| v.trim().parse::<usize>().ok())
                .ok_or(())
        })
}

fn transmission(input: &[u8]) -> IResult<&[u8], Parsed<'_>> {
    if let Ok((rest, _)) = alt((tag::<_, _, nom::error::Error<&[u8]>>("\r\n"), tag("\n")))(input) {
        return Ok((rest, Parsed::HeartBeat));
    }
    // A lone '\r' may be the first half of a CRLF heart-beat.
    if input == b"\r" {
        return Err(nom::Err::Incomplete(nom::Needed::new(1)));
    }

    let (mut rest, command) = line(input)?;
    let mut headers = Vec::new();
    loop {
        let (next, header) = header_line(rest)?;
        rest = next;
        match header {
            Some(header) => headers.push(header),
            None => break,
        }
    }

    let (rest, body) = match content_length(&headers) {
        Some(Ok(length)) => terminated(take(length), tag("\0"))(rest)?,
        Some(Err(())) => {
            return Err(nom::Err::Failure(nom::error::Error::new(
                rest,
                nom::error::ErrorKind::Digit,
            )))
        }
        None => terminated(take_until("\0"), tag("\0"))(rest)?,
    };

    Ok((
        rest,
        Parsed::Frame(RawFrame {
            command,
            headers,
            body,
        }),
    ))
}

fn utf8(bytes: &[u8], what: &str) -> Result<String> {
    from_utf8(bytes)
        .map(str::to_owned)
        .map_err(|_| Error::Frame(format!("{} is not valid UTF-8", what)))
}

impl RawFrame<'_> {
    fn into_frame(self) -> Result<Frame> {
        let command: Command = utf8(self.command, "command")?.parse()?;
        let escaped = !command.is_handshake();
        let mut headers = HeaderList::with_capacity(self.headers.len());
        for (key, value) in self.headers {
            let key = utf8(key, "header name")?;
            let value = utf8(value, "header value")?;
            let header = if escaped {
                Header(Header::decode_value(&key)?, Header::decode_value(&value)?)
            } else {
                Header(key, value)
            };
            headers.push(header);
        }
        Ok(Frame {
            command,
            headers,
            body: self.body.to_vec(),
        })
    }
}

impl Decoder for StompCodec {
    type Item = Transmission;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Transmission>> {
        if src.is_empty() {
            return Ok(None);
        }
        if src.len() < self.wanted {
            return self.incomplete(self.wanted);
        }
        // Every frame ends in a NUL; without a new one there is nothing to parse.
        let eol_first = matches!(src[0], b'\n' | b'\r');
        if !eol_first && !src[self.scanned..].contains(&0) {
            self.scanned = src.len();
            return self.incomplete(src.len());
        }
        let (consumed, decoded) = match transmission(&src[..]) {
            Ok((rest, Parsed::HeartBeat)) => (src.len() - rest.len(), Ok(Transmission::HeartBeat)),
            Ok((rest, Parsed::Frame(raw))) => (
                src.len() - rest.len(),
                raw.into_frame().map(Transmission::CompleteFrame),
            ),
            Err(nom::Err::Incomplete(needed)) => {
                if let nom::Needed::Size(more) = needed {
                    self.wanted = src.len() + more.get();
                }
                return self.incomplete(self.wanted.max(src.len()));
            }
            Err(nom::Err::Error(e)) | Err(nom::Err::Failure(e)) => {
                return Err(Error::Frame(format!("{:?}", e.code)))
            }
        };
        src.advance(consumed);
        self.scanned = 0;
        self.wanted = 0;
        decoded.map(Some)
    }
}

impl Encoder<Transmission> for StompCodec {
    type Error = Error;

    fn encode(&mut self, item: Transmission, dst: &mut BytesMut) -> Result<()> {
        item.write(dst);
        Ok(())
    }
}

impl Encoder<Frame> for StompCodec {
    type Error = Error;

    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<()> {
        item.write(dst);
        Ok(())
    }
}
