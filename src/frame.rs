use crate::error::{Error, Result};
use crate::header::{Header, HeaderList, HeartBeat, StompVersion};
use crate::subscription::AckMode;
use bytes::{BufMut, BytesMut};
use std::fmt;
use std::fmt::Formatter;
use std::str::{from_utf8, FromStr};

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Send,
    Subscribe,
    Unsubscribe,
    Begin,
    Commit,
    Abort,
    Ack,
    Nack,
    Disconnect,
    Connect,
    Stomp,
    Connected,
    Message,
    Receipt,
    Error,
}
impl Command {
    pub fn as_str(&self) -> &'static str {
        use self::Command::*;

        match *self {
            Send => "SEND",
            Subscribe => "SUBSCRIBE",
            Unsubscribe => "UNSUBSCRIBE",
            Begin => "BEGIN",
            Commit => "COMMIT",
            Abort => "ABORT",
            Ack => "ACK",
            Nack => "NACK",
            Disconnect => "DISCONNECT",
            Connect => "CONNECT",
            Stomp => "STOMP",
            Connected => "CONNECTED",
            Message => "MESSAGE",
            Receipt => "RECEIPT",
            Error => "ERROR",
        }
    }

    /// Header values of these frames are never escaped on the wire.
    pub fn is_handshake(&self) -> bool {
        matches!(self, Command::Connect | Command::Stomp | Command::Connected)
    }
}
impl fmt::Display for Command {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
impl FromStr for Command {
    type Err = Error;

    fn from_str(s: &str) -> Result<Command> {
        use self::Command::*;

        let command = match s {
            "SEND" => Send,
            "SUBSCRIBE" => Subscribe,
            "UNSUBSCRIBE" => Unsubscribe,
            "BEGIN" => Begin,
            "COMMIT" => Commit,
            "ABORT" => Abort,
            "ACK" => Ack,
            "NACK" => Nack,
            "DISCONNECT" => Disconnect,
            "CONNECT" => Connect,
            "STOMP" => Stomp,
            "CONNECTED" => Connected,
            "MESSAGE" => Message,
            "RECEIPT" => Receipt,
            "ERROR" => Error,
            other => return Err(self::Error::UnknownCommand(other.to_owned())),
        };
        Ok(command)
    }
}

pub trait ToFrameBody {
    fn to_frame_body(&self) -> &[u8];
}

impl<'b> ToFrameBody for &'b [u8] {
    fn to_frame_body(&self) -> &[u8] {
        self
    }
}

impl<'b> ToFrameBody for &'b str {
    fn to_frame_body(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl ToFrameBody for String {
    fn to_frame_body(&self) -> &[u8] {
        self.as_bytes()
    }
}

impl ToFrameBody for Vec<u8> {
    fn to_frame_body(&self) -> &[u8] {
        self.as_slice()
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Frame {
    pub command: Command,
    pub headers: HeaderList,
    pub body: Vec<u8>,
}

/// One unit read from or written to the wire. A heart-beat is the
/// nil frame: it carries no command.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Transmission {
    HeartBeat,
    CompleteFrame(Frame),
}

impl Transmission {
    pub fn write(&self, out: &mut BytesMut) {
        match *self {
            Transmission::HeartBeat => out.put_u8(b'\n'),
            Transmission::CompleteFrame(ref frame) => frame.write(out),
        }
    }
}

impl From<Frame> for Transmission {
    fn from(frame: Frame) -> Transmission {
        Transmission::CompleteFrame(frame)
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}", self.to_str())
    }
}

impl Frame {
    pub fn new(command: Command) -> Frame {
        Frame {
            command,
            headers: HeaderList::new(),
            body: Vec::new(),
        }
    }

    pub fn with_headers(command: Command, headers: HeaderList) -> Frame {
        Frame {
            command,
            headers,
            body: Vec::new(),
        }
    }

    pub fn count_bytes(&self) -> usize {
        let escaped = !self.command.is_handshake();
        let mut space_required: usize = 0;
        // Add one to space calculations to make room for '\n'
        space_required += self.command.as_str().len() + 1;
        space_required += self
            .headers
            .iter()
            .fold(0, |length, header| length + header.get_raw(escaped).len() + 1);
        space_required += 1; // Newline at end of headers
        space_required += self.body.len();
        space_required += 1; // Terminating NUL
        space_required
    }

    pub fn to_str(&self) -> String {
        let mut frame_string = String::with_capacity(self.count_bytes());
        frame_string.push_str(self.command.as_str());
        frame_string.push('\n');
        for header in self.headers.iter() {
            // Passcodes stay out of logs.
            if header.get_key() == "passcode" {
                frame_string.push_str("passcode:********");
            } else {
                frame_string.push_str(&header.get_raw(false));
            }
            frame_string.push('\n');
        }
        frame_string.push('\n');
        let body_string: &str = match from_utf8(self.body.as_ref()) {
            Ok(s) => s,
            Err(_) => "<Binary content>",
        };
        frame_string.push_str(body_string);
        frame_string
    }

    pub fn write(&self, out: &mut BytesMut) {
        let escaped = !self.command.is_handshake();
        out.reserve(self.count_bytes());
        out.extend_from_slice(self.command.as_str().as_bytes());
        out.put_u8(b'\n');

        for header in self.headers.iter() {
            out.extend_from_slice(header.get_raw(escaped).as_bytes());
            out.put_u8(b'\n');
        }

        out.put_u8(b'\n');
        out.extend_from_slice(&self.body);
        out.put_u8(0);
    }

    pub fn connected(version: StompVersion, server: &str, heart_beat: HeartBeat) -> Frame {
        let heart_beat = heart_beat.to_string();
        Frame::with_headers(
            Command::Connected,
            header_list![
                "version" => version.as_str(),
                "server" => server,
                "heart-beat" => &heart_beat
            ],
        )
    }

    pub fn disconnect(receipt_id: &str) -> Frame {
        Frame::with_headers(
            Command::Disconnect,
            header_list![
                "receipt" => receipt_id
            ],
        )
    }

    pub fn subscribe(subscription_id: &str, destination: &str, ack_mode: AckMode) -> Frame {
        Frame::with_headers(
            Command::Subscribe,
            header_list![
                "destination" => destination,
                "id" => subscription_id,
                "ack" => ack_mode.as_text()
            ],
        )
    }

    pub fn unsubscribe(subscription_id: &str) -> Frame {
        Frame::with_headers(
            Command::Unsubscribe,
            header_list![
                "id" => subscription_id
            ],
        )
    }

    pub fn send(destination: &str, body: &[u8]) -> Frame {
        Frame {
            command: Command::Send,
            headers: header_list![
                "content-length" => &body.len().to_string(),
                "destination" => destination
            ],
            body: body.into(),
        }
    }

    pub fn begin(transaction_id: &str) -> Frame {
        Frame::with_headers(
            Command::Begin,
            header_list![
                "transaction" => transaction_id
            ],
        )
    }

    pub fn abort(transaction_id: &str) -> Frame {
        Frame::with_headers(
            Command::Abort,
            header_list![
                "transaction" => transaction_id
            ],
        )
    }

    pub fn commit(transaction_id: &str) -> Frame {
        Frame::with_headers(
            Command::Commit,
            header_list![
                "transaction" => transaction_id
            ],
        )
    }

    pub fn receipt(receipt_id: &str) -> Frame {
        Frame::with_headers(
            Command::Receipt,
            header_list![
                "receipt-id" => receipt_id
            ],
        )
    }

    pub fn error(message: &str) -> Frame {
        Frame::with_headers(
            Command::Error,
            header_list![
                "message" => message
            ],
        )
    }

    pub fn is_error(&self) -> bool {
        self.command == Command::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_round_trip_through_text() {
        for command in [Command::Send, Command::Stomp, Command::Nack, Command::Receipt] {
            assert_eq!(command, command.as_str().parse::<Command>().unwrap());
        }
        assert!(matches!(
            "PUBLISH".parse::<Command>(),
            Err(Error::UnknownCommand(ref c)) if c == "PUBLISH"
        ));
    }

    #[test]
    fn write_escapes_headers_except_on_handshake() {
        let mut send = Frame::send("/queue/a:b", b"hi");
        send.headers.push(Header::new("note", "line\nbreak"));
        let mut out = BytesMut::new();
        send.write(&mut out);
        assert_eq!(
            &b"SEND\ncontent-length:2\ndestination:/queue/a\\cb\nnote:line\\nbreak\n\nhi\0"[..],
            &out[..]
        );

        let mut connect = Frame::new(Command::Connect);
        connect.headers.push(Header::new("login", "a:b"));
        let mut out = BytesMut::new();
        connect.write(&mut out);
        assert_eq!(&b"CONNECT\nlogin:a:b\n\n\0"[..], &out[..]);
    }

    #[test]
    fn count_bytes_matches_written_length() {
        let frame = Frame::send("/topic/x", b"payload");
        let mut out = BytesMut::new();
        frame.write(&mut out);
        assert_eq!(frame.count_bytes(), out.len());
    }

    #[test]
    fn passcode_is_masked_in_display() {
        let mut connect = Frame::new(Command::Connect);
        connect.headers.push(Header::new("passcode", "secret"));
        assert!(!connect.to_string().contains("secret"));
    }

    #[test]
    fn heart_beat_writes_single_newline() {
        let mut out = BytesMut::new();
        Transmission::HeartBeat.write(&mut out);
        assert_eq!(&b"\n"[..], &out[..]);
    }
}
