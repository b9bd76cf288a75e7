// Non-camel case types are used for Stomp Protocol version enum variants
#![macro_use]
#![allow(non_camel_case_types)]
use std::fmt;
use std::slice::Iter;
use std::str::FromStr;
use unicode_segmentation::UnicodeSegmentation;

use crate::error::{Error, Result};

/// Largest heart-beat interval, in milliseconds, that a peer may request.
pub const MAX_HEART_BEAT_MS: u64 = u32::MAX as u64;

// Ideally this would be a simple typedef. However:
// See Rust bug #11047: https://github.com/mozilla/rust/issues/11047
// Cannot call static methods (`with_capacity`) on type aliases (`HeaderList`)
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeaderList {
    pub headers: Vec<Header>,
}

impl HeaderList {
    pub fn new() -> HeaderList {
        HeaderList::with_capacity(0)
    }
    pub fn with_capacity(capacity: usize) -> HeaderList {
        HeaderList {
            headers: Vec::with_capacity(capacity),
        }
    }

    pub fn push(&mut self, header: Header) {
        self.headers.push(header);
    }

    pub fn iter(&self) -> Iter<'_, Header> {
        self.headers.iter()
    }

    pub fn len(&self) -> usize {
        self.headers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.headers.is_empty()
    }

    pub fn concat(&mut self, other_list: &mut HeaderList) {
        self.headers.append(&mut other_list.headers);
    }

    pub fn retain<F>(&mut self, test: F)
    where
        F: Fn(&Header) -> bool,
    {
        self.headers.retain(test)
    }

    /// Value of the first header named `key`.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_header(key).map(Header::get_value)
    }

    pub fn get_all(&self, key: &str) -> Vec<&str> {
        self.headers
            .iter()
            .filter(|header| header.get_key() == key)
            .map(Header::get_value)
            .collect()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get_header(key).is_some()
    }

    /// Replaces the value of the first `key` header, appending one if absent.
    /// Any later duplicates of `key` are dropped.
    pub fn set(&mut self, key: &str, value: &str) {
        let mut seen = false;
        self.headers.retain_mut(|header| {
            if header.get_key() != key {
                return true;
            }
            if seen {
                return false;
            }
            seen = true;
            header.1 = value.to_owned();
            true
        });
        if !seen {
            self.headers.push(Header::new_raw(key, value));
        }
    }

    /// Removes every header named `key`, returning the first value removed.
    pub fn remove(&mut self, key: &str) -> Option<String> {
        let first = self.get(key).map(str::to_owned);
        self.headers.retain(|header| header.get_key() != key);
        first
    }
}

impl<'a> IntoIterator for &'a HeaderList {
    type Item = &'a Header;
    type IntoIter = Iter<'a, Header>;

    fn into_iter(self) -> Self::IntoIter {
        self.headers.iter()
    }
}

pub struct SuppressedHeader<'a>(pub &'a str);
pub struct ContentType<'a>(pub &'a str);

/// A header key and value, both held in their decoded (unescaped) form.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header(pub String, pub String);

impl Header {
    pub fn new(key: &str, value: &str) -> Header {
        Header(key.to_owned(), value.to_owned())
    }

    pub fn new_raw<T: Into<String>, U: Into<String>>(key: T, value: U) -> Header {
        Header(key.into(), value.into())
    }

    /// The `key:value` line as it appears on the wire, escaped or not.
    pub fn get_raw(&self, escaped: bool) -> String {
        if escaped {
            format!(
                "{}:{}",
                Self::encode_value(&self.0),
                Self::encode_value(&self.1)
            )
        } else {
            format!("{}:{}", self.0, self.1)
        }
    }

    pub fn encode_value(value: &str) -> String {
        let mut encoded = String::with_capacity(value.len());
        for grapheme in UnicodeSegmentation::graphemes(value, true) {
            match grapheme {
                "\\" => encoded.push_str(r"\\"), // Order is significant
                "\r" => encoded.push_str(r"\r"),
                "\n" => encoded.push_str(r"\n"),
                "\r\n" => encoded.push_str(r"\r\n"),
                ":" => encoded.push_str(r"\c"),
                g => encoded.push_str(g),
            }
        }
        encoded
    }

    pub fn decode_value(value: &str) -> Result<String> {
        let mut decoded = String::with_capacity(value.len());
        let mut chars = value.chars();
        while let Some(c) = chars.next() {
            if c != '\\' {
                decoded.push(c);
                continue;
            }
            match chars.next() {
                Some('\\') => decoded.push('\\'),
                Some('r') => decoded.push('\r'),
                Some('n') => decoded.push('\n'),
                Some('c') => decoded.push(':'),
                other => {
                    return Err(Error::InvalidHeader(format!(
                        "undefined escape sequence '\\{}'",
                        other.map(String::from).unwrap_or_default()
                    )))
                }
            }
        }
        Ok(decoded)
    }

    pub fn get_key(&self) -> &str {
        &self.0
    }

    pub fn get_value(&self) -> &str {
        &self.1
    }
}

// Headers defined by the STOMP protocol
pub struct Ack<'a>(pub &'a str);
pub struct Destination<'a>(pub &'a str);
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HeartBeat(pub u64, pub u64);
pub struct Host<'a>(pub &'a str);
pub struct Id<'a>(pub &'a str);
pub struct Login<'a>(pub &'a str);
pub struct MessageId<'a>(pub &'a str);
pub struct Passcode<'a>(pub &'a str);
pub struct Receipt<'a>(pub &'a str);
pub struct ReceiptId<'a>(pub &'a str);
pub struct Server<'a>(pub &'a str);
pub struct Session<'a>(pub &'a str);
pub struct Subscription<'a>(pub &'a str);
pub struct Transaction<'a>(pub &'a str);
#[derive(Clone, Copy)]
pub struct Version(pub StompVersion);

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum StompVersion {
    Stomp_v1_0,
    Stomp_v1_1,
    Stomp_v1_2,
}

impl StompVersion {
    /// Versions this crate speaks, oldest first.
    pub const SUPPORTED: [StompVersion; 3] = [
        StompVersion::Stomp_v1_0,
        StompVersion::Stomp_v1_1,
        StompVersion::Stomp_v1_2,
    ];

    pub fn as_str(&self) -> &'static str {
        match *self {
            StompVersion::Stomp_v1_0 => "1.0",
            StompVersion::Stomp_v1_1 => "1.1",
            StompVersion::Stomp_v1_2 => "1.2",
        }
    }

    pub fn supports_nack(&self) -> bool {
        *self != StompVersion::Stomp_v1_0
    }

    /// Value for an `accept-version` header listing every supported version.
    pub fn accept_version_header() -> String {
        StompVersion::SUPPORTED
            .iter()
            .map(StompVersion::as_str)
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Picks the highest version present in both `offered` and the supported set.
    pub fn negotiate(offered: &[StompVersion]) -> Option<StompVersion> {
        StompVersion::SUPPORTED
            .iter()
            .rev()
            .find(|version| offered.contains(version))
            .copied()
    }
}

impl fmt::Display for StompVersion {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StompVersion {
    type Err = Error;

    fn from_str(s: &str) -> Result<StompVersion> {
        match s.trim() {
            "1.0" => Ok(StompVersion::Stomp_v1_0),
            "1.1" => Ok(StompVersion::Stomp_v1_1),
            "1.2" => Ok(StompVersion::Stomp_v1_2),
            other => Err(Error::UnsupportedVersion(other.to_owned())),
        }
    }
}

impl HeartBeat {
    /// Parses an `"x,y"` heart-beat header value, both parts in milliseconds.
    pub fn parse(raw: &str) -> Result<HeartBeat> {
        let invalid = || Error::InvalidHeartBeat(raw.to_owned());
        let (x, y) = raw.split_once(',').ok_or_else(invalid)?;
        let parse_part = |part: &str| -> Result<u64> {
            let part = part.trim();
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(invalid());
            }
            let value = part.parse::<u64>().map_err(|_| invalid())?;
            Ok(value.min(MAX_HEART_BEAT_MS))
        };
        Ok(HeartBeat(parse_part(x)?, parse_part(y)?))
    }
}

impl fmt::Display for HeartBeat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{},{}", self.0, self.1)
    }
}

impl HeaderList {
    pub fn get_header<'a>(&'a self, key: &str) -> Option<&'a Header> {
        self.headers.iter().find(|header| header.get_key() == key)
    }

    pub fn get_accept_version(&self) -> Option<Vec<StompVersion>> {
        let versions = self.get("accept-version")?;
        let versions: Vec<StompVersion> = versions
            .split(',')
            .filter_map(|v| v.parse::<StompVersion>().ok())
            .collect();
        Some(versions)
    }

    pub fn get_ack(&self) -> Option<Ack<'_>> {
        self.get("ack").map(Ack)
    }

    pub fn get_destination(&self) -> Option<Destination<'_>> {
        self.get("destination").map(Destination)
    }

    /// The heart-beat header, if present; a malformed value is an error.
    pub fn get_heart_beat(&self) -> Option<Result<HeartBeat>> {
        self.get("heart-beat").map(HeartBeat::parse)
    }

    pub fn get_id(&self) -> Option<Id<'_>> {
        self.get("id").map(Id)
    }

    pub fn get_login(&self) -> Option<Login<'_>> {
        self.get("login").map(Login)
    }

    pub fn get_message_id(&self) -> Option<MessageId<'_>> {
        self.get("message-id").map(MessageId)
    }

    pub fn get_passcode(&self) -> Option<Passcode<'_>> {
        self.get("passcode").map(Passcode)
    }

    pub fn get_receipt(&self) -> Option<Receipt<'_>> {
        self.get("receipt").map(Receipt)
    }

    pub fn get_receipt_id(&self) -> Option<ReceiptId<'_>> {
        self.get("receipt-id").map(ReceiptId)
    }

    pub fn get_server(&self) -> Option<Server<'_>> {
        self.get("server").map(Server)
    }

    pub fn get_session(&self) -> Option<Session<'_>> {
        self.get("session").map(Session)
    }

    pub fn get_subscription(&self) -> Option<Subscription<'_>> {
        self.get("subscription").map(Subscription)
    }

    pub fn get_transaction(&self) -> Option<Transaction<'_>> {
        self.get("transaction").map(Transaction)
    }

    pub fn get_version(&self) -> Option<Result<Version>> {
        self.get("version")
            .map(|version| version.parse::<StompVersion>().map(Version))
    }

    pub fn get_content_type(&self) -> Option<ContentType<'_>> {
        self.get("content-type").map(ContentType)
    }
}

#[macro_export]
macro_rules! header_list [
  ($($key:expr => $value: expr), *) => ({
    #[allow(unused_mut)]
    let mut header_list = $crate::header::HeaderList::new();
    $(header_list.push($crate::header::Header::new($key, $value));)*
    header_list
  })
];
