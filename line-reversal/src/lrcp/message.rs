use std::{fmt, str::FromStr};

use super::MAX_MESSAGE_SIZE;

// Numeric wire fields are decimal, at most ten digits, and capped at
// 2^31 - 1.
const MAX_NUMERIC: u64 = 2_147_483_647;
const MAX_NUMERIC_DIGITS: usize = 10;

#[derive(Debug, PartialEq, Eq)]
pub struct Message {
    pub session: u32,
    pub kind: Kind,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Kind {
    Connect,
    Data { position: u32, data: String },
    Ack { length: u32 },
    Close,
}

impl Message {
    pub fn data(session: u32, position: u32, data: String) -> Self {
        Self {
            session,
            kind: Kind::Data { position, data },
        }
    }

    pub fn ack(session: u32, length: u32) -> Self {
        Self {
            session,
            kind: Kind::Ack { length },
        }
    }

    pub fn close(session: u32) -> Self {
        Self {
            session,
            kind: Kind::Close,
        }
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            Kind::Connect => write!(f, "/connect/{}/", self.session),
            Kind::Close => write!(f, "/close/{}/", self.session),
            Kind::Ack { length } => write!(f, "/ack/{}/{}/", self.session, length),
            Kind::Data { position, data } => {
                write!(f, "/data/{}/{}/{}/", self.session, position, escape(data))
            }
        }
    }
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ParseMessageError {
    #[error("unknown message format")]
    Unknown,

    #[error("message too large")]
    TooLarge,

    #[error("numeric field out of range")]
    BadNumeric,

    #[error("the data field is not escaped properly")]
    BadDataFormat,
}

impl FromStr for Message {
    type Err = ParseMessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() >= MAX_MESSAGE_SIZE {
            return Err(ParseMessageError::TooLarge);
        }
        if s.len() < 2 || !s.starts_with('/') || !s.ends_with('/') {
            return Err(ParseMessageError::Unknown);
        }

        // Split the undelimited body; escaped slashes inside a data
        // field are put back together below.
        let mut parts = s[1..s.len() - 1].split('/');
        let ty = parts.next().ok_or(ParseMessageError::Unknown)?;
        let session = numeric_field(parts.next().ok_or(ParseMessageError::Unknown)?)?;

        let message = match ty {
            "connect" => {
                if parts.next().is_some() {
                    return Err(ParseMessageError::Unknown);
                }

                Self {
                    session,
                    kind: Kind::Connect,
                }
            }
            "close" => {
                if parts.next().is_some() {
                    return Err(ParseMessageError::Unknown);
                }

                Self {
                    session,
                    kind: Kind::Close,
                }
            }
            "ack" => {
                let length = numeric_field(parts.next().ok_or(ParseMessageError::Unknown)?)?;
                if parts.next().is_some() {
                    return Err(ParseMessageError::Unknown);
                }

                Self {
                    session,
                    kind: Kind::Ack { length },
                }
            }
            "data" => {
                let position = numeric_field(parts.next().ok_or(ParseMessageError::Unknown)?)?;
                let raw = parts.collect::<Vec<_>>().join("/");

                Self {
                    session,
                    kind: Kind::Data {
                        position,
                        data: unescape(&raw)?,
                    },
                }
            }
            _ => return Err(ParseMessageError::Unknown),
        };

        Ok(message)
    }
}

fn numeric_field(field: &str) -> Result<u32, ParseMessageError> {
    if field.is_empty()
        || field.len() > MAX_NUMERIC_DIGITS
        || !field.bytes().all(|b| b.is_ascii_digit())
    {
        return Err(ParseMessageError::BadNumeric);
    }

    let value: u64 = field.parse().map_err(|_| ParseMessageError::BadNumeric)?;
    if value > MAX_NUMERIC {
        return Err(ParseMessageError::BadNumeric);
    }

    Ok(value as u32)
}

pub(super) fn escape(data: &str) -> String {
    data.replace('\\', r"\\").replace('/', r"\/")
}

// The raw field still contains the slashes the splitter re-joined;
// every one of them must be preceded by a backslash.
fn unescape(raw: &str) -> Result<String, ParseMessageError> {
    let mut unescaped = String::with_capacity(raw.len());

    let mut chars = raw.chars();
    while let Some(ch) = chars.next() {
        match ch {
            '\\' => match chars.next() {
                Some(escaped @ ('\\' | '/')) => unescaped.push(escaped),
                _ => return Err(ParseMessageError::BadDataFormat),
            },
            '/' => return Err(ParseMessageError::BadDataFormat),
            _ => unescaped.push(ch),
        }
    }

    Ok(unescaped)
}
