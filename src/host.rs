//! Host model: protocols, record identity, candidate validation, and the
//! endpoint key that session identity hangs off.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Maximum length for host names and addresses.
pub const MAX_FIELD_LEN: usize = 128;

/// Wire protocol a host speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    Ssh,
    Vnc,
    Http,
    Https,
}

impl Protocol {
    /// Default port used when an address carries no explicit port.
    pub fn default_port(&self) -> u16 {
        match self {
            Protocol::Ssh => 22,
            Protocol::Vnc => 5900,
            Protocol::Http => 80,
            Protocol::Https => 443,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::Ssh => "SSH",
            Protocol::Vnc => "VNC",
            Protocol::Http => "HTTP",
            Protocol::Https => "HTTPS",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "SSH" => Ok(Protocol::Ssh),
            "VNC" => Ok(Protocol::Vnc),
            "HTTP" => Ok(Protocol::Http),
            "HTTPS" => Ok(Protocol::Https),
            other => Err(ValidationError::UnknownProtocol(other.to_string())),
        }
    }
}

/// Opaque identifier for a stored host record.
///
/// Assigned by the store at add time; immutable for the record's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HostId(Uuid);

impl HostId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for HostId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for HostId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A stored host definition.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostRecord {
    pub id: HostId,
    pub name: String,
    pub address: String,
    pub protocol: Protocol,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl HostRecord {
    /// The endpoint this record points at.
    pub fn endpoint(&self) -> EndpointKey {
        EndpointKey {
            address: self.address.clone(),
            protocol: self.protocol,
        }
    }
}

// Manual impl so passwords never reach logs via {:?}.
impl fmt::Debug for HostRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("address", &self.address)
            .field("protocol", &self.protocol)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

/// An unvalidated host definition, as submitted by callers.
#[derive(Debug, Clone, Deserialize)]
pub struct HostCandidate {
    pub name: String,
    pub address: String,
    pub protocol: Protocol,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl HostCandidate {
    /// Validate the candidate and stamp it with a fresh id.
    pub fn into_record(self) -> Result<HostRecord, ValidationError> {
        validate_field("name", &self.name)?;
        validate_field("address", &self.address)?;
        Ok(HostRecord {
            id: HostId::generate(),
            name: self.name,
            address: self.address,
            protocol: self.protocol,
            username: self.username,
            password: self.password,
        })
    }
}

/// Reasons a host candidate is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{0} must not be empty")]
    Empty(&'static str),
    #[error("{0} exceeds {MAX_FIELD_LEN} characters")]
    TooLong(&'static str),
    #[error("{0} contains control characters")]
    ControlChars(&'static str),
    #[error("unknown protocol: {0}")]
    UnknownProtocol(String),
}

fn validate_field(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.is_empty() {
        return Err(ValidationError::Empty(field));
    }
    if value.chars().count() > MAX_FIELD_LEN {
        return Err(ValidationError::TooLong(field));
    }
    if value.chars().any(char::is_control) {
        return Err(ValidationError::ControlChars(field));
    }
    Ok(())
}

/// Identity of a live connection target: `(address, protocol)`.
///
/// Two host records naming the same endpoint share one session. The string
/// form is `address|PROTOCOL`, e.g. `10.0.0.5|SSH`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EndpointKey {
    pub address: String,
    pub protocol: Protocol,
}

impl fmt::Display for EndpointKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}|{}", self.address, self.protocol)
    }
}

impl FromStr for EndpointKey {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (address, protocol) = s
            .rsplit_once('|')
            .ok_or_else(|| ValidationError::Empty("endpoint key"))?;
        if address.is_empty() {
            return Err(ValidationError::Empty("address"));
        }
        Ok(Self {
            address: address.to_string(),
            protocol: protocol.parse()?,
        })
    }
}

impl Serialize for EndpointKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for EndpointKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}
