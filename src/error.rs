use std::borrow::Cow;
use std::error;
use std::fmt;
use std::io;

/// Backend status codes translated into errors.
///
/// These are data, not control flow: a non-zero status still produces a
/// complete response frame, carried on the [`Item`](crate::protocol::Item) so
/// the frontend can forward it verbatim.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
pub enum CommandError {
    /// The backend has no entry for the key.
    KeyNotFound,
    /// The key already exists (Add on a present key, CAS mismatch).
    KeyExists,
    /// The value exceeded the backend's item size limit.
    ValueTooLarge,
    /// Any other non-zero status, carrying the numeric code.
    Backend(u16),
}

impl CommandError {
    /// Map a response status to an error kind. `None` for NoError.
    pub fn from_status(status: u16) -> Option<CommandError> {
        match status {
            0x0000 => None,
            0x0001 => Some(CommandError::KeyNotFound),
            0x0002 => Some(CommandError::KeyExists),
            0x0003 => Some(CommandError::ValueTooLarge),
            code => Some(CommandError::Backend(code)),
        }
    }

    /// The wire status code this error was mapped from.
    pub fn status(self) -> u16 {
        match self {
            CommandError::KeyNotFound => 0x0001,
            CommandError::KeyExists => 0x0002,
            CommandError::ValueTooLarge => 0x0003,
            CommandError::Backend(code) => code,
        }
    }
}

impl fmt::Display for CommandError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CommandError::KeyNotFound => write!(f, "key not found"),
            CommandError::KeyExists => write!(f, "key already exists"),
            CommandError::ValueTooLarge => write!(f, "value too large"),
            CommandError::Backend(code) => write!(f, "backend error {code:#06x}"),
        }
    }
}

impl error::Error for CommandError {}

/// Malformed frames on either side of the proxy.
#[derive(Debug)]
pub enum ProtocolError {
    /// The frame did not start with the expected magic byte.
    BadMagic(u8),
    /// The frame's declared lengths are inconsistent or abusive.
    BadFrame(Cow<'static, str>),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ProtocolError::BadMagic(m) => write!(f, "unexpected magic byte {m:#04x}"),
            ProtocolError::BadFrame(reason) => write!(f, "malformed frame: {reason}"),
        }
    }
}

impl error::Error for ProtocolError {}

impl From<ProtocolError> for RouterError {
    fn from(err: ProtocolError) -> Self {
        RouterError::Protocol(err)
    }
}

/// Startup configuration faults. All fatal.
#[derive(Debug)]
pub enum ConfigError {
    /// Two backends share a name; ring construction cannot proceed.
    ConflictName(String),
    /// The server list is empty; the ring would have no slots.
    NoServers,
    /// The config file could not be read.
    Io(io::Error),
    /// The config file could not be parsed.
    Parse(serde_yaml::Error),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ConfigError::ConflictName(name) => write!(f, "conflicting backend name: {name}"),
            ConfigError::NoServers => write!(f, "no backends configured"),
            ConfigError::Io(err) => write!(f, "config file unreadable: {err}"),
            ConfigError::Parse(err) => write!(f, "config file invalid: {err}"),
        }
    }
}

impl error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ConfigError::ConflictName(_) | ConfigError::NoServers => None,
            ConfigError::Io(err) => Some(err),
            ConfigError::Parse(err) => Some(err),
        }
    }
}

impl From<ConfigError> for RouterError {
    fn from(err: ConfigError) -> Self {
        RouterError::Config(err)
    }
}

/// Errors raised by the router and its backend clients.
#[derive(Debug)]
pub enum RouterError {
    /// `std::io` related errors.
    Io(io::Error),
    /// A malformed frame was received.
    Protocol(ProtocolError),
    /// The configuration is unusable.
    Config(ConfigError),
    /// The backend connection died with requests outstanding.
    ConnectionLost,
    /// A pending request hit its caller-supplied deadline.
    Timeout,
    /// The backend has no connected client to carry the operation.
    ClientGone,
}

impl fmt::Display for RouterError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RouterError::Io(err) => err.fmt(f),
            RouterError::Protocol(err) => err.fmt(f),
            RouterError::Config(err) => err.fmt(f),
            RouterError::ConnectionLost => write!(f, "backend connection lost"),
            RouterError::Timeout => write!(f, "request timed out"),
            RouterError::ClientGone => write!(f, "backend has no connected client"),
        }
    }
}

impl error::Error for RouterError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            RouterError::Io(err) => Some(err),
            RouterError::Protocol(err) => Some(err),
            RouterError::Config(err) => Some(err),
            RouterError::ConnectionLost | RouterError::Timeout | RouterError::ClientGone => None,
        }
    }
}

impl From<io::Error> for RouterError {
    fn from(err: io::Error) -> Self {
        RouterError::Io(err)
    }
}
