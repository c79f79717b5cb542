use std::fmt;

use crate::error::NetronError;

/// Session status of a peer.
///
/// Requests may only be written while `Handshaking` or `Online`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Status {
    /// No connection.
    Offline = 0,
    /// Transport is connecting.
    Connecting = 1,
    /// Transport is up, identities are being exchanged.
    Handshaking = 2,
    /// Session established.
    Online = 3,
}

impl Status {
    /// Exclusive upper bound of the numeric status codes.
    pub const MAX: u8 = 4;

    /// Whether envelopes may be written in this status.
    pub fn can_send(self) -> bool {
        matches!(self, Status::Handshaking | Status::Online)
    }
}

impl TryFrom<u8> for Status {
    type Error = NetronError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(Status::Offline),
            1 => Ok(Status::Connecting),
            2 => Ok(Status::Handshaking),
            3 => Ok(Status::Online),
            _ => Err(NetronError::IllegalState(format!(
                "invalid status code {code}, expected 0..{}",
                Status::MAX
            ))),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::Offline => "offline",
            Status::Connecting => "connecting",
            Status::Handshaking => "handshaking",
            Status::Online => "online",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        for code in 0..Status::MAX {
            let status = Status::try_from(code).expect("valid code");
            assert_eq!(status as u8, code);
        }
        assert!(Status::try_from(Status::MAX).is_err());
    }

    #[test]
    fn test_can_send() {
        assert!(!Status::Offline.can_send());
        assert!(!Status::Connecting.can_send());
        assert!(Status::Handshaking.can_send());
        assert!(Status::Online.can_send());
    }
}
