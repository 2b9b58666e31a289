use thiserror::Error;

/// Error kinds surfaced by the switching core.
///
/// Per-connection protocol violations (`InvalidLength`, `ShortRead`, the
/// frame validation kinds) terminate that connection but nothing else;
/// registry errors (`DuplicateVlan`, `UnknownVlan`) are recoverable and
/// returned to the caller.
#[derive(Debug, Error)]
pub enum SwitchError {
    /// Read or write on a connection that has already been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// Wire length prefix outside the accepted 1..=1518 range.
    #[error("invalid frame length: {0}")]
    InvalidLength(u32),

    /// The stream ended in the middle of a length prefix or frame body.
    #[error("short read: stream ended mid-frame")]
    ShortRead,

    /// Frame shorter than the 14-byte Ethernet header.
    #[error("frame too short: {0} bytes (minimum 14)")]
    FrameTooShort(usize),

    /// Frame longer than the maximum untagged Ethernet frame.
    #[error("frame too long: {0} bytes (maximum 1518)")]
    FrameTooLong(usize),

    /// All-zero source MAC addresses never appear on a real segment.
    #[error("invalid source MAC: all zeros")]
    ZeroSourceMac,

    /// Write to a peer connection failed; the source connection stays up.
    #[error("write failed: {0}")]
    WriteFailed(#[source] std::io::Error),

    #[error("VLAN already exists on port {0}")]
    DuplicateVlan(u16),

    #[error("no VLAN on port {0}")]
    UnknownVlan(u16),

    #[error("failed to bind port {port}: {source}")]
    BindFailed {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl SwitchError {
    /// True for errors that indicate the peer violated the wire protocol or
    /// sent an invalid frame. These count toward `dropped_frames` before the
    /// connection is torn down; clean disconnects do not.
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            SwitchError::InvalidLength(_)
                | SwitchError::ShortRead
                | SwitchError::FrameTooShort(_)
                | SwitchError::FrameTooLong(_)
                | SwitchError::ZeroSourceMac
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_violations_are_classified() {
        assert!(SwitchError::InvalidLength(2048).is_protocol_violation());
        assert!(SwitchError::ShortRead.is_protocol_violation());
        assert!(SwitchError::FrameTooShort(4).is_protocol_violation());
        assert!(SwitchError::ZeroSourceMac.is_protocol_violation());
        assert!(!SwitchError::ConnectionClosed.is_protocol_violation());
        assert!(!SwitchError::DuplicateVlan(9999).is_protocol_violation());
    }

    #[test]
    fn display_messages_name_the_offending_value() {
        assert_eq!(
            SwitchError::InvalidLength(2048).to_string(),
            "invalid frame length: 2048"
        );
        assert_eq!(
            SwitchError::UnknownVlan(9998).to_string(),
            "no VLAN on port 9998"
        );
    }
}
