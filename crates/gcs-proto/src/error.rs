use thiserror::Error;

/// Reasons a frame is rejected at the codec boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("frame truncated: need {needed} bytes, have {available}")]
    Truncated { needed: usize, available: usize },

    /// Also returned for ids outside the dialect, whose CRC_EXTRA seed is unknown.
    #[error("checksum mismatch on message {msg_id}: frame carries {received:#06x}")]
    ChecksumMismatch { msg_id: u32, received: u16 },

    /// Checksum held but a field carries a value the dialect does not define.
    #[error("message {msg_id} has a field outside the dialect")]
    Malformed { msg_id: u32 },

    #[error("bad start marker {0:#04x}")]
    BadMagic(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EncodeError {
    #[error("message {0} has no typed form in this build and cannot be sent")]
    UnknownKind(u32),

    #[error("{field} = {value} is not defined by the dialect")]
    OutOfDialect { field: &'static str, value: u32 },

    #[error("frame write failed: {0}")]
    Write(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PayloadError {
    #[error("payload of {0} bytes exceeds the 255 byte frame limit")]
    TooLarge(usize),

    #[error("message id {0} does not fit in 24 bits")]
    IdOutOfRange(u32),

    #[error("message id {0} has a typed payload; build that variant instead")]
    KnownKind(u32),
}
