//! Error types for iSCSI target operations

use thiserror::Error;

/// iSCSI target errors
#[derive(Debug, Error)]
pub enum IscsiError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("SCSI error: {0}")]
    Scsi(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("Invalid PDU: {0}")]
    InvalidPdu(String),

    #[error("Configuration error: {0}")]
    Config(String),

    /// A Data-Out PDU referenced a transfer the target never solicited
    #[error("Invalid target transfer tag: 0x{0:08x}")]
    InvalidTargetTransferTag(u32),
}

impl IscsiError {
    /// True for socket conditions that only mean "the peer is gone".
    ///
    /// These are part of the normal connection lifecycle and are logged at
    /// debug level rather than reported as failures.
    pub fn is_disconnect(&self) -> bool {
        use std::io::ErrorKind;
        match self {
            IscsiError::Io(e) => matches!(
                e.kind(),
                ErrorKind::BrokenPipe
                    | ErrorKind::ConnectionReset
                    | ErrorKind::ConnectionAborted
                    | ErrorKind::NotConnected
                    | ErrorKind::UnexpectedEof
            ),
            _ => false,
        }
    }
}

/// Result type for SCSI operations
pub type ScsiResult<T> = Result<T, IscsiError>;
