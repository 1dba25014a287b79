use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Frame has no '|' separator within the first {0} bytes")]
    MissingSeparator(usize),

    #[error("Empty command token")]
    EmptyCommand,

    #[error("Malformed peer report: {0}")]
    BadPeerReport(String),

    #[error("Attach ticket must be a nonzero decimal u64")]
    BadTicket,
}
