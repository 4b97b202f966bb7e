use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AddressError {
    #[error("invalid address")]
    InvalidAddress,
    #[error("unknown protocol code {0}")]
    UnknownProtocol(u64),
    #[error("component value exceeds its maximum size")]
    FieldTooLarge,
    #[error("missing value for protocol component")]
    MissingValue,
}
