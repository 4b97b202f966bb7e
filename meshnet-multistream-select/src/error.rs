use thiserror::Error;

#[derive(Debug, Error)]
pub enum FramerError {
    #[error("message of {size} bytes exceeds the maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },
    #[error("invalid varint length prefix")]
    InvalidVarint,
    #[error("stream closed with {buffered} unconsumed bytes buffered")]
    StreamClosed { buffered: usize },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Error)]
pub enum NegotiationError {
    #[error("no protocol in common")]
    NoProtocolInCommon,
    #[error(transparent)]
    Framer(#[from] FramerError),
    #[error("expected header line `{expected}`, got `{actual}`")]
    UnexpectedHeader { expected: String, actual: String },
    #[error("message is not valid utf-8")]
    InvalidUtf8,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
