use demo_bitreader::BitError;

#[derive(thiserror::Error, Debug)]
pub enum ParseError {
    #[error("invalid demo header: {0}")]
    InvalidHeader(&'static str),
    #[error("unexpected end of demo stream")]
    UnexpectedEof,
    #[error("malformed frame: declared length disagrees with consumption ({0})")]
    MalformedFrame(String),
    #[error("unknown frame kind {0}")]
    UnknownFrameKind(u32),
    #[error("send-table schema mismatch: {0}")]
    SchemaMismatch(String),
    #[error("handler panicked: {0}")]
    HandlerPanic(String),
    #[error("broadcast endpoint unavailable: {0}")]
    BroadcastUnavailable(String),
    #[error("failed to decode net message: {0}")]
    Decode(#[from] prost::DecodeError),
    #[error("failed to decompress frame payload: {0}")]
    Decompress(#[from] snap::Error),
    #[error("bit stream error: {0}")]
    Bit(BitError),
}

impl From<BitError> for ParseError {
    fn from(err: BitError) -> Self {
        match err {
            BitError::UnexpectedEof => ParseError::UnexpectedEof,
            BitError::MalformedChunk {
                expected_bit,
                actual_bit,
            } => ParseError::MalformedFrame(format!(
                "expected bit {expected_bit}, got {actual_bit}"
            )),
            other => ParseError::Bit(other),
        }
    }
}

pub type Result<T> = std::result::Result<T, ParseError>;
