/// Errors raised while encoding or decoding a payload.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The value sequence cannot be represented by this codec.
    #[error("{codec} encode error: {message}")]
    Encode {
        codec: &'static str,
        message: String,
    },

    /// The input is truncated or structurally invalid.
    #[error("{codec} decode error: {message}")]
    Decode {
        codec: &'static str,
        message: String,
    },

    /// No codec is registered under this name.
    #[error("unknown codec '{0}'")]
    UnknownCodec(String),
}

impl CodecError {
    pub(crate) fn encode(codec: &'static str, message: impl Into<String>) -> Self {
        Self::Encode {
            codec,
            message: message.into(),
        }
    }

    pub(crate) fn decode(codec: &'static str, message: impl Into<String>) -> Self {
        Self::Decode {
            codec,
            message: message.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;
