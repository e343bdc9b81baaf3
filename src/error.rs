#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// An input slot is unwired or wired to the wrong kind of waveform.
    ///
    /// This is a configuration problem detected before decoding starts;
    /// malformed signal content is never an `Error` (it surfaces as in-band
    /// error symbols instead).
    #[error("invalid input for slot {slot}: {reason}")]
    InvalidInput { slot: usize, reason: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;
