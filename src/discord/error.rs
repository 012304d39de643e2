use thiserror::Error;

pub type PinguResult<T> = Result<T, PinguError>;

#[derive(Error, Debug)]
pub enum PinguError {
    #[error("{0}")]
    BadArgument(String),
    #[error("No clown was set.")]
    MissingClown,
    #[error("I'm missing the `{}` permission(s) for the voice channel.", .0.join("`, `"))]
    MissingVoicePermissions(Vec<&'static str>),
    #[error("{0}")]
    MissingData(String),
    #[error("Database error: {0}")]
    Database(#[from] diesel::result::Error),
    #[error("Database pool error: {0}")]
    Pool(#[from] diesel::r2d2::PoolError),
    #[error("Discord error: {0}")]
    Discord(#[from] serenity::Error),
    #[error("Voice connection error: {0}")]
    Voice(#[from] songbird::error::JoinError),
}

impl PinguError {
    pub fn bad_argument(message: impl Into<String>) -> Self {
        PinguError::BadArgument(message.into())
    }

    /// Errors caused by the invoker rather than by the bot; these are answered without logging a trace.
    pub fn is_user_facing(&self) -> bool {
        matches!(self, PinguError::BadArgument(_) | PinguError::MissingClown | PinguError::MissingVoicePermissions(_) | PinguError::MissingData(_))
    }
}
