mod domain;
mod message;
mod suppression;
mod tenant;
mod webhook;
mod webhook_delivery;

pub use domain::*;
pub use message::*;
pub use suppression::*;
pub use tenant::*;
pub use webhook::*;
pub use webhook_delivery::*;

use thiserror::Error;

/// Errors surfaced by every Store repository. Mirrors the four kinds the
/// core is required to distinguish: duplicate key, foreign-key violation,
/// connection loss, and everything else.
#[derive(Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Database(sqlx::Error),
    #[error("foreign key violation")]
    ForeignKeyViolation,
    #[error("connection lost")]
    ConnectionLost,
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Email(#[from] email_address::Error),
    #[error("{0}")]
    BadRequest(String),
    #[error("{0}")]
    Internal(String),
    #[error("cryptographic error: {0}")]
    Crypto(#[from] aws_lc_rs::error::Unspecified),
    #[error("key rejected: {0}")]
    WrongCryptKey(#[from] aws_lc_rs::error::KeyRejected),
    #[error(transparent)]
    MailAuth(#[from] mail_auth::Error),
    #[error("{0}")]
    NotFound(&'static str),
    #[error("conflict")]
    Conflict,
}

impl From<sqlx::Error> for Error {
    fn from(sql: sqlx::Error) -> Self {
        match &sql {
            sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
                return Error::Conflict;
            }
            sqlx::Error::Database(db_err) if db_err.is_foreign_key_violation() => {
                return Error::ForeignKeyViolation;
            }
            sqlx::Error::RowNotFound => return Error::NotFound("not found"),
            sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                return Error::ConnectionLost;
            }
            _ => {}
        }
        Error::Database(sql)
    }
}
