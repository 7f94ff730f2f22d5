//! Postgres persistence for the metering and sequencing core.

pub mod billing;
pub mod sequences;

use thiserror::Error;

pub use billing::PgBillingStore;
pub use sequences::PgSequenceStore;

/// key: store-error -> backend-agnostic persistence failure
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("corrupt row in {table}: {detail}")]
    Corrupt { table: &'static str, detail: String },
}

pub(crate) fn corrupt(table: &'static str, detail: impl Into<String>) -> StoreError {
    StoreError::Corrupt {
        table,
        detail: detail.into(),
    }
}
