use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KelpErrorCode {
    Io,
    Encode,
    Decode,
    Validation,
    ConfigurationConflict,
    WrongThread,
    MigrationRequired,
    SchemaTooNew,
    TransactionFailure,
    AsyncTaskFailure,
    Closed,
    NotInTransaction,
    AlreadyInTransaction,
    TableNotFound,
    ObjectNotFound,
    StoreInUse,
    QueueFull,
    Cancelled,
    NoDefaultConfiguration,
    WorkerPanicked,
    VersionMismatch,
    SnapshotExpired,
}

impl KelpErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            KelpErrorCode::Io => "io",
            KelpErrorCode::Encode => "encode",
            KelpErrorCode::Decode => "decode",
            KelpErrorCode::Validation => "validation",
            KelpErrorCode::ConfigurationConflict => "configuration_conflict",
            KelpErrorCode::WrongThread => "wrong_thread",
            KelpErrorCode::MigrationRequired => "migration_required",
            KelpErrorCode::SchemaTooNew => "schema_too_new",
            KelpErrorCode::TransactionFailure => "transaction_failure",
            KelpErrorCode::AsyncTaskFailure => "async_task_failure",
            KelpErrorCode::Closed => "closed",
            KelpErrorCode::NotInTransaction => "not_in_transaction",
            KelpErrorCode::AlreadyInTransaction => "already_in_transaction",
            KelpErrorCode::TableNotFound => "table_not_found",
            KelpErrorCode::ObjectNotFound => "object_not_found",
            KelpErrorCode::StoreInUse => "store_in_use",
            KelpErrorCode::QueueFull => "queue_full",
            KelpErrorCode::Cancelled => "cancelled",
            KelpErrorCode::NoDefaultConfiguration => "no_default_configuration",
            KelpErrorCode::WorkerPanicked => "worker_panicked",
            KelpErrorCode::VersionMismatch => "version_mismatch",
            KelpErrorCode::SnapshotExpired => "snapshot_expired",
        }
    }
}

#[derive(Debug, Error)]
pub enum KelpError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("encode error: {0}")]
    Encode(String),
    #[error("decode error: {0}")]
    Decode(String),
    #[error("validation error: {0}")]
    Validation(String),
    #[error("configuration conflict for '{}': {message}", path.display())]
    ConfigurationConflict { path: PathBuf, message: String },
    #[error("handle accessed from a thread other than its owner")]
    WrongThread,
    #[error(
        "store '{}' needs migration from schema v{on_disk} to v{requested}",
        path.display()
    )]
    MigrationRequired {
        path: PathBuf,
        on_disk: u64,
        requested: u64,
    },
    #[error(
        "store '{}' has schema v{on_disk}, newer than requested v{requested}",
        path.display()
    )]
    SchemaTooNew {
        path: PathBuf,
        on_disk: u64,
        requested: u64,
    },
    #[error("transaction failed: {source}")]
    TransactionFailure {
        #[source]
        source: Box<KelpError>,
    },
    #[error("async task failed: {message}")]
    AsyncTaskFailure { message: String },
    #[error("handle is closed")]
    Closed,
    #[error("not in a write transaction")]
    NotInTransaction,
    #[error("already in a write transaction")]
    AlreadyInTransaction,
    #[error("table '{0}' not found")]
    TableNotFound(String),
    #[error("object {id} not found in table '{table}'")]
    ObjectNotFound { table: String, id: u64 },
    #[error("store '{}' is still open", path.display())]
    StoreInUse { path: PathBuf },
    #[error("queue full")]
    QueueFull,
    #[error("live query was cancelled")]
    Cancelled,
    #[error("no default configuration set")]
    NoDefaultConfiguration,
    #[error("async worker panicked")]
    WorkerPanicked,
    #[error("version mismatch: expected {expected}, got {actual}")]
    VersionMismatch {
        expected: crate::version::VersionId,
        actual: crate::version::VersionId,
    },
    #[error("snapshot {0} expired")]
    SnapshotExpired(crate::version::VersionId),
}

impl KelpError {
    pub fn code(&self) -> KelpErrorCode {
        match self {
            KelpError::Io(_) => KelpErrorCode::Io,
            KelpError::Encode(_) => KelpErrorCode::Encode,
            KelpError::Decode(_) => KelpErrorCode::Decode,
            KelpError::Validation(_) => KelpErrorCode::Validation,
            KelpError::ConfigurationConflict { .. } => KelpErrorCode::ConfigurationConflict,
            KelpError::WrongThread => KelpErrorCode::WrongThread,
            KelpError::MigrationRequired { .. } => KelpErrorCode::MigrationRequired,
            KelpError::SchemaTooNew { .. } => KelpErrorCode::SchemaTooNew,
            KelpError::TransactionFailure { .. } => KelpErrorCode::TransactionFailure,
            KelpError::AsyncTaskFailure { .. } => KelpErrorCode::AsyncTaskFailure,
            KelpError::Closed => KelpErrorCode::Closed,
            KelpError::NotInTransaction => KelpErrorCode::NotInTransaction,
            KelpError::AlreadyInTransaction => KelpErrorCode::AlreadyInTransaction,
            KelpError::TableNotFound(_) => KelpErrorCode::TableNotFound,
            KelpError::ObjectNotFound { .. } => KelpErrorCode::ObjectNotFound,
            KelpError::StoreInUse { .. } => KelpErrorCode::StoreInUse,
            KelpError::QueueFull => KelpErrorCode::QueueFull,
            KelpError::Cancelled => KelpErrorCode::Cancelled,
            KelpError::NoDefaultConfiguration => KelpErrorCode::NoDefaultConfiguration,
            KelpError::WorkerPanicked => KelpErrorCode::WorkerPanicked,
            KelpError::VersionMismatch { .. } => KelpErrorCode::VersionMismatch,
            KelpError::SnapshotExpired(_) => KelpErrorCode::SnapshotExpired,
        }
    }

    pub fn code_str(&self) -> &'static str {
        self.code().as_str()
    }

    /// Wraps a failure raised inside a transaction body.
    pub(crate) fn transaction_failure(source: KelpError) -> Self {
        KelpError::TransactionFailure {
            source: Box::new(source),
        }
    }

    /// Flattens a worker-side failure into the message delivered to the owner.
    pub(crate) fn async_failure(source: &KelpError) -> Self {
        KelpError::AsyncTaskFailure {
            message: source.to_string(),
        }
    }

    /// Fatal errors cannot be resolved by retrying the same call.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KelpError::ConfigurationConflict { .. }
                | KelpError::WrongThread
                | KelpError::SchemaTooNew { .. }
        )
    }
}
