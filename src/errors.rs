use crate::schema::MigrationIdentity;
use crate::status::MigrationStatus;

/// Errors returned by the batched migration API.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Database error
    #[error(transparent)]
    Database(#[from] sqlx::Error),

    /// Schema migration error
    #[error(transparent)]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Job arguments could not be (de)serialized
    #[error("Failed to serialize job arguments: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The cursor column exists but cannot be used to walk the table
    #[error("Column {column} of {table} is not an integer column (found {data_type})")]
    InvalidCursorColumn {
        /// Table that was inspected
        table: String,
        /// Offending column
        column: String,
        /// Type reported by the catalog
        data_type: String,
    },

    /// Registration parameters are inconsistent
    #[error("Invalid batched migration configuration: {0}")]
    InvalidConfiguration(String),

    /// A status change is not allowed from the migration's current status
    #[error("Cannot move batched migration {id} from '{from}' to '{to}'")]
    InvalidTransition {
        /// Migration id
        id: i64,
        /// Current status
        from: MigrationStatus,
        /// Requested status
        to: MigrationStatus,
    },

    /// No batched migration has the given id
    #[error("Batched background migration {0} does not exist")]
    MigrationNotFound(i64),

    /// No transformation is registered under the migration's job class name
    #[error("Unknown job class {0}")]
    UnknownJobClass(String),

    /// The migration exists but has not completed, and finalizing was not requested
    #[error(
        "Expected batched background migration for the given configuration to be marked as \
         'finished', but it is '{status}': {identity}\n\n\
         Finalize it manually by running\n\n\t{command}",
        command = .identity.finalize_command()
    )]
    NotFinished {
        /// Identity that was checked
        identity: MigrationIdentity,
        /// Status found
        status: MigrationStatus,
    },

    /// A batch failed while the migration was being finalized
    #[error("Failed to finalize batched background migration {identity}: {source}")]
    FinalizeFailed {
        /// Migration being finalized
        identity: MigrationIdentity,
        /// Error raised by the transformation
        #[source]
        source: anyhow::Error,
    },
}

/// Result alias for this crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;
