use crate::cursor::{BatchRange, quote_ident};
use crate::registration::QueueMigration;
use serde::de::DeserializeOwned;
use sqlx::PgConnection;
use std::future::Future;

/// The slice of a table handed to a transformation in one unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubBatch {
    /// Table being migrated
    pub table_name: String,
    /// Cursor columns
    pub column_names: Vec<String>,
    /// Keys covered by this sub-batch, both ends inclusive
    pub range: BatchRange,
    /// Rows in the sub-batch when it was carved out
    pub rows: i64,
}

impl SubBatch {
    /// The quoted table name, ready to be interpolated into SQL.
    pub fn quoted_table(&self) -> String {
        quote_ident(&self.table_name)
    }

    /// SQL predicate matching exactly the rows of this sub-batch.
    pub fn predicate(&self) -> String {
        self.range.predicate(&self.column_names)
    }
}

/// A data transformation applied to a table one sub-batch at a time.
///
/// The implementing type is built from the migration's job arguments, so
/// `struct CopyColumns(Vec<String>, Vec<String>)` receives
/// `[["id"], ["id_convert_to_bigint"]]`. Types without arguments should be
/// unit structs.
///
/// Transformations run concurrently with application traffic on the same
/// table and must tolerate rows changing under them, e.g. by only writing
/// rows that still need it.
pub trait BatchedMigrationJob: DeserializeOwned + Send + Sync + 'static {
    /// Unique name of the transformation.
    ///
    /// This MUST be unique for the whole application.
    const JOB_CLASS_NAME: &'static str;

    /// The application data provided to this transformation at runtime.
    type Context: Clone + Send + Sync + 'static;

    /// Transform the rows of `batch`.
    ///
    /// `conn` is inside a transaction that is committed when this returns
    /// `Ok` and rolled back otherwise.
    fn perform(
        &self,
        ctx: &Self::Context,
        conn: &mut PgConnection,
        batch: &SubBatch,
    ) -> impl Future<Output = anyhow::Result<()>> + Send;

    /// Start registering this transformation over `column_name` of `table_name`.
    fn migration(table_name: &str, column_name: &str) -> QueueMigration {
        QueueMigration::new(Self::JOB_CLASS_NAME, table_name, column_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sub_batches_render_their_predicate() {
        let batch = SubBatch {
            table_name: "events".into(),
            column_names: vec!["id".into()],
            range: BatchRange::new(11, 20),
            rows: 10,
        };
        assert_eq!(batch.quoted_table(), r#""events""#);
        assert_eq!(batch.predicate(), r#""id" >= 11 AND "id" <= 20"#);
    }
}
