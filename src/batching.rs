//! Walking a table in bounded, key-ordered batches.
//!
//! Batch boundaries are found with an `OFFSET` lookahead on the cursor
//! columns instead of counting rows, so each step touches at most
//! `batch_size + 1` index entries.

use crate::cursor::{BatchRange, Cursor, quote_ident, row_expression, row_placeholders};
use crate::errors::{Error, Result};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgExecutor, Row};

const INTEGER_TYPES: [&str; 3] = ["smallint", "integer", "bigint"];

/// One batch produced by a [`BatchIterator`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    /// Keys covered by the batch; both ends are existing rows.
    pub range: BatchRange,
    /// Rows in the batch at the time it was computed.
    pub rows: i64,
}

/// Produces consecutive batches over `[bounds.min, bounds.max]`.
///
/// Every batch starts and ends on an existing key, holds at most
/// `batch_size` rows and never overlaps the previous one. Rows beyond
/// the current maximum key are ignored, which clamps a registered
/// maximum that no longer exists.
#[derive(Debug, Clone)]
pub struct BatchIterator {
    table: String,
    columns: Vec<String>,
    max: Cursor,
    next: Option<Cursor>,
    next_is_key: bool,
    batch_size: i64,
}

impl BatchIterator {
    /// Create an iterator over `bounds` of `table`, ordered by `columns`.
    pub fn new(
        table: impl Into<String>,
        columns: Vec<String>,
        bounds: BatchRange,
        batch_size: i64,
    ) -> Self {
        Self {
            table: table.into(),
            columns,
            max: bounds.max,
            next: Some(bounds.min),
            next_is_key: false,
            batch_size: batch_size.max(1),
        }
    }

    /// Compute the next batch, or `None` once the range is exhausted.
    pub async fn next_batch(&mut self, conn: &mut PgConnection) -> Result<Option<Batch>> {
        let Some(lower) = self.next.take() else {
            return Ok(None);
        };

        let start = if self.next_is_key {
            Some(lower)
        } else {
            self.key_at(conn, &lower, 0).await?
        };
        let Some(start) = start else {
            return Ok(None);
        };

        let lookahead = self.keys_from(conn, &start, self.batch_size - 1, 2).await?;
        let batch = match lookahead.as_slice() {
            [end, next_start] => {
                self.next = Some(next_start.clone());
                self.next_is_key = true;
                Batch {
                    range: BatchRange::new(start, end.clone()),
                    rows: self.batch_size,
                }
            }
            [end] => Batch {
                range: BatchRange::new(start, end.clone()),
                rows: self.batch_size,
            },
            _ => {
                let end = self.last_key(conn, &start).await?.unwrap_or_else(|| start.clone());
                let range = BatchRange::new(start, end);
                let rows = self.count(conn, &range).await?;
                Batch { range, rows }
            }
        };

        Ok(Some(batch))
    }

    async fn key_at(
        &self,
        conn: &mut PgConnection,
        lower: &Cursor,
        offset: i64,
    ) -> Result<Option<Cursor>> {
        Ok(self.keys_from(conn, lower, offset, 1).await?.into_iter().next())
    }

    /// Up to `limit` keys in `[lower, max]`, skipping the first `offset`.
    async fn keys_from(
        &self,
        conn: &mut PgConnection,
        lower: &Cursor,
        offset: i64,
        limit: i64,
    ) -> Result<Vec<Cursor>> {
        let arity = self.columns.len();
        let sql = format!(
            "SELECT {select} FROM {table} WHERE {row} >= {lower} AND {row} <= {upper} \
             ORDER BY {order} OFFSET ${offset} LIMIT ${limit}",
            select = self.select_list(),
            table = quote_ident(&self.table),
            row = row_expression(&self.columns),
            lower = row_placeholders(arity, 1),
            upper = row_placeholders(arity, arity + 1),
            order = self.order_list("ASC"),
            offset = 2 * arity + 1,
            limit = 2 * arity + 2,
        );

        let mut query = sqlx::query(&sql);
        for value in lower.values().iter().chain(self.max.values()) {
            query = query.bind(*value);
        }
        let rows = query.bind(offset).bind(limit).fetch_all(&mut *conn).await?;

        rows.iter().map(|row| self.decode(row)).collect()
    }

    async fn last_key(&self, conn: &mut PgConnection, lower: &Cursor) -> Result<Option<Cursor>> {
        let arity = self.columns.len();
        let sql = format!(
            "SELECT {select} FROM {table} WHERE {row} >= {lower} AND {row} <= {upper} \
             ORDER BY {order} LIMIT 1",
            select = self.select_list(),
            table = quote_ident(&self.table),
            row = row_expression(&self.columns),
            lower = row_placeholders(arity, 1),
            upper = row_placeholders(arity, arity + 1),
            order = self.order_list("DESC"),
        );

        let mut query = sqlx::query(&sql);
        for value in lower.values().iter().chain(self.max.values()) {
            query = query.bind(*value);
        }

        query
            .fetch_optional(&mut *conn)
            .await?
            .map(|row| self.decode(&row))
            .transpose()
    }

    async fn count(&self, conn: &mut PgConnection, range: &BatchRange) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {table} WHERE {predicate}",
            table = quote_ident(&self.table),
            predicate = range.predicate(&self.columns),
        );
        Ok(sqlx::query_scalar::<_, i64>(&sql).fetch_one(&mut *conn).await?)
    }

    fn select_list(&self) -> String {
        self.columns
            .iter()
            .map(|column| format!("{}::bigint", quote_ident(column)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn order_list(&self, direction: &str) -> String {
        self.columns
            .iter()
            .map(|column| format!("{} {direction}", quote_ident(column)))
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn decode(&self, row: &PgRow) -> Result<Cursor> {
        let values = (0..self.columns.len())
            .map(|i| row.try_get::<i64, _>(i))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Cursor::new(values))
    }
}

/// Smallest and largest key of `table`, or `None` when it is empty.
///
/// With `min` given, keys below it are ignored.
pub async fn table_bounds(
    conn: &mut PgConnection,
    table: &str,
    columns: &[String],
    min: Option<&Cursor>,
) -> Result<Option<BatchRange>> {
    let select = columns
        .iter()
        .map(|column| format!("{}::bigint", quote_ident(column)))
        .collect::<Vec<_>>()
        .join(", ");
    let filter = match min {
        Some(min) => format!(
            "WHERE {} >= {}",
            row_expression(columns),
            row_placeholders(min.arity(), 1)
        ),
        None => String::new(),
    };

    let mut bounds = Vec::with_capacity(2);
    for direction in ["ASC", "DESC"] {
        let order = columns
            .iter()
            .map(|column| format!("{} {direction}", quote_ident(column)))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {select} FROM {table} {filter} ORDER BY {order} LIMIT 1",
            table = quote_ident(table),
        );

        let mut query = sqlx::query(&sql);
        for value in min.map(Cursor::values).unwrap_or_default() {
            query = query.bind(*value);
        }

        let Some(row) = query.fetch_optional(&mut *conn).await? else {
            return Ok(None);
        };
        let values = (0..columns.len())
            .map(|i| row.try_get::<i64, _>(i))
            .collect::<Result<Vec<_>, _>>()?;
        bounds.push(Cursor::new(values));
    }

    let max = bounds.pop();
    let min = bounds.pop();
    Ok(min.zip(max).map(|(min, max)| BatchRange { min, max }))
}

/// Result of checking that a table can be walked by the given columns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableCheck {
    /// The table and all cursor columns exist and are integers.
    Ready,
    /// The table does not exist.
    MissingTable,
    /// The named cursor column does not exist.
    MissingColumn(String),
}

/// Check that `table` exists and that every cursor column is an integer column.
///
/// A missing table or column is reported through [`TableCheck`]; an
/// existing column of another type is an [`Error::InvalidCursorColumn`].
pub async fn check_table<'e>(
    executor: impl PgExecutor<'e> + Copy,
    table: &str,
    columns: &[String],
) -> Result<TableCheck> {
    if !table_exists(executor, table).await? {
        return Ok(TableCheck::MissingTable);
    }

    let found = sqlx::query_as::<_, (String, String)>(
        r"
        SELECT a.attname::text, format_type(a.atttypid, a.atttypmod)
        FROM pg_attribute a
        WHERE a.attrelid = to_regclass($1)
          AND a.attnum > 0
          AND NOT a.attisdropped
          AND a.attname = ANY($2)
        ",
    )
    .bind(quote_ident(table))
    .bind(columns)
    .fetch_all(executor)
    .await?;

    for column in columns {
        let Some((_, data_type)) = found.iter().find(|(name, _)| name == column) else {
            return Ok(TableCheck::MissingColumn(column.clone()));
        };
        if !INTEGER_TYPES.contains(&data_type.as_str()) {
            return Err(Error::InvalidCursorColumn {
                table: table.to_string(),
                column: column.clone(),
                data_type: data_type.clone(),
            });
        }
    }

    Ok(TableCheck::Ready)
}

/// Whether `table` exists in the current search path.
pub async fn table_exists<'e>(executor: impl PgExecutor<'e>, table: &str) -> Result<bool> {
    Ok(
        sqlx::query_scalar::<_, bool>("SELECT to_regclass($1) IS NOT NULL")
            .bind(quote_ident(table))
            .fetch_one(executor)
            .await?,
    )
}

/// Planner estimate of the number of rows in `table`.
///
/// `None` when the table has never been analyzed or the estimate is not positive.
pub async fn estimate_tuple_count<'e>(
    executor: impl PgExecutor<'e>,
    table: &str,
) -> Result<Option<i64>> {
    let estimate = sqlx::query_scalar::<_, Option<i64>>(
        "SELECT reltuples::bigint FROM pg_class WHERE oid = to_regclass($1)",
    )
    .bind(quote_ident(table))
    .fetch_optional(executor)
    .await?
    .flatten();

    Ok(estimate.filter(|count| *count > 0))
}
