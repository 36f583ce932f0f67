//! Cursor tuples and the key ranges built from them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A position in a table, expressed as the values of its cursor columns.
///
/// Single-column cursors hold one value. Composite cursors compare
/// lexicographically, the same way Postgres compares row constructors
/// and arrays, so `(1, 500) < (2, 0)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(Vec<i64>);

impl Cursor {
    /// Build a cursor from its column values.
    pub fn new(values: impl Into<Vec<i64>>) -> Self {
        Self(values.into())
    }

    /// The cursor with every component set to zero.
    pub fn zero(arity: usize) -> Self {
        Self(vec![0; arity])
    }

    /// Number of columns this cursor covers.
    pub fn arity(&self) -> usize {
        self.0.len()
    }

    /// The column values, in cursor column order.
    pub fn values(&self) -> &[i64] {
        &self.0
    }

    pub(crate) fn into_values(self) -> Vec<i64> {
        self.0
    }
}

impl From<i64> for Cursor {
    fn from(value: i64) -> Self {
        Self(vec![value])
    }
}

impl From<Vec<i64>> for Cursor {
    fn from(values: Vec<i64>) -> Self {
        Self(values)
    }
}

impl<const N: usize> From<[i64; N]> for Cursor {
    fn from(values: [i64; N]) -> Self {
        Self(values.to_vec())
    }
}

impl fmt::Display for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0.as_slice() {
            [single] => write!(f, "{single}"),
            values => {
                f.write_str("(")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str(")")
            }
        }
    }
}

/// An inclusive range of cursor positions: `min <= key <= max`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchRange {
    /// First key covered by the range.
    pub min: Cursor,
    /// Last key covered by the range.
    pub max: Cursor,
}

impl BatchRange {
    /// Create a range. The bounds are not reordered.
    pub fn new(min: impl Into<Cursor>, max: impl Into<Cursor>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
        }
    }

    /// Whether `key` lies inside this range.
    pub fn contains(&self, key: &Cursor) -> bool {
        &self.min <= key && key <= &self.max
    }

    /// Whether this range shares at least one position with `other`.
    pub fn overlaps(&self, other: &BatchRange) -> bool {
        self.min <= other.max && other.min <= self.max
    }

    /// SQL predicate selecting the rows of this range.
    ///
    /// Values are inlined as integer literals; column names are quoted.
    pub fn predicate(&self, columns: &[String]) -> String {
        let columns = row_expression(columns);
        format!(
            "{columns} >= {} AND {columns} <= {}",
            row_literal(&self.min),
            row_literal(&self.max)
        )
    }
}

impl fmt::Display for BatchRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.min, self.max)
    }
}

/// Quote an SQL identifier, doubling embedded quotes.
///
/// Dotted names (`schema.table`) are quoted part by part.
pub fn quote_ident(name: &str) -> String {
    name.split('.')
        .map(|part| format!("\"{}\"", part.replace('"', "\"\"")))
        .collect::<Vec<_>>()
        .join(".")
}

/// `("a", "b")` for composite cursors, `"a"` for single-column ones.
pub(crate) fn row_expression(columns: &[String]) -> String {
    let quoted = columns
        .iter()
        .map(|column| quote_ident(column))
        .collect::<Vec<_>>();
    match quoted.as_slice() {
        [single] => single.clone(),
        _ => format!("ROW({})", quoted.join(", ")),
    }
}

/// Same shape as [`row_expression`], but with `$n` placeholders starting at `first`.
pub(crate) fn row_placeholders(arity: usize, first: usize) -> String {
    let placeholders = (first..first + arity)
        .map(|n| format!("${n}"))
        .collect::<Vec<_>>();
    match placeholders.as_slice() {
        [single] => single.clone(),
        _ => format!("ROW({})", placeholders.join(", ")),
    }
}

fn row_literal(cursor: &Cursor) -> String {
    let values = cursor
        .values()
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>();
    match values.as_slice() {
        [single] => single.clone(),
        _ => format!("ROW({})", values.join(", ")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn composite_cursors_order_lexicographically() {
        assert!(Cursor::from([1, 500]) < Cursor::from([2, 0]));
        assert!(Cursor::from([2, 0]) < Cursor::from([2, 1]));
        assert!(Cursor::from([0, 0]) <= Cursor::from([50, 200]));
    }

    #[test]
    fn ranges_are_inclusive() {
        let range = BatchRange::new(3, 7);
        assert!(range.contains(&Cursor::from(3)));
        assert!(range.contains(&Cursor::from(7)));
        assert!(!range.contains(&Cursor::from(8)));
        assert!(range.overlaps(&BatchRange::new(7, 9)));
        assert!(!range.overlaps(&BatchRange::new(8, 9)));
    }

    #[test]
    fn predicate_for_single_column() {
        let range = BatchRange::new(1, 10);
        assert_eq!(
            range.predicate(&["id".to_string()]),
            r#""id" >= 1 AND "id" <= 10"#
        );
    }

    #[test]
    fn predicate_for_composite_cursor() {
        let range = BatchRange::new([1, 2], [3, 4]);
        let columns = ["user_id".to_string(), "project_id".to_string()];
        assert_eq!(
            range.predicate(&columns),
            r#"ROW("user_id", "project_id") >= ROW(1, 2) AND ROW("user_id", "project_id") <= ROW(3, 4)"#
        );
    }

    #[test]
    fn identifiers_are_quoted() {
        assert_eq!(quote_ident("events"), r#""events""#);
        assert_eq!(quote_ident("partitions.events_100"), r#""partitions"."events_100""#);
        assert_eq!(quote_ident(r#"we"ird"#), r#""we""ird""#);
    }

    #[test]
    fn placeholders_follow_cursor_arity() {
        assert_eq!(row_placeholders(1, 1), "$1");
        assert_eq!(row_placeholders(2, 3), "ROW($3, $4)");
    }

    #[test]
    fn cursors_display_as_tuples() {
        assert_eq!(Cursor::from(5).to_string(), "5");
        assert_eq!(Cursor::from([5, 6]).to_string(), "(5, 6)");
        assert_eq!(BatchRange::new(1, 3).to_string(), "[1, 3]");
    }
}
