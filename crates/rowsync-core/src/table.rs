//! Table descriptors.

use std::sync::Arc;

use crate::value::Value;

/// Descriptor of one table to clone. Read-only once constructed.
///
/// The primary-key column must hold 64-bit signed integers forming a
/// total order; rows are uniquely identified by it. A table may
/// designate a separate sharding column; when it does not, the primary
/// key doubles as the sharding key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Table {
    /// Table name as it appears in SQL.
    pub name: String,
    /// Column names, in SELECT order.
    pub column_names: Vec<String>,
    /// Index of the primary-key column within `column_names`.
    pub id_column_index: usize,
    /// Index of the sharding-key column, when distinct from the PK.
    pub sharding_column_index: Option<usize>,
}

impl Table {
    /// Creates a descriptor with the primary key at `id_column_index`
    /// and no separate sharding column.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        column_names: Vec<String>,
        id_column_index: usize,
    ) -> Arc<Table> {
        Arc::new(Table {
            name: name.into(),
            column_names,
            id_column_index,
            sharding_column_index: None,
        })
    }

    /// Creates a descriptor whose sharding key is a different column
    /// than the primary key.
    #[must_use]
    pub fn with_sharding_column(
        name: impl Into<String>,
        column_names: Vec<String>,
        id_column_index: usize,
        sharding_column_index: usize,
    ) -> Arc<Table> {
        Arc::new(Table {
            name: name.into(),
            column_names,
            id_column_index,
            sharding_column_index: Some(sharding_column_index),
        })
    }

    /// SQL identifier of the primary-key column.
    #[must_use]
    pub fn id_column(&self) -> &str {
        &self.column_names[self.id_column_index]
    }

    /// Comma-separated column list rendered for SELECT.
    #[must_use]
    pub fn column_list(&self) -> String {
        self.column_names.join(", ")
    }

    /// Extracts the primary key from a scanned data vector, or `None`
    /// when the PK cell is not an integer.
    #[must_use]
    pub fn pk_of(&self, data: &[Value]) -> Option<i64> {
        data.get(self.id_column_index).and_then(Value::as_int)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn column_list_preserves_order() {
        let table = Table::new(
            "customers",
            vec!["id".into(), "name".into(), "region".into()],
            0,
        );
        assert_eq!(table.column_list(), "id, name, region");
        assert_eq!(table.id_column(), "id");
    }

    #[test]
    fn pk_extraction() {
        let table = Table::new("customers", vec!["id".into(), "name".into()], 0);
        assert_eq!(table.pk_of(&[Value::Int(7), Value::Text("A".into())]), Some(7));
        assert_eq!(table.pk_of(&[Value::Null, Value::Text("A".into())]), None);
    }
}
