//! Result rows handed from the query executor to the hydrator.
//!
//! A fetch plan selects the columns of several entities at once, one group
//! per alias. Every column is labelled `{alias}__{column}`, so the hydrator
//! can pick out the slice of a row that belongs to the root or to one
//! join-fetched association.

use crate::value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Separator between an alias and a column name in a row label.
pub const ALIAS_SEPARATOR: &str = "__";

/// Label of `column` selected under `alias`.
pub fn aliased_column(alias: &str, column: &str) -> String {
    format!("{alias}{ALIAS_SEPARATOR}{column}")
}

/// Column labels of one result set, shared by all of its rows.
#[derive(Debug, Clone, Default)]
pub struct RowHeader {
    labels: Vec<String>,
    positions: HashMap<String, usize>,
}

impl RowHeader {
    pub fn new(labels: Vec<String>) -> Arc<Self> {
        let positions = labels
            .iter()
            .enumerate()
            .map(|(i, label)| (label.clone(), i))
            .collect();
        Arc::new(Self { labels, positions })
    }

    pub fn labels(&self) -> &[String] {
        &self.labels
    }

    pub fn position(&self, label: &str) -> Option<usize> {
        self.positions.get(label).copied()
    }
}

/// One row of a result set.
#[derive(Debug, Clone)]
pub struct Row {
    header: Arc<RowHeader>,
    values: Vec<Value>,
}

impl Row {
    /// Row with its own header. Prefer [`Row::with_header`] when building
    /// many rows with the same labels.
    pub fn new(labels: Vec<String>, values: Vec<Value>) -> Self {
        Self::with_header(&RowHeader::new(labels), values)
    }

    pub fn with_header(header: &Arc<RowHeader>, values: Vec<Value>) -> Self {
        Self {
            header: Arc::clone(header),
            values,
        }
    }

    pub fn header(&self) -> &Arc<RowHeader> {
        &self.header
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Value under an exact label. A label past the end of a short row
    /// reads as absent.
    pub fn get_by_name(&self, label: &str) -> Option<&Value> {
        self.header
            .position(label)
            .and_then(|i| self.values.get(i))
    }

    /// Value of `column` selected under `alias`.
    pub fn aliased(&self, alias: &str, column: &str) -> Option<&Value> {
        self.get_by_name(&aliased_column(alias, column))
    }

    /// (label, value) pairs in selection order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.header
            .labels()
            .iter()
            .map(String::as_str)
            .zip(&self.values)
    }
}
