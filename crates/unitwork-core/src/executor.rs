//! Write-side collaborator traits.
//!
//! The unit of work never talks to storage directly. A flush compiles into an
//! ordered batch of [`WriteCommand`]s handed to a [`WriteExecutor`] in one
//! call; the executor decides how to apply it (one transaction, a pipelined
//! batch, ...). For snapshot purposes the call is all-or-nothing: anything
//! but `Outcome::Ok` means nothing in memory advances.
//!
//! Storage-generated identifiers are threaded through the batch with
//! [`Param::Generated`]: a later command can reference the identifier an
//! earlier insert produced without the engine knowing its value yet.

use crate::error::Error;
use crate::value::Value;
use asupersync::{Cx, Outcome};
use std::fmt;

/// A column value inside a write command.
#[derive(Debug, Clone, PartialEq)]
pub enum Param {
    /// A literal value.
    Value(Value),
    /// The identifier generated by the insert at `command` in the same batch.
    Generated { command: usize },
}

impl Param {
    pub fn as_value(&self) -> Option<&Value> {
        match self {
            Param::Value(v) => Some(v),
            Param::Generated { .. } => None,
        }
    }

    /// Resolve against the results of already executed commands.
    pub fn resolve(&self, results: &[WriteResult]) -> Option<Value> {
        match self {
            Param::Value(v) => Some(v.clone()),
            Param::Generated { command } => results.get(*command).and_then(|r| r.generated.clone()),
        }
    }
}

impl From<Value> for Param {
    fn from(v: Value) -> Self {
        Param::Value(v)
    }
}

impl fmt::Display for Param {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Param::Value(v) => write!(f, "{v}"),
            Param::Generated { command } => write!(f, "<generated by #{command}>"),
        }
    }
}

/// (column, value) pairs of one command.
pub type Columns = Vec<(String, Param)>;

/// One physical write.
#[derive(Debug, Clone, PartialEq)]
pub enum WriteCommand {
    /// Insert an entity row. `generated` names the identifier column the
    /// store must fill in and report back.
    Insert {
        entity: String,
        table: String,
        columns: Columns,
        generated: Option<String>,
    },
    /// Update columns of the entity row addressed by `key`.
    Update {
        entity: String,
        table: String,
        key: Columns,
        set: Columns,
    },
    /// Delete the entity row addressed by `key`.
    Delete {
        entity: String,
        table: String,
        key: Columns,
    },
    /// Insert one link-table row of a many-to-many association.
    LinkInsert { table: String, columns: Columns },
    /// Delete one link-table row of a many-to-many association.
    LinkDelete { table: String, columns: Columns },
}

impl WriteCommand {
    pub fn table(&self) -> &str {
        match self {
            WriteCommand::Insert { table, .. }
            | WriteCommand::Update { table, .. }
            | WriteCommand::Delete { table, .. }
            | WriteCommand::LinkInsert { table, .. }
            | WriteCommand::LinkDelete { table, .. } => table,
        }
    }

    pub const fn kind_name(&self) -> &'static str {
        match self {
            WriteCommand::Insert { .. } => "insert",
            WriteCommand::Update { .. } => "update",
            WriteCommand::Delete { .. } => "delete",
            WriteCommand::LinkInsert { .. } => "link_insert",
            WriteCommand::LinkDelete { .. } => "link_delete",
        }
    }
}

impl fmt::Display for WriteCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn cols(f: &mut fmt::Formatter<'_>, columns: &Columns) -> fmt::Result {
            for (i, (c, p)) in columns.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{c}={p}")?;
            }
            Ok(())
        }
        write!(f, "{} {} (", self.kind_name(), self.table())?;
        match self {
            WriteCommand::Insert { columns, .. }
            | WriteCommand::LinkInsert { columns, .. }
            | WriteCommand::LinkDelete { columns, .. } => cols(f, columns)?,
            WriteCommand::Update { key, set, .. } => {
                cols(f, set)?;
                write!(f, " WHERE ")?;
                cols(f, key)?;
            }
            WriteCommand::Delete { key, .. } => cols(f, key)?,
        }
        write!(f, ")")
    }
}

/// Per-command result of a write batch.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteResult {
    pub affected: u64,
    /// Identifier generated by an insert, if requested.
    pub generated: Option<Value>,
}

/// Applies a batch of write commands.
pub trait WriteExecutor: Send + Sync {
    /// Execute `commands` in order, returning one result per command.
    fn execute(
        &self,
        cx: &Cx,
        commands: &[WriteCommand],
    ) -> impl Future<Output = Outcome<Vec<WriteResult>, Error>> + Send;
}

/// Reserves identifier values ahead of the insert (sequence strategy).
pub trait IdGenerator: Send + Sync {
    fn next_id(&self, cx: &Cx, entity: &str) -> impl Future<Output = Outcome<Value, Error>> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_param_resolves_from_earlier_result() {
        let results = vec![
            WriteResult {
                affected: 1,
                generated: Some(Value::BigInt(41)),
            },
            WriteResult {
                affected: 1,
                generated: None,
            },
        ];
        assert_eq!(
            Param::Generated { command: 0 }.resolve(&results),
            Some(Value::BigInt(41))
        );
        assert_eq!(Param::Generated { command: 1 }.resolve(&results), None);
        assert_eq!(Param::Generated { command: 5 }.resolve(&results), None);
        assert_eq!(
            Param::Value(Value::Int(3)).resolve(&[]),
            Some(Value::Int(3))
        );
    }

    #[test]
    fn display_is_readable() {
        let cmd = WriteCommand::Update {
            entity: "File".into(),
            table: "files".into(),
            key: vec![("file_id".into(), Param::Value(Value::BigInt(1)))],
            set: vec![("picture_id".into(), Param::Generated { command: 0 })],
        };
        assert_eq!(
            cmd.to_string(),
            "update files (picture_id=<generated by #0> WHERE file_id=1)"
        );
    }
}
