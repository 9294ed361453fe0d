//! Write batch application with relational integrity checks.

use crate::fetch::same;
use crate::{StoredRow, Tables};
use std::sync::Arc;
use unitwork_core::{
    AssociationKind, AssociationMapping, Columns, EntityMetadata, Error, MetadataRegistry, Result,
    Value, WriteCommand, WriteError, WriteErrorKind, WriteResult,
};

fn write_error(kind: WriteErrorKind, index: usize, message: impl Into<String>) -> Error {
    Error::Write(WriteError {
        kind,
        message: message.into(),
        command_index: Some(index),
        retryable: false,
        source: None,
    })
}

/// Resolve command parameters against the results of earlier commands.
fn resolve(columns: &Columns, results: &[WriteResult], index: usize) -> Result<Vec<(String, Value)>> {
    columns
        .iter()
        .map(|(column, param)| {
            param
                .resolve(results)
                .map(|value| (column.clone(), value))
                .ok_or_else(|| {
                    write_error(
                        WriteErrorKind::Rejected,
                        index,
                        format!("'{column}' refers to an identifier no earlier insert generated"),
                    )
                })
        })
        .collect()
}

fn matches(row: &StoredRow, key: &[(String, Value)]) -> bool {
    key.iter()
        .all(|(c, v)| row.get(c).is_some_and(|stored| same(stored, v)))
}

/// (column, value) pairs of `row` addressing `meta`'s primary key.
fn primary_key(meta: &EntityMetadata, row: &StoredRow) -> Vec<(String, Value)> {
    meta.identity_parts()
        .into_iter()
        .map(|part| {
            let column = meta.identity_part_column(part).to_string();
            let value = row.get(&column).cloned().unwrap_or(Value::Null);
            (column, value)
        })
        .collect()
}

/// The owning many-to-many association stored in link table `name`.
fn link_owner(registry: &MetadataRegistry, name: &str) -> Result<Option<(Arc<EntityMetadata>, AssociationMapping)>> {
    for entity in registry.entity_names() {
        let meta = registry.get(&entity)?;
        let found = meta
            .associations
            .iter()
            .find(|a| a.kind == AssociationKind::ManyToMany && a.join_table.as_ref().is_some_and(|t| t.name == name))
            .cloned();
        if let Some(assoc) = found {
            return Ok(Some((meta, assoc)));
        }
    }
    Ok(None)
}

/// Check that every non-null foreign key of `row` points at an existing row.
fn check_foreign_keys(
    registry: &MetadataRegistry,
    tables: &Tables,
    meta: &EntityMetadata,
    row: &StoredRow,
    index: usize,
) -> Result<()> {
    for assoc in meta.foreign_keys() {
        let key: Vec<(String, Value)> = assoc
            .join_columns
            .iter()
            .map(|jc| (jc.column.clone(), row.get(&jc.column).cloned().unwrap_or(Value::Null)))
            .collect();
        if key.iter().any(|(_, v)| v.is_null()) {
            continue;
        }
        let target = registry.get(&assoc.target)?;
        let wanted: Vec<(String, Value)> = assoc
            .join_columns
            .iter()
            .zip(&key)
            .map(|(jc, (_, v))| (target.identity_part_column(&jc.referenced).to_string(), v.clone()))
            .collect();
        let exists = tables
            .get(&target.table)
            .is_some_and(|rows| rows.iter().any(|r| matches(r, &wanted)));
        if !exists {
            return Err(write_error(
                WriteErrorKind::Constraint,
                index,
                format!(
                    "{}.{} references a missing {} row",
                    meta.table,
                    assoc.name,
                    target.name
                ),
            ));
        }
    }
    Ok(())
}

/// Check that nothing still references the `meta` row `row` about to be deleted.
fn check_unreferenced(
    registry: &MetadataRegistry,
    tables: &Tables,
    meta: &EntityMetadata,
    row: &StoredRow,
    index: usize,
) -> Result<()> {
    for entity in registry.entity_names() {
        let other = registry.get(&entity)?;
        for assoc in &other.associations {
            let columns = if assoc.has_foreign_key() && assoc.target == meta.name {
                Some((&other.table, &assoc.join_columns))
            } else if let Some(link) = assoc.join_table.as_ref().filter(|_| assoc.is_owning()) {
                if other.name == meta.name {
                    Some((&link.name, &link.local))
                } else if assoc.target == meta.name {
                    Some((&link.name, &link.remote))
                } else {
                    None
                }
            } else {
                None
            };
            let Some((table, join_columns)) = columns else {
                continue;
            };
            let key: Vec<(String, Value)> = join_columns
                .iter()
                .map(|jc| {
                    let value = row
                        .get(meta.identity_part_column(&jc.referenced))
                        .cloned()
                        .unwrap_or(Value::Null);
                    (jc.column.clone(), value)
                })
                .collect();
            let referenced = tables
                .get(table)
                .is_some_and(|rows| rows.iter().any(|r| !std::ptr::eq(r, row) && matches(r, &key)));
            if referenced {
                return Err(write_error(
                    WriteErrorKind::Constraint,
                    index,
                    format!("{} row is still referenced from {table}", meta.name),
                ));
            }
        }
    }
    Ok(())
}

/// Apply `commands` to `tables` in order.
pub(crate) fn apply(
    registry: &MetadataRegistry,
    tables: &mut Tables,
    commands: &[WriteCommand],
) -> Result<Vec<WriteResult>> {
    let mut results: Vec<WriteResult> = Vec::with_capacity(commands.len());
    for (index, command) in commands.iter().enumerate() {
        tracing::trace!(index = index, command = %command, "Applying");
        let result = match command {
            WriteCommand::Insert {
                entity,
                table,
                columns,
                generated,
            } => {
                let meta = registry.get(entity)?;
                let mut row: StoredRow = resolve(columns, &results, index)?.into_iter().collect();
                let mut generated_value = None;
                if let Some(column) = generated {
                    let next = tables
                        .get(table)
                        .into_iter()
                        .flatten()
                        .filter_map(|r| r.get(column).and_then(Value::as_i64))
                        .max()
                        .unwrap_or(0)
                        + 1;
                    row.insert(column.clone(), Value::BigInt(next));
                    generated_value = Some(Value::BigInt(next));
                }
                let key = primary_key(&meta, &row);
                if key.iter().any(|(_, v)| v.is_null()) {
                    return Err(write_error(
                        WriteErrorKind::Constraint,
                        index,
                        format!("{table} insert without a complete primary key"),
                    ));
                }
                if tables
                    .get(table)
                    .is_some_and(|rows| rows.iter().any(|r| matches(r, &key)))
                {
                    return Err(write_error(
                        WriteErrorKind::Constraint,
                        index,
                        format!("duplicate primary key in {table}"),
                    ));
                }
                check_foreign_keys(registry, tables, &meta, &row, index)?;
                tables.entry(table.clone()).or_default().push(row);
                WriteResult {
                    affected: 1,
                    generated: generated_value,
                }
            }
            WriteCommand::Update {
                entity,
                table,
                key,
                set,
            } => {
                let meta = registry.get(entity)?;
                let key = resolve(key, &results, index)?;
                let set = resolve(set, &results, index)?;
                let Some(position) = tables
                    .get(table)
                    .and_then(|rows| rows.iter().position(|r| matches(r, &key)))
                else {
                    return Err(write_error(
                        WriteErrorKind::Missing,
                        index,
                        format!("no {table} row to update"),
                    ));
                };
                let mut row = tables[table.as_str()][position].clone();
                row.extend(set);
                check_foreign_keys(registry, tables, &meta, &row, index)?;
                if let Some(rows) = tables.get_mut(table) {
                    rows[position] = row;
                }
                WriteResult {
                    affected: 1,
                    generated: None,
                }
            }
            WriteCommand::Delete { entity, table, key } => {
                let meta = registry.get(entity)?;
                let key = resolve(key, &results, index)?;
                let Some(position) = tables
                    .get(table)
                    .and_then(|rows| rows.iter().position(|r| matches(r, &key)))
                else {
                    return Err(write_error(
                        WriteErrorKind::Missing,
                        index,
                        format!("no {table} row to delete"),
                    ));
                };
                check_unreferenced(registry, tables, &meta, &tables[table.as_str()][position], index)?;
                if let Some(rows) = tables.get_mut(table) {
                    rows.remove(position);
                }
                WriteResult {
                    affected: 1,
                    generated: None,
                }
            }
            WriteCommand::LinkInsert { table, columns } => {
                let row: StoredRow = resolve(columns, &results, index)?.into_iter().collect();
                let key: Vec<(String, Value)> = row.iter().map(|(c, v)| (c.clone(), v.clone())).collect();
                if tables
                    .get(table)
                    .is_some_and(|rows| rows.iter().any(|r| matches(r, &key)))
                {
                    return Err(write_error(
                        WriteErrorKind::Constraint,
                        index,
                        format!("duplicate link row in {table}"),
                    ));
                }
                if let Some((owner, assoc)) = link_owner(registry, table)? {
                    check_link_sides(registry, tables, &owner, &assoc, &row, index)?;
                }
                tables.entry(table.clone()).or_default().push(row);
                WriteResult {
                    affected: 1,
                    generated: None,
                }
            }
            WriteCommand::LinkDelete { table, columns } => {
                let key = resolve(columns, &results, index)?;
                let removed = tables.get_mut(table).map_or(0, |rows| {
                    let before = rows.len();
                    rows.retain(|r| !matches(r, &key));
                    before - rows.len()
                });
                WriteResult {
                    affected: u64::try_from(removed).unwrap_or(u64::MAX),
                    generated: None,
                }
            }
        };
        results.push(result);
    }
    Ok(results)
}

/// Both sides of a link row must exist.
fn check_link_sides(
    registry: &MetadataRegistry,
    tables: &Tables,
    owner: &EntityMetadata,
    assoc: &AssociationMapping,
    row: &StoredRow,
    index: usize,
) -> Result<()> {
    let Some(link) = &assoc.join_table else {
        return Ok(());
    };
    let target = registry.get(&assoc.target)?;
    for (meta, side) in [(owner, &link.local), (target.as_ref(), &link.remote)] {
        let wanted: Vec<(String, Value)> = side
            .iter()
            .map(|jc| {
                (
                    meta.identity_part_column(&jc.referenced).to_string(),
                    row.get(&jc.column).cloned().unwrap_or(Value::Null),
                )
            })
            .collect();
        let exists = tables
            .get(&meta.table)
            .is_some_and(|rows| rows.iter().any(|r| matches(r, &wanted)));
        if !exists {
            return Err(write_error(
                WriteErrorKind::Constraint,
                index,
                format!("{} link row references a missing {} row", link.name, meta.name),
            ));
        }
    }
    Ok(())
}
