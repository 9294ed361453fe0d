//! Fetch plan interpretation.
//!
//! A plan is evaluated as a list of tuples, one row index (or none, for an
//! unmatched outer join) per alias. Joins multiply tuples the way a SQL
//! join multiplies rows, conditions filter them, ordering is a stable sort,
//! and the projection decides what leaves the store.

use crate::{StoredRow, Tables};
use std::cmp::Ordering;
use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use unitwork_core::{
    AssociationKind, AssociationMapping, EntityIdentity, EntityMetadata, Error, JoinColumn,
    MetadataRegistry, QueryError, QueryErrorKind, Result, Row, RowHeader, Value, aliased_column,
};
use unitwork_query::{COUNT_COLUMN, Condition, FetchPlan, JoinType, Projection, ResolvedPlan};

/// Alias to row index within the alias's table.
type Tuple = BTreeMap<String, Option<usize>>;

/// SQL equality: NULL matches nothing, numeric widths compare by value.
pub(crate) fn same(a: &Value, b: &Value) -> bool {
    !a.is_null() && !b.is_null() && a.sort_cmp(b) == Ordering::Equal
}

fn table<'t>(tables: &'t Tables, name: &str) -> &'t [StoredRow] {
    tables.get(name).map_or(&[], Vec::as_slice)
}

fn cell<'r>(row: &'r StoredRow, column: &str) -> &'r Value {
    static NULL: Value = Value::Null;
    row.get(column).unwrap_or(&NULL)
}

/// Indices of rows in `rows` whose `columns` equal `values`.
fn matching(rows: &[StoredRow], columns: &[(&str, &Value)]) -> Vec<usize> {
    rows.iter()
        .enumerate()
        .filter(|(_, row)| columns.iter().all(|(c, v)| same(cell(row, c), v)))
        .map(|(i, _)| i)
        .collect()
}

/// Index of the row of `meta` with `identity`.
pub(crate) fn find_by_identity(
    tables: &Tables,
    meta: &EntityMetadata,
    identity: &EntityIdentity,
) -> Option<usize> {
    let columns: Vec<(&str, &Value)> = identity
        .iter()
        .map(|(part, value)| (meta.identity_part_column(part), value))
        .collect();
    matching(table(tables, &meta.table), &columns).into_iter().next()
}

/// Rows of `assoc.target` related to `owner_row` of `owner` through `assoc`.
pub(crate) fn related(
    registry: &MetadataRegistry,
    tables: &Tables,
    owner: &EntityMetadata,
    assoc: &AssociationMapping,
    owner_row: &StoredRow,
) -> Result<Vec<usize>> {
    let target = registry.get(&assoc.target)?;
    let target_rows = table(tables, &target.table);

    // Columns on `from_row` referencing identity parts of `to`.
    let referencing = |to: &EntityMetadata, from_row: &StoredRow, columns: &[JoinColumn]| {
        columns
            .iter()
            .map(|jc| {
                (
                    to.identity_part_column(&jc.referenced).to_string(),
                    cell(from_row, &jc.column).clone(),
                )
            })
            .collect::<Vec<_>>()
    };
    // Columns on the far side holding identity parts of `from` read off `from_row`.
    let referenced = |from: &EntityMetadata, from_row: &StoredRow, columns: &[JoinColumn]| {
        columns
            .iter()
            .map(|jc| {
                (
                    jc.column.clone(),
                    cell(from_row, from.identity_part_column(&jc.referenced)).clone(),
                )
            })
            .collect::<Vec<_>>()
    };
    let lookup = |rows: &[StoredRow], pairs: &[(String, Value)]| {
        let columns: Vec<(&str, &Value)> = pairs.iter().map(|(c, v)| (c.as_str(), v)).collect();
        matching(rows, &columns)
    };

    if assoc.has_foreign_key() {
        return Ok(lookup(
            target_rows,
            &referencing(&target, owner_row, &assoc.join_columns),
        ));
    }
    let owning = registry.owning_side(assoc)?;
    if assoc.kind != AssociationKind::ManyToMany {
        return Ok(lookup(
            target_rows,
            &referenced(owner, owner_row, &owning.join_columns),
        ));
    }

    let link = owning.join_table.as_ref().ok_or_else(|| {
        Error::invalid_mapping(&owner.name, format!("'{}' has no link table", owning.name))
    })?;
    let (near, far) = if assoc.is_owning() {
        (&link.local, &link.remote)
    } else {
        (&link.remote, &link.local)
    };
    let links = table(tables, &link.name);
    let mut found = Vec::new();
    for l in lookup(links, &referenced(owner, owner_row, near)) {
        for t in lookup(target_rows, &referencing(&target, &links[l], far)) {
            if !found.contains(&t) {
                found.push(t);
            }
        }
    }
    Ok(found)
}

/// Evaluate `plan` over `tables`.
pub(crate) fn run(registry: &MetadataRegistry, tables: &Tables, plan: &FetchPlan) -> Result<Vec<Row>> {
    let resolved = plan.resolve(registry)?;
    let root = Arc::clone(resolved.root()?);

    let mut tuples: Vec<Tuple> = (0..table(tables, &root.table).len())
        .map(|i| Tuple::from([(plan.alias.clone(), Some(i))]))
        .collect();

    for join in &resolved.joins {
        let parent = resolved.entity(&join.join.parent)?;
        let mut next = Vec::with_capacity(tuples.len());
        for tuple in tuples {
            let parent_row = tuple
                .get(&join.join.parent)
                .copied()
                .flatten()
                .map(|i| &table(tables, &parent.table)[i]);
            let matches = match parent_row {
                Some(row) => related(registry, tables, parent, &join.association, row)?,
                None => Vec::new(),
            };
            if matches.is_empty() {
                if join.join.join_type == JoinType::Left {
                    let mut t = tuple;
                    t.insert(join.join.alias.clone(), None);
                    next.push(t);
                }
                continue;
            }
            for m in matches {
                let mut t = tuple.clone();
                t.insert(join.join.alias.clone(), Some(m));
                next.push(t);
            }
        }
        tuples = next;
    }

    for condition in &plan.conditions {
        tuples = filter(registry, tables, &resolved, condition, tuples)?;
    }

    if !plan.order_by.is_empty() {
        let key = |tuple: &Tuple, alias: &str, name: &str| -> Value {
            let Ok(meta) = resolved.entity(alias) else {
                return Value::Null;
            };
            let column = meta.get_field(name).map_or(name, |f| f.column.as_str());
            tuple
                .get(alias)
                .copied()
                .flatten()
                .map_or(Value::Null, |i| cell(&table(tables, &meta.table)[i], column).clone())
        };
        tuples.sort_by(|a, b| {
            for term in &plan.order_by {
                let ord = key(a, &term.alias, &term.name).sort_cmp(&key(b, &term.alias, &term.name));
                let ord = match term.direction {
                    unitwork_query::OrderDirection::Asc => ord,
                    unitwork_query::OrderDirection::Desc => ord.reverse(),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
            Ordering::Equal
        });
    }

    let window = |len: usize| {
        let start = plan.offset.unwrap_or(0).min(len);
        let end = plan.limit.map_or(len, |l| start.saturating_add(l).min(len));
        start..end
    };

    match plan.projection {
        Projection::Entities => {
            let mut aliases = vec![(plan.alias.clone(), Arc::clone(&root))];
            for join in resolved.fetched() {
                aliases.push((join.join.alias.clone(), Arc::clone(resolved.entity(&join.join.alias)?)));
            }
            let header = RowHeader::new(
                aliases
                    .iter()
                    .flat_map(|(alias, meta)| {
                        meta.columns()
                            .into_iter()
                            .map(move |c| aliased_column(alias, c))
                            .collect::<Vec<_>>()
                    })
                    .collect(),
            );
            let range = window(tuples.len());
            Ok(tuples[range]
                .iter()
                .map(|tuple| {
                    let values = aliases
                        .iter()
                        .flat_map(|(alias, meta)| {
                            let row = tuple
                                .get(alias)
                                .copied()
                                .flatten()
                                .map(|i| &table(tables, &meta.table)[i]);
                            meta.columns()
                                .into_iter()
                                .map(|c| row.map_or(Value::Null, |r| cell(r, c).clone()))
                                .collect::<Vec<_>>()
                        })
                        .collect();
                    Row::with_header(&header, values)
                })
                .collect())
        }
        Projection::RootIdentities => {
            let roots = distinct_roots(&plan.alias, &tuples);
            let range = window(roots.len());
            let parts = root.identity_parts();
            let header = RowHeader::new(
                parts
                    .iter()
                    .map(|p| aliased_column(&plan.alias, root.identity_part_column(p)))
                    .collect(),
            );
            let rows = table(tables, &root.table);
            Ok(roots[range]
                .iter()
                .map(|i| {
                    let values = parts
                        .iter()
                        .map(|p| cell(&rows[*i], root.identity_part_column(p)).clone())
                        .collect();
                    Row::with_header(&header, values)
                })
                .collect())
        }
        Projection::CountRoots => {
            let count = i64::try_from(distinct_roots(&plan.alias, &tuples).len()).map_err(|_| {
                Error::Query(QueryError {
                    kind: QueryErrorKind::Database,
                    message: "root count overflows".to_string(),
                    source: None,
                })
            })?;
            Ok(vec![Row::new(
                vec![COUNT_COLUMN.to_string()],
                vec![Value::BigInt(count)],
            )])
        }
    }
}

/// Root row indices in order of first appearance.
fn distinct_roots(alias: &str, tuples: &[Tuple]) -> Vec<usize> {
    let mut seen = HashSet::new();
    tuples
        .iter()
        .filter_map(|t| t.get(alias).copied().flatten())
        .filter(|i| seen.insert(*i))
        .collect()
}

fn filter(
    registry: &MetadataRegistry,
    tables: &Tables,
    resolved: &ResolvedPlan,
    condition: &Condition,
    tuples: Vec<Tuple>,
) -> Result<Vec<Tuple>> {
    let alias = condition.alias();
    let meta = Arc::clone(resolved.entity(alias)?);
    let rows = table(tables, &meta.table);
    let row_of = |tuple: &Tuple| tuple.get(alias).copied().flatten();

    let keep: Box<dyn Fn(usize) -> bool + '_> = match condition {
        Condition::Eq { name, value, .. } => {
            let column = meta
                .get_field(name)
                .map_or(name.clone(), |f| f.column.clone());
            let value = value.clone();
            Box::new(move |i| {
                let stored = cell(&rows[i], &column);
                if value.is_null() {
                    stored.is_null()
                } else {
                    same(stored, &value)
                }
            })
        }
        Condition::IdentityIn { identities, .. } => {
            let wanted: HashSet<usize> = identities
                .iter()
                .filter_map(|identity| find_by_identity(tables, &meta, identity))
                .collect();
            Box::new(move |i| wanted.contains(&i))
        }
        Condition::ElementOf {
            owner_entity,
            association,
            owner,
            ..
        } => {
            let owner_meta = registry.get(owner_entity)?;
            let assoc = owner_meta.require_association(association)?;
            if assoc.target != meta.name {
                return Err(Error::Query(QueryError {
                    kind: QueryErrorKind::Unsupported,
                    message: format!(
                        "'{owner_entity}.{association}' targets {}, not {}",
                        assoc.target, meta.name
                    ),
                    source: None,
                }));
            }
            let members: HashSet<usize> = match find_by_identity(tables, &owner_meta, owner) {
                Some(o) => related(
                    registry,
                    tables,
                    &owner_meta,
                    assoc,
                    &table(tables, &owner_meta.table)[o],
                )?
                .into_iter()
                .collect(),
                None => HashSet::new(),
            };
            Box::new(move |i| members.contains(&i))
        }
    };

    Ok(tuples
        .into_iter()
        .filter(|t| row_of(t).is_some_and(|i| keep(i)))
        .collect())
}
