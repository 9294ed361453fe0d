//! Compiled fetch plans.
//!
//! A [`FetchPlan`] is what the session hands to a
//! [`QueryExecutor`](crate::QueryExecutor): a root entity under an alias,
//! joins along associations, filter conditions, ordering, a page window and
//! a projection. Executors translate plans into their own query language;
//! none is defined here.
//!
//! Selected columns are labelled `alias__column` (see
//! [`unitwork_core::aliased_column`]). Under [`Projection::Entities`] every
//! storage column of the root and of every fetched join is selected.

use crate::order::OrderBy;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use unitwork_core::{
    AssociationMapping, EntityIdentity, EntityMetadata, Error, MetadataRegistry, Result, Value,
};

/// Types of joins.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JoinType {
    Inner,
    #[default]
    Left,
}

impl JoinType {
    pub const fn as_str(&self) -> &'static str {
        match self {
            JoinType::Inner => "INNER JOIN",
            JoinType::Left => "LEFT JOIN",
        }
    }
}

/// A join from `parent` alias along `association`, introducing `alias`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinFetch {
    pub alias: String,
    pub parent: String,
    pub association: String,
    pub join_type: JoinType,
    /// Select the joined entity's columns so it can be hydrated.
    pub fetch: bool,
}

/// Row filter.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// `alias.name = value`; `name` is a field name or a storage column.
    Eq {
        alias: String,
        name: String,
        value: Value,
    },
    /// The entity under `alias` has one of the given identities.
    IdentityIn {
        alias: String,
        identities: Vec<EntityIdentity>,
    },
    /// The entity under `alias` is an element of `owner_entity.association`
    /// for the owner row identified by `owner`.
    ElementOf {
        alias: String,
        owner_entity: String,
        association: String,
        owner: EntityIdentity,
    },
}

impl Condition {
    pub fn alias(&self) -> &str {
        match self {
            Condition::Eq { alias, .. }
            | Condition::IdentityIn { alias, .. }
            | Condition::ElementOf { alias, .. } => alias,
        }
    }
}

/// What the executor returns per result row.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Projection {
    /// Every column of the root and of every fetched join, one row per
    /// joined combination.
    #[default]
    Entities,
    /// Distinct root identities, one row per root, in the order each root
    /// first appears in the ordered joined rows. Offset and limit apply to
    /// roots. Columns are labelled `alias__column` for each identity column.
    RootIdentities,
    /// A single row with a `count` column: the number of distinct roots.
    CountRoots,
}

/// Name of the column produced by [`Projection::CountRoots`].
pub const COUNT_COLUMN: &str = "count";

/// A relationship path to join-fetch, e.g. `halls.rooms`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncludePath {
    pub association: String,
    pub nested: Vec<IncludePath>,
}

impl IncludePath {
    pub fn new(association: impl Into<String>) -> Self {
        Self {
            association: association.into(),
            nested: Vec::new(),
        }
    }

    #[must_use]
    pub fn nest(mut self, path: IncludePath) -> Self {
        self.nested.push(path);
        self
    }

    /// Parse a dotted path. Empty segments are skipped.
    pub fn parse(path: &str) -> Option<IncludePath> {
        let parts: Vec<&str> = path
            .trim()
            .split('.')
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .collect();
        Self::build_nested(&parts)
    }

    fn build_nested(parts: &[&str]) -> Option<IncludePath> {
        let (first, rest) = parts.split_first()?;
        let mut path = IncludePath::new(*first);
        if let Some(child) = Self::build_nested(rest) {
            path.nested.push(child);
        }
        Some(path)
    }
}

/// A compiled query plan.
#[derive(Debug, Clone, PartialEq)]
pub struct FetchPlan {
    pub root: String,
    pub alias: String,
    pub joins: Vec<JoinFetch>,
    pub conditions: Vec<Condition>,
    pub order_by: Vec<OrderBy>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
    pub projection: Projection,
}

impl FetchPlan {
    /// Plan selecting every `root` entity under `alias`.
    pub fn new(root: impl Into<String>, alias: impl Into<String>) -> Self {
        Self {
            root: root.into(),
            alias: alias.into(),
            joins: Vec::new(),
            conditions: Vec::new(),
            order_by: Vec::new(),
            offset: None,
            limit: None,
            projection: Projection::Entities,
        }
    }

    /// Join-fetch `parent.association` as `alias`.
    #[must_use]
    pub fn join_fetch(
        mut self,
        parent: impl Into<String>,
        association: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        self.joins.push(JoinFetch {
            alias: alias.into(),
            parent: parent.into(),
            association: association.into(),
            join_type: JoinType::Left,
            fetch: true,
        });
        self
    }

    /// Inner join `parent.association` as `alias` without selecting its columns.
    #[must_use]
    pub fn join(
        mut self,
        parent: impl Into<String>,
        association: impl Into<String>,
        alias: impl Into<String>,
    ) -> Self {
        self.joins.push(JoinFetch {
            alias: alias.into(),
            parent: parent.into(),
            association: association.into(),
            join_type: JoinType::Inner,
            fetch: false,
        });
        self
    }

    /// Join-fetch a dotted path from the root, generating aliases
    /// (`halls.rooms` yields `{root}_halls` and `{root}_halls_rooms`).
    #[must_use]
    pub fn include(mut self, path: &str) -> Self {
        if let Some(include) = IncludePath::parse(path) {
            let root = self.alias.clone();
            self.push_include(&root, &include);
        }
        self
    }

    fn push_include(&mut self, parent: &str, include: &IncludePath) {
        let alias = format!("{parent}_{}", include.association);
        if !self.joins.iter().any(|j| j.alias == alias) {
            self.joins.push(JoinFetch {
                alias: alias.clone(),
                parent: parent.to_string(),
                association: include.association.clone(),
                join_type: JoinType::Left,
                fetch: true,
            });
        }
        for nested in &include.nested {
            self.push_include(&alias, nested);
        }
    }

    #[must_use]
    pub fn filter(mut self, condition: Condition) -> Self {
        self.conditions.push(condition);
        self
    }

    /// Add `alias.name = value`.
    #[must_use]
    pub fn where_eq(
        self,
        alias: impl Into<String>,
        name: impl Into<String>,
        value: impl Into<Value>,
    ) -> Self {
        self.filter(Condition::Eq {
            alias: alias.into(),
            name: name.into(),
            value: value.into(),
        })
    }

    #[must_use]
    pub fn order(mut self, term: OrderBy) -> Self {
        self.order_by.push(term);
        self
    }

    /// Append parsed ordering terms (`"b.id ASC, h.name DESC"`).
    pub fn order_by_str(mut self, ordering: &str) -> Result<Self> {
        self.order_by
            .extend(OrderBy::parse_list(ordering, Some(&self.alias))?);
        Ok(self)
    }

    #[must_use]
    pub fn offset(mut self, offset: usize) -> Self {
        self.offset = Some(offset);
        self
    }

    #[must_use]
    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    #[must_use]
    pub fn projection(mut self, projection: Projection) -> Self {
        self.projection = projection;
        self
    }

    /// Copy of this plan without a page window.
    #[must_use]
    pub fn unpaged(&self) -> Self {
        let mut plan = self.clone();
        plan.offset = None;
        plan.limit = None;
        plan
    }

    pub fn join_for(&self, alias: &str) -> Option<&JoinFetch> {
        self.joins.iter().find(|j| j.alias == alias)
    }

    /// Resolve every alias to its entity metadata and every join to its
    /// association mapping. Fails on unknown aliases or associations and on
    /// duplicate aliases.
    pub fn resolve(&self, registry: &MetadataRegistry) -> Result<ResolvedPlan> {
        let root = registry.get(&self.root)?;
        let mut entities: HashMap<String, Arc<EntityMetadata>> = HashMap::new();
        entities.insert(self.alias.clone(), root);
        let mut joins = Vec::with_capacity(self.joins.len());
        for join in &self.joins {
            let parent = entities.get(&join.parent).cloned().ok_or_else(|| {
                Error::Custom(format!(
                    "join '{}' refers to unknown alias '{}'",
                    join.alias, join.parent
                ))
            })?;
            let assoc = parent.require_association(&join.association)?.clone();
            let target = registry.get(&assoc.target)?;
            if entities.insert(join.alias.clone(), target).is_some() {
                return Err(Error::Custom(format!("duplicate alias '{}'", join.alias)));
            }
            joins.push(ResolvedJoin {
                join: join.clone(),
                parent_entity: parent.name.clone(),
                association: assoc,
            });
        }
        for cond in &self.conditions {
            if !entities.contains_key(cond.alias()) {
                return Err(Error::Custom(format!(
                    "condition refers to unknown alias '{}'",
                    cond.alias()
                )));
            }
        }
        for term in &self.order_by {
            if !entities.contains_key(&term.alias) {
                return Err(Error::Custom(format!(
                    "ordering refers to unknown alias '{}'",
                    term.alias
                )));
            }
        }
        Ok(ResolvedPlan {
            root_alias: self.alias.clone(),
            entities,
            joins,
        })
    }

    /// True if a to-many join can repeat a root across several rows.
    pub fn multiplies_roots(&self, registry: &MetadataRegistry) -> Result<bool> {
        Ok(self
            .resolve(registry)?
            .joins
            .iter()
            .any(|j| j.association.is_collection()))
    }
}

impl fmt::Display for FetchPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FETCH {} {}", self.root, self.alias)?;
        for j in &self.joins {
            write!(
                f,
                " {} {}.{} {}{}",
                j.join_type.as_str(),
                j.parent,
                j.association,
                j.alias,
                if j.fetch { " (fetch)" } else { "" }
            )?;
        }
        if !self.order_by.is_empty() {
            let terms: Vec<String> = self.order_by.iter().map(ToString::to_string).collect();
            write!(f, " ORDER BY {}", terms.join(", "))?;
        }
        if let Some(offset) = self.offset {
            write!(f, " OFFSET {offset}")?;
        }
        if let Some(limit) = self.limit {
            write!(f, " LIMIT {limit}")?;
        }
        Ok(())
    }
}

/// A join with its association mapping resolved.
#[derive(Debug, Clone)]
pub struct ResolvedJoin {
    pub join: JoinFetch,
    pub parent_entity: String,
    pub association: AssociationMapping,
}

/// Alias-to-metadata resolution of a [`FetchPlan`].
#[derive(Debug, Clone)]
pub struct ResolvedPlan {
    pub root_alias: String,
    pub entities: HashMap<String, Arc<EntityMetadata>>,
    pub joins: Vec<ResolvedJoin>,
}

impl ResolvedPlan {
    pub fn entity(&self, alias: &str) -> Result<&Arc<EntityMetadata>> {
        self.entities
            .get(alias)
            .ok_or_else(|| Error::Custom(format!("unknown alias '{alias}'")))
    }

    pub fn root(&self) -> Result<&Arc<EntityMetadata>> {
        self.entity(&self.root_alias)
    }

    /// Joins whose columns are selected, in plan order.
    pub fn fetched(&self) -> impl Iterator<Item = &ResolvedJoin> {
        self.joins.iter().filter(|j| j.join.fetch)
    }

    /// The fetched join loading `parent_alias.association`, if any.
    pub fn fetched_join(&self, parent_alias: &str, association: &str) -> Option<&ResolvedJoin> {
        self.fetched()
            .find(|j| j.join.parent == parent_alias && j.join.association == association)
    }
}
