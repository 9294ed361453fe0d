//! Entity metadata: identifiers, persistent fields and associations.
//!
//! Metadata is described at runtime (it usually comes from an external
//! metadata source) and is immutable once registered. Everything in the
//! session layer reads it through a shared [`MetadataRegistry`].

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, RwLock};

/// How identifier values come into existence.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IdGeneration {
    /// The application sets the identifier before persisting.
    #[default]
    Assigned,
    /// The store generates the identifier during the insert.
    Identity,
    /// An [`IdGenerator`](crate::IdGenerator) reserves the value before the insert.
    Sequence,
}

/// A persistent scalar field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMapping {
    pub name: String,
    pub column: String,
    pub nullable: bool,
    /// Part of the entity identifier.
    pub id: bool,
}

impl FieldMapping {
    /// A nullable, non-identifier field stored in a column of the same name.
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        Self {
            column: name.clone(),
            name,
            nullable: true,
            id: false,
        }
    }

    /// An identifier field.
    pub fn id(name: impl Into<String>) -> Self {
        Self {
            nullable: false,
            id: true,
            ..Self::new(name)
        }
    }

    #[must_use]
    pub fn column(mut self, column: impl Into<String>) -> Self {
        self.column = column.into();
        self
    }

    #[must_use]
    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }
}

/// Operations propagated along an association.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CascadeSet {
    pub persist: bool,
    pub remove: bool,
    pub merge: bool,
    pub refresh: bool,
    pub detach: bool,
}

/// One cascadable operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CascadeOp {
    Persist,
    Remove,
    Merge,
    Refresh,
    Detach,
}

impl CascadeOp {
    pub const fn as_str(self) -> &'static str {
        match self {
            CascadeOp::Persist => "persist",
            CascadeOp::Remove => "remove",
            CascadeOp::Merge => "merge",
            CascadeOp::Refresh => "refresh",
            CascadeOp::Detach => "detach",
        }
    }
}

impl fmt::Display for CascadeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl CascadeSet {
    pub const NONE: CascadeSet = CascadeSet {
        persist: false,
        remove: false,
        merge: false,
        refresh: false,
        detach: false,
    };

    pub const ALL: CascadeSet = CascadeSet {
        persist: true,
        remove: true,
        merge: true,
        refresh: true,
        detach: true,
    };

    /// Parse a comma separated option list such as `"persist, remove"` or `"all"`.
    pub fn parse(input: &str) -> Result<Self> {
        let mut set = CascadeSet::NONE;
        for opt in input.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            match opt.to_ascii_lowercase().as_str() {
                "all" => set = CascadeSet::ALL,
                "persist" => set.persist = true,
                "remove" => set.remove = true,
                "merge" => set.merge = true,
                "refresh" => set.refresh = true,
                "detach" => set.detach = true,
                other => {
                    return Err(Error::Custom(format!("unknown cascade option '{other}'")));
                }
            }
        }
        Ok(set)
    }

    pub const fn contains(&self, op: CascadeOp) -> bool {
        match op {
            CascadeOp::Persist => self.persist,
            CascadeOp::Remove => self.remove,
            CascadeOp::Merge => self.merge,
            CascadeOp::Refresh => self.refresh,
            CascadeOp::Detach => self.detach,
        }
    }

    pub const fn is_empty(&self) -> bool {
        !(self.persist || self.remove || self.merge || self.refresh || self.detach)
    }
}

/// Cardinality and direction of an association.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssociationKind {
    ManyToOne,
    OneToOne,
    OneToMany,
    ManyToMany,
}

impl AssociationKind {
    pub const fn is_collection(self) -> bool {
        matches!(self, AssociationKind::OneToMany | AssociationKind::ManyToMany)
    }
}

/// A foreign key column and the target identifier part it references.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinColumn {
    pub column: String,
    /// Name of the identity part on the referenced entity.
    pub referenced: String,
}

impl JoinColumn {
    pub fn new(column: impl Into<String>, referenced: impl Into<String>) -> Self {
        Self {
            column: column.into(),
            referenced: referenced.into(),
        }
    }
}

/// Link table of a many-to-many association.
///
/// `local` columns reference the owning entity's identity parts, `remote`
/// columns reference the target's. Both may be composite.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinTable {
    pub name: String,
    pub local: Vec<JoinColumn>,
    pub remote: Vec<JoinColumn>,
}

impl JoinTable {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local: Vec::new(),
            remote: Vec::new(),
        }
    }

    #[must_use]
    pub fn local(mut self, column: impl Into<String>, referenced: impl Into<String>) -> Self {
        self.local.push(JoinColumn::new(column, referenced));
        self
    }

    #[must_use]
    pub fn remote(mut self, column: impl Into<String>, referenced: impl Into<String>) -> Self {
        self.remote.push(JoinColumn::new(column, referenced));
        self
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.local
            .iter()
            .chain(self.remote.iter())
            .map(|c| c.column.as_str())
    }
}

/// One relationship field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssociationMapping {
    pub name: String,
    pub target: String,
    pub kind: AssociationKind,
    /// Field on the target holding the owning side (inverse associations only).
    pub mapped_by: Option<String>,
    /// Foreign key columns (owning to-one).
    pub join_columns: Vec<JoinColumn>,
    /// Link table (owning many-to-many).
    pub join_table: Option<JoinTable>,
    pub cascade: CascadeSet,
    /// Target field used to key the collection.
    pub index_by: Option<String>,
    /// Ordering applied to collection elements, e.g. `"name DESC"`.
    pub order_by: Option<String>,
    /// False when the foreign key is required.
    pub nullable: bool,
    pub orphan_removal: bool,
    /// The foreign key columns are part of the owner's identifier.
    pub id: bool,
}

impl AssociationMapping {
    fn base(name: impl Into<String>, target: impl Into<String>, kind: AssociationKind) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind,
            mapped_by: None,
            join_columns: Vec::new(),
            join_table: None,
            cascade: CascadeSet::NONE,
            index_by: None,
            order_by: None,
            nullable: true,
            orphan_removal: false,
            id: false,
        }
    }

    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::base(name, target, AssociationKind::ManyToOne)
    }

    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::base(name, target, AssociationKind::OneToOne)
    }

    pub fn one_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        mapped_by: impl Into<String>,
    ) -> Self {
        Self {
            mapped_by: Some(mapped_by.into()),
            ..Self::base(name, target, AssociationKind::OneToMany)
        }
    }

    pub fn many_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::base(name, target, AssociationKind::ManyToMany)
    }

    #[must_use]
    pub fn join_column(mut self, column: impl Into<String>, referenced: impl Into<String>) -> Self {
        self.join_columns.push(JoinColumn::new(column, referenced));
        self
    }

    #[must_use]
    pub fn join_table(mut self, table: JoinTable) -> Self {
        self.join_table = Some(table);
        self
    }

    #[must_use]
    pub fn mapped_by(mut self, field: impl Into<String>) -> Self {
        self.mapped_by = Some(field.into());
        self
    }

    #[must_use]
    pub fn cascade(mut self, cascade: CascadeSet) -> Self {
        self.cascade = cascade;
        self
    }

    #[must_use]
    pub fn index_by(mut self, field: impl Into<String>) -> Self {
        self.index_by = Some(field.into());
        self
    }

    #[must_use]
    pub fn order_by(mut self, ordering: impl Into<String>) -> Self {
        self.order_by = Some(ordering.into());
        self
    }

    /// Mark the foreign key as required (non-nullable).
    #[must_use]
    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn orphan_removal(mut self, value: bool) -> Self {
        self.orphan_removal = value;
        self
    }

    /// Make the foreign key columns part of the owner's identifier.
    #[must_use]
    pub fn identifier(mut self) -> Self {
        self.id = true;
        self.nullable = false;
        self
    }

    pub const fn is_collection(&self) -> bool {
        self.kind.is_collection()
    }

    /// True if this side holds the foreign key or the link table rows.
    pub fn is_owning(&self) -> bool {
        match self.kind {
            AssociationKind::ManyToOne => true,
            AssociationKind::OneToOne => self.mapped_by.is_none(),
            AssociationKind::OneToMany => false,
            AssociationKind::ManyToMany => self.mapped_by.is_none(),
        }
    }

    /// Owning to-one: the association is stored as foreign key columns on the owner row.
    pub fn has_foreign_key(&self) -> bool {
        !self.is_collection() && self.is_owning()
    }
}

/// Static description of one entity type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityMetadata {
    pub name: String,
    pub table: String,
    pub fields: Vec<FieldMapping>,
    pub associations: Vec<AssociationMapping>,
    pub id_generation: IdGeneration,
}

impl EntityMetadata {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            fields: Vec::new(),
            associations: Vec::new(),
            id_generation: IdGeneration::Assigned,
        }
    }

    #[must_use]
    pub fn field(mut self, field: FieldMapping) -> Self {
        self.fields.push(field);
        self
    }

    #[must_use]
    pub fn association(mut self, association: AssociationMapping) -> Self {
        self.associations.push(association);
        self
    }

    #[must_use]
    pub fn id_generation(mut self, strategy: IdGeneration) -> Self {
        self.id_generation = strategy;
        self
    }

    pub fn get_field(&self, name: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.name == name)
    }

    pub fn field_by_column(&self, column: &str) -> Option<&FieldMapping> {
        self.fields.iter().find(|f| f.column == column)
    }

    pub fn get_association(&self, name: &str) -> Option<&AssociationMapping> {
        self.associations.iter().find(|a| a.name == name)
    }

    pub fn require_field(&self, name: &str) -> Result<&FieldMapping> {
        self.get_field(name)
            .ok_or_else(|| Error::unknown_field(&self.name, name))
    }

    pub fn require_association(&self, name: &str) -> Result<&AssociationMapping> {
        self.get_association(name)
            .ok_or_else(|| Error::unknown_association(&self.name, name))
    }

    /// Names of the identity parts, in identity order.
    ///
    /// Scalar identifier fields come first (by field name), then the join
    /// columns of identifier associations (by column name).
    pub fn identity_parts(&self) -> Vec<&str> {
        let mut parts: Vec<&str> = self
            .fields
            .iter()
            .filter(|f| f.id)
            .map(|f| f.name.as_str())
            .collect();
        for assoc in self.associations.iter().filter(|a| a.id) {
            parts.extend(assoc.join_columns.iter().map(|c| c.column.as_str()));
        }
        parts
    }

    /// Storage column holding an identity part.
    pub fn identity_part_column<'a>(&'a self, part: &'a str) -> &'a str {
        self.get_field(part).map_or(part, |f| f.column.as_str())
    }

    /// The single generated identifier field, if the entity has one.
    pub fn generated_id_field(&self) -> Option<&FieldMapping> {
        if self.id_generation == IdGeneration::Assigned {
            return None;
        }
        self.fields.iter().find(|f| f.id)
    }

    /// Owning to-one associations (stored as foreign key columns).
    pub fn foreign_keys(&self) -> impl Iterator<Item = &AssociationMapping> {
        self.associations.iter().filter(|a| a.has_foreign_key())
    }

    pub fn collections(&self) -> impl Iterator<Item = &AssociationMapping> {
        self.associations.iter().filter(|a| a.is_collection())
    }

    /// Every storage column of the entity's own table, in declaration order.
    pub fn columns(&self) -> Vec<&str> {
        let mut cols: Vec<&str> = self.fields.iter().map(|f| f.column.as_str()).collect();
        for assoc in self.foreign_keys() {
            for jc in &assoc.join_columns {
                if !cols.contains(&jc.column.as_str()) {
                    cols.push(jc.column.as_str());
                }
            }
        }
        cols
    }

    /// Checks that only need this entity's own metadata.
    pub fn validate(&self) -> Result<()> {
        if self.identity_parts().is_empty() {
            return Err(Error::invalid_mapping(
                &self.name,
                format!("entity '{}' declares no identifier", self.name),
            ));
        }
        if self.id_generation != IdGeneration::Assigned {
            let ids = self.fields.iter().filter(|f| f.id).count();
            if ids != 1 || self.associations.iter().any(|a| a.id) {
                return Err(Error::invalid_mapping(
                    &self.name,
                    format!(
                        "entity '{}' uses a generated identifier but has a composite key",
                        self.name
                    ),
                ));
            }
        }
        for assoc in &self.associations {
            if self.get_field(&assoc.name).is_some() {
                return Err(Error::invalid_mapping(
                    &self.name,
                    format!("'{}' is declared as both field and association", assoc.name),
                ));
            }
            if assoc.has_foreign_key() && assoc.join_columns.is_empty() {
                return Err(Error::invalid_mapping(
                    &self.name,
                    format!("owning association '{}' has no join columns", assoc.name),
                ));
            }
            if assoc.kind == AssociationKind::ManyToMany
                && assoc.is_owning()
                && assoc.join_table.is_none()
            {
                return Err(Error::invalid_mapping(
                    &self.name,
                    format!("many-to-many association '{}' has no join table", assoc.name),
                ));
            }
            if assoc.id && !assoc.has_foreign_key() {
                return Err(Error::invalid_mapping(
                    &self.name,
                    format!(
                        "identifier association '{}' must be an owning to-one",
                        assoc.name
                    ),
                ));
            }
            if !assoc.is_collection() && (assoc.index_by.is_some() || assoc.order_by.is_some()) {
                return Err(Error::invalid_mapping(
                    &self.name,
                    format!(
                        "index_by/order_by on single-valued association '{}'",
                        assoc.name
                    ),
                ));
            }
        }
        Ok(())
    }
}

/// Supplies metadata for entity types on demand.
pub trait MetadataSource: Send + Sync {
    fn load(&self, entity: &str) -> Option<EntityMetadata>;
}

/// Immutable-after-load registry of entity metadata.
///
/// Entries are added eagerly with [`register`](Self::register) or loaded
/// lazily from a [`MetadataSource`] the first time a type is requested.
#[derive(Default)]
pub struct MetadataRegistry {
    entries: RwLock<HashMap<String, Arc<EntityMetadata>>>,
    source: Option<Box<dyn MetadataSource>>,
}

impl fmt::Debug for MetadataRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self
            .entries
            .read()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("MetadataRegistry")
            .field("entities", &names)
            .field("has_source", &self.source.is_some())
            .finish()
    }
}

impl MetadataRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry backed by a lazy metadata source.
    pub fn with_source(source: impl MetadataSource + 'static) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            source: Some(Box::new(source)),
        }
    }

    /// Register metadata eagerly. Fails if the type is already registered.
    pub fn register(&self, metadata: EntityMetadata) -> Result<()> {
        metadata.validate()?;
        let mut entries = self.entries_mut()?;
        if entries.contains_key(&metadata.name) {
            return Err(Error::invalid_mapping(
                &metadata.name,
                format!("entity '{}' is already registered", metadata.name),
            ));
        }
        tracing::trace!(entity = %metadata.name, table = %metadata.table, "Registered entity metadata");
        entries.insert(metadata.name.clone(), Arc::new(metadata));
        Ok(())
    }

    /// Builder-style registration for test and bootstrap code.
    pub fn with(self, metadata: EntityMetadata) -> Result<Self> {
        self.register(metadata)?;
        Ok(self)
    }

    /// Metadata for `entity`, loading it from the source on first use.
    pub fn get(&self, entity: &str) -> Result<Arc<EntityMetadata>> {
        if let Some(meta) = self.entries_ref()?.get(entity) {
            return Ok(Arc::clone(meta));
        }
        let Some(source) = &self.source else {
            return Err(Error::unknown_entity(entity));
        };
        let loaded = source
            .load(entity)
            .ok_or_else(|| Error::unknown_entity(entity))?;
        if loaded.name != entity {
            return Err(Error::invalid_mapping(
                entity,
                format!("metadata source returned '{}' for '{entity}'", loaded.name),
            ));
        }
        loaded.validate()?;
        let mut entries = self.entries_mut()?;
        let meta = entries
            .entry(entity.to_string())
            .or_insert_with(|| Arc::new(loaded));
        tracing::trace!(entity = %entity, "Loaded entity metadata from source");
        Ok(Arc::clone(meta))
    }

    /// Names of every entity loaded so far.
    pub fn entity_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .entries
            .read()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    /// The association on `target` that owns the inverse `assoc`, or `assoc` itself if owning.
    pub fn owning_side(&self, assoc: &AssociationMapping) -> Result<AssociationMapping> {
        if assoc.is_owning() {
            return Ok(assoc.clone());
        }
        let mapped_by = assoc.mapped_by.as_deref().ok_or_else(|| {
            Error::invalid_mapping(
                &assoc.target,
                format!("inverse association '{}' has no mapped_by", assoc.name),
            )
        })?;
        let target = self.get(&assoc.target)?;
        target.require_association(mapped_by).cloned()
    }

    /// Cross-entity checks over everything registered so far.
    ///
    /// Targets must exist, inverse sides must point at an owning association,
    /// join columns must reference identity parts, `index_by` must name a
    /// target field.
    pub fn validate(&self) -> Result<()> {
        for name in self.entity_names() {
            let meta = self.get(&name)?;
            for assoc in &meta.associations {
                let target = self.get(&assoc.target)?;
                let target_parts = target.identity_parts();
                for jc in &assoc.join_columns {
                    if !target_parts.contains(&jc.referenced.as_str()) {
                        return Err(Error::invalid_mapping(
                            &meta.name,
                            format!(
                                "join column '{}' of '{}' references '{}', not an identity part of '{}'",
                                jc.column, assoc.name, jc.referenced, target.name
                            ),
                        ));
                    }
                }
                if let Some(jt) = &assoc.join_table {
                    let local_parts = meta.identity_parts();
                    let local_ok = jt
                        .local
                        .iter()
                        .all(|c| local_parts.contains(&c.referenced.as_str()));
                    let remote_ok = jt
                        .remote
                        .iter()
                        .all(|c| target_parts.contains(&c.referenced.as_str()));
                    if !local_ok || !remote_ok || jt.local.is_empty() || jt.remote.is_empty() {
                        return Err(Error::invalid_mapping(
                            &meta.name,
                            format!("join table '{}' does not reference both identifiers", jt.name),
                        ));
                    }
                }
                if let Some(mapped_by) = &assoc.mapped_by {
                    let owning = target.require_association(mapped_by)?;
                    if !owning.is_owning() || owning.target != meta.name {
                        return Err(Error::invalid_mapping(
                            &meta.name,
                            format!(
                                "'{}' is mapped by '{}.{}', which is not an owning association back to '{}'",
                                assoc.name, target.name, mapped_by, meta.name
                            ),
                        ));
                    }
                }
                if let Some(index_by) = &assoc.index_by {
                    if target.get_field(index_by).is_none() && !target_parts.contains(&index_by.as_str()) {
                        return Err(Error::unknown_field(&target.name, index_by));
                    }
                }
            }
        }
        Ok(())
    }

    fn entries_ref(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, Arc<EntityMetadata>>>> {
        self.entries
            .read()
            .map_err(|_| Error::Custom("metadata registry lock poisoned".to_string()))
    }

    fn entries_mut(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, Arc<EntityMetadata>>>> {
        self.entries
            .write()
            .map_err(|_| Error::Custom("metadata registry lock poisoned".to_string()))
    }
}
