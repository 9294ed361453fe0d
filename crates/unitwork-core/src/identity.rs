//! Entity identities.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};

/// Ordered (field, value) pairs forming the primary key of one entity.
///
/// Values are normalized on construction (see [`Value::normalized`]) so an
/// identity built from `Int(7)` equals one built from `BigInt(7)`. Field
/// order follows the identifier order declared in the entity metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityIdentity {
    parts: Vec<(String, Value)>,
}

impl EntityIdentity {
    pub fn new<K, V, I>(parts: I) -> Self
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            parts: parts
                .into_iter()
                .map(|(k, v)| (k.into(), v.into().normalized()))
                .collect(),
        }
    }

    /// Identity with a single identifier field.
    pub fn single(field: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new([(field.into(), value.into())])
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// True if the identity spans more than one field.
    pub fn is_composite(&self) -> bool {
        self.parts.len() > 1
    }

    /// Value of one identifier field.
    pub fn get(&self, field: &str) -> Option<&Value> {
        self.parts.iter().find(|(f, _)| f == field).map(|(_, v)| v)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.parts.iter().map(|(f, _)| f.as_str())
    }

    pub fn values(&self) -> impl Iterator<Item = &Value> {
        self.parts.iter().map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.parts.iter().map(|(f, v)| (f.as_str(), v))
    }

    /// An identity with a NULL part can never match a stored row.
    pub fn has_null(&self) -> bool {
        self.parts.iter().any(|(_, v)| v.is_null())
    }
}

impl Eq for EntityIdentity {}

impl Hash for EntityIdentity {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.parts.len().hash(state);
        for (field, value) in &self.parts {
            field.hash(state);
            value.hash_into(state);
        }
    }
}

impl fmt::Display for EntityIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, (field, value)) in self.parts.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{field}={value}")?;
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn integer_widths_compare_equal() {
        let a = EntityIdentity::single("id", Value::Int(3));
        let b = EntityIdentity::single("id", 3_i64);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn composite_identity_order_matters() {
        let ab = EntityIdentity::new([("user", 1_i64), ("merchant", 2_i64)]);
        let ba = EntityIdentity::new([("merchant", 2_i64), ("user", 1_i64)]);
        assert!(ab.is_composite());
        assert_ne!(ab, ba);
        assert_eq!(ab.get("merchant"), Some(&Value::BigInt(2)));
        assert_eq!(ab.to_string(), "[user=1, merchant=2]");
    }

    #[test]
    fn null_part_detected() {
        let id = EntityIdentity::new([("a", Value::BigInt(1)), ("b", Value::Null)]);
        assert!(id.has_null());
    }
}
