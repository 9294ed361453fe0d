//! ORDER BY terms of a fetch plan.

use regex::Regex;
use std::fmt;
use std::sync::OnceLock;
use unitwork_core::{Error, Result};

/// Sort direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum OrderDirection {
    #[default]
    Asc,
    Desc,
}

impl OrderDirection {
    pub const fn as_str(&self) -> &'static str {
        match self {
            OrderDirection::Asc => "ASC",
            OrderDirection::Desc => "DESC",
        }
    }
}

/// One ordering term: `alias.name [ASC|DESC]`.
///
/// `name` is a field name, or a storage column for foreign key columns
/// that have no field of their own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderBy {
    pub alias: String,
    pub name: String,
    pub direction: OrderDirection,
}

fn term_regex() -> Result<&'static Regex> {
    static TERM: OnceLock<Option<Regex>> = OnceLock::new();
    TERM.get_or_init(|| {
        Regex::new(r"(?i)^\s*(?:([A-Za-z_][A-Za-z0-9_]*)\.)?([A-Za-z_][A-Za-z0-9_]*)(?:\s+(asc|desc))?\s*$")
            .ok()
    })
    .as_ref()
    .ok_or_else(|| Error::Custom("ordering pattern failed to compile".to_string()))
}

impl OrderBy {
    pub fn asc(alias: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            name: name.into(),
            direction: OrderDirection::Asc,
        }
    }

    pub fn desc(alias: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            alias: alias.into(),
            name: name.into(),
            direction: OrderDirection::Desc,
        }
    }

    /// Parse a comma separated list such as `"b.id ASC, h.name DESC"`.
    ///
    /// Terms without an alias (`"name DESC"`, as written in association
    /// mappings) get `default_alias`.
    pub fn parse_list(input: &str, default_alias: Option<&str>) -> Result<Vec<OrderBy>> {
        let mut terms = Vec::new();
        for raw in input.split(',') {
            if raw.trim().is_empty() {
                continue;
            }
            let caps = term_regex()?
                .captures(raw)
                .ok_or_else(|| Error::Custom(format!("invalid ordering term '{}'", raw.trim())))?;
            let alias = match (caps.get(1), default_alias) {
                (Some(a), _) => a.as_str().to_string(),
                (None, Some(d)) => d.to_string(),
                (None, None) => {
                    return Err(Error::Custom(format!(
                        "ordering term '{}' needs an alias",
                        raw.trim()
                    )));
                }
            };
            let direction = match caps.get(3).map(|m| m.as_str().to_ascii_uppercase()) {
                Some(d) if d == "DESC" => OrderDirection::Desc,
                _ => OrderDirection::Asc,
            };
            terms.push(OrderBy {
                alias,
                name: caps[2].to_string(),
                direction,
            });
        }
        Ok(terms)
    }
}

impl fmt::Display for OrderBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{} {}", self.alias, self.name, self.direction.as_str())
    }
}
