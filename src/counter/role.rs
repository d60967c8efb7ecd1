use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use super::unit::Unit;

/// A named, unit-typed measurement dimension.
///
/// Equality and hashing consider the name only: two roles with the same
/// name are the same dimension regardless of the unit they were built with.
#[derive(Clone)]
pub struct Role {
    name: Arc<str>,
    unit: Unit,
}

impl Role {
    pub fn new(name: impl Into<Arc<str>>, unit: Unit) -> Self {
        Self {
            name: name.into(),
            unit,
        }
    }

    /// Timed business methods.
    pub fn performances() -> Self {
        Self::new("performances", Unit::NANOSECOND)
    }

    /// JDBC-style database calls.
    pub fn jdbc() -> Self {
        Self::new("jdbc", Unit::NANOSECOND)
    }

    /// Inbound web requests.
    pub fn web() -> Self {
        Self::new("web", Unit::NANOSECOND)
    }

    /// Failure counts.
    pub fn failures() -> Self {
        Self::new("failures", Unit::UNARY)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn unit(&self) -> Unit {
        self.unit
    }
}

impl PartialEq for Role {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for Role {}

impl Hash for Role {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Debug for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Role({} [{}])", self.name, self.unit)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
