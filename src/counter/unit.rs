use std::fmt;

use thiserror::Error;

/// Errors raised when converting a value between units.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnitError {
    /// The two units measure different dimensions (e.g. time vs. bytes).
    #[error("incompatible units: cannot convert {from} into {to}")]
    IncompatibleUnits {
        from: &'static str,
        to: &'static str,
    },
}

/// A measurement unit: a primary unit (`ns`, `b`, `u`) or a unit derived
/// from it by a linear scale factor.
///
/// Two units are convertible iff they share the same primary unit.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Unit {
    name: &'static str,
    primary: &'static str,
    scale: u64,
}

impl Unit {
    // Time family, primary unit nanosecond.
    pub const NANOSECOND: Unit = Unit::primary("ns");
    pub const MICROSECOND: Unit = Unit::derived("us", Unit::NANOSECOND, 1_000);
    pub const MILLISECOND: Unit = Unit::derived("ms", Unit::MICROSECOND, 1_000);
    pub const SECOND: Unit = Unit::derived("s", Unit::MILLISECOND, 1_000);
    pub const MINUTE: Unit = Unit::derived("min", Unit::SECOND, 60);
    pub const HOUR: Unit = Unit::derived("h", Unit::MINUTE, 60);
    pub const DAY: Unit = Unit::derived("day", Unit::HOUR, 24);

    // Binary family, primary unit byte.
    pub const BYTE: Unit = Unit::primary("b");
    pub const KBYTE: Unit = Unit::derived("Kb", Unit::BYTE, 1_024);
    pub const MBYTE: Unit = Unit::derived("Mb", Unit::KBYTE, 1_024);
    pub const GBYTE: Unit = Unit::derived("Gb", Unit::MBYTE, 1_024);

    // Unary family for plain counts.
    pub const UNARY: Unit = Unit::primary("u");
    pub const DECA: Unit = Unit::derived("*10", Unit::UNARY, 10);
    pub const HECTO: Unit = Unit::derived("*100", Unit::DECA, 10);
    pub const KILO: Unit = Unit::derived("*1000", Unit::HECTO, 10);
    pub const MEGA: Unit = Unit::derived("*10^6", Unit::KILO, 1_000);
    pub const GIGA: Unit = Unit::derived("*10^9", Unit::MEGA, 1_000);
    pub const TERA: Unit = Unit::derived("*10^12", Unit::GIGA, 1_000);

    /// Every unit known to the registry, smallest first within a family.
    pub const ALL: [Unit; 18] = [
        Unit::NANOSECOND,
        Unit::MICROSECOND,
        Unit::MILLISECOND,
        Unit::SECOND,
        Unit::MINUTE,
        Unit::HOUR,
        Unit::DAY,
        Unit::BYTE,
        Unit::KBYTE,
        Unit::MBYTE,
        Unit::GBYTE,
        Unit::UNARY,
        Unit::DECA,
        Unit::HECTO,
        Unit::KILO,
        Unit::MEGA,
        Unit::GIGA,
        Unit::TERA,
    ];

    const fn primary(name: &'static str) -> Self {
        Self {
            name,
            primary: name,
            scale: 1,
        }
    }

    const fn derived(name: &'static str, base: Unit, factor: u64) -> Self {
        Self {
            name,
            primary: base.primary,
            scale: base.scale * factor,
        }
    }

    /// Resolves a unit by its wire name. `µs` is accepted as an alias of `us`.
    pub fn by_name(name: &str) -> Option<Unit> {
        if name == "µs" {
            return Some(Unit::MICROSECOND);
        }
        Unit::ALL.iter().copied().find(|u| u.name == name)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Name of the primary unit of this unit's family.
    pub fn primary_name(&self) -> &'static str {
        self.primary
    }

    /// Number of primary units in one of this unit.
    pub fn scale(&self) -> u64 {
        self.scale
    }

    pub fn is_compatible(&self, other: &Unit) -> bool {
        self.primary == other.primary
    }

    /// Converts `value`, expressed in `from`, into this unit.
    pub fn convert(&self, value: f64, from: &Unit) -> Result<f64, UnitError> {
        if !self.is_compatible(from) {
            return Err(UnitError::IncompatibleUnits {
                from: from.name,
                to: self.name,
            });
        }
        if self.scale == from.scale {
            return Ok(value);
        }
        Ok(value * from.scale as f64 / self.scale as f64)
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Unit({})", self.name)
    }
}

impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_time_scales() {
        assert_eq!(Unit::MICROSECOND.scale(), 1_000);
        assert_eq!(Unit::SECOND.scale(), 1_000_000_000);
        assert_eq!(Unit::DAY.scale(), 86_400_000_000_000);
        assert_eq!(Unit::GBYTE.scale(), 1 << 30);
        assert_eq!(Unit::TERA.scale(), 1_000_000_000_000);
    }

    #[test]
    fn test_convert_within_family() {
        let ms = Unit::MILLISECOND
            .convert(2.0, &Unit::SECOND)
            .expect("same family");
        assert_eq!(ms, 2_000.0);

        let ns = Unit::NANOSECOND
            .convert(1.5, &Unit::MICROSECOND)
            .expect("same family");
        assert_eq!(ns, 1_500.0);

        let kb = Unit::KBYTE.convert(2_048.0, &Unit::BYTE).expect("same family");
        assert_eq!(kb, 2.0);
    }

    #[test]
    fn test_convert_incompatible_fails() {
        let err = Unit::NANOSECOND
            .convert(1.0, &Unit::BYTE)
            .expect_err("time vs bytes");
        assert_eq!(
            err,
            UnitError::IncompatibleUnits {
                from: "b",
                to: "ns"
            }
        );
        assert!(Unit::UNARY.convert(1.0, &Unit::SECOND).is_err());
    }

    #[test]
    fn test_by_name() {
        assert_eq!(Unit::by_name("ns"), Some(Unit::NANOSECOND));
        assert_eq!(Unit::by_name("µs"), Some(Unit::MICROSECOND));
        assert_eq!(Unit::by_name("Mb"), Some(Unit::MBYTE));
        assert_eq!(Unit::by_name("*10^9"), Some(Unit::GIGA));
        assert_eq!(Unit::by_name("parsec"), None);
    }
}
