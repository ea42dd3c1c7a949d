//! SHV RPC access levels.

/// Access level granted to a method call or required by a method.
///
/// Levels are ordered; a higher level implies all lower ones.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(i64)]
pub enum AccessLevel {
    Browse = 1,
    Read = 8,
    Write = 16,
    Command = 24,
    Config = 32,
    Service = 40,
    SuperService = 48,
    Devel = 56,
    Admin = 63,
}

impl AccessLevel {
    pub const ALL: [AccessLevel; 9] = [
        AccessLevel::Browse,
        AccessLevel::Read,
        AccessLevel::Write,
        AccessLevel::Command,
        AccessLevel::Config,
        AccessLevel::Service,
        AccessLevel::SuperService,
        AccessLevel::Devel,
        AccessLevel::Admin,
    ];

    /// Short name used in configuration files and the legacy access string.
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessLevel::Browse => "bws",
            AccessLevel::Read => "rd",
            AccessLevel::Write => "wr",
            AccessLevel::Command => "cmd",
            AccessLevel::Config => "cfg",
            AccessLevel::Service => "srv",
            AccessLevel::SuperService => "ssrv",
            AccessLevel::Devel => "dev",
            AccessLevel::Admin => "su",
        }
    }

    pub fn from_str_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|l| l.as_str() == name)
    }

    /// Highest defined level that is not above `value`; integers between the
    /// defined levels degrade to the nearest one below.
    pub fn from_value(value: i64) -> Option<Self> {
        Self::ALL.iter().copied().rev().find(|l| *l as i64 <= value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_are_ordered() {
        assert!(AccessLevel::Browse < AccessLevel::Read);
        assert!(AccessLevel::Devel < AccessLevel::Admin);
        assert_eq!(AccessLevel::Admin as i64, 63);
    }

    #[test]
    fn test_name_round_trip() {
        for level in AccessLevel::ALL {
            assert_eq!(AccessLevel::from_str_name(level.as_str()), Some(level));
        }
        assert_eq!(AccessLevel::from_str_name("root"), None);
    }

    #[test]
    fn test_from_value_degrades_to_nearest_below() {
        assert_eq!(AccessLevel::from_value(8), Some(AccessLevel::Read));
        assert_eq!(AccessLevel::from_value(9), Some(AccessLevel::Read));
        assert_eq!(AccessLevel::from_value(62), Some(AccessLevel::Devel));
        assert_eq!(AccessLevel::from_value(0), None);
    }
}
