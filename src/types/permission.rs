use std::fmt;

use serde::de::{self, Deserializer, Visitor};
use serde::{Deserialize, Serialize, Serializer};

/// Permission is an ordered access level; a higher level implies every lower one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Permission(u8);

impl Permission {
    pub const VIEW: Permission = Permission(0);
    pub const COMMENT: Permission = Permission(1);
    pub const CONTRIBUTE: Permission = Permission(2);
    pub const EDIT: Permission = Permission(3);
    pub const SHARE: Permission = Permission(4);
    pub const DELETE: Permission = Permission(5);
    /// Only meaningful on a type-level (wildcard) grant.
    pub const CREATE: Permission = Permission(6);
    pub const OWNER: Permission = Permission(7);

    pub const MAX_LEVEL: u8 = 7;

    const NAMES: [&'static str; 8] = [
        "view",
        "comment",
        "contribute",
        "edit",
        "share",
        "delete",
        "create",
        "owner",
    ];

    /// Builds a level from its numeric form, rejecting anything outside 0..=7.
    pub const fn new(level: u8) -> Option<Self> {
        if level <= Self::MAX_LEVEL {
            Some(Self(level))
        } else {
            None
        }
    }

    pub const fn level(self) -> u8 {
        self.0
    }

    /// Returns true if this level satisfies the required level.
    #[must_use]
    pub const fn satisfies(self, required: Permission) -> bool {
        self.0 >= required.0
    }

    /// Lowers this level to at most `cap`.
    #[must_use]
    pub fn capped_at(self, cap: Permission) -> Permission {
        self.min(cap)
    }

    /// Parses either a level name ("edit") or its number ("3").
    pub fn parse(s: &str) -> Option<Permission> {
        let s = s.trim();
        if let Ok(n) = s.parse::<u8>() {
            return Self::new(n);
        }
        Self::NAMES
            .iter()
            .position(|name| name.eq_ignore_ascii_case(s))
            .map(|idx| Permission(idx as u8))
    }

    #[must_use]
    pub fn name(self) -> &'static str {
        Self::NAMES[self.0 as usize]
    }

    pub fn all() -> impl Iterator<Item = Permission> {
        (0..=Self::MAX_LEVEL).map(Permission)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl TryFrom<i64> for Permission {
    type Error = i64;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .ok()
            .and_then(Permission::new)
            .ok_or(value)
    }
}

impl From<Permission> for i64 {
    fn from(p: Permission) -> Self {
        i64::from(p.0)
    }
}

impl Serialize for Permission {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.0)
    }
}

// Accepts both the integer wire form and the level name.
impl<'de> Deserialize<'de> for Permission {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        struct LevelVisitor;

        impl Visitor<'_> for LevelVisitor {
            type Value = Permission;

            fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
                f.write_str("a permission level 0..7 or a level name")
            }

            fn visit_u64<E: de::Error>(self, v: u64) -> Result<Permission, E> {
                u8::try_from(v)
                    .ok()
                    .and_then(Permission::new)
                    .ok_or_else(|| E::custom(format!("permission level out of range: {v}")))
            }

            fn visit_i64<E: de::Error>(self, v: i64) -> Result<Permission, E> {
                Permission::try_from(v)
                    .map_err(|v| E::custom(format!("permission level out of range: {v}")))
            }

            fn visit_str<E: de::Error>(self, v: &str) -> Result<Permission, E> {
                Permission::parse(v).ok_or_else(|| E::custom(format!("invalid permission: {v}")))
            }
        }

        deserializer.deserialize_any(LevelVisitor)
    }
}
