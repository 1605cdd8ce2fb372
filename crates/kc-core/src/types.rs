//! Entity type identifiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// The storable entity types.
///
/// Used as the key of the backend table, of cascade hooks and of
/// per-type configuration overrides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EntityType {
    /// Realms.
    Realm,
    /// Clients.
    Client,
    /// Groups.
    Group,
    /// Roles.
    Role,
    /// Users.
    User,
    /// User sessions (client sessions are owned by them).
    UserSession,
}

impl EntityType {
    /// All entity types, parents before dependents.
    pub const ALL: [Self; 6] = [
        Self::Realm,
        Self::Client,
        Self::Group,
        Self::Role,
        Self::User,
        Self::UserSession,
    ];

    /// Stable name used in logs, storage tables and configuration keys.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Realm => "realm",
            Self::Client => "client",
            Self::Group => "group",
            Self::Role => "role",
            Self::User => "user",
            Self::UserSession => "user-session",
        }
    }

    /// Environment variable suffix, e.g. `USER_SESSION`.
    #[must_use]
    pub fn env_suffix(self) -> String {
        self.as_str().replace('-', "_").to_uppercase()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s) || t.env_suffix().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown entity type '{s}'"))
    }
}
