use serde::{Deserialize, Serialize};

/// Caller privilege, lowest first.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum AuthorizationTier {
    ReadOnly,
    Operator,
    Admin,
}

impl AuthorizationTier {
    pub fn allows(self, required: AuthorizationTier) -> bool {
        self >= required
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthzSummary {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub role: AuthorizationTier,
}
