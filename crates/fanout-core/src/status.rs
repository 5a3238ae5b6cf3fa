//! Upstream sync status.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Health of the upstream connection when a breadcrumb was created.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStatus {
    /// Initial load in progress; data may be incomplete.
    #[default]
    Resyncing,
    /// A complete, consistent view has been established.
    InSync,
}

impl SyncStatus {
    /// Whether the upstream view is complete.
    #[inline]
    pub const fn is_in_sync(&self) -> bool {
        matches!(self, Self::InSync)
    }

    /// Static label, used for logs and metrics.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Resyncing => "resyncing",
            Self::InSync => "in_sync",
        }
    }
}

impl fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
