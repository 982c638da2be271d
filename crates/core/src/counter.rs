//! Delta schemas: which counters a projected aggregate carries.
//!
//! Each aggregate type that is mirrored into the secondary index declares a
//! closed set of counters. The queue engine is generic over this set, so the
//! retry/backoff/dead-letter machinery is written once and reused for every
//! aggregate.

use core::fmt;
use core::hash::Hash;

use crate::error::DomainError;

/// A closed, ordered set of counter names for one aggregate type.
///
/// The `Ord` implementation defines the order in which deltas are forwarded
/// to the secondary store.
pub trait Counter: Copy + Ord + Eq + Hash + fmt::Debug + Send + Sync + 'static {
    /// Discriminator persisted alongside every queue row of this aggregate type.
    const TARGET_KIND: &'static str;

    /// Name of the secondary index this aggregate is projected into.
    const INDEX_NAME: &'static str;

    /// Every counter of the schema, in forwarding order.
    fn all() -> &'static [Self];

    /// Stable name used in persisted delta maps.
    fn as_str(&self) -> &'static str;

    /// Decode a persisted counter name.
    fn parse(name: &str) -> Result<Self, DomainError> {
        Self::all()
            .iter()
            .copied()
            .find(|c| c.as_str() == name)
            .ok_or_else(|| DomainError::unknown_counter(Self::TARGET_KIND, name))
    }
}

/// Counters of the project aggregate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ProjectCounter {
    Comment,
    Like,
    View,
}

impl Counter for ProjectCounter {
    const TARGET_KIND: &'static str = "project";
    const INDEX_NAME: &'static str = "project_index";

    fn all() -> &'static [Self] {
        &[Self::Comment, Self::Like, Self::View]
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Comment => "comment",
            Self::Like => "like",
            Self::View => "view",
        }
    }
}

/// Counters of the dataset aggregate.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum DataCounter {
    Download,
}

impl Counter for DataCounter {
    const TARGET_KIND: &'static str = "data";
    const INDEX_NAME: &'static str = "data_index";

    fn all() -> &'static [Self] {
        &[Self::Download]
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Download => "download",
        }
    }
}

impl fmt::Display for ProjectCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for DataCounter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
