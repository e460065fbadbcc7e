use std::fmt;

/// What happens to a blob's resident data when its last handle closes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CachePolicy {
    /// Closed entries keep their paged-in data until filesystem teardown.
    NeverEvict,
    /// A closed entry's data is dropped immediately; the next open pages
    /// and verifies from storage again.
    EvictImmediately,
}

impl fmt::Display for CachePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NeverEvict => write!(f, "never-evict"),
            Self::EvictImmediately => write!(f, "evict-immediately"),
        }
    }
}
