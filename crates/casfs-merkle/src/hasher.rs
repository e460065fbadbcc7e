use casfs_types::Digest;

/// Domain tag for leaf (chunk) hashes.
const LEAF_DOMAIN: &[u8] = b"casfs-leaf-v1:";

/// Domain tag for interior tree hashes.
const INTERIOR_DOMAIN: &[u8] = b"casfs-tree-v1:";

/// Hash one content chunk.
///
/// The chunk index is mixed into the hash so identical chunks at different
/// offsets produce different leaves -- a transposed chunk fails
/// verification even when its bytes are intact.
pub fn leaf_hash(index: u64, chunk: &[u8]) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(LEAF_DOMAIN);
    hasher.update(&index.to_le_bytes());
    hasher.update(chunk);
    Digest::from_hash(*hasher.finalize().as_bytes())
}

/// Hash a group of child digests into their parent.
///
/// The level (1 = parents of leaves) keeps interior nodes from colliding
/// with leaves or with interior nodes of a different height.
pub fn interior_hash(level: u32, children: &[Digest]) -> Digest {
    let mut hasher = blake3::Hasher::new();
    hasher.update(INTERIOR_DOMAIN);
    hasher.update(&level.to_le_bytes());
    for child in children {
        hasher.update(child.as_bytes());
    }
    Digest::from_hash(*hasher.finalize().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leaf_hash_is_deterministic() {
        assert_eq!(leaf_hash(0, b"data"), leaf_hash(0, b"data"));
    }

    #[test]
    fn leaf_hash_depends_on_index() {
        assert_ne!(leaf_hash(0, b"data"), leaf_hash(1, b"data"));
    }

    #[test]
    fn leaf_and_interior_domains_are_separated() {
        let d = leaf_hash(0, b"x");
        assert_ne!(interior_hash(1, &[d]), leaf_hash(1, d.as_bytes()));
    }

    #[test]
    fn interior_hash_depends_on_level() {
        let d = leaf_hash(0, b"x");
        assert_ne!(interior_hash(1, &[d]), interior_hash(2, &[d]));
    }
}
