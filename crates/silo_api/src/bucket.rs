//! Bucket identifiers and document-to-bucket mapping.
//!
//! A bucket is a logical partition of the document space, identified by a
//! 64-bit value: the top [`COUNT_BITS`] bits hold how many of the low data
//! bits are significant, the remaining bits hold the id data itself.
//! Buckets form a binary tree: a bucket with `n` used bits splits into two
//! children with `n + 1` used bits that differ in bit `n`.

use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};

use serde::Serialize;

/// Number of high bits reserved for the used-bit count.
pub const COUNT_BITS: u32 = 6;
/// Maximum number of significant data bits in a bucket id.
pub const MAX_USED_BITS: u32 = 64 - COUNT_BITS;

/// 64-bit bucket identifier. Equality and hashing are over the full raw
/// value, so two buckets with the same data bits but different used-bit
/// counts are distinct buckets.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct BucketId(u64);

impl BucketId {
    /// The null bucket. Messages without a bucket target (and out-of-band
    /// control work) carry this; it never participates in locking.
    pub const fn null() -> Self {
        BucketId(0)
    }

    /// Build a bucket id from a used-bit count and raw data bits. Data bits
    /// above `used_bits` are masked off so the id is canonical.
    pub fn new(used_bits: u32, data: u64) -> Self {
        assert!(
            used_bits >= 1 && used_bits <= MAX_USED_BITS,
            "bucket used bits {used_bits} out of range"
        );
        BucketId((u64::from(used_bits) << MAX_USED_BITS) | (data & Self::mask(used_bits)))
    }

    /// Reconstruct from a previously obtained raw value.
    pub const fn from_raw(raw: u64) -> Self {
        BucketId(raw)
    }

    /// Full 64-bit value, count bits included.
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// How many low data bits are significant.
    pub fn used_bits(self) -> u32 {
        (self.0 >> MAX_USED_BITS) as u32
    }

    /// The significant data bits.
    pub fn data(self) -> u64 {
        self.0 & Self::mask(self.used_bits())
    }

    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Whether `other` lives in this bucket's subtree. A bucket contains
    /// itself.
    pub fn contains(self, other: BucketId) -> bool {
        other.used_bits() >= self.used_bits()
            && (other.0 & Self::mask(self.used_bits())) == self.data()
    }

    /// The two children produced by splitting this bucket: both gain one
    /// used bit, differing in the new highest significant bit.
    pub fn split(self) -> (BucketId, BucketId) {
        let bits = self.used_bits();
        assert!(bits < MAX_USED_BITS, "bucket already at max used bits");
        (
            BucketId::new(bits + 1, self.data()),
            BucketId::new(bits + 1, self.data() | (1u64 << bits)),
        )
    }

    fn mask(bits: u32) -> u64 {
        if bits >= 64 {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        }
    }
}

impl fmt::Display for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Bucket(0x{:016x})", self.0)
    }
}

impl fmt::Debug for BucketId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Document identifier as received from the document API.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        DocumentId(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Maps document ids to the bucket their documents live in. Split remapping
/// consults this to decide which child a queued document operation belongs
/// to.
pub trait BucketIdFactory: Send + Sync {
    fn bucket_of(&self, doc: &DocumentId) -> BucketId;
}

/// Default factory: hashes the document id into the full 58-bit location
/// space. Any bucket in the tree above that location contains the document.
pub struct HashBucketIdFactory;

impl BucketIdFactory for HashBucketIdFactory {
    fn bucket_of(&self, doc: &DocumentId) -> BucketId {
        let mut hasher = DefaultHasher::new();
        doc.as_str().hash(&mut hasher);
        BucketId::new(MAX_USED_BITS, hasher.finish())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_masks_unused_bits() {
        let b = BucketId::new(4, 0xffff);
        assert_eq!(b.used_bits(), 4);
        assert_eq!(b.data(), 0xf);
        assert_eq!(b, BucketId::new(4, 0xf));
    }

    #[test]
    fn equality_is_over_full_id() {
        assert_ne!(BucketId::new(4, 0x8), BucketId::new(5, 0x8));
    }

    #[test]
    fn contains_checks_prefix_bits() {
        let parent = BucketId::new(3, 0b101);
        let (left, right) = parent.split();
        assert_eq!(left.used_bits(), 4);
        assert_eq!(right.data(), 0b1101);
        assert!(parent.contains(parent));
        assert!(parent.contains(left));
        assert!(parent.contains(right));
        assert!(!left.contains(parent));
        assert!(!parent.contains(BucketId::new(4, 0b0100)));
    }

    #[test]
    fn factory_location_is_contained_in_ancestors() {
        let factory = HashBucketIdFactory;
        let loc = factory.bucket_of(&DocumentId::new("id:music:song::1"));
        assert_eq!(loc.used_bits(), MAX_USED_BITS);
        let ancestor = BucketId::new(16, loc.data());
        assert!(ancestor.contains(loc));
    }

    #[test]
    fn null_bucket_is_null() {
        assert!(BucketId::null().is_null());
        assert!(!BucketId::new(1, 1).is_null());
    }
}
