//! Shard, bucket and key derivation.
//!
//! A hash is split purely by string slicing:
//!
//! ```text
//! a 3 7f 09c2e1d ...
//! | | |  |
//! | | |  +-- key: `key_len` characters
//! | | +----- sub-bucket: `key_index` characters (optional)
//! | +------- root bucket: `bucket_chars` characters
//! +--------- shard: first character
//! ```
//!
//! Because the bucket set is created up front and never resized, routing a
//! hash never needs to consult the store.

use std::fmt;

use fhist_error::{HistoryError, Result};

/// Number of index shards (one per leading hex character).
pub const SHARD_COUNT: usize = 16;

/// One of the sixteen index shards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ShardId(u8);

impl ShardId {
    /// Shard for a leading hex character.
    #[must_use]
    pub const fn from_hex_char(c: u8) -> Option<Self> {
        match c {
            b'0'..=b'9' => Some(Self(c - b'0')),
            b'a'..=b'f' => Some(Self(c - b'a' + 10)),
            _ => None,
        }
    }

    /// Shard for a zero-based slot index (`0..16`).
    #[must_use]
    pub const fn from_index(index: usize) -> Option<Self> {
        if index < SHARD_COUNT {
            Some(Self(index as u8))
        } else {
            None
        }
    }

    /// Shard owning `hash`, by its first character.
    pub fn of_hash(hash: &str) -> Result<Self> {
        hash.as_bytes()
            .first()
            .copied()
            .and_then(Self::from_hex_char)
            .ok_or_else(|| HistoryError::InvalidHash {
                hash: hash.to_owned(),
                reason: "hash must start with a lowercase hex character",
            })
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    #[must_use]
    pub const fn as_char(self) -> char {
        if self.0 < 10 {
            (b'0' + self.0) as char
        } else {
            (b'a' + self.0 - 10) as char
        }
    }

    /// All shards in slot order.
    pub fn all() -> impl Iterator<Item = Self> {
        (0..SHARD_COUNT as u8).map(Self)
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_char())
    }
}

/// Fixed partitioning of every shard, chosen at store creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BucketLayout {
    /// Hash characters selecting the root bucket (1..=3).
    pub bucket_chars: u8,
    /// Hash characters selecting a sub-bucket (0 disables sub-buckets).
    pub key_index: u8,
    /// Characters kept as the stored key.
    pub key_len: u8,
}

impl BucketLayout {
    #[must_use]
    pub const fn new(bucket_chars: u8, key_index: u8, key_len: u8) -> Self {
        Self {
            bucket_chars,
            key_index,
            key_len,
        }
    }

    /// Root buckets per shard.
    #[must_use]
    pub const fn root_buckets(&self) -> usize {
        1 << (4 * self.bucket_chars as u32)
    }

    /// Sub-buckets per root bucket (zero when key splitting is off).
    #[must_use]
    pub const fn sub_buckets(&self) -> usize {
        if self.key_index == 0 {
            0
        } else {
            1 << (4 * self.key_index as u32)
        }
    }

    /// Hash characters consumed before the key starts.
    #[must_use]
    pub const fn prefix_len(&self) -> usize {
        1 + self.bucket_chars as usize + self.key_index as usize
    }

    /// Minimum hash length this layout can route.
    #[must_use]
    pub const fn min_hash_len(&self) -> usize {
        self.prefix_len() + self.key_len as usize
    }

    /// Hex name of root bucket `index`.
    #[must_use]
    pub fn bucket_name(&self, index: usize) -> String {
        format!("{index:0width$x}", width = self.bucket_chars as usize)
    }

    /// Backend tree name for a root bucket and optional sub-bucket.
    #[must_use]
    pub fn tree_name(bucket: &str, sub: Option<&str>) -> String {
        match sub {
            Some(sub) => format!("{bucket}/{sub}"),
            None => bucket.to_owned(),
        }
    }

    /// Every backend tree of one shard, root buckets first within each group.
    #[must_use]
    pub fn tree_names(&self) -> Vec<String> {
        let subs = self.sub_buckets();
        let mut names = Vec::with_capacity(self.root_buckets() * subs.max(1));
        for bucket in 0..self.root_buckets() {
            let bucket_name = self.bucket_name(bucket);
            if subs == 0 {
                names.push(bucket_name);
                continue;
            }
            for sub in 0..subs {
                let sub_name = format!("{sub:0width$x}", width = self.key_index as usize);
                names.push(Self::tree_name(&bucket_name, Some(&sub_name)));
            }
        }
        names
    }

    /// Stable description persisted next to each shard's trees.
    #[must_use]
    pub fn marker(&self) -> String {
        format!(
            "buckets={};key_index={};key_len={}",
            self.bucket_chars, self.key_index, self.key_len
        )
    }

    /// Split `hash` into its shard, bucket, sub-bucket and key.
    pub fn route(&self, hash: &str) -> Result<Route> {
        let shard = ShardId::of_hash(hash)?;
        if hash.len() < self.min_hash_len() {
            return Err(HistoryError::InvalidHash {
                hash: hash.to_owned(),
                reason: "hash shorter than the bucket layout requires",
            });
        }
        if !hash.is_ascii() {
            return Err(HistoryError::InvalidHash {
                hash: hash.to_owned(),
                reason: "hash must be ascii hex",
            });
        }

        let bucket_end = 1 + self.bucket_chars as usize;
        let bucket_name = &hash[1..bucket_end];
        let bucket = usize::from_str_radix(bucket_name, 16).map_err(|_| {
            HistoryError::InvalidHash {
                hash: hash.to_owned(),
                reason: "bucket characters are not hex",
            }
        })?;

        let prefix_end = self.prefix_len();
        let sub = (self.key_index > 0).then(|| &hash[bucket_end..prefix_end]);
        let key_end = prefix_end + self.key_len as usize;

        Ok(Route {
            shard,
            bucket,
            tree: Self::tree_name(bucket_name, sub),
            key: hash[prefix_end..key_end].to_owned(),
            composite: hash[..key_end].to_owned(),
        })
    }
}

impl Default for BucketLayout {
    fn default() -> Self {
        Self::new(1, 0, 7)
    }
}

/// Where one hash lives in the index.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Route {
    pub shard: ShardId,
    /// Root bucket slot within the shard.
    pub bucket: usize,
    /// Backend tree holding the key (root bucket or sub-bucket).
    pub tree: String,
    /// Stored key.
    pub key: String,
    /// Hash prefix up to the end of the key; unique per index entry.
    pub composite: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_ids_cover_hex_alphabet() {
        let chars: String = ShardId::all().map(ShardId::as_char).collect();
        assert_eq!(chars, "0123456789abcdef");
        for shard in ShardId::all() {
            assert_eq!(ShardId::from_hex_char(shard.as_char() as u8), Some(shard));
        }
        assert_eq!(ShardId::from_hex_char(b'g'), None);
        assert_eq!(ShardId::from_hex_char(b'A'), None);
    }

    #[test]
    fn routes_by_string_slicing() {
        let layout = BucketLayout::new(1, 0, 6);
        let route = layout.route("a3f09c2e1d77").expect("route");
        assert_eq!(route.shard.as_char(), 'a');
        assert_eq!(route.bucket, 3);
        assert_eq!(route.tree, "3");
        assert_eq!(route.key, "f09c2e");
        assert_eq!(route.composite, "a3f09c2e");
    }

    #[test]
    fn routes_through_sub_buckets() {
        let layout = BucketLayout::new(2, 1, 4);
        let route = layout.route("0ff7abcdef").expect("route");
        assert_eq!(route.bucket, 0xff);
        assert_eq!(route.tree, "ff/7");
        assert_eq!(route.key, "abcd");
        assert_eq!(route.composite, "0ff7abcd");
    }

    #[test]
    fn tree_names_are_fixed_by_layout() {
        let flat = BucketLayout::new(1, 0, 7);
        assert_eq!(flat.root_buckets(), 16);
        assert_eq!(flat.sub_buckets(), 0);
        assert_eq!(flat.tree_names().len(), 16);

        let split = BucketLayout::new(2, 1, 7);
        let names = split.tree_names();
        assert_eq!(names.len(), 256 * 16);
        assert_eq!(names.first().map(String::as_str), Some("00/0"));
        assert_eq!(names.last().map(String::as_str), Some("ff/f"));
    }

    #[test]
    fn short_hash_is_rejected() {
        let layout = BucketLayout::new(1, 0, 7);
        let err = layout.route("a3f0").expect_err("too short");
        assert!(matches!(err, HistoryError::InvalidHash { .. }));
    }
}
