// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

/// An 128-bit checksum
///
/// Used to verify that the sharded sparse feature streams survive a whole
/// tree of splits and the finalize merge unchanged.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Checksum(u128);

impl std::fmt::Display for Checksum {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl Checksum {
    /// Wraps a checksum value.
    #[must_use]
    pub fn from_raw(value: u128) -> Self {
        Self(value)
    }

    /// Returns the raw 128-bit integer.
    #[must_use]
    pub fn into_u128(self) -> u128 {
        self.0
    }

    /// Checksums a byte slice.
    #[must_use]
    pub fn of_bytes(bytes: &[u8]) -> Self {
        Self(xxhash_rust::xxh3::xxh3_128(bytes))
    }

    /// Checksums a word slice, streamed in little-endian byte order.
    #[must_use]
    pub fn of_words(words: &[u64]) -> Self {
        let mut hasher = xxhash_rust::xxh3::Xxh3Default::new();
        for word in words {
            hasher.update(&word.to_le_bytes());
        }
        Self(hasher.digest128())
    }
}
