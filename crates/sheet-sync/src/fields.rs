//! Syncable field keys and the per-record dirty bitmask.
//!
//! The ordinal of each `FieldKey` is its bit position in `FieldMask`. Masks are
//! persisted with every sheet, so the enumeration is part of the on-disk
//! format: append new keys at the end, never reorder or reuse a bit.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{BitOr, BitOrAssign};

macro_rules! field_keys {
    ($($(#[$meta:meta])* $variant:ident = $bit:literal => $name:literal),+ $(,)?) => {
        /// A syncable field of a sheet.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u8)]
        pub enum FieldKey {
            $($(#[$meta])* $variant = $bit),+
        }

        impl FieldKey {
            /// Every key, in bit order.
            pub const ALL: &'static [FieldKey] = &[$(FieldKey::$variant),+];

            /// Field name in the remote record.
            pub const fn name(self) -> &'static str {
                match self {
                    $(FieldKey::$variant => $name),+
                }
            }

            /// Look up a key by its remote field name.
            pub fn from_name(name: &str) -> Option<Self> {
                match name {
                    $($name => Some(FieldKey::$variant),)+
                    _ => None,
                }
            }
        }
    };
}

field_keys! {
    /// Natural key, fixed at creation
    Key = 0 => "key",
    Name = 1 => "name",
    Notes = 2 => "notes",
    SortOrder = 3 => "sortOrder",
    /// Ordered column list, stored remotely as one blob
    Columns = 4 => "columns",
    CreatedAt = 5 => "createdAt",
    ModifiedAt = 6 => "modifiedAt",
}

impl FieldKey {
    /// Bit for this key in a `FieldMask`.
    pub const fn bit(self) -> u64 {
        1 << (self as u8)
    }

    /// Whether the value is cheap to compare after an upload.
    ///
    /// Blob fields are trusted as uploaded.
    pub const fn is_scalar(self) -> bool {
        !matches!(self, FieldKey::Columns)
    }
}

impl fmt::Display for FieldKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of fields with local values not yet confirmed uploaded.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FieldMask(u64);

impl FieldMask {
    pub const fn empty() -> Self {
        Self(0)
    }

    /// Mask with every known field set.
    pub fn all() -> Self {
        FieldKey::ALL.iter().copied().collect()
    }

    /// Rebuild a mask from persisted bits. Unknown bits are kept so that a
    /// newer build's fields survive a round-trip through an older one.
    pub const fn from_bits_retain(bits: u64) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u64 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, key: FieldKey) -> bool {
        self.0 & key.bit() != 0
    }

    pub fn insert(&mut self, key: FieldKey) {
        self.0 |= key.bit();
    }

    pub fn remove(&mut self, key: FieldKey) {
        self.0 &= !key.bit();
    }

    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    /// Known keys in this mask, in bit order.
    pub fn iter(self) -> impl Iterator<Item = FieldKey> {
        FieldKey::ALL.iter().copied().filter(move |key| self.contains(*key))
    }
}

impl FromIterator<FieldKey> for FieldMask {
    fn from_iter<I: IntoIterator<Item = FieldKey>>(iter: I) -> Self {
        let mut mask = Self::empty();
        for key in iter {
            mask.insert(key);
        }
        mask
    }
}

impl From<FieldKey> for FieldMask {
    fn from(key: FieldKey) -> Self {
        Self(key.bit())
    }
}

impl BitOr for FieldMask {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        self.union(rhs)
    }
}

impl BitOrAssign for FieldMask {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

impl fmt::Display for FieldMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<_> = self.iter().map(FieldKey::name).collect();
        write!(f, "[{}]", names.join(", "))
    }
}
