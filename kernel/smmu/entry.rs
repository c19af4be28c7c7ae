//! Translation entry encoding.
//!
//! Every table slot, L1 or L2, is one 32-bit word:
//!
//! ```text
//!  31                                  8 7     5   4    3    2   1  0
//! +-------------------------------------+-------+----+----+----+------+
//! |        physical base >> 12          |  res  |PRIV| SH | C  | kind |
//! +-------------------------------------+-------+----+----+----+------+
//! ```
//!
//! Keeping the base shifted by the page size gives 36 bits of physical reach
//! in a 32-bit word. The two kind bits are interpreted per level:
//!
//! | kind | L1 slot        | L2 slot                  |
//! |------|----------------|--------------------------|
//! | 00   | unmapped       | unmapped                 |
//! | 01   | L2 pointer     | large page (one of 16)   |
//! | 10   | 1 MiB section  | 4 KiB small page         |

use bitflags::bitflags;

/// Small page size (4 KiB).
pub const SMALL_PAGE_SIZE: u64 = 1 << SMALL_PAGE_SHIFT;
pub const SMALL_PAGE_SHIFT: u32 = 12;

/// Large page size (64 KiB, 16 contiguous L2 slots).
pub const LARGE_PAGE_SIZE: u64 = 1 << 16;

/// Section size (1 MiB, one L1 slot).
pub const SECTION_SIZE: u64 = 1 << SECTION_SHIFT;
pub const SECTION_SHIFT: u32 = 20;

/// L2 slots covered by one large page.
pub const LARGE_PAGE_SLOTS: usize = (LARGE_PAGE_SIZE / SMALL_PAGE_SIZE) as usize;

/// L1 slots: one per MiB of a 36-bit IOVA space.
pub const L1_ENTRIES: usize = 1 << 16;

/// L2 slots: one per 4 KiB inside a MiB.
pub const L2_ENTRIES: usize = 1 << 8;

/// Highest IOVA (exclusive) the two-level table can describe.
pub const IOVA_LIMIT: u64 = (L1_ENTRIES as u64) << SECTION_SHIFT;

/// Highest physical address (exclusive) an entry can encode.
pub const PHYS_LIMIT: u64 = 1 << 36;

const KIND_MASK: u32 = 0b11;
const KIND_NONE: u32 = 0b00;
const KIND_TABLE_OR_LARGE: u32 = 0b01;
const KIND_SECTION_OR_SMALL: u32 = 0b10;
const ATTR_MASK: u32 = 0b1_1100;
const BASE_SHIFT: u32 = 8;

bitflags! {
    /// Mapping protection requested by the caller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        /// Request a cacheable, shareable translation.
        const CACHE = 1 << 2;
        /// Privileged-access hint.
        const PRIV = 1 << 3;
    }
}

bitflags! {
    /// Attribute bits stored in an entry.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct EntryAttrs: u32 {
        const CACHEABLE = 1 << 2;
        const SHAREABLE = 1 << 3;
        const PRIVILEGED = 1 << 4;
    }
}

impl EntryAttrs {
    /// Derive entry attributes from a caller's protection request.
    ///
    /// `cacheable_override` forces cacheable + shareable regardless of `prot`.
    pub fn from_prot(prot: Prot, cacheable_override: bool) -> Self {
        let mut attrs = Self::empty();
        if prot.contains(Prot::CACHE) || cacheable_override {
            attrs |= Self::CACHEABLE | Self::SHAREABLE;
        }
        if prot.contains(Prot::PRIV) {
            attrs |= Self::PRIVILEGED;
        }
        attrs
    }
}

/// Mapping granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    /// 4 KiB, one L2 slot.
    Small,
    /// 64 KiB, sixteen L2 slots.
    Large,
    /// 1 MiB, one L1 slot.
    Section,
}

impl PageSize {
    /// Map a byte size onto a supported granularity.
    pub const fn from_bytes(size: u64) -> Option<Self> {
        match size {
            SMALL_PAGE_SIZE => Some(Self::Small),
            LARGE_PAGE_SIZE => Some(Self::Large),
            SECTION_SIZE => Some(Self::Section),
            _ => None,
        }
    }

    pub const fn bytes(self) -> u64 {
        match self {
            Self::Small => SMALL_PAGE_SIZE,
            Self::Large => LARGE_PAGE_SIZE,
            Self::Section => SECTION_SIZE,
        }
    }

    /// Offset mask within one mapping of this size.
    #[inline]
    pub const fn offset_mask(self) -> u64 {
        self.bytes() - 1
    }
}

/// L1 slot index for an IOVA.
#[inline]
pub const fn l1_index(iova: u64) -> usize {
    ((iova >> SECTION_SHIFT) as usize) & (L1_ENTRIES - 1)
}

/// L2 slot index for an IOVA.
#[inline]
pub const fn l2_index(iova: u64) -> usize {
    ((iova >> SMALL_PAGE_SHIFT) as usize) & (L2_ENTRIES - 1)
}

/// Decoded shape of an L1 slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L1Kind {
    Unmapped,
    /// Points at the L2 table whose physical base is given.
    Table(u64),
    Section,
}

/// Decoded shape of an L2 slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum L2Kind {
    Unmapped,
    Large,
    Small,
}

/// One fixed-width translation word.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct TranslationEntry(u32);

impl TranslationEntry {
    /// The unmapped entry.
    pub const EMPTY: Self = Self(0);

    #[inline]
    const fn encode(base: u64, attrs: EntryAttrs, kind: u32) -> Self {
        Self((((base >> SMALL_PAGE_SHIFT) as u32) << BASE_SHIFT) | (attrs.bits() & ATTR_MASK) | kind)
    }

    /// L1 slot pointing at an L2 table.
    pub const fn table(table_phys: u64) -> Self {
        Self::encode(table_phys, EntryAttrs::empty(), KIND_TABLE_OR_LARGE)
    }

    /// L1 section entry.
    pub const fn section(phys: u64, attrs: EntryAttrs) -> Self {
        Self::encode(phys & !(SECTION_SIZE - 1), attrs, KIND_SECTION_OR_SMALL)
    }

    /// One of the sixteen L2 slots of a large page.
    pub const fn large(phys: u64, attrs: EntryAttrs) -> Self {
        Self::encode(phys & !(LARGE_PAGE_SIZE - 1), attrs, KIND_TABLE_OR_LARGE)
    }

    /// L2 small page entry.
    pub const fn small(phys: u64, attrs: EntryAttrs) -> Self {
        Self::encode(phys & !(SMALL_PAGE_SIZE - 1), attrs, KIND_SECTION_OR_SMALL)
    }

    /// Rebuild from the raw word read back from table memory.
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn is_empty(self) -> bool {
        self.0 & KIND_MASK == KIND_NONE
    }

    /// Physical base stored in the entry.
    #[inline]
    pub const fn base(self) -> u64 {
        ((self.0 >> BASE_SHIFT) as u64) << SMALL_PAGE_SHIFT
    }

    #[inline]
    pub const fn attrs(self) -> EntryAttrs {
        EntryAttrs::from_bits_truncate(self.0 & ATTR_MASK)
    }

    /// Interpret as an L1 slot.
    pub const fn l1_kind(self) -> L1Kind {
        match self.0 & KIND_MASK {
            KIND_TABLE_OR_LARGE => L1Kind::Table(self.base()),
            KIND_SECTION_OR_SMALL => L1Kind::Section,
            _ => L1Kind::Unmapped,
        }
    }

    /// Interpret as an L2 slot.
    pub const fn l2_kind(self) -> L2Kind {
        match self.0 & KIND_MASK {
            KIND_TABLE_OR_LARGE => L2Kind::Large,
            KIND_SECTION_OR_SMALL => L2Kind::Small,
            _ => L2Kind::Unmapped,
        }
    }
}

impl core::fmt::Debug for TranslationEntry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "TranslationEntry({:#010x})", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_section_encoding() {
        let e = TranslationEntry::section(0x8_8010_0000, EntryAttrs::CACHEABLE);
        assert_eq!(e.l1_kind(), L1Kind::Section);
        assert_eq!(e.base(), 0x8_8010_0000);
        assert_eq!(e.attrs(), EntryAttrs::CACHEABLE);
    }

    #[test]
    fn test_large_page_masks_low_bits() {
        let e = TranslationEntry::large(0x8001_3000, EntryAttrs::empty());
        assert_eq!(e.l2_kind(), L2Kind::Large);
        assert_eq!(e.base(), 0x8001_0000);
    }

    #[test]
    fn test_table_pointer() {
        let e = TranslationEntry::table(0x4020_1000);
        assert_eq!(e.l1_kind(), L1Kind::Table(0x4020_1000));
        assert!(!e.is_empty());
        assert!(TranslationEntry::EMPTY.is_empty());
    }

    #[test]
    fn test_cacheable_override() {
        let plain = EntryAttrs::from_prot(Prot::READ | Prot::WRITE, false);
        assert!(plain.is_empty());
        let forced = EntryAttrs::from_prot(Prot::READ, true);
        assert_eq!(forced, EntryAttrs::CACHEABLE | EntryAttrs::SHAREABLE);
        let privileged = EntryAttrs::from_prot(Prot::PRIV, false);
        assert_eq!(privileged, EntryAttrs::PRIVILEGED);
    }

    #[test]
    fn test_indices() {
        assert_eq!(l1_index(0x1010_0000), 0x101);
        assert_eq!(l2_index(0x1010_5000), 0x05);
        assert_eq!(PageSize::from_bytes(0x1_0000), Some(PageSize::Large));
        assert_eq!(PageSize::from_bytes(0x2000), None);
    }
}
