//! Page structures for ShaleDB storage.

use serde::{Deserialize, Serialize};

/// Page size in bytes (4 KB).
pub const PAGE_SIZE: usize = 4096;

/// Bytes available to a page's owner after the header.
pub const PAYLOAD_SIZE: usize = PAGE_SIZE - PageHeader::SIZE;

/// Stable identifier of one page in the database file.
///
/// Ids are recycled through the on-disk freelist once a page is freed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// Sentinel for "no page" (empty tree, end of a leaf chain or freelist).
    pub const INVALID: PageId = PageId(u32::MAX);

    /// Returns true unless this is the invalid sentinel.
    pub fn is_valid(&self) -> bool {
        *self != Self::INVALID
    }

    /// Returns the id widened for 8-byte child pointers.
    pub fn as_u64(&self) -> u64 {
        self.0 as u64
    }

    /// Narrows an 8-byte child pointer back into a PageId.
    ///
    /// Values outside the u32 range cannot have been written by this crate and
    /// decode as the invalid sentinel.
    pub fn from_u64(value: u64) -> Self {
        u32::try_from(value).map(Self).unwrap_or(Self::INVALID)
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "{}", self.0)
        } else {
            write!(f, "invalid")
        }
    }
}

/// Page types in ShaleDB storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum PageType {
    /// Cleared or never-initialized page.
    Invalid = 0,
    /// B+ tree leaf page.
    Leaf = 1,
    /// B+ tree internal page.
    Internal = 2,
    /// File metadata or catalog page.
    Meta = 3,
    /// Page on the freelist.
    Free = 4,
    /// Heap data page.
    Heap = 5,
}

impl PageType {
    /// Decodes a type tag, returning None for unknown tags.
    pub fn from_u32(tag: u32) -> Option<Self> {
        match tag {
            0 => Some(PageType::Invalid),
            1 => Some(PageType::Leaf),
            2 => Some(PageType::Internal),
            3 => Some(PageType::Meta),
            4 => Some(PageType::Free),
            5 => Some(PageType::Heap),
            _ => None,
        }
    }
}

/// Header structure at the beginning of every page.
///
/// Layout (12 bytes, little-endian):
/// - page_type: 4 bytes
/// - page_id: 4 bytes
/// - next_page_id: 4 bytes (leaf sibling, freelist link or overflow chain)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageHeader {
    /// Type of this page.
    pub page_type: PageType,
    /// Identifier of this page.
    pub page_id: PageId,
    /// Type-dependent link to another page.
    pub next_page_id: PageId,
}

impl PageHeader {
    /// Size of the page header in bytes.
    pub const SIZE: usize = 12;

    /// Creates a new page header with no outgoing link.
    pub fn new(page_id: PageId, page_type: PageType) -> Self {
        Self {
            page_type,
            page_id,
            next_page_id: PageId(0),
        }
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..4].copy_from_slice(&(self.page_type as u32).to_le_bytes());
        buf[4..8].copy_from_slice(&self.page_id.0.to_le_bytes());
        buf[8..12].copy_from_slice(&self.next_page_id.0.to_le_bytes());
        buf
    }

    /// Deserializes the header from bytes.
    ///
    /// Unknown type tags decode as `PageType::Invalid`.
    pub fn from_bytes(buf: &[u8]) -> Self {
        let tag = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let page_id = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let next_page_id = u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);

        Self {
            page_type: PageType::from_u32(tag).unwrap_or(PageType::Invalid),
            page_id: PageId(page_id),
            next_page_id: PageId(next_page_id),
        }
    }
}

/// A fixed-size block: header followed by an opaque payload.
///
/// The page has no knowledge of trees or records; whoever holds it decides
/// how the payload is laid out.
#[derive(Clone)]
pub struct Page {
    data: Box<[u8; PAGE_SIZE]>,
}

impl Page {
    /// Creates a cleared page (type invalid, id 0, zeroed payload).
    pub fn new() -> Self {
        Self {
            data: Box::new([0u8; PAGE_SIZE]),
        }
    }

    /// Creates a cleared page carrying the given id and type.
    pub fn with_header(page_id: PageId, page_type: PageType) -> Self {
        let mut page = Self::new();
        page.set_header(&PageHeader::new(page_id, page_type));
        page
    }

    /// Returns the page ID stored in the header.
    #[inline]
    pub fn page_id(&self) -> PageId {
        PageId(self.read_header_u32(4))
    }

    /// Sets the page ID stored in the header.
    #[inline]
    pub fn set_page_id(&mut self, page_id: PageId) {
        self.write_header_u32(4, page_id.0);
    }

    /// Returns the page type stored in the header.
    #[inline]
    pub fn page_type(&self) -> PageType {
        PageType::from_u32(self.read_header_u32(0)).unwrap_or(PageType::Invalid)
    }

    /// Sets the page type stored in the header.
    #[inline]
    pub fn set_page_type(&mut self, page_type: PageType) {
        self.write_header_u32(0, page_type as u32);
    }

    /// Returns the type-dependent next-page link.
    #[inline]
    pub fn next_page_id(&self) -> PageId {
        PageId(self.read_header_u32(8))
    }

    /// Sets the type-dependent next-page link.
    #[inline]
    pub fn set_next_page_id(&mut self, page_id: PageId) {
        self.write_header_u32(8, page_id.0);
    }

    /// Decodes the full header.
    pub fn header(&self) -> PageHeader {
        PageHeader::from_bytes(&self.data[..PageHeader::SIZE])
    }

    /// Overwrites the full header.
    pub fn set_header(&mut self, header: &PageHeader) {
        self.data[..PageHeader::SIZE].copy_from_slice(&header.to_bytes());
    }

    /// Returns the payload (bytes after the header).
    #[inline]
    pub fn payload(&self) -> &[u8] {
        &self.data[PageHeader::SIZE..]
    }

    /// Returns the payload mutably.
    #[inline]
    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.data[PageHeader::SIZE..]
    }

    /// Returns the whole block, header included.
    #[inline]
    pub fn data(&self) -> &[u8; PAGE_SIZE] {
        &self.data
    }

    /// Returns the whole block mutably.
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8; PAGE_SIZE] {
        &mut self.data
    }

    /// Zeroes the block and resets the header to invalid/0.
    pub fn clear(&mut self) {
        self.data.fill(0);
    }

    #[inline(always)]
    fn read_header_u32(&self, offset: usize) -> u32 {
        u32::from_le_bytes([
            self.data[offset],
            self.data[offset + 1],
            self.data[offset + 2],
            self.data[offset + 3],
        ])
    }

    #[inline(always)]
    fn write_header_u32(&mut self, offset: usize, value: u32) {
        self.data[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
    }
}

impl Default for Page {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Page")
            .field("page_id", &self.page_id())
            .field("page_type", &self.page_type())
            .field("next_page_id", &self.next_page_id())
            .finish()
    }
}
