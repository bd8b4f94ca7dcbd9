//! Self-describing extent binary format (C1).
//!
//! ```text
//! offset  bytes  field
//! 0       4      magic           = 0x31545845 ("EXT1")
//! 4       2      version         = 1
//! 6       2      flags           (bit 0: compressed)
//! 8       4      pageSize
//! 12      4      pageCount
//! 16      4      extentSize
//! 20      8      checksum        (FNV-1a 64 of the data section)
//! 28      36     reserved, MUST be zero
//! 64      B      bitmap          B = ceil(pageCount/8), LSB-first
//! 64+B    extentSize  data       packed present pages, ascending index order
//! ```
//!
//! Every function here is pure: no I/O, no allocation beyond what's needed to
//! build or return the requested bytes.

use std::collections::BTreeMap;
use thiserror::Error;

pub const MAGIC: u32 = 0x3154_5845;
pub const VERSION: u16 = 1;
pub const HEADER_LEN: usize = 64;
pub const FLAG_COMPRESSED: u16 = 0b0000_0001;

const FNV_OFFSET_BASIS: u64 = 0xCBF2_9CE4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01B3;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FormatError {
    #[error("extent payload truncated: need at least {need} bytes, got {got}")]
    Truncated { need: usize, got: usize },
    #[error("bad magic: expected {MAGIC:#010x}, got {0:#010x}")]
    BadMagic(u32),
    #[error("unsupported version: {0}")]
    BadVersion(u16),
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

/// Computes FNV-1a 64-bit over `bytes`, using offset-basis
/// `0xCBF29CE484222325` and prime `0x100000001B3`, wrapping on overflow.
#[must_use]
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    let mut hash = FNV_OFFSET_BASIS;
    for &b in bytes {
        hash ^= u64::from(b);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}

/// Brian Kernighan popcount.
#[must_use]
pub fn popcount(mut n: u64) -> u32 {
    let mut count = 0;
    while n != 0 {
        n &= n - 1;
        count += 1;
    }
    count
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtentHeader {
    pub version: u16,
    pub flags: u16,
    pub page_size: u32,
    pub page_count: u32,
    pub extent_size: u32,
    pub checksum: u64,
}

impl ExtentHeader {
    #[must_use]
    pub const fn compressed(&self) -> bool {
        self.flags & FLAG_COMPRESSED != 0
    }

    #[must_use]
    pub fn bitmap_len(&self) -> usize {
        (self.page_count as usize).div_ceil(8)
    }
}

/// Builds a page-packed extent blob from a sparse map of slot index to page
/// bytes. All pages must have length `page_size`. Slot indices need not be
/// contiguous; `pageCount = max(index) + 1`. An empty map produces a 64-byte
/// header-only blob with checksum 0.
///
/// # Errors
/// Returns `InvalidArgument` if `page_size` is 0, or if any page's length is
/// not exactly `page_size`.
pub fn build(pages: &BTreeMap<u32, Vec<u8>>, page_size: u32, flags: u16) -> Result<Vec<u8>, FormatError> {
    if page_size == 0 {
        return Err(FormatError::InvalidArgument("page size must be > 0".to_string()));
    }
    for (idx, data) in pages {
        if data.len() != page_size as usize {
            return Err(FormatError::InvalidArgument(format!(
                "page {idx} has length {}, expected {page_size}",
                data.len()
            )));
        }
    }

    let page_count = pages.keys().max().map_or(0, |m| m + 1);
    let bitmap_len = (page_count as usize).div_ceil(8);
    let mut bitmap = vec![0u8; bitmap_len];
    let mut data_section = Vec::with_capacity(pages.len() * page_size as usize);
    for (&idx, bytes) in pages {
        let byte_idx = (idx / 8) as usize;
        let bit_idx = idx % 8;
        bitmap[byte_idx] |= 1 << bit_idx;
        data_section.extend_from_slice(bytes);
    }

    let extent_size = u32::try_from(data_section.len()).unwrap_or(u32::MAX);
    let checksum = if data_section.is_empty() { 0 } else { fnv1a_64(&data_section) };

    let mut out = Vec::with_capacity(HEADER_LEN + bitmap.len() + data_section.len());
    out.extend_from_slice(&MAGIC.to_le_bytes());
    out.extend_from_slice(&VERSION.to_le_bytes());
    out.extend_from_slice(&flags.to_le_bytes());
    out.extend_from_slice(&page_size.to_le_bytes());
    out.extend_from_slice(&page_count.to_le_bytes());
    out.extend_from_slice(&extent_size.to_le_bytes());
    out.extend_from_slice(&checksum.to_le_bytes());
    out.extend_from_slice(&[0u8; 36]);
    out.extend_from_slice(&bitmap);
    out.extend_from_slice(&data_section);
    Ok(out)
}

/// Parses only the fixed 64-byte header. Does not verify the checksum.
///
/// # Errors
/// Returns `Truncated` if shorter than 64 bytes, `BadMagic`/`BadVersion` on
/// mismatch.
pub fn parse_header(bytes: &[u8]) -> Result<ExtentHeader, FormatError> {
    if bytes.len() < HEADER_LEN {
        return Err(FormatError::Truncated { need: HEADER_LEN, got: bytes.len() });
    }
    let magic = u32::from_le_bytes(bytes[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(FormatError::BadMagic(magic));
    }
    let version = u16::from_le_bytes(bytes[4..6].try_into().unwrap());
    if version != VERSION {
        return Err(FormatError::BadVersion(version));
    }
    let flags = u16::from_le_bytes(bytes[6..8].try_into().unwrap());
    let page_size = u32::from_le_bytes(bytes[8..12].try_into().unwrap());
    let page_count = u32::from_le_bytes(bytes[12..16].try_into().unwrap());
    let extent_size = u32::from_le_bytes(bytes[16..20].try_into().unwrap());
    let checksum = u64::from_le_bytes(bytes[20..28].try_into().unwrap());
    Ok(ExtentHeader { version, flags, page_size, page_count, extent_size, checksum })
}

/// Parses the header, verifies total length and recomputes the FNV-1a
/// checksum over the data section. Never panics or propagates an error:
/// any malformation simply yields `false`.
#[must_use]
pub fn validate(bytes: &[u8]) -> bool {
    let Ok(header) = parse_header(bytes) else { return false };
    let bitmap_len = header.bitmap_len();
    let needed = HEADER_LEN + bitmap_len + header.extent_size as usize;
    if bytes.len() < needed {
        return false;
    }
    let data_start = HEADER_LEN + bitmap_len;
    let data = &bytes[data_start..data_start + header.extent_size as usize];
    fnv1a_64(data) == header.checksum
}

fn bitmap_slice(bytes: &[u8], header: &ExtentHeader) -> Option<&[u8]> {
    let bitmap_len = header.bitmap_len();
    if bytes.len() < HEADER_LEN + bitmap_len {
        return None;
    }
    Some(&bytes[HEADER_LEN..HEADER_LEN + bitmap_len])
}

fn bit_set(bitmap: &[u8], idx: u32) -> bool {
    let byte_idx = (idx / 8) as usize;
    let bit_idx = idx % 8;
    byte_idx < bitmap.len() && (bitmap[byte_idx] >> bit_idx) & 1 == 1
}

/// Returns the page bytes for `slot_index` within a single extent blob, or
/// `None` if the bitmap bit is clear (or the slot is out of range).
#[must_use]
pub fn extract_page(bytes: &[u8], slot_index: u32) -> Option<Vec<u8>> {
    let header = parse_header(bytes).ok()?;
    if slot_index >= header.page_count {
        return None;
    }
    let bitmap = bitmap_slice(bytes, &header)?;
    if !bit_set(bitmap, slot_index) {
        return None;
    }
    // Present-page prefix count: number of set bits below slot_index.
    let mut prefix = 0usize;
    for i in 0..slot_index {
        if bit_set(bitmap, i) {
            prefix += 1;
        }
    }
    let page_size = header.page_size as usize;
    let data_start = HEADER_LEN + header.bitmap_len() + prefix * page_size;
    let data_end = data_start + page_size;
    if bytes.len() < data_end {
        return None;
    }
    Some(bytes[data_start..data_end].to_vec())
}

/// Enumerates the slot indices present in the bitmap, ascending.
#[must_use]
pub fn present_indices(bytes: &[u8]) -> Vec<u32> {
    let Ok(header) = parse_header(bytes) else { return Vec::new() };
    let Some(bitmap) = bitmap_slice(bytes, &header) else { return Vec::new() };
    (0..header.page_count).filter(|&i| bit_set(bitmap, i)).collect()
}

/// Counts the present pages via Brian Kernighan popcount over the bitmap.
#[must_use]
pub fn count_present(bytes: &[u8]) -> u32 {
    let Ok(header) = parse_header(bytes) else { return 0 };
    let Some(bitmap) = bitmap_slice(bytes, &header) else { return 0 };
    let mut total = 0u32;
    for chunk in bitmap.chunks(8) {
        let mut buf = [0u8; 8];
        buf[..chunk.len()].copy_from_slice(chunk);
        total += popcount(u64::from_le_bytes(buf));
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(byte: u8, size: usize) -> Vec<u8> {
        vec![byte; size]
    }

    #[test]
    fn empty_map_is_header_only() {
        let blob = build(&BTreeMap::new(), 4096, 0).unwrap();
        assert_eq!(blob.len(), HEADER_LEN);
        let header = parse_header(&blob).unwrap();
        assert_eq!(header.checksum, 0);
        assert_eq!(header.page_count, 0);
        assert!(validate(&blob));
    }

    #[test]
    fn round_trip_dense() {
        let mut pages = BTreeMap::new();
        for i in 0..512u32 {
            pages.insert(i, page((i % 256) as u8, 4096));
        }
        let blob = build(&pages, 4096, 0).unwrap();
        assert!(validate(&blob));
        let header = parse_header(&blob).unwrap();
        assert_eq!(header.page_count, 512);
        assert_eq!(header.extent_size as usize, 512 * 4096);
        for (i, data) in &pages {
            assert_eq!(extract_page(&blob, *i).as_ref(), Some(data));
        }
    }

    #[test]
    fn sparse_bitmap_and_holes() {
        let mut pages = BTreeMap::new();
        pages.insert(0, page(1, 4096));
        pages.insert(2, page(2, 4096));
        pages.insert(5, page(3, 4096));
        let blob = build(&pages, 4096, 0).unwrap();
        let header = parse_header(&blob).unwrap();
        assert_eq!(header.page_count, 6);
        assert_eq!(header.extent_size as usize, 3 * 4096);
        assert_eq!(count_present(&blob), 3);
        assert_eq!(present_indices(&blob), vec![0, 2, 5]);
        assert!(extract_page(&blob, 1).is_none());
        assert_eq!(extract_page(&blob, 5), Some(page(3, 4096)));
    }

    #[test]
    fn deterministic_serialization() {
        let mut pages = BTreeMap::new();
        pages.insert(3, page(9, 128));
        pages.insert(1, page(7, 128));
        let a = build(&pages, 128, 0).unwrap();
        let b = build(&pages, 128, 0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn rejects_zero_page_size() {
        let mut pages = BTreeMap::new();
        pages.insert(0, page(1, 10));
        assert!(build(&pages, 0, 0).is_err());
    }

    #[test]
    fn rejects_mismatched_page_length() {
        let mut pages = BTreeMap::new();
        pages.insert(0, page(1, 10));
        assert!(build(&pages, 4096, 0).is_err());
    }

    #[test]
    fn validate_rejects_truncated_or_bad_magic() {
        assert!(!validate(&[0u8; 10]));
        let mut pages = BTreeMap::new();
        pages.insert(0, page(1, 16));
        let mut blob = build(&pages, 16, 0).unwrap();
        blob[0] = 0xFF;
        assert!(!validate(&blob));
    }

    #[test]
    fn validate_detects_tampered_data() {
        let mut pages = BTreeMap::new();
        pages.insert(0, page(0xAA, 4096));
        pages.insert(1, page(0xBB, 4096));
        let mut blob = build(&pages, 4096, 0).unwrap();
        assert!(validate(&blob));
        let last = blob.len() - 1;
        blob[last] ^= 0xFF;
        assert!(!validate(&blob));
    }

    #[test]
    fn fnv1a_known_vector() {
        // FNV-1a 64 of the empty string is the offset basis.
        assert_eq!(fnv1a_64(b""), FNV_OFFSET_BASIS);
    }
}
