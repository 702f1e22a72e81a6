//! On-disk page format.
//!
//! The file is an array of fixed-size pages. Every page carries a 16-byte
//! header: `{magic:u16, page_type:u8, flags:u8, page_id:u32, lsn:u32,
//! checksum:u32}`, all little-endian. The checksum is a CRC-32 over the whole
//! page with the checksum field zeroed, so torn writes surface as
//! `Corruption` on read. Page 0 is the meta page; its payload starts with the
//! file magic `NOVUSDB\0` and the format version.

use byteorder::{ByteOrder, LittleEndian};
use crc32fast::Hasher;

use crate::core::errors::NovusError;

pub type PageId = u32;

/// Sentinel page id: "no page". Page 0 is the meta page and is never linked.
pub const NO_PAGE: PageId = 0;

pub const PAGE_HEADER_SIZE: usize = 16;

const PAGE_MAGIC: u16 = 0x4e56;

pub const FILE_MAGIC: &[u8; 8] = b"NOVUSDB\0";
pub const FORMAT_VERSION: u32 = 1;

const META_FREE_HEAD: usize = 12;
const META_NEXT_PAGE_ID: usize = 16;
const META_CATALOG_ROOT: usize = 20;
const META_PAGE_SIZE: usize = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PageType {
    Meta = 0,
    Free = 1,
    RecordHeap = 2,
    IndexInternal = 3,
    IndexLeaf = 4,
    Overflow = 5,
}

impl TryFrom<u8> for PageType {
    type Error = NovusError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Meta),
            1 => Ok(Self::Free),
            2 => Ok(Self::RecordHeap),
            3 => Ok(Self::IndexInternal),
            4 => Ok(Self::IndexLeaf),
            5 => Ok(Self::Overflow),
            other => Err(NovusError::Corruption(format!(
                "unknown page type: {other}"
            ))),
        }
    }
}

/// One page's bytes, header included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    buf: Vec<u8>,
}

impl Page {
    /// Zero-filled page with a stamped header. Call [`Page::seal`] before the
    /// bytes go to disk or into a WAL frame.
    pub fn new(page_size: usize, id: PageId, page_type: PageType) -> Self {
        let mut buf = vec![0u8; page_size];
        LittleEndian::write_u16(&mut buf[0..2], PAGE_MAGIC);
        buf[2] = page_type as u8;
        LittleEndian::write_u32(&mut buf[4..8], id);
        Self { buf }
    }

    /// Wrap bytes read from disk, verifying magic and checksum.
    pub fn from_bytes(buf: Vec<u8>) -> Result<Self, NovusError> {
        if buf.len() < PAGE_HEADER_SIZE {
            return Err(NovusError::Corruption("short page read".into()));
        }
        let magic = LittleEndian::read_u16(&buf[0..2]);
        if magic != PAGE_MAGIC {
            return Err(NovusError::Corruption(format!(
                "bad page magic: {magic:#06x}"
            )));
        }
        let page = Self { buf };
        let stored = page.checksum();
        let computed = page.compute_checksum();
        if stored != computed {
            return Err(NovusError::Corruption(format!(
                "checksum mismatch on page {}: stored {stored:#010x}, computed {computed:#010x}",
                page.id()
            )));
        }
        PageType::try_from(page.buf[2])?;
        Ok(page)
    }

    /// Wrap bytes whose integrity is already established (WAL redo frames).
    pub fn from_bytes_unchecked(buf: Vec<u8>) -> Self {
        Self { buf }
    }

    pub fn id(&self) -> PageId {
        LittleEndian::read_u32(&self.buf[4..8])
    }

    pub fn page_type(&self) -> Result<PageType, NovusError> {
        PageType::try_from(self.buf[2])
    }

    pub fn set_page_type(&mut self, page_type: PageType) {
        self.buf[2] = page_type as u8;
    }

    pub fn lsn(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[8..12])
    }

    pub fn set_lsn(&mut self, lsn: u32) {
        LittleEndian::write_u32(&mut self.buf[8..12], lsn);
    }

    fn checksum(&self) -> u32 {
        LittleEndian::read_u32(&self.buf[12..16])
    }

    fn compute_checksum(&self) -> u32 {
        let mut hasher = Hasher::new();
        hasher.update(&self.buf[..12]);
        hasher.update(&[0u8; 4]);
        hasher.update(&self.buf[PAGE_HEADER_SIZE..]);
        hasher.finalize()
    }

    /// Recompute the checksum after payload mutation.
    pub fn seal(&mut self) {
        let sum = self.compute_checksum();
        LittleEndian::write_u32(&mut self.buf[12..16], sum);
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[PAGE_HEADER_SIZE..]
    }

    pub fn payload_mut(&mut self) -> &mut [u8] {
        &mut self.buf[PAGE_HEADER_SIZE..]
    }

    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    // Meta page payload: file magic (8) + version (4) + free-list head (4) +
    // next page id (4) + catalog root (4).

    pub fn init_meta(&mut self) {
        let payload = self.payload_mut();
        payload[0..8].copy_from_slice(FILE_MAGIC);
        write_u32(payload, 8, FORMAT_VERSION);
        write_u32(payload, META_FREE_HEAD, NO_PAGE);
        write_u32(payload, META_NEXT_PAGE_ID, 1);
        write_u32(payload, META_CATALOG_ROOT, NO_PAGE);
    }

    pub fn meta_check(&self) -> Result<(), NovusError> {
        let payload = self.payload();
        if &payload[0..8] != FILE_MAGIC {
            return Err(NovusError::Corruption("bad file magic on meta page".into()));
        }
        let version = read_u32(payload, 8);
        if version != FORMAT_VERSION {
            return Err(NovusError::Corruption(format!(
                "unsupported format version: {version}"
            )));
        }
        Ok(())
    }

    pub fn meta_free_head(&self) -> PageId {
        read_u32(self.payload(), META_FREE_HEAD)
    }

    pub fn set_meta_free_head(&mut self, id: PageId) {
        write_u32(self.payload_mut(), META_FREE_HEAD, id);
    }

    pub fn meta_next_page_id(&self) -> PageId {
        read_u32(self.payload(), META_NEXT_PAGE_ID)
    }

    pub fn set_meta_next_page_id(&mut self, id: PageId) {
        write_u32(self.payload_mut(), META_NEXT_PAGE_ID, id);
    }

    pub fn meta_catalog_root(&self) -> PageId {
        read_u32(self.payload(), META_CATALOG_ROOT)
    }

    pub fn set_meta_catalog_root(&mut self, id: PageId) {
        write_u32(self.payload_mut(), META_CATALOG_ROOT, id);
    }

    pub fn meta_page_size(&self) -> u32 {
        read_u32(self.payload(), META_PAGE_SIZE)
    }

    pub fn set_meta_page_size(&mut self, size: u32) {
        write_u32(self.payload_mut(), META_PAGE_SIZE, size);
    }

    // Free page payload: next free page id (4).

    pub fn free_next(&self) -> PageId {
        read_u32(self.payload(), 0)
    }

    pub fn set_free_next(&mut self, id: PageId) {
        write_u32(self.payload_mut(), 0, id);
    }
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    LittleEndian::read_u32(&buf[offset..offset + 4])
}

fn write_u32(buf: &mut [u8], offset: usize, value: u32) {
    LittleEndian::write_u32(&mut buf[offset..offset + 4], value);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_roundtrip() {
        let mut page = Page::new(4096, 7, PageType::IndexLeaf);
        page.set_lsn(42);
        page.seal();
        let parsed = Page::from_bytes(page.bytes().to_vec()).unwrap();
        assert_eq!(parsed.id(), 7);
        assert_eq!(parsed.page_type().unwrap(), PageType::IndexLeaf);
        assert_eq!(parsed.lsn(), 42);
    }

    #[test]
    fn checksum_detects_flipped_bit() {
        let mut page = Page::new(4096, 3, PageType::RecordHeap);
        page.payload_mut()[100] = 0xaa;
        page.seal();
        let mut bytes = page.bytes().to_vec();
        bytes[200] ^= 0x01;
        assert!(matches!(
            Page::from_bytes(bytes),
            Err(NovusError::Corruption(_))
        ));
    }

    #[test]
    fn bad_magic_is_corruption() {
        let mut page = Page::new(4096, 1, PageType::Free);
        page.seal();
        let mut bytes = page.bytes().to_vec();
        bytes[0] = 0;
        assert!(matches!(
            Page::from_bytes(bytes),
            Err(NovusError::Corruption(_))
        ));
    }

    #[test]
    fn meta_fields_roundtrip() {
        let mut page = Page::new(4096, 0, PageType::Meta);
        page.init_meta();
        page.meta_check().unwrap();
        assert_eq!(page.meta_free_head(), NO_PAGE);
        assert_eq!(page.meta_next_page_id(), 1);

        page.set_meta_free_head(9);
        page.set_meta_next_page_id(17);
        page.set_meta_catalog_root(5);
        assert_eq!(page.meta_free_head(), 9);
        assert_eq!(page.meta_next_page_id(), 17);
        assert_eq!(page.meta_catalog_root(), 5);
    }
}
