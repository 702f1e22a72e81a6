//! Slotted-page record heap.
//!
//! Each collection owns a singly linked chain of `RecordHeap` pages. A heap
//! page's payload holds `{next_page:u32, num_slots:u16, free_space_end:u16}`
//! followed by the slot array; record bytes are appended from the end of the
//! payload toward the slots. A slot is `{offset:u16, length:u16, flags:u8}`.
//! Deletion tombstones the slot; slots are never reused, so a location stays
//! stable until vacuum rewrites the chain.
//!
//! Records larger than a page spill into an `Overflow` chain; the heap slot
//! then holds an 8-byte stub `{first_page:u32, total_len:u32}`.

use byteorder::{ByteOrder, LittleEndian, WriteBytesExt};

use crate::core::codec::{decode_document, encode_document};
use crate::core::errors::NovusError;
use crate::core::value::Document;
use crate::storage::page::{Page, PageId, PageType, NO_PAGE};
use crate::storage::pager::{allocate_page, free_page, PageIo};

const HEAP_HEADER: usize = 8;
const SLOT_SIZE: usize = 5;

const FLAG_DELETED: u8 = 0x01;
const FLAG_OVERFLOW: u8 = 0x02;

const OVERFLOW_HEADER: usize = 6;

/// Per-collection chain state; persisted in the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapState {
    pub root: PageId,
    pub last: PageId,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordLoc {
    pub page_id: PageId,
    pub slot: u16,
}

fn next_page(page: &Page) -> PageId {
    LittleEndian::read_u32(&page.payload()[0..4])
}

fn set_next_page(page: &mut Page, id: PageId) {
    LittleEndian::write_u32(&mut page.payload_mut()[0..4], id);
}

fn num_slots(page: &Page) -> usize {
    LittleEndian::read_u16(&page.payload()[4..6]) as usize
}

fn set_num_slots(page: &mut Page, n: usize) {
    LittleEndian::write_u16(&mut page.payload_mut()[4..6], n as u16);
}

fn free_space_end(page: &Page) -> usize {
    LittleEndian::read_u16(&page.payload()[6..8]) as usize
}

fn set_free_space_end(page: &mut Page, end: usize) {
    LittleEndian::write_u16(&mut page.payload_mut()[6..8], end as u16);
}

fn slot(page: &Page, idx: usize) -> (usize, usize, u8) {
    let base = HEAP_HEADER + idx * SLOT_SIZE;
    let p = page.payload();
    let offset = LittleEndian::read_u16(&p[base..base + 2]) as usize;
    let length = LittleEndian::read_u16(&p[base + 2..base + 4]) as usize;
    (offset, length, p[base + 4])
}

fn set_slot(page: &mut Page, idx: usize, offset: usize, length: usize, flags: u8) {
    let base = HEAP_HEADER + idx * SLOT_SIZE;
    let p = page.payload_mut();
    LittleEndian::write_u16(&mut p[base..base + 2], offset as u16);
    LittleEndian::write_u16(&mut p[base + 2..base + 4], length as u16);
    p[base + 4] = flags;
}

fn init_heap_page(page: &mut Page) {
    let payload_len = page.payload().len();
    set_next_page(page, NO_PAGE);
    set_num_slots(page, 0);
    set_free_space_end(page, payload_len);
}

/// Space left for one more slot plus `len` record bytes.
fn fits(page: &Page, len: usize) -> bool {
    let slots_end = HEAP_HEADER + (num_slots(page) + 1) * SLOT_SIZE;
    free_space_end(page) >= slots_end && free_space_end(page) - slots_end >= len
}

fn append_record(page: &mut Page, bytes: &[u8], flags: u8) -> u16 {
    let offset = free_space_end(page) - bytes.len();
    let idx = num_slots(page);
    page.payload_mut()[offset..offset + bytes.len()].copy_from_slice(bytes);
    set_slot(page, idx, offset, bytes.len(), flags);
    set_num_slots(page, idx + 1);
    set_free_space_end(page, offset);
    idx as u16
}

fn encode_record(record_id: u64, doc: &Document) -> Result<Vec<u8>, NovusError> {
    let body = encode_document(doc)?;
    let mut bytes = Vec::with_capacity(8 + body.len());
    bytes.write_u64::<LittleEndian>(record_id)?;
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

fn decode_record(bytes: &[u8]) -> Result<(u64, Document), NovusError> {
    if bytes.len() < 8 {
        return Err(NovusError::Corruption("short record".into()));
    }
    let record_id = LittleEndian::read_u64(&bytes[0..8]);
    let doc = decode_document(&bytes[8..])?;
    Ok((record_id, doc))
}

/// Largest record stored inline on an otherwise empty page.
fn inline_capacity(page_size: usize) -> usize {
    page_size - crate::storage::page::PAGE_HEADER_SIZE - HEAP_HEADER - SLOT_SIZE
}

/// Append a record, extending the chain when the last page is full.
pub fn insert(
    io: &dyn PageIo,
    state: &mut HeapState,
    record_id: u64,
    doc: &Document,
) -> Result<RecordLoc, NovusError> {
    let bytes = encode_record(record_id, doc)?;
    if bytes.len() > inline_capacity(io.page_size()) {
        let stub = spill_overflow(io, &bytes)?;
        return insert_bytes(io, state, &stub, FLAG_OVERFLOW);
    }
    insert_bytes(io, state, &bytes, 0)
}

fn insert_bytes(
    io: &dyn PageIo,
    state: &mut HeapState,
    bytes: &[u8],
    flags: u8,
) -> Result<RecordLoc, NovusError> {
    if state.last != NO_PAGE {
        let mut page = io.read(state.last)?;
        if fits(&page, bytes.len()) {
            let slot = append_record(&mut page, bytes, flags);
            let page_id = page.id();
            io.write(page)?;
            return Ok(RecordLoc { page_id, slot });
        }
    }

    let new_id = allocate_page(io, PageType::RecordHeap)?;
    let mut new_page = io.read(new_id)?;
    init_heap_page(&mut new_page);
    let slot = append_record(&mut new_page, bytes, flags);
    io.write(new_page)?;

    if state.last != NO_PAGE {
        let mut prev = io.read(state.last)?;
        set_next_page(&mut prev, new_id);
        io.write(prev)?;
    }
    if state.root == NO_PAGE {
        state.root = new_id;
    }
    state.last = new_id;
    Ok(RecordLoc {
        page_id: new_id,
        slot,
    })
}

fn spill_overflow(io: &dyn PageIo, bytes: &[u8]) -> Result<Vec<u8>, NovusError> {
    let chunk_cap = io.page_size() - crate::storage::page::PAGE_HEADER_SIZE - OVERFLOW_HEADER;
    let mut first = NO_PAGE;
    let mut prev: Option<Page> = None;
    for chunk in bytes.chunks(chunk_cap) {
        let id = allocate_page(io, PageType::Overflow)?;
        let mut page = io.read(id)?;
        {
            let payload = page.payload_mut();
            LittleEndian::write_u32(&mut payload[0..4], NO_PAGE);
            LittleEndian::write_u16(&mut payload[4..6], chunk.len() as u16);
            payload[OVERFLOW_HEADER..OVERFLOW_HEADER + chunk.len()].copy_from_slice(chunk);
        }
        if let Some(mut p) = prev.take() {
            LittleEndian::write_u32(&mut p.payload_mut()[0..4], id);
            io.write(p)?;
        } else {
            first = id;
        }
        prev = Some(page);
    }
    if let Some(p) = prev {
        io.write(p)?;
    }

    let mut stub = Vec::with_capacity(8);
    stub.write_u32::<LittleEndian>(first)?;
    stub.write_u32::<LittleEndian>(bytes.len() as u32)?;
    Ok(stub)
}

fn read_overflow(io: &dyn PageIo, stub: &[u8]) -> Result<Vec<u8>, NovusError> {
    if stub.len() != 8 {
        return Err(NovusError::Corruption("bad overflow stub".into()));
    }
    let mut id = LittleEndian::read_u32(&stub[0..4]);
    let total = LittleEndian::read_u32(&stub[4..8]) as usize;
    let mut bytes = Vec::with_capacity(total);
    while id != NO_PAGE && bytes.len() < total {
        let page = io.read(id)?;
        let payload = page.payload();
        let len = LittleEndian::read_u16(&payload[4..6]) as usize;
        bytes.extend_from_slice(&payload[OVERFLOW_HEADER..OVERFLOW_HEADER + len]);
        id = LittleEndian::read_u32(&payload[0..4]);
    }
    if bytes.len() != total {
        return Err(NovusError::Corruption("truncated overflow chain".into()));
    }
    Ok(bytes)
}

fn free_overflow(io: &dyn PageIo, stub: &[u8]) -> Result<(), NovusError> {
    if stub.len() != 8 {
        return Err(NovusError::Corruption("bad overflow stub".into()));
    }
    let mut id = LittleEndian::read_u32(&stub[0..4]);
    while id != NO_PAGE {
        let page = io.read(id)?;
        let next = LittleEndian::read_u32(&page.payload()[0..4]);
        free_page(io, id)?;
        id = next;
    }
    Ok(())
}

fn slot_bytes(page: &Page, idx: usize) -> Result<(Vec<u8>, u8), NovusError> {
    if idx >= num_slots(page) {
        return Err(NovusError::NotFound);
    }
    let (offset, length, flags) = slot(page, idx);
    if flags & FLAG_DELETED != 0 {
        return Err(NovusError::NotFound);
    }
    Ok((page.payload()[offset..offset + length].to_vec(), flags))
}

pub fn read(io: &dyn PageIo, loc: RecordLoc) -> Result<(u64, Document), NovusError> {
    let page = io.read(loc.page_id)?;
    let (bytes, flags) = slot_bytes(&page, loc.slot as usize)?;
    if flags & FLAG_OVERFLOW != 0 {
        return decode_record(&read_overflow(io, &bytes)?);
    }
    decode_record(&bytes)
}

/// Rewrite in place when the new bytes fit the existing slot, else tombstone
/// and reinsert. The caller relocates index entries when the location moves.
pub fn update(
    io: &dyn PageIo,
    state: &mut HeapState,
    loc: RecordLoc,
    record_id: u64,
    doc: &Document,
) -> Result<RecordLoc, NovusError> {
    let bytes = encode_record(record_id, doc)?;
    let mut page = io.read(loc.page_id)?;
    let idx = loc.slot as usize;
    if idx >= num_slots(&page) {
        return Err(NovusError::NotFound);
    }
    let (offset, length, flags) = slot(&page, idx);
    if flags & FLAG_DELETED != 0 {
        return Err(NovusError::NotFound);
    }

    if flags & FLAG_OVERFLOW == 0 && bytes.len() <= length {
        page.payload_mut()[offset..offset + bytes.len()].copy_from_slice(&bytes);
        set_slot(&mut page, idx, offset, bytes.len(), flags);
        io.write(page)?;
        return Ok(loc);
    }

    drop(page);
    delete(io, loc)?;
    if bytes.len() > inline_capacity(io.page_size()) {
        let stub = spill_overflow(io, &bytes)?;
        insert_bytes(io, state, &stub, FLAG_OVERFLOW)
    } else {
        insert_bytes(io, state, &bytes, 0)
    }
}

/// Tombstone the slot; overflow chains are released immediately, heap space
/// waits for vacuum.
pub fn delete(io: &dyn PageIo, loc: RecordLoc) -> Result<(), NovusError> {
    let mut page = io.read(loc.page_id)?;
    let idx = loc.slot as usize;
    if idx >= num_slots(&page) {
        return Err(NovusError::NotFound);
    }
    let (offset, length, flags) = slot(&page, idx);
    if flags & FLAG_DELETED != 0 {
        return Err(NovusError::NotFound);
    }
    if flags & FLAG_OVERFLOW != 0 {
        let stub = page.payload()[offset..offset + length].to_vec();
        free_overflow(io, &stub)?;
    }
    set_slot(&mut page, idx, offset, length, flags | FLAG_DELETED);
    io.write(page)?;
    Ok(())
}

/// Resumable scan position over a heap chain.
#[derive(Debug, Clone, Copy)]
pub struct ScanCursor {
    next_page: PageId,
    next_slot: u16,
}

impl ScanCursor {
    pub fn new(root: PageId) -> Self {
        Self {
            next_page: root,
            next_slot: 0,
        }
    }
}

/// Advance to the next live record, skipping tombstones.
pub fn scan_next(
    io: &dyn PageIo,
    cursor: &mut ScanCursor,
) -> Result<Option<(u64, RecordLoc, Document)>, NovusError> {
    while cursor.next_page != NO_PAGE {
        let page = io.read(cursor.next_page)?;
        let slots = num_slots(&page);
        while (cursor.next_slot as usize) < slots {
            let idx = cursor.next_slot as usize;
            cursor.next_slot += 1;
            let (offset, length, flags) = slot(&page, idx);
            if flags & FLAG_DELETED != 0 {
                continue;
            }
            let bytes = page.payload()[offset..offset + length].to_vec();
            let record = if flags & FLAG_OVERFLOW != 0 {
                decode_record(&read_overflow(io, &bytes)?)?
            } else {
                decode_record(&bytes)?
            };
            let loc = RecordLoc {
                page_id: page.id(),
                slot: idx as u16,
            };
            return Ok(Some((record.0, loc, record.1)));
        }
        cursor.next_page = next_page(&page);
        cursor.next_slot = 0;
    }
    Ok(None)
}

/// Count tombstoned slots across the chain.
pub fn tombstone_count(io: &dyn PageIo, root: PageId) -> Result<usize, NovusError> {
    let mut count = 0;
    let mut id = root;
    while id != NO_PAGE {
        let page = io.read(id)?;
        for idx in 0..num_slots(&page) {
            let (_, _, flags) = slot(&page, idx);
            if flags & FLAG_DELETED != 0 {
                count += 1;
            }
        }
        id = next_page(&page);
    }
    Ok(count)
}

/// Free every heap page in the chain. Overflow chains of still-live records
/// must have been drained (or will be rewritten) by the caller.
pub fn free_chain(io: &dyn PageIo, root: PageId) -> Result<usize, NovusError> {
    let mut freed = 0;
    let mut id = root;
    while id != NO_PAGE {
        let page = io.read(id)?;
        for idx in 0..num_slots(&page) {
            let (offset, length, flags) = slot(&page, idx);
            if flags & FLAG_OVERFLOW != 0 && flags & FLAG_DELETED == 0 {
                let stub = page.payload()[offset..offset + length].to_vec();
                free_overflow(io, &stub)?;
            }
        }
        let next = next_page(&page);
        free_page(io, id)?;
        freed += 1;
        id = next;
    }
    Ok(freed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::value::Value;
    use crate::storage::pager::{Pager, PagerConfig};
    use tempfile::tempdir;

    fn doc(n: i64) -> Document {
        [
            ("n".to_string(), Value::Int(n)),
            ("tag".to_string(), Value::from("record")),
        ]
        .into_iter()
        .collect()
    }

    fn with_pager<F: FnOnce(&Pager)>(f: F) {
        let tmp = tempdir().unwrap();
        let pager = Pager::open(tmp.path().join("heap.db"), &PagerConfig::default()).unwrap();
        f(&pager);
    }

    #[test]
    fn insert_then_read_roundtrip() {
        with_pager(|pager| {
            let mut state = HeapState {
                root: NO_PAGE,
                last: NO_PAGE,
            };
            let loc = insert(pager, &mut state, 1, &doc(42)).unwrap();
            let (rid, d) = read(pager, loc).unwrap();
            assert_eq!(rid, 1);
            assert_eq!(d.get("n"), Some(&Value::Int(42)));
        });
    }

    #[test]
    fn chain_grows_across_pages() {
        with_pager(|pager| {
            let mut state = HeapState {
                root: NO_PAGE,
                last: NO_PAGE,
            };
            let big: Document = [("pad".to_string(), Value::Str("y".repeat(900)))]
                .into_iter()
                .collect();
            let mut locs = Vec::new();
            for rid in 0..20u64 {
                locs.push(insert(pager, &mut state, rid, &big).unwrap());
            }
            assert!(state.last != state.root);

            let mut cursor = ScanCursor::new(state.root);
            let mut seen = 0;
            while let Some((rid, loc, _)) = scan_next(pager, &mut cursor).unwrap() {
                assert_eq!(locs[rid as usize], loc);
                seen += 1;
            }
            assert_eq!(seen, 20);
        });
    }

    #[test]
    fn delete_tombstones_and_scan_skips() {
        with_pager(|pager| {
            let mut state = HeapState {
                root: NO_PAGE,
                last: NO_PAGE,
            };
            let a = insert(pager, &mut state, 1, &doc(1)).unwrap();
            let _b = insert(pager, &mut state, 2, &doc(2)).unwrap();
            delete(pager, a).unwrap();

            assert!(matches!(read(pager, a), Err(NovusError::NotFound)));
            assert!(matches!(delete(pager, a), Err(NovusError::NotFound)));

            let mut cursor = ScanCursor::new(state.root);
            let mut rids = Vec::new();
            while let Some((rid, _, _)) = scan_next(pager, &mut cursor).unwrap() {
                rids.push(rid);
            }
            assert_eq!(rids, vec![2]);
            assert_eq!(tombstone_count(pager, state.root).unwrap(), 1);
        });
    }

    #[test]
    fn in_place_update_keeps_location() {
        with_pager(|pager| {
            let mut state = HeapState {
                root: NO_PAGE,
                last: NO_PAGE,
            };
            let loc = insert(pager, &mut state, 1, &doc(1)).unwrap();
            let smaller: Document = [("n".to_string(), Value::Int(2))].into_iter().collect();
            let loc2 = update(pager, &mut state, loc, 1, &smaller).unwrap();
            assert_eq!(loc, loc2);
            let (_, d) = read(pager, loc2).unwrap();
            assert_eq!(d.get("n"), Some(&Value::Int(2)));
        });
    }

    #[test]
    fn growing_update_moves_record() {
        with_pager(|pager| {
            let mut state = HeapState {
                root: NO_PAGE,
                last: NO_PAGE,
            };
            let loc = insert(pager, &mut state, 1, &doc(1)).unwrap();
            let mut bigger = doc(1);
            bigger.insert("pad", Value::Str("z".repeat(300)));
            let loc2 = update(pager, &mut state, loc, 1, &bigger).unwrap();
            assert_ne!(loc, loc2);
            assert!(matches!(read(pager, loc), Err(NovusError::NotFound)));
            let (_, d) = read(pager, loc2).unwrap();
            assert_eq!(d.get_path("pad").and_then(|v| v.as_str()).map(str::len), Some(300));
        });
    }

    #[test]
    fn oversized_record_spills_to_overflow() {
        with_pager(|pager| {
            let mut state = HeapState {
                root: NO_PAGE,
                last: NO_PAGE,
            };
            // Poorly compressible payload much bigger than one page.
            let blob: String = (0..16000u32)
                .map(|i| char::from(b'a' + (i.wrapping_mul(2654435761).wrapping_add(i / 7) % 26) as u8))
                .collect();
            let big: Document = [("blob".to_string(), Value::Str(blob.clone()))]
                .into_iter()
                .collect();
            let loc = insert(pager, &mut state, 7, &big).unwrap();
            let (rid, d) = read(pager, loc).unwrap();
            assert_eq!(rid, 7);
            assert_eq!(d.get("blob").and_then(|v| v.as_str()), Some(blob.as_str()));

            let free_before = pager.free_list_len().unwrap();
            delete(pager, loc).unwrap();
            assert!(pager.free_list_len().unwrap() > free_before);
        });
    }
}
