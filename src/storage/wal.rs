//! Write-ahead log.
//!
//! Sibling file `<db>.wal`. An append-only sequence of frames:
//! `{lsn:u64, txn_id:u64, kind:u8, page_id:u32, reserved:u16,
//! payload_len:u32, payload, crc32}`. `PagePut` frames carry the full
//! post-image of a page (redo-only). Committed writes are durable once the
//! `CommitTxn` frame is fsync'd; a partial tail fails its CRC and is safe to
//! truncate.

use std::fs::{File, OpenOptions};
use std::io::{Cursor, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher;
use log::warn;

use crate::core::errors::NovusError;
use crate::storage::page::PageId;

const WAL_MAGIC: &[u8; 8] = b"NOVUSWAL";
const WAL_VERSION: u32 = 1;
const WAL_HEADER_SIZE: usize = 16;

const FRAME_HEADER_SIZE: usize = 8 + 8 + 1 + 4 + 2 + 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    BeginTxn = 1,
    PagePut = 2,
    CommitTxn = 3,
    AbortTxn = 4,
    Checkpoint = 5,
}

impl TryFrom<u8> for FrameKind {
    type Error = NovusError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::BeginTxn),
            2 => Ok(Self::PagePut),
            3 => Ok(Self::CommitTxn),
            4 => Ok(Self::AbortTxn),
            5 => Ok(Self::Checkpoint),
            other => Err(NovusError::Corruption(format!(
                "invalid WAL frame kind: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub lsn: u64,
    pub txn_id: u64,
    pub kind: FrameKind,
    pub page_id: PageId,
    pub payload: Vec<u8>,
}

#[derive(Debug)]
pub struct Wal {
    file: File,
    path: PathBuf,
    next_lsn: u64,
}

impl Wal {
    /// Open or create the log. An existing file is scanned; a torn tail is
    /// truncated away before the appender is positioned at the end.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, NovusError> {
        let path = path.as_ref().to_path_buf();
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();

        if len == 0 {
            let mut header = Vec::with_capacity(WAL_HEADER_SIZE);
            header.extend_from_slice(WAL_MAGIC);
            header.write_u32::<LittleEndian>(WAL_VERSION)?;
            header.resize(WAL_HEADER_SIZE, 0);
            file.write_all(&header)?;
            file.sync_all()?;
            return Ok(Self {
                file,
                path,
                next_lsn: 1,
            });
        }

        let mut bytes = Vec::new();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut bytes)?;
        check_header(&bytes)?;

        let (frames, valid_end) = parse_frames(&bytes);
        if (valid_end as u64) < len {
            warn!(
                "truncating torn WAL tail: {} of {} bytes valid",
                valid_end, len
            );
            file.set_len(valid_end as u64)?;
            file.sync_all()?;
        }
        file.seek(SeekFrom::Start(valid_end as u64))?;

        let next_lsn = frames.last().map(|f| f.lsn + 1).unwrap_or(1);
        Ok(Self {
            file,
            path,
            next_lsn,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn append(
        &mut self,
        txn_id: u64,
        kind: FrameKind,
        page_id: PageId,
        payload: &[u8],
    ) -> Result<u64, NovusError> {
        let lsn = self.next_lsn;
        self.next_lsn += 1;

        let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len() + 4);
        buf.write_u64::<LittleEndian>(lsn)?;
        buf.write_u64::<LittleEndian>(txn_id)?;
        buf.push(kind as u8);
        buf.write_u32::<LittleEndian>(page_id)?;
        buf.write_u16::<LittleEndian>(0)?;
        buf.write_u32::<LittleEndian>(payload.len() as u32)?;
        buf.extend_from_slice(payload);

        let mut hasher = Hasher::new();
        hasher.update(&buf);
        buf.write_u32::<LittleEndian>(hasher.finalize())?;

        self.file.write_all(&buf)?;
        Ok(lsn)
    }

    pub fn sync(&mut self) -> Result<(), NovusError> {
        self.file.sync_all()?;
        Ok(())
    }

    /// Re-scan the log from the start; stops at the first bad frame.
    pub fn frames(&mut self) -> Result<Vec<Frame>, NovusError> {
        let pos = self.file.stream_position()?;
        let mut bytes = Vec::new();
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut bytes)?;
        self.file.seek(SeekFrom::Start(pos))?;
        check_header(&bytes)?;
        let (frames, _) = parse_frames(&bytes);
        Ok(frames)
    }

    /// Append a `Checkpoint` frame, fsync, then truncate the log back to its
    /// header. Frames covered by the checkpoint are no longer needed: the
    /// data file holds their effects.
    pub fn checkpoint(&mut self, up_to_lsn: u64) -> Result<(), NovusError> {
        let mut payload = Vec::with_capacity(8);
        payload.write_u64::<LittleEndian>(up_to_lsn)?;
        self.append(0, FrameKind::Checkpoint, 0, &payload)?;
        self.sync()?;
        self.file.set_len(WAL_HEADER_SIZE as u64)?;
        self.file.seek(SeekFrom::Start(WAL_HEADER_SIZE as u64))?;
        self.file.sync_all()?;
        Ok(())
    }

    pub fn size(&self) -> Result<u64, NovusError> {
        Ok(self.file.metadata()?.len())
    }

    /// LSN the next append will receive; lets a commit stamp page headers
    /// before framing them.
    pub fn next_lsn(&self) -> u64 {
        self.next_lsn
    }
}

fn check_header(bytes: &[u8]) -> Result<(), NovusError> {
    if bytes.len() < WAL_HEADER_SIZE {
        return Err(NovusError::Corruption("WAL header too short".into()));
    }
    if &bytes[0..8] != WAL_MAGIC {
        return Err(NovusError::Corruption("bad WAL magic".into()));
    }
    let mut cursor = Cursor::new(&bytes[8..12]);
    let version = cursor.read_u32::<LittleEndian>().unwrap_or(0);
    if version != WAL_VERSION {
        return Err(NovusError::Corruption(format!(
            "unsupported WAL version: {version}"
        )));
    }
    Ok(())
}

/// Parse frames after the header; returns the frames and the byte offset of
/// the end of the last valid frame.
fn parse_frames(bytes: &[u8]) -> (Vec<Frame>, usize) {
    let mut frames = Vec::new();
    let mut offset = WAL_HEADER_SIZE;

    loop {
        let remaining = bytes.len().saturating_sub(offset);
        if remaining < FRAME_HEADER_SIZE + 4 {
            break;
        }
        let mut cursor = Cursor::new(&bytes[offset..]);
        let lsn = cursor.read_u64::<LittleEndian>().unwrap_or(0);
        let txn_id = cursor.read_u64::<LittleEndian>().unwrap_or(0);
        let kind_byte = cursor.read_u8().unwrap_or(0);
        let page_id = cursor.read_u32::<LittleEndian>().unwrap_or(0);
        let _reserved = cursor.read_u16::<LittleEndian>().unwrap_or(0);
        let payload_len = cursor.read_u32::<LittleEndian>().unwrap_or(0) as usize;

        let frame_len = FRAME_HEADER_SIZE + payload_len + 4;
        if remaining < frame_len {
            break;
        }
        let body = &bytes[offset..offset + FRAME_HEADER_SIZE + payload_len];
        let mut crc_cursor = Cursor::new(&bytes[offset + FRAME_HEADER_SIZE + payload_len..]);
        let stored_crc = crc_cursor.read_u32::<LittleEndian>().unwrap_or(0);
        let mut hasher = Hasher::new();
        hasher.update(body);
        if hasher.finalize() != stored_crc {
            break;
        }
        let Ok(kind) = FrameKind::try_from(kind_byte) else {
            break;
        };

        frames.push(Frame {
            lsn,
            txn_id,
            kind,
            page_id,
            payload: bytes[offset + FRAME_HEADER_SIZE..offset + FRAME_HEADER_SIZE + payload_len]
                .to_vec(),
        });
        offset += frame_len;
    }

    (frames, offset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_and_rescan() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("test.wal");
        let mut wal = Wal::open(&path).unwrap();

        wal.append(1, FrameKind::BeginTxn, 0, &[]).unwrap();
        wal.append(1, FrameKind::PagePut, 7, b"page-bytes").unwrap();
        wal.append(1, FrameKind::CommitTxn, 0, &[]).unwrap();
        wal.sync().unwrap();

        let frames = wal.frames().unwrap();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[1].kind, FrameKind::PagePut);
        assert_eq!(frames[1].page_id, 7);
        assert_eq!(frames[1].payload, b"page-bytes");
        assert_eq!(frames[2].lsn, 3);
    }

    #[test]
    fn lsn_continues_after_reopen() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("test.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(1, FrameKind::BeginTxn, 0, &[]).unwrap();
            wal.sync().unwrap();
        }
        let mut wal = Wal::open(&path).unwrap();
        let lsn = wal.append(2, FrameKind::BeginTxn, 0, &[]).unwrap();
        assert_eq!(lsn, 2);
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("test.wal");
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(1, FrameKind::BeginTxn, 0, &[]).unwrap();
            wal.append(1, FrameKind::CommitTxn, 0, &[]).unwrap();
            wal.sync().unwrap();
        }
        // Simulate a torn write: half a frame of garbage at the tail.
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&[0xde, 0xad, 0xbe, 0xef, 0x01]).unwrap();
        }
        let mut wal = Wal::open(&path).unwrap();
        let frames = wal.frames().unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].kind, FrameKind::CommitTxn);
    }

    #[test]
    fn checkpoint_truncates_to_header() {
        let tmp = tempdir().unwrap();
        let path = tmp.path().join("test.wal");
        let mut wal = Wal::open(&path).unwrap();
        wal.append(1, FrameKind::BeginTxn, 0, &[]).unwrap();
        wal.append(1, FrameKind::PagePut, 3, &vec![0u8; 128]).unwrap();
        wal.append(1, FrameKind::CommitTxn, 0, &[]).unwrap();
        wal.sync().unwrap();

        wal.checkpoint(3).unwrap();
        assert_eq!(wal.size().unwrap(), WAL_HEADER_SIZE as u64);
        assert!(wal.frames().unwrap().is_empty());

        // The appender keeps working after truncation.
        wal.append(2, FrameKind::BeginTxn, 0, &[]).unwrap();
        wal.sync().unwrap();
        assert_eq!(wal.frames().unwrap().len(), 1);
    }
}
