// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Crash-recoverable FIFO on local disk.
//!
//! Records are appended as CRC-framed entries to numbered segment files:
//!
//! ```text
//! <dir>/00000000000000000001.seg
//! <dir>/00000000000000000002.seg
//! <dir>/cursor
//! ```
//!
//! A frame is `len: u32 LE | id: u64 LE | payload | crc32: u32 LE`, the CRC
//! covering everything before it. The cursor file holds the read position
//! and the next identifier to assign, and is rewritten after every dequeue.
//!
//! On open the directory is scanned from the cursor: frames are verified, a
//! torn or corrupt tail is truncated away and the counters are rebuilt.

use crate::constants::SEGMENT_ROLL_BYTES;
use crate::errors::QueueError;
use crate::queue::QueueItem;
use bytes::Bytes;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, warn};

const SEGMENT_EXTENSION: &str = "seg";
const CURSOR_FILE_NAME: &str = "cursor";

const FRAME_HEADER_LEN: usize = 4 + 8;
const FRAME_CRC_LEN: usize = 4;
const FRAME_OVERHEAD: u64 = (FRAME_HEADER_LEN + FRAME_CRC_LEN) as u64;

const CURSOR_LEN: usize = 8 + 8 + 8 + 4;

#[derive(Debug)]
pub struct DurableQueue {
    dir: PathBuf,
    state: Mutex<Option<Store>>,
}

impl DurableQueue {
    /// Opens (or creates) the queue stored in `dir`, recovering whatever a
    /// previous process left behind.
    pub fn open(dir: impl Into<PathBuf>, sync_writes: bool) -> Result<Self, QueueError> {
        Self::open_with_segment_size(dir, sync_writes, SEGMENT_ROLL_BYTES)
    }

    pub(crate) fn open_with_segment_size(
        dir: impl Into<PathBuf>,
        sync_writes: bool,
        segment_roll_bytes: u64,
    ) -> Result<Self, QueueError> {
        let dir = dir.into();
        let store = Store::open(&dir, sync_writes, segment_roll_bytes)?;
        info!(
            "Opened durable queue at {} with {} records ({} bytes)",
            dir.display(),
            store.items,
            store.bytes
        );
        Ok(DurableQueue {
            dir,
            state: Mutex::new(Some(store)),
        })
    }

    fn state(&self) -> MutexGuard<'_, Option<Store>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Appends `payload`. The durable queue has no byte cap, so this only
    /// fails on I/O errors or a record too large to frame.
    pub fn enqueue(&self, payload: Bytes) -> Result<QueueItem, QueueError> {
        self.state()
            .as_mut()
            .ok_or(QueueError::Closed)?
            .enqueue(payload)
    }

    pub fn dequeue(&self) -> Result<QueueItem, QueueError> {
        self.state().as_mut().ok_or(QueueError::Closed)?.dequeue()
    }

    /// Occupied payload bytes.
    pub fn length(&self) -> u64 {
        self.state().as_ref().map_or(0, |store| store.bytes)
    }

    pub fn item_count(&self) -> u64 {
        self.state().as_ref().map_or(0, |store| store.items)
    }

    /// Syncs everything to disk and releases the file handles. Unconsumed
    /// records stay on disk for the next open.
    pub fn close(&self) -> Result<(), QueueError> {
        match self.state().take() {
            Some(store) => store.close().map_err(QueueError::from),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Segment {
    id: u64,
    len: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Cursor {
    segment: u64,
    offset: u64,
    next_id: u64,
}

impl Cursor {
    fn encode(&self) -> [u8; CURSOR_LEN] {
        let mut buf = [0u8; CURSOR_LEN];
        buf[0..8].copy_from_slice(&self.segment.to_le_bytes());
        buf[8..16].copy_from_slice(&self.offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.next_id.to_le_bytes());
        let crc = crc32fast::hash(&buf[..24]);
        buf[24..].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    fn decode(buf: &[u8]) -> Option<Cursor> {
        if buf.len() != CURSOR_LEN {
            return None;
        }
        if crc32fast::hash(&buf[..24]) != le_u32(&buf[24..28]) {
            return None;
        }
        Some(Cursor {
            segment: le_u64(&buf[0..8]),
            offset: le_u64(&buf[8..16]),
            next_id: le_u64(&buf[16..24]),
        })
    }
}

#[derive(Debug)]
struct Store {
    dir: PathBuf,
    sync_writes: bool,
    segment_roll_bytes: u64,
    /// Rolled segments still holding unconsumed frames, oldest first.
    sealed: VecDeque<Segment>,
    active: Segment,
    writer: File,
    reader: Option<(u64, File)>,
    cursor: Cursor,
    cursor_file: File,
    next_id: u64,
    items: u64,
    bytes: u64,
}

/// Outcome of scanning one segment from a start offset.
#[derive(Debug)]
struct Scan {
    start: u64,
    len: u64,
    items: u64,
    bytes: u64,
    last_id: Option<u64>,
}

impl Store {
    fn open(dir: &Path, sync_writes: bool, segment_roll_bytes: u64) -> Result<Self, QueueError> {
        fs::create_dir_all(dir)?;

        let segment_ids = list_segments(dir)?;
        let cursor_path = dir.join(CURSOR_FILE_NAME);
        let mut cursor = match read_cursor(&cursor_path)? {
            Some(cursor) => cursor,
            None => {
                if !segment_ids.is_empty() {
                    warn!(
                        "Queue cursor in {} is missing or corrupt, replaying from the oldest segment",
                        dir.display()
                    );
                }
                Cursor {
                    segment: segment_ids.first().copied().unwrap_or(1),
                    offset: 0,
                    next_id: 1,
                }
            }
        };

        let (consumed, live): (Vec<u64>, Vec<u64>) = segment_ids
            .into_iter()
            .partition(|&id| id < cursor.segment);
        for id in consumed {
            fs::remove_file(segment_path(dir, id))?;
            debug!("Removed consumed queue segment {id}");
        }
        if let Some(&first) = live.first() {
            if first != cursor.segment {
                warn!(
                    "Queue segment {} named by the cursor is gone, resuming at segment {first}",
                    cursor.segment
                );
                cursor.segment = first;
                cursor.offset = 0;
            }
        }

        let mut segments = Vec::with_capacity(live.len().max(1));
        let mut items = 0;
        let mut bytes = 0;
        let mut last_id = None;
        for id in live {
            let start = if id == cursor.segment { cursor.offset } else { 0 };
            let scan = scan_segment(&segment_path(dir, id), start)?;
            if id == cursor.segment {
                cursor.offset = scan.start;
            }
            items += scan.items;
            bytes += scan.bytes;
            last_id = scan.last_id.or(last_id);
            segments.push(Segment { id, len: scan.len });
        }

        let active = match segments.pop() {
            Some(active) => active,
            None => {
                File::create(segment_path(dir, cursor.segment))?;
                Segment {
                    id: cursor.segment,
                    len: 0,
                }
            }
        };
        let writer = OpenOptions::new()
            .write(true)
            .open(segment_path(dir, active.id))?;

        let next_id = cursor.next_id.max(last_id.map_or(1, |id| id + 1));
        cursor.next_id = next_id;

        let cursor_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&cursor_path)?;

        let mut store = Store {
            dir: dir.to_path_buf(),
            sync_writes,
            segment_roll_bytes,
            sealed: segments.into(),
            active,
            writer,
            reader: None,
            cursor,
            cursor_file,
            next_id,
            items,
            bytes,
        };

        if store.items == 0 {
            store.reset_empty()?;
        } else {
            store.skip_consumed_segments()?;
            store.persist_cursor()?;
        }
        Ok(store)
    }

    fn enqueue(&mut self, payload: Bytes) -> Result<QueueItem, QueueError> {
        let len =
            u32::try_from(payload.len()).map_err(|_| QueueError::RecordTooLarge(payload.len()))?;

        if self.active.len >= self.segment_roll_bytes {
            self.roll()?;
        }

        let id = self.next_id;
        let frame = encode_frame(id, len, &payload);
        if let Err(e) = self.append(&frame) {
            // Cut off whatever part of the frame made it to disk.
            if let Err(rollback) = self.writer.set_len(self.active.len) {
                error!(
                    "Failed to roll back partial write in queue segment {}: {rollback}",
                    self.active.id
                );
            }
            return Err(e.into());
        }

        self.active.len += frame.len() as u64;
        self.next_id += 1;
        self.items += 1;
        self.bytes += u64::from(len);
        Ok(QueueItem { id, payload })
    }

    fn append(&mut self, frame: &[u8]) -> io::Result<()> {
        self.writer.seek(SeekFrom::Start(self.active.len))?;
        self.writer.write_all(frame)?;
        if self.sync_writes {
            self.writer.sync_data()?;
        }
        Ok(())
    }

    fn roll(&mut self) -> Result<(), QueueError> {
        self.writer.sync_data()?;
        let id = self.active.id + 1;
        let writer = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(segment_path(&self.dir, id))?;
        let sealed = std::mem::replace(&mut self.active, Segment { id, len: 0 });
        self.sealed.push_back(sealed);
        self.writer = writer;
        debug!("Rolled durable queue to segment {id}");
        Ok(())
    }

    fn dequeue(&mut self) -> Result<QueueItem, QueueError> {
        if self.items == 0 {
            return Err(QueueError::Empty);
        }
        self.skip_consumed_segments()?;

        let segment = self.cursor.segment;
        let offset = self.cursor.offset;
        let remaining = self.segment_len(segment).saturating_sub(offset);

        let mut file = match self.reader.take() {
            Some((id, file)) if id == segment => file,
            _ => File::open(segment_path(&self.dir, segment))?,
        };
        file.seek(SeekFrom::Start(offset))?;
        let frame = read_frame(&mut file, remaining)?;
        self.reader = Some((segment, file));

        match frame {
            Frame::Record(item) => {
                let len = item.payload.len() as u64;
                self.cursor.offset += FRAME_OVERHEAD + len;
                self.items -= 1;
                self.bytes -= len;
                self.cursor.next_id = self.next_id;

                let committed = if self.items == 0 {
                    self.reset_empty()
                } else {
                    self.persist_cursor()
                };
                // A failed cursor write only risks replaying this record after restart.
                if let Err(e) = committed {
                    error!("Failed to persist queue cursor: {e}");
                }
                Ok(item)
            }
            Frame::End | Frame::Invalid => {
                warn!(
                    "Corrupt frame in queue segment {segment} at offset {offset}, dropping the rest of the segment"
                );
                self.truncate_segment(segment, offset)?;
                self.recount()?;
                Err(QueueError::Corrupt { segment, offset })
            }
        }
    }

    fn skip_consumed_segments(&mut self) -> Result<(), QueueError> {
        while let Some(front) = self.sealed.front().copied() {
            if front.id != self.cursor.segment || self.cursor.offset < front.len {
                break;
            }
            self.sealed.pop_front();
            self.reader = None;
            fs::remove_file(segment_path(&self.dir, front.id))?;
            debug!("Removed consumed queue segment {}", front.id);

            self.cursor.segment = self.sealed.front().map_or(self.active.id, |s| s.id);
            self.cursor.offset = 0;
        }
        Ok(())
    }

    fn segment_len(&self, id: u64) -> u64 {
        if id == self.active.id {
            return self.active.len;
        }
        self.sealed
            .iter()
            .find(|s| s.id == id)
            .map_or(0, |s| s.len)
    }

    fn truncate_segment(&mut self, id: u64, len: u64) -> Result<(), QueueError> {
        self.reader = None;
        if id == self.active.id {
            self.writer.set_len(len)?;
            self.active.len = len;
            return Ok(());
        }
        OpenOptions::new()
            .write(true)
            .open(segment_path(&self.dir, id))?
            .set_len(len)?;
        if let Some(segment) = self.sealed.iter_mut().find(|s| s.id == id) {
            segment.len = len;
        }
        Ok(())
    }

    /// Rebuilds the item and byte counters from what is left on disk.
    fn recount(&mut self) -> Result<(), QueueError> {
        let mut items = 0;
        let mut bytes = 0;
        for segment in self.sealed.iter_mut().chain(std::iter::once(&mut self.active)) {
            let start = if segment.id == self.cursor.segment {
                self.cursor.offset
            } else {
                0
            };
            let scan = scan_segment(&segment_path(&self.dir, segment.id), start)?;
            segment.len = scan.len;
            items += scan.items;
            bytes += scan.bytes;
        }
        self.items = items;
        self.bytes = bytes;
        self.reader = None;

        if self.items == 0 {
            self.reset_empty()
        } else {
            self.persist_cursor()
        }
    }

    /// Drops every segment but the active one, truncates it, then points
    /// the cursor at its start.
    fn reset_empty(&mut self) -> Result<(), QueueError> {
        self.reader = None;
        while let Some(segment) = self.sealed.pop_front() {
            fs::remove_file(segment_path(&self.dir, segment.id))?;
        }
        self.writer.set_len(0)?;
        if self.sync_writes {
            self.writer.sync_data()?;
        }
        self.active.len = 0;
        self.cursor = Cursor {
            segment: self.active.id,
            offset: 0,
            next_id: self.next_id,
        };
        self.persist_cursor()
    }

    fn persist_cursor(&mut self) -> Result<(), QueueError> {
        self.cursor_file.seek(SeekFrom::Start(0))?;
        self.cursor_file.write_all(&self.cursor.encode())?;
        if self.sync_writes {
            self.cursor_file.sync_data()?;
        }
        Ok(())
    }

    fn close(self) -> io::Result<()> {
        self.writer.sync_all()?;
        self.cursor_file.sync_all()?;
        debug!(
            "Closed durable queue at {} with {} records left",
            self.dir.display(),
            self.items
        );
        Ok(())
    }
}

#[derive(Debug)]
enum Frame {
    Record(QueueItem),
    /// Clean end of segment.
    End,
    /// Torn write or checksum mismatch.
    Invalid,
}

fn frame_crc(len: u32, id: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&len.to_le_bytes());
    hasher.update(&id.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

fn encode_frame(id: u64, len: u32, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(payload.len() + FRAME_OVERHEAD as usize);
    frame.extend_from_slice(&len.to_le_bytes());
    frame.extend_from_slice(&id.to_le_bytes());
    frame.extend_from_slice(payload);
    frame.extend_from_slice(&frame_crc(len, id, payload).to_le_bytes());
    frame
}

/// Reads the frame at the reader's position. `remaining` is the number of
/// segment bytes left from there and bounds the payload length.
fn read_frame<R: Read>(reader: &mut R, remaining: u64) -> io::Result<Frame> {
    if remaining == 0 {
        return Ok(Frame::End);
    }
    if remaining < FRAME_OVERHEAD {
        return Ok(Frame::Invalid);
    }

    let mut header = [0u8; FRAME_HEADER_LEN];
    if read_full(reader, &mut header)? < FRAME_HEADER_LEN {
        return Ok(Frame::Invalid);
    }
    let len = le_u32(&header[0..4]);
    let id = le_u64(&header[4..12]);
    if u64::from(len) + FRAME_OVERHEAD > remaining {
        return Ok(Frame::Invalid);
    }

    let mut body = vec![0u8; len as usize + FRAME_CRC_LEN];
    if read_full(reader, &mut body)? < body.len() {
        return Ok(Frame::Invalid);
    }
    let crc = le_u32(&body[len as usize..]);
    body.truncate(len as usize);
    if frame_crc(len, id, &body) != crc {
        return Ok(Frame::Invalid);
    }

    Ok(Frame::Record(QueueItem {
        id,
        payload: Bytes::from(body),
    }))
}

/// Like `read_exact`, but reports a short read instead of failing on EOF.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Verifies every frame of a segment from `start`, truncating the file at
/// the first torn or corrupt one.
fn scan_segment(path: &Path, start: u64) -> Result<Scan, QueueError> {
    let file = OpenOptions::new().read(true).write(true).open(path)?;
    let file_len = file.metadata()?.len();
    let start = start.min(file_len);

    let mut reader = BufReader::new(&file);
    reader.seek(SeekFrom::Start(start))?;

    let mut scan = Scan {
        start,
        len: file_len,
        items: 0,
        bytes: 0,
        last_id: None,
    };
    let mut position = start;
    loop {
        match read_frame(&mut reader, file_len - position)? {
            Frame::Record(item) => {
                let len = item.payload.len() as u64;
                position += FRAME_OVERHEAD + len;
                scan.items += 1;
                scan.bytes += len;
                scan.last_id = Some(item.id);
            }
            Frame::End => break,
            Frame::Invalid => {
                warn!(
                    "Truncating {} at offset {position}: {} bytes of torn or corrupt data",
                    path.display(),
                    file_len - position
                );
                file.set_len(position)?;
                scan.len = position;
                break;
            }
        }
    }
    Ok(scan)
}

fn read_cursor(path: &Path) -> Result<Option<Cursor>, QueueError> {
    match fs::read(path) {
        Ok(buf) if buf.is_empty() => Ok(None),
        Ok(buf) => {
            let cursor = Cursor::decode(&buf);
            if cursor.is_none() {
                warn!("Ignoring corrupt queue cursor at {}", path.display());
            }
            Ok(cursor)
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

fn list_segments(dir: &Path) -> Result<Vec<u64>, QueueError> {
    let mut ids = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(SEGMENT_EXTENSION) {
            continue;
        }
        match path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .and_then(|stem| stem.parse::<u64>().ok())
        {
            Some(id) => ids.push(id),
            None => debug!("Ignoring unrecognized file {}", path.display()),
        }
    }
    ids.sort_unstable();
    Ok(ids)
}

fn segment_path(dir: &Path, id: u64) -> PathBuf {
    dir.join(format!("{id:020}.{SEGMENT_EXTENSION}"))
}

fn le_u32(buf: &[u8]) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[..4]);
    u32::from_le_bytes(bytes)
}

fn le_u64(buf: &[u8]) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    u64::from_le_bytes(bytes)
}
