// Copyright (c) 2024-present, tealtree
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{checksum::Checksum, DocId};
use varint_rs::{VarintReader, VarintWriter};

/// A byte stream of LEB128-encoded doc-id deltas: 7 payload bits per byte,
/// high bit set on continuation.
///
/// Supports appending during construction, forward cursors, and bounded
/// in-place rewriting at a prior position. An in-place writer is locked to a
/// cursor on the same buffer: it must never advance past the cursor, because
/// a single pass reads old entries and writes new entries into the same
/// bytes. If a write would cross the cursor it spills into a temporary
/// "overheat" buffer, which `flush` copies back once the cursor has moved on.
#[derive(Clone, Debug, Default)]
pub struct VarIntBuffer {
    data: Vec<u8>,
}

impl VarIntBuffer {
    /// Creates an empty buffer.
    #[must_use]
    pub fn new() -> Self {
        Self { data: Vec::new() }
    }

    /// Stream length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the stream holds no bytes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Resizes the stream, zero-filling any growth.
    pub fn resize(&mut self, len: usize) {
        self.data.resize(len, 0);
    }

    /// Appends `n` zero bytes of reserve space.
    pub fn append_tail(&mut self, n: usize) {
        let len = self.data.len();
        self.data.resize(len + n, 0);
    }

    /// Drops all content, keeping the allocation.
    pub fn clear(&mut self) {
        self.data.clear();
    }

    /// Moves `n` bytes from `from` to `to` within the stream; the ranges may
    /// overlap.
    pub fn move_within(&mut self, from: usize, to: usize, n: usize) {
        self.data.copy_within(from..from + n, to);
    }

    /// Copies `n` bytes out of another stream.
    pub fn copy_from(&mut self, other: &Self, from: usize, to: usize, n: usize) {
        if n == 0 {
            return;
        }
        self.data[to..to + n].copy_from_slice(&other.data[from..from + n]);
    }

    /// Checksum over `n` bytes starting at `begin`.
    #[must_use]
    pub fn checksum(&self, begin: usize, n: usize) -> Checksum {
        Checksum::of_bytes(&self.data[begin..begin + n])
    }

    /// Appends one value to the end of the stream (build phase).
    pub fn append(&mut self, value: DocId) -> crate::Result<()> {
        self.data.write_u32_varint(value)?;
        Ok(())
    }

    /// Forward cursor starting at byte offset `start`.
    #[must_use]
    pub fn cursor(&self, start: usize) -> VarIntCursor {
        VarIntCursor { pos: start }
    }

    /// In-place writer at byte offset `start`, not locked to any cursor.
    ///
    /// Writes stay within the current stream length.
    #[must_use]
    pub fn writer(&self, start: usize) -> VarIntWriter {
        VarIntWriter {
            pos: start,
            overheat_capacity: self.data.len(),
            overheat: None,
        }
    }

    /// A cursor and an in-place writer locked to it, both starting at
    /// `offset`. `overheat_capacity` sizes the spill buffer reserved on the
    /// first crossing write.
    #[must_use]
    pub fn cursor_and_writer(&self, offset: usize, overheat_capacity: usize) -> (VarIntCursor, VarIntWriter) {
        let capacity = if overheat_capacity == 0 {
            self.data.len()
        } else {
            overheat_capacity
        };

        (
            VarIntCursor { pos: offset },
            VarIntWriter {
                pos: offset,
                overheat_capacity: capacity,
                overheat: None,
            },
        )
    }
}

/// Forward read cursor over a [`VarIntBuffer`].
///
/// Detached: holds only its byte position, so it can interleave with writers
/// on the same buffer.
#[derive(Clone, Debug)]
pub struct VarIntCursor {
    pos: usize,
}

impl VarIntCursor {
    /// Current byte position.
    #[must_use]
    pub fn pos(&self) -> usize {
        self.pos
    }

    /// Decodes the next value.
    pub fn next(&mut self, buf: &VarIntBuffer) -> crate::Result<DocId> {
        let mut source = CursorSource {
            data: &buf.data,
            pos: &mut self.pos,
        };
        Ok(source.read_u32_varint()?)
    }
}

struct CursorSource<'a> {
    data: &'a [u8],
    pos: &'a mut usize,
}

impl std::io::Read for CursorSource<'_> {
    fn read(&mut self, out: &mut [u8]) -> std::io::Result<usize> {
        let remaining = &self.data[(*self.pos).min(self.data.len())..];
        let n = remaining.len().min(out.len());
        out[..n].copy_from_slice(&remaining[..n]);
        *self.pos += n;
        Ok(n)
    }
}

struct Overheat {
    bytes: Vec<u8>,
    resume_pos: usize,
}

impl std::fmt::Debug for Overheat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Overheat({} bytes at {})", self.bytes.len(), self.resume_pos)
    }
}

/// In-place writer over a [`VarIntBuffer`], optionally locked to a cursor.
///
/// Every `write` takes the lock-stepped cursor's current byte position
/// (`usize::MAX` when the writer is free-running); the writer spills to the
/// overheat buffer instead of crossing it.
#[derive(Debug)]
pub struct VarIntWriter {
    pos: usize,
    overheat_capacity: usize,
    overheat: Option<Overheat>,
}

impl VarIntWriter {
    /// Encodes one value at the current position.
    pub fn write(&mut self, buf: &mut VarIntBuffer, read_pos: usize, value: DocId) -> crate::Result<()> {
        let mut sink = WriterSink {
            data: &mut buf.data,
            pos: &mut self.pos,
            overheat: &mut self.overheat,
            overheat_capacity: self.overheat_capacity,
            read_pos,
        };
        sink.write_u32_varint(value)?;
        Ok(())
    }

    /// Copies any overheat spill back into the stream. Must be called after
    /// the lock-stepped cursor has passed the writer's finish position.
    pub fn flush(&mut self, buf: &mut VarIntBuffer, read_pos: usize) -> crate::Result<()> {
        if let Some(overheat) = self.overheat.take() {
            let end = overheat.resume_pos + overheat.bytes.len();
            if end > read_pos {
                return Err(crate::Error::Train(
                    "sparse stream rewrite outgrew the bytes consumed by its cursor".into(),
                ));
            }
            buf.data[overheat.resume_pos..end].copy_from_slice(&overheat.bytes);
            self.pos = end;
        }
        Ok(())
    }

    /// Byte position of the next write. Only valid once any overheat spill
    /// has been flushed.
    #[must_use]
    pub fn pos(&self) -> usize {
        debug_assert!(self.overheat.is_none(), "flush() the overheat spill first");
        self.pos
    }
}

struct WriterSink<'a> {
    data: &'a mut Vec<u8>,
    pos: &'a mut usize,
    overheat: &'a mut Option<Overheat>,
    overheat_capacity: usize,
    read_pos: usize,
}

impl WriterSink<'_> {
    fn put(&mut self, byte: u8) -> std::io::Result<()> {
        if let Some(overheat) = self.overheat.as_mut() {
            overheat.bytes.push(byte);
            return Ok(());
        }

        if *self.pos >= self.read_pos {
            // Writing more bytes than the cursor has read so far; switch to
            // the overheat buffer until flush().
            let mut bytes = Vec::with_capacity(self.overheat_capacity);
            bytes.push(byte);
            *self.overheat = Some(Overheat {
                bytes,
                resume_pos: *self.pos,
            });
            return Ok(());
        }

        match self.data.get_mut(*self.pos) {
            Some(slot) => {
                *slot = byte;
                *self.pos += 1;
                Ok(())
            }
            None => Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "varint write past the end of the stream",
            )),
        }
    }
}

impl std::io::Write for WriterSink<'_> {
    fn write(&mut self, bytes: &[u8]) -> std::io::Result<usize> {
        for &byte in bytes {
            self.put(byte)?;
        }
        Ok(bytes.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::VarIntBuffer;
    use test_log::test;

    #[test]
    fn append_read_back() {
        let values = [0u32, 1, 127, 128, 300, 16_383, 16_384, 1 << 21, u32::MAX];

        let mut buf = VarIntBuffer::new();
        for &v in &values {
            buf.append(v).unwrap();
        }

        let mut cursor = buf.cursor(0);
        for &v in &values {
            assert_eq!(v, cursor.next(&buf).unwrap());
        }
        assert_eq!(buf.len(), cursor.pos());
    }

    #[test]
    fn cursor_past_end_fails() {
        let mut buf = VarIntBuffer::new();
        buf.append(5).unwrap();

        let mut cursor = buf.cursor(0);
        assert_eq!(5, cursor.next(&buf).unwrap());
        assert!(cursor.next(&buf).is_err());
    }

    #[test]
    fn lock_step_rewrite_in_place() {
        // New values encode to no more bytes than the old ones, so the
        // rewrite stays behind the cursor the whole way.
        let old = [1000u32, 2000, 3000, 4000];
        let new = [1u32, 2, 3, 4];

        let mut buf = VarIntBuffer::new();
        for &v in &old {
            buf.append(v).unwrap();
        }

        let (mut cursor, mut writer) = buf.cursor_and_writer(0, 0);
        for &v in &new {
            cursor.next(&buf).unwrap();
            writer.write(&mut buf, cursor.pos(), v).unwrap();
        }
        writer.flush(&mut buf, cursor.pos()).unwrap();
        assert_eq!(new.len(), writer.pos());

        let mut check = buf.cursor(0);
        for &v in &new {
            assert_eq!(v, check.next(&buf).unwrap());
        }
    }

    #[test]
    fn overheat_spill_and_flush() {
        // The first rewritten value is longer than the first value read, so
        // the writer overheats immediately and recovers on flush.
        let old = [1u32, 1, 1, 300, 300];
        let new = [300u32, 1, 1, 1, 1];

        let mut buf = VarIntBuffer::new();
        for &v in &old {
            buf.append(v).unwrap();
        }
        let total = buf.len();

        let (mut cursor, mut writer) = buf.cursor_and_writer(0, 0);
        for &v in &new {
            cursor.next(&buf).unwrap();
            writer.write(&mut buf, cursor.pos(), v).unwrap();
        }
        writer.flush(&mut buf, cursor.pos()).unwrap();

        assert_eq!(total, cursor.pos());
        assert_eq!(6, writer.pos());

        let mut check = buf.cursor(0);
        for &v in &new {
            assert_eq!(v, check.next(&buf).unwrap());
        }
    }

    #[test]
    fn flush_rejects_net_growth() {
        let old = [1u32, 1];
        let new = [300u32, 300];

        let mut buf = VarIntBuffer::new();
        for &v in &old {
            buf.append(v).unwrap();
        }

        let (mut cursor, mut writer) = buf.cursor_and_writer(0, 0);
        for &v in &new {
            cursor.next(&buf).unwrap();
            writer.write(&mut buf, cursor.pos(), v).unwrap();
        }
        assert!(writer.flush(&mut buf, cursor.pos()).is_err());
    }

    #[test]
    fn move_and_copy_bytes() {
        let mut buf = VarIntBuffer::new();
        for v in 1..=5u32 {
            buf.append(v).unwrap();
        }

        buf.append_tail(3);
        assert_eq!(8, buf.len());

        buf.move_within(0, 3, 5);
        let mut cursor = buf.cursor(3);
        for v in 1..=5u32 {
            assert_eq!(v, cursor.next(&buf).unwrap());
        }

        let mut other = VarIntBuffer::new();
        other.resize(5);
        other.copy_from(&buf, 3, 0, 5);
        let mut cursor = other.cursor(0);
        for v in 1..=5u32 {
            assert_eq!(v, cursor.next(&other).unwrap());
        }
    }

    #[test]
    fn free_writer_stays_in_bounds() {
        let mut buf = VarIntBuffer::new();
        buf.resize(4);

        let mut writer = buf.writer(0);
        writer.write(&mut buf, usize::MAX, 300).unwrap();
        writer.write(&mut buf, usize::MAX, 7).unwrap();
        assert_eq!(3, writer.pos());

        // A fourth byte fits, a fifth does not.
        writer.write(&mut buf, usize::MAX, 1).unwrap();
        assert!(writer.write(&mut buf, usize::MAX, 1).is_err());
    }
}
