//! Buffered, non-blocking output for an endpoint.
//!
//! Two shapes, kept as a tagged `enum` rather than a trait object so the hot
//! write path never pays for a vtable: [`SequentialBuffer`] for ordinary
//! streams, [`SeekableBuffer`] for files whose writes must land at the
//! offset they were issued at, even when interleaved with seeks.
use std::collections::VecDeque;
use std::io::{self, Seek, SeekFrom, Write};

/// A contiguous byte queue, flushed front-to-back.
#[derive(Default)]
pub struct SequentialBuffer(VecDeque<u8>);

impl SequentialBuffer {
    pub fn new() -> Self {
        Self(VecDeque::new())
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.0.extend(bytes);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Write the front of the buffer until the handle would block or the
    /// buffer empties. A `WouldBlock`/`Interrupted` error is absorbed and
    /// reported as a clean return, leaving the remainder for the next
    /// writability event.
    pub fn flush<W: Write>(&mut self, writer: &mut W) -> io::Result<()> {
        while !self.0.is_empty() {
            let (front, _) = self.0.as_slices();
            match writer.write(front) {
                Ok(0) => {
                    return Err(io::Error::new(io::ErrorKind::WriteZero, "wrote 0 bytes"));
                }
                Ok(n) => {
                    self.0.drain(..n);
                }
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::Interrupted =>
                {
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

/// An ordered sequence of `(offset, bytes)` chunks, each seeked to before
/// being drained, so later writes at earlier offsets correctly overwrite
/// bytes laid down by an earlier chunk.
#[derive(Default)]
pub struct SeekableBuffer(VecDeque<(u64, VecDeque<u8>)>);

impl SeekableBuffer {
    pub fn new() -> Self {
        Self(VecDeque::new())
    }

    pub fn append(&mut self, offset: u64, bytes: &[u8]) {
        self.0.push_back((offset, bytes.iter().copied().collect()));
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn flush<W: Write + Seek>(&mut self, writer: &mut W) -> io::Result<()> {
        while let Some((offset, chunk)) = self.0.front_mut() {
            writer.seek(SeekFrom::Start(*offset))?;

            while !chunk.is_empty() {
                let (front, _) = chunk.as_slices();
                match writer.write(front) {
                    Ok(0) => {
                        return Err(io::Error::new(io::ErrorKind::WriteZero, "wrote 0 bytes"));
                    }
                    Ok(n) => {
                        chunk.drain(..n);
                        *offset += n as u64;
                    }
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::Interrupted =>
                    {
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                }
            }
            self.0.pop_front();
        }
        Ok(())
    }
}

/// Either shape of output buffer, chosen once at endpoint construction time.
pub enum OutputBuffer {
    Sequential(SequentialBuffer),
    Seekable(SeekableBuffer),
}

impl OutputBuffer {
    pub fn sequential() -> Self {
        OutputBuffer::Sequential(SequentialBuffer::new())
    }

    pub fn seekable() -> Self {
        OutputBuffer::Seekable(SeekableBuffer::new())
    }

    pub fn is_empty(&self) -> bool {
        match self {
            OutputBuffer::Sequential(b) => b.is_empty(),
            OutputBuffer::Seekable(b) => b.is_empty(),
        }
    }

    /// Append bytes written at a given virtual offset (ignored by the
    /// non-seekable shape, which is always appended contiguously).
    pub fn append(&mut self, offset: u64, bytes: &[u8]) {
        match self {
            OutputBuffer::Sequential(b) => b.append(bytes),
            OutputBuffer::Seekable(b) => b.append(offset, bytes),
        }
    }

    /// Flush whichever shape this is against a handle that supports both
    /// writing and seeking (the non-seekable shape simply never seeks it).
    pub fn flush<W: Write + Seek>(&mut self, writer: &mut W) -> io::Result<()> {
        match self {
            OutputBuffer::Sequential(b) => b.flush(writer),
            OutputBuffer::Seekable(b) => b.flush(writer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn sequential_flush_drains_fully() {
        let mut buf = SequentialBuffer::new();
        buf.append(b"hello");

        let mut sink = Cursor::new(Vec::new());
        buf.flush(&mut sink).unwrap();

        assert!(buf.is_empty());
        assert_eq!(sink.into_inner(), b"hello");
    }

    #[test]
    fn seekable_write_then_seek_then_write_overwrites_front() {
        let mut buf = SeekableBuffer::new();
        buf.append(0, b"AAA");
        buf.append(0, b"B");

        let mut file = Cursor::new(vec![0u8; 3]);
        buf.flush(&mut file).unwrap();

        assert!(buf.is_empty());
        assert_eq!(file.into_inner(), b"BAA");
    }

    #[test]
    fn empty_buffers_are_noops() {
        let mut seq = SequentialBuffer::new();
        let mut file = Cursor::new(Vec::new());
        seq.flush(&mut file).unwrap();
        assert_eq!(file.into_inner(), Vec::<u8>::new());
    }
}
