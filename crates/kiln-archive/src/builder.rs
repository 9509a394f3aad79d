use std::io;
use std::io::{Seek, SeekFrom, Write};

use crate::format::{
    Hash, ResourceTag, TocEntry, ARCHIVE_FOOTER_SIZE, ARCHIVE_HEADER_SIZE, ARCHIVE_MAGIC,
    ENTRY_FLAG_LZ4, ENTRY_HEADER_SIZE, FOOTER_MAGIC, FORMAT_VERSION, TOC_ENTRY_SIZE,
    TOC_HEADER_SIZE, TOC_MAGIC, TOC_VERSION,
};

/// Streaming archive writer used by tests and tooling.
///
/// Entries are appended in playback order; `finish` writes the TOC and
/// footer. Compression is per entry so incompressible payloads can be stored
/// verbatim.
pub struct ArchiveBuilder<W> {
    writer: W,
    toc: Vec<TocEntry>,
}

impl<W: Write + Seek> ArchiveBuilder<W> {
    pub fn new(mut writer: W) -> io::Result<Self> {
        writer.seek(SeekFrom::Start(0))?;
        writer.write_all(&ARCHIVE_MAGIC)?;
        write_u32(&mut writer, ARCHIVE_HEADER_SIZE)?;
        write_u32(&mut writer, FORMAT_VERSION)?;
        write_u32(&mut writer, 0)?; // flags
        write_u32(&mut writer, 0)?; // reserved
        Ok(Self {
            writer,
            toc: Vec::new(),
        })
    }

    pub fn add_entry(
        &mut self,
        tag: ResourceTag,
        hash: Hash,
        payload: &[u8],
        compress: bool,
    ) -> io::Result<()> {
        let compressed;
        let (stored, flags) = if compress {
            compressed = lz4_flex::block::compress(payload);
            if compressed.len() < payload.len() {
                (compressed.as_slice(), ENTRY_FLAG_LZ4)
            } else {
                (payload, 0)
            }
        } else {
            (payload, 0)
        };

        let stored_len = u32::try_from(stored.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entry payload too large"))?;
        let raw_len = u32::try_from(payload.len())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "entry payload too large"))?;

        self.writer.write_all(&[tag as u8, flags])?;
        self.writer.write_all(&0u16.to_le_bytes())?;
        write_u64(&mut self.writer, hash)?;
        write_u32(&mut self.writer, stored_len)?;
        write_u32(&mut self.writer, raw_len)?;
        debug_assert_eq!(ENTRY_HEADER_SIZE, 20);
        let payload_offset = self.writer.stream_position()?;
        self.writer.write_all(stored)?;

        self.toc.push(TocEntry {
            tag,
            flags,
            hash,
            offset: payload_offset,
            stored_len,
            raw_len,
        });
        Ok(())
    }

    pub fn finish(mut self) -> io::Result<W> {
        let toc_offset = self.writer.stream_position()?;

        self.writer.write_all(&TOC_MAGIC)?;
        write_u32(&mut self.writer, TOC_VERSION)?;
        write_u32(&mut self.writer, self.toc.len() as u32)?;
        for entry in &self.toc {
            write_u32(&mut self.writer, entry.tag as u32)?;
            write_u32(&mut self.writer, entry.flags as u32)?;
            write_u64(&mut self.writer, entry.hash)?;
            write_u64(&mut self.writer, entry.offset)?;
            write_u32(&mut self.writer, entry.stored_len)?;
            write_u32(&mut self.writer, entry.raw_len)?;
        }
        let toc_len =
            TOC_HEADER_SIZE as u64 + self.toc.len() as u64 * TOC_ENTRY_SIZE as u64;

        self.writer.write_all(&FOOTER_MAGIC)?;
        write_u32(&mut self.writer, ARCHIVE_FOOTER_SIZE)?;
        write_u32(&mut self.writer, FORMAT_VERSION)?;
        write_u64(&mut self.writer, toc_offset)?;
        write_u64(&mut self.writer, toc_len)?;
        self.writer.flush()?;

        Ok(self.writer)
    }
}

fn write_u32<W: Write>(writer: &mut W, value: u32) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}

fn write_u64<W: Write>(writer: &mut W, value: u64) -> io::Result<()> {
    writer.write_all(&value.to_le_bytes())
}
