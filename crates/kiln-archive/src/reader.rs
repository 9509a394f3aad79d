use std::collections::HashMap;
use std::io;
use std::io::{Read, Seek, SeekFrom};

use crate::format::{
    ArchiveFooter, ArchiveHeader, Hash, ResourceTag, TocEntry, ARCHIVE_FOOTER_SIZE,
    ARCHIVE_HEADER_SIZE, ARCHIVE_MAGIC, ENTRY_FLAG_LZ4, FOOTER_MAGIC, FORMAT_VERSION,
    FORMAT_VERSION_V1, TOC_ENTRY_SIZE, TOC_HEADER_SIZE, TOC_MAGIC, TOC_VERSION,
};

#[derive(Debug)]
pub enum ArchiveReadError {
    Io(io::Error),
    InvalidMagic,
    UnsupportedHeaderSize(u32),
    UnsupportedFooterSize(u32),
    /// The archive's `format_version` is outside the range supported by this
    /// reader. Older versions are accepted; newer/unknown versions and a
    /// header/footer version mismatch are rejected deterministically before
    /// any version-specific field is interpreted.
    UnsupportedFormatVersion(u32),
    UnsupportedTocVersion(u32),
    TocOutOfBounds,
    EntryOutOfBounds,
    UnknownResourceTag(u8),
    DecompressFailed { hash: Hash },
    MissingEntry { tag: ResourceTag, hash: Hash },
}

impl From<io::Error> for ArchiveReadError {
    fn from(value: io::Error) -> Self {
        Self::Io(value)
    }
}

impl std::fmt::Display for ArchiveReadError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{self:?}")
    }
}

impl std::error::Error for ArchiveReadError {}

/// Whether `read_entry` returns the stored payload bytes verbatim or the
/// decompressed create-info blob.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PayloadRead {
    Raw,
    Decompressed,
}

/// Random-access reader over a pipeline-state archive.
///
/// Opening validates every untrusted offset and length against the actual
/// file size before allocating, and builds per-tag hash lists in TOC order
/// (the archive's published playback order within a tag).
pub struct ArchiveReader<R> {
    reader: R,
    pub header: ArchiveHeader,
    pub footer: ArchiveFooter,
    entries: HashMap<(ResourceTag, Hash), TocEntry>,
    hash_lists: [Vec<Hash>; ResourceTag::COUNT],
}

impl<R: Read + Seek> ArchiveReader<R> {
    pub fn open(mut reader: R) -> Result<Self, ArchiveReadError> {
        let file_len = reader.seek(SeekFrom::End(0))?;
        reader.seek(SeekFrom::Start(0))?;

        let header = read_header(&mut reader)?;

        if file_len < ARCHIVE_FOOTER_SIZE as u64 {
            return Err(ArchiveReadError::TocOutOfBounds);
        }
        reader.seek(SeekFrom::Start(file_len - ARCHIVE_FOOTER_SIZE as u64))?;
        let footer = read_footer(&mut reader)?;

        if footer.format_version != header.format_version {
            // The footer is parsed at a fixed offset from the end of the
            // file; if it disagrees with the header, refuse to interpret the
            // mismatched structures.
            return Err(ArchiveReadError::UnsupportedFormatVersion(
                footer.format_version,
            ));
        }

        let toc_end = footer
            .toc_offset
            .checked_add(footer.toc_len)
            .ok_or(ArchiveReadError::TocOutOfBounds)?;
        if toc_end > file_len {
            return Err(ArchiveReadError::TocOutOfBounds);
        }

        reader.seek(SeekFrom::Start(footer.toc_offset))?;
        let toc = read_toc(&mut reader, footer.toc_len)?;

        // TOC offsets are untrusted; payloads must sit between the header and
        // the TOC itself.
        let payload_region_start = ARCHIVE_HEADER_SIZE as u64;
        let payload_region_end = footer.toc_offset;
        let mut entries = HashMap::with_capacity(toc.len());
        let mut hash_lists: [Vec<Hash>; ResourceTag::COUNT] = Default::default();
        for entry in toc {
            let end = entry
                .offset
                .checked_add(entry.stored_len as u64)
                .ok_or(ArchiveReadError::TocOutOfBounds)?;
            if entry.offset < payload_region_start || end > payload_region_end {
                return Err(ArchiveReadError::TocOutOfBounds);
            }
            // Duplicate (tag, hash) entries: the last one wins, and the hash
            // keeps its first position in the playback order.
            if entries.insert((entry.tag, entry.hash), entry).is_none() {
                hash_lists[entry.tag as usize].push(entry.hash);
            }
        }

        Ok(Self {
            reader,
            header,
            footer,
            entries,
            hash_lists,
        })
    }

    /// Hashes recorded for `tag`, in the archive's published playback order.
    pub fn hash_list(&self, tag: ResourceTag) -> &[Hash] {
        &self.hash_lists[tag as usize]
    }

    pub fn contains(&self, tag: ResourceTag, hash: Hash) -> bool {
        self.entries.contains_key(&(tag, hash))
    }

    /// Size of the entry as stored in the archive (compressed size when the
    /// payload is compressed).
    pub fn entry_stored_len(&self, tag: ResourceTag, hash: Hash) -> Option<u32> {
        self.entries.get(&(tag, hash)).map(|e| e.stored_len)
    }

    /// Decompressed size of the entry payload.
    pub fn entry_raw_len(&self, tag: ResourceTag, hash: Hash) -> Option<u32> {
        self.entries.get(&(tag, hash)).map(|e| e.raw_len)
    }

    pub fn read_entry(
        &mut self,
        tag: ResourceTag,
        hash: Hash,
        mode: PayloadRead,
    ) -> Result<Vec<u8>, ArchiveReadError> {
        let entry = *self
            .entries
            .get(&(tag, hash))
            .ok_or(ArchiveReadError::MissingEntry { tag, hash })?;

        self.reader.seek(SeekFrom::Start(entry.offset))?;
        let mut stored = vec![0u8; entry.stored_len as usize];
        self.reader.read_exact(&mut stored)?;

        if mode == PayloadRead::Raw || entry.flags & ENTRY_FLAG_LZ4 == 0 {
            return Ok(stored);
        }

        let raw = lz4_flex::block::decompress(&stored, entry.raw_len as usize)
            .map_err(|_| ArchiveReadError::DecompressFailed { hash })?;
        if raw.len() != entry.raw_len as usize {
            return Err(ArchiveReadError::DecompressFailed { hash });
        }
        Ok(raw)
    }
}

fn read_header<R: Read>(reader: &mut R) -> Result<ArchiveHeader, ArchiveReadError> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if magic != ARCHIVE_MAGIC {
        return Err(ArchiveReadError::InvalidMagic);
    }

    let header_size = read_u32(reader)?;
    if header_size != ARCHIVE_HEADER_SIZE {
        return Err(ArchiveReadError::UnsupportedHeaderSize(header_size));
    }
    let format_version = read_u32(reader)?;
    if !is_supported_format_version(format_version) {
        return Err(ArchiveReadError::UnsupportedFormatVersion(format_version));
    }
    let flags = read_u32(reader)?;
    let _reserved = read_u32(reader)?;

    Ok(ArchiveHeader {
        format_version,
        flags,
    })
}

fn read_footer<R: Read>(reader: &mut R) -> Result<ArchiveFooter, ArchiveReadError> {
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if magic != FOOTER_MAGIC {
        return Err(ArchiveReadError::InvalidMagic);
    }
    let footer_size = read_u32(reader)?;
    if footer_size != ARCHIVE_FOOTER_SIZE {
        return Err(ArchiveReadError::UnsupportedFooterSize(footer_size));
    }
    let format_version = read_u32(reader)?;
    if !is_supported_format_version(format_version) {
        return Err(ArchiveReadError::UnsupportedFormatVersion(format_version));
    }
    let toc_offset = read_u64(reader)?;
    let toc_len = read_u64(reader)?;

    Ok(ArchiveFooter {
        format_version,
        toc_offset,
        toc_len,
    })
}

fn read_toc<R: Read>(reader: &mut R, toc_len: u64) -> Result<Vec<TocEntry>, ArchiveReadError> {
    if toc_len < TOC_HEADER_SIZE as u64 {
        return Err(ArchiveReadError::TocOutOfBounds);
    }
    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if magic != TOC_MAGIC {
        return Err(ArchiveReadError::InvalidMagic);
    }

    let toc_version = read_u32(reader)?;
    if toc_version != TOC_VERSION {
        return Err(ArchiveReadError::UnsupportedTocVersion(toc_version));
    }

    let entry_count = read_u32(reader)? as u64;
    let expected_len = (TOC_HEADER_SIZE as u64)
        .checked_add(
            entry_count
                .checked_mul(TOC_ENTRY_SIZE as u64)
                .ok_or(ArchiveReadError::TocOutOfBounds)?,
        )
        .ok_or(ArchiveReadError::TocOutOfBounds)?;
    if toc_len != expected_len {
        return Err(ArchiveReadError::TocOutOfBounds);
    }

    let mut entries = Vec::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        let tag_raw = read_u32(reader)?;
        let tag_u8 = u8::try_from(tag_raw).map_err(|_| {
            ArchiveReadError::UnknownResourceTag(tag_raw.min(u8::MAX as u32) as u8)
        })?;
        let tag =
            ResourceTag::from_u8(tag_u8).ok_or(ArchiveReadError::UnknownResourceTag(tag_u8))?;
        let flags_raw = read_u32(reader)?;
        let hash = read_u64(reader)?;
        let offset = read_u64(reader)?;
        let stored_len = read_u32(reader)?;
        let raw_len = read_u32(reader)?;
        entries.push(TocEntry {
            tag,
            flags: flags_raw as u8,
            hash,
            offset,
            stored_len,
            raw_len,
        });
    }

    Ok(entries)
}

fn is_supported_format_version(v: u32) -> bool {
    // Accept everything from the initial version through the latest known
    // version; reject the rest so mismatches are deterministic.
    (FORMAT_VERSION_V1..=FORMAT_VERSION).contains(&v)
}

fn read_u32<R: Read>(reader: &mut R) -> Result<u32, ArchiveReadError> {
    let mut buf = [0u8; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64<R: Read>(reader: &mut R) -> Result<u64, ArchiveReadError> {
    let mut buf = [0u8; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}
