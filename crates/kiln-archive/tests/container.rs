use std::io::Cursor;

use kiln_archive::format::ARCHIVE_FOOTER_SIZE;
use kiln_archive::{ArchiveBuilder, ArchiveReadError, ArchiveReader, PayloadRead, ResourceTag};
use pretty_assertions::assert_eq;

fn build_archive(entries: &[(ResourceTag, u64, Vec<u8>, bool)]) -> Vec<u8> {
    let mut builder = ArchiveBuilder::new(Cursor::new(Vec::new())).expect("builder");
    for (tag, hash, payload, compress) in entries {
        builder
            .add_entry(*tag, *hash, payload, *compress)
            .expect("add entry");
    }
    builder.finish().expect("finish").into_inner()
}

#[test]
fn round_trips_entries_in_capture_order() {
    let shader = vec![0x42u8; 512];
    let bytes = build_archive(&[
        (ResourceTag::AppInfo, 1, b"{}".to_vec(), false),
        (ResourceTag::ShaderModule, 0xdead_beef, shader.clone(), true),
        (ResourceTag::GraphicsPipeline, 7, b"{\"flags\":0}".to_vec(), true),
        (ResourceTag::GraphicsPipeline, 3, b"{\"flags\":4}".to_vec(), true),
    ]);

    let mut reader = ArchiveReader::open(Cursor::new(bytes)).expect("open");
    assert_eq!(reader.hash_list(ResourceTag::AppInfo), &[1]);
    assert_eq!(reader.hash_list(ResourceTag::GraphicsPipeline), &[7, 3]);
    assert_eq!(reader.hash_list(ResourceTag::ComputePipeline), &[] as &[u64]);

    let raw = reader
        .read_entry(ResourceTag::ShaderModule, 0xdead_beef, PayloadRead::Decompressed)
        .expect("read shader");
    assert_eq!(raw, shader);

    // A run of identical bytes compresses; the stored form must be smaller
    // and distinct from the decompressed payload.
    let stored = reader
        .read_entry(ResourceTag::ShaderModule, 0xdead_beef, PayloadRead::Raw)
        .expect("read stored");
    assert!(stored.len() < shader.len());
    assert_eq!(
        reader.entry_stored_len(ResourceTag::ShaderModule, 0xdead_beef),
        Some(stored.len() as u32)
    );
    assert_eq!(
        reader.entry_raw_len(ResourceTag::ShaderModule, 0xdead_beef),
        Some(shader.len() as u32)
    );
}

#[test]
fn incompressible_payloads_are_stored_verbatim() {
    // 4 bytes cannot shrink under LZ4 block framing.
    let bytes = build_archive(&[(ResourceTag::Sampler, 9, vec![1, 2, 3, 4], true)]);
    let mut reader = ArchiveReader::open(Cursor::new(bytes)).expect("open");
    let stored = reader
        .read_entry(ResourceTag::Sampler, 9, PayloadRead::Raw)
        .expect("read stored");
    assert_eq!(stored, vec![1, 2, 3, 4]);
}

#[test]
fn duplicate_entries_last_one_wins() {
    let bytes = build_archive(&[
        (ResourceTag::Sampler, 5, b"first".to_vec(), false),
        (ResourceTag::Sampler, 5, b"second".to_vec(), false),
    ]);
    let mut reader = ArchiveReader::open(Cursor::new(bytes)).expect("open");
    assert_eq!(reader.hash_list(ResourceTag::Sampler), &[5]);
    let payload = reader
        .read_entry(ResourceTag::Sampler, 5, PayloadRead::Decompressed)
        .expect("read");
    assert_eq!(payload, b"second");
}

#[test]
fn missing_entry_is_reported() {
    let bytes = build_archive(&[]);
    let mut reader = ArchiveReader::open(Cursor::new(bytes)).expect("open");
    assert!(matches!(
        reader.read_entry(ResourceTag::Sampler, 1, PayloadRead::Decompressed),
        Err(ArchiveReadError::MissingEntry { .. })
    ));
}

#[test]
fn rejects_bad_magic() {
    let mut bytes = build_archive(&[]);
    bytes[0] = b'X';
    assert!(matches!(
        ArchiveReader::open(Cursor::new(bytes)),
        Err(ArchiveReadError::InvalidMagic)
    ));
}

#[test]
fn rejects_unknown_format_version() {
    let mut bytes = build_archive(&[]);
    // Header format_version lives after the magic and header_size words.
    bytes[12..16].copy_from_slice(&999u32.to_le_bytes());
    assert!(matches!(
        ArchiveReader::open(Cursor::new(bytes)),
        Err(ArchiveReadError::UnsupportedFormatVersion(999))
    ));
}

#[test]
fn rejects_header_footer_version_mismatch() {
    let mut bytes = build_archive(&[]);
    let footer_version_at = bytes.len() - ARCHIVE_FOOTER_SIZE as usize + 12;
    // Version 0 is below the supported range, caught while parsing the
    // footer itself.
    bytes[footer_version_at..footer_version_at + 4].copy_from_slice(&0u32.to_le_bytes());
    assert!(matches!(
        ArchiveReader::open(Cursor::new(bytes)),
        Err(ArchiveReadError::UnsupportedFormatVersion(0))
    ));
}

#[test]
fn rejects_toc_offset_past_end_of_file() {
    let mut bytes = build_archive(&[(ResourceTag::Sampler, 1, b"x".to_vec(), false)]);
    let toc_offset_at = bytes.len() - ARCHIVE_FOOTER_SIZE as usize + 16;
    let huge = (bytes.len() as u64 * 2).to_le_bytes();
    bytes[toc_offset_at..toc_offset_at + 8].copy_from_slice(&huge);
    assert!(matches!(
        ArchiveReader::open(Cursor::new(bytes)),
        Err(ArchiveReadError::TocOutOfBounds)
    ));
}

#[test]
fn rejects_entry_payload_outside_payload_region() {
    let payload = b"payload".to_vec();
    let mut bytes = build_archive(&[(ResourceTag::Sampler, 1, payload, false)]);
    // Corrupt the TOC entry's offset field to point into the footer.
    let footer_at = bytes.len() - ARCHIVE_FOOTER_SIZE as usize;
    let toc_offset = u64::from_le_bytes(bytes[footer_at + 16..footer_at + 24].try_into().unwrap());
    let entry_offset_at = toc_offset as usize + 16 + 16;
    let bad = (bytes.len() as u64 - 4).to_le_bytes();
    bytes[entry_offset_at..entry_offset_at + 8].copy_from_slice(&bad);
    assert!(matches!(
        ArchiveReader::open(Cursor::new(bytes)),
        Err(ArchiveReadError::TocOutOfBounds)
    ));
}

#[test]
fn corrupt_compressed_payload_fails_decompression() {
    let compressible = vec![7u8; 256];
    let mut bytes = build_archive(&[(ResourceTag::ShaderModule, 2, compressible, true)]);

    // Flip bytes inside the stored payload (which starts right after the
    // 24-byte header and 20-byte entry header).
    let payload_at = 24 + 20;
    bytes[payload_at] ^= 0xff;
    bytes[payload_at + 1] ^= 0xff;

    let mut reader = ArchiveReader::open(Cursor::new(bytes)).expect("open");
    let result = reader.read_entry(ResourceTag::ShaderModule, 2, PayloadRead::Decompressed);
    assert!(matches!(
        result,
        Err(ArchiveReadError::DecompressFailed { hash: 2 })
    ));
}
