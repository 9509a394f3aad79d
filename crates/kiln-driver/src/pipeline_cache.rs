//! On-disk pipeline-cache blob header.
//!
//! Layout (little-endian): `u32 length` = 16 + UUID size, `u32 version` = 1,
//! `u32 vendor_id`, `u32 device_id`, then the device's pipeline-cache UUID.
//! The payload past the header is opaque to everything but the driver.

use crate::device::DeviceProperties;

pub const PIPELINE_CACHE_UUID_SIZE: usize = 16;
pub const PIPELINE_CACHE_HEADER_SIZE: usize = 16 + PIPELINE_CACHE_UUID_SIZE;
pub const PIPELINE_CACHE_HEADER_VERSION: u32 = 1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipelineCacheHeader {
    pub vendor_id: u32,
    pub device_id: u32,
    pub uuid: [u8; PIPELINE_CACHE_UUID_SIZE],
}

impl PipelineCacheHeader {
    pub fn for_device(props: &DeviceProperties) -> Self {
        Self {
            vendor_id: props.vendor_id,
            device_id: props.device_id,
            uuid: props.cache_uuid,
        }
    }

    pub fn write_to(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(PIPELINE_CACHE_HEADER_SIZE as u32).to_le_bytes());
        out.extend_from_slice(&PIPELINE_CACHE_HEADER_VERSION.to_le_bytes());
        out.extend_from_slice(&self.vendor_id.to_le_bytes());
        out.extend_from_slice(&self.device_id.to_le_bytes());
        out.extend_from_slice(&self.uuid);
    }
}

/// Validate a cache blob header against the current device. Returns the
/// mismatch reason so callers can log it; any mismatch means "discard and
/// start empty", never a hard failure.
pub fn validate_blob_header(
    blob: &[u8],
    props: &DeviceProperties,
) -> std::result::Result<(), &'static str> {
    if blob.len() < PIPELINE_CACHE_HEADER_SIZE {
        return Err("cache header is too small");
    }

    let read_le = |offset: usize| -> u32 {
        u32::from_le_bytes(blob[offset..offset + 4].try_into().expect("4-byte slice"))
    };

    if read_le(0) != PIPELINE_CACHE_HEADER_SIZE as u32 {
        return Err("cache header length mismatch");
    }
    if read_le(4) != PIPELINE_CACHE_HEADER_VERSION {
        return Err("cache header version is not 1");
    }
    if read_le(8) != props.vendor_id {
        return Err("cache vendor id does not match device");
    }
    if read_le(12) != props.device_id {
        return Err("cache device id does not match device");
    }
    if blob[16..PIPELINE_CACHE_HEADER_SIZE] != props.cache_uuid {
        return Err("cache UUID does not match device");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn props() -> DeviceProperties {
        DeviceProperties {
            device_name: "test".to_owned(),
            vendor_id: 0x1234,
            device_id: 0x5678,
            cache_uuid: [7u8; PIPELINE_CACHE_UUID_SIZE],
        }
    }

    #[test]
    fn header_round_trips() {
        let props = props();
        let mut blob = Vec::new();
        PipelineCacheHeader::for_device(&props).write_to(&mut blob);
        blob.extend_from_slice(b"opaque payload");
        assert_eq!(validate_blob_header(&blob, &props), Ok(()));
    }

    #[test]
    fn short_blob_is_rejected() {
        let blob = vec![0u8; PIPELINE_CACHE_HEADER_SIZE - 1];
        assert!(validate_blob_header(&blob, &props()).is_err());
    }

    #[test]
    fn uuid_mismatch_is_rejected() {
        let props = props();
        let mut blob = Vec::new();
        PipelineCacheHeader::for_device(&props).write_to(&mut blob);

        let mut other = props.clone();
        other.cache_uuid[0] ^= 0xff;
        assert_eq!(
            validate_blob_header(&blob, &other),
            Err("cache UUID does not match device")
        );
    }

    #[test]
    fn vendor_mismatch_is_rejected() {
        let props = props();
        let mut blob = Vec::new();
        PipelineCacheHeader::for_device(&props).write_to(&mut blob);

        let mut other = props.clone();
        other.vendor_id += 1;
        assert_eq!(
            validate_blob_header(&blob, &other),
            Err("cache vendor id does not match device")
        );
    }
}
