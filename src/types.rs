pub use zerocopy::{AsBytes, FromBytes, FromZeroes};

pub const METADATA_SIGNATURE: [u8; 16] = *b"sfxpack:metadata";

pub const LAUNCH_SIZE: usize = 260;
pub const VERSION_SIZE: usize = 64;
pub const PATH_SIZE: usize = 260;
pub const SNIPPET_SIZE: usize = 512;

pub const HASH_SEED: u64 = 6812447004271;

pub const FLAG_EXPLORE: u32 = 1 << 0;
pub const FLAG_SPAN: u32 = 1 << 1;
pub const FLAG_ALLOW_DEST_CHANGE: u32 = 1 << 2;
pub const FLAG_REQUIRE_ADMIN: u32 = 1 << 3;
pub const FLAG_REQUIRE_REBOOT: u32 = 1 << 4;
pub const FLAG_EXTERNAL_ARCHIVE: u32 = 1 << 5;

pub const ENTRY_FILE: u8 = 0;
pub const ENTRY_DOWNLOAD: u8 = 1;

/// Per-volume installer metadata, patched in place after the archive is
/// finalized. The record keeps a fixed size so the signature-scan fixup can
/// overwrite it without resizing the volume; all multi-byte fields are
/// little-endian.
#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct MetadataRecord {
    pub signature:      [u8; 16],
    pub launch_command: [u8; LAUNCH_SIZE],
    pub version:        [u8; VERSION_SIZE],
    pub flags:          u32,
    pub space_required: u64,
    pub file_count:     u32,
}

impl MetadataRecord {
    /// The placeholder stamped into every volume: zero except the signature.
    pub fn placeholder() -> Self {
        let mut record = Self::new_zeroed();
        record.signature = METADATA_SIGNATURE;
        record
    }
}

/// One archive table row. Download references carry their URL as the entry
/// content; `compressed_size` is then the URL byte count and
/// `uncompressed_size` is zero.
#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct EntryRecord {
    pub offset:            u64,
    pub compressed_size:   u64,
    pub uncompressed_size: u64,
    pub content_hash:      u64,
    pub kind:              u8,
    pub path:              [u8; PATH_SIZE],
    pub snippet:           [u8; SNIPPET_SIZE],
}

/// Written after the entry records of a volume, directly before the
/// start-of-archive trailer.
#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
pub struct IndexHeader {
    pub entry_count:  u64,
    pub archive_size: u64,
    pub index_hash:   u64,
}

/// Bounded copy into a fixed-width, NUL-terminated field. Longer values are
/// truncated; the final byte always stays NUL.
pub fn put_str(field: &mut [u8], value: &str) {
    let bytes = value.as_bytes();
    let len = bytes.len().min(field.len().saturating_sub(1));
    field[..len].copy_from_slice(&bytes[..len]);
    for byte in field[len..].iter_mut() {
        *byte = 0;
    }
}

/// Reads a NUL-terminated fixed-width field back into a string, replacing
/// invalid sequences.
pub fn get_str(field: &[u8]) -> String {
    let end = field.iter().position(|&c| c == 0).unwrap_or(field.len());
    String::from_utf8_lossy(&field[..end]).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::size_of;

    #[test]
    fn metadata_record_size_is_fixed() {
        assert_eq!(
            size_of::<MetadataRecord>(),
            16 + LAUNCH_SIZE + VERSION_SIZE + 4 + 8 + 4
        );
    }

    #[test]
    fn placeholder_is_zero_except_signature() {
        let record = MetadataRecord::placeholder();
        assert_eq!(record.signature, METADATA_SIGNATURE);
        assert_eq!(record.launch_command, [0u8; LAUNCH_SIZE]);
        let flags = record.flags;
        let count = record.file_count;
        assert_eq!(flags, 0);
        assert_eq!(count, 0);
    }

    #[test]
    fn put_str_truncates_and_terminates() {
        let mut field = [0xffu8; 8];
        put_str(&mut field, "abcdefghij");
        assert_eq!(&field[..7], b"abcdefg");
        assert_eq!(field[7], 0);
        put_str(&mut field, "xy");
        assert_eq!(get_str(&field), "xy");
    }
}
