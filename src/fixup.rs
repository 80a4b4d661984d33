use std::{
    fs::{self, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    mem::size_of,
    path::Path,
};

use crate::{
    error::BuildError,
    matcher,
    project::PackageSettings,
    types::{
        put_str, AsBytes, FromBytes, FromZeroes, MetadataRecord, FLAG_ALLOW_DEST_CHANGE,
        FLAG_EXPLORE, FLAG_EXTERNAL_ARCHIVE, FLAG_REQUIRE_ADMIN, FLAG_REQUIRE_REBOOT, FLAG_SPAN,
        METADATA_SIGNATURE,
    },
};

/// Patches the metadata record of a finished volume in place.
///
/// The record is found by scanning the executable prefix for the placeholder
/// signature rather than through any resource machinery: once archive bytes
/// have been appended the resource section can no longer be rewritten without
/// invalidating them. The prefix ends at the start-of-archive offset, read
/// from the 8-byte trailer the archive finalize step leaves at the very end
/// of the file; in sidecar mode the whole executable is the prefix. The write
/// never changes the file length.
pub fn write_metadata(
    path: &Path, launch_command: &str, version: &str, spanned: bool, file_count: u64,
    uncompressed_total: u64, settings: &PackageSettings,
) -> Result<(), BuildError> {
    let mut file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| BuildError::setup(path, e))?;
    let file_len = file.seek(SeekFrom::End(0))?;

    let prefix_len = if settings.external_archive {
        file_len
    } else {
        if file_len < 8 {
            return Err(BuildError::MetadataSignatureNotFound(path.to_path_buf()));
        }
        file.seek(SeekFrom::End(-8))?;
        let mut trailer = [0u8; 8];
        file.read_exact(&mut trailer)?;
        u64::from_le_bytes(trailer).min(file_len)
    };

    let mut prefix = vec![0u8; prefix_len as usize];
    file.seek(SeekFrom::Start(0))?;
    file.read_exact(&mut prefix)?;

    let position = find_signature(&prefix)
        .ok_or_else(|| BuildError::MetadataSignatureNotFound(path.to_path_buf()))?;
    let mut record = MetadataRecord::read_from_prefix(&prefix[position..])
        .ok_or_else(|| BuildError::MetadataSignatureNotFound(path.to_path_buf()))?;

    put_str(&mut record.launch_command, launch_command);
    put_str(&mut record.version, version);

    let mut flags = 0u32;
    if settings.explore_on_complete && !spanned {
        flags |= FLAG_EXPLORE;
    }
    if spanned {
        flags |= FLAG_SPAN;
    }
    if settings.allow_destination_change {
        flags |= FLAG_ALLOW_DEST_CHANGE;
    }
    if settings.require_admin {
        flags |= FLAG_REQUIRE_ADMIN;
    }
    if settings.require_reboot {
        flags |= FLAG_REQUIRE_REBOOT;
    }
    if settings.external_archive {
        flags |= FLAG_EXTERNAL_ARCHIVE;
    }
    record.flags = flags;
    record.space_required = uncompressed_total;
    record.file_count = file_count as u32;

    file.seek(SeekFrom::Start(position as u64))?;
    file.write_all(record.as_bytes())?;
    Ok(())
}

/// First occurrence of the placeholder signature, bounded so a full record
/// fits behind it.
pub fn find_signature(haystack: &[u8]) -> Option<usize> {
    if haystack.len() < size_of::<MetadataRecord>() {
        return None;
    }
    haystack[..haystack.len() - size_of::<MetadataRecord>() + METADATA_SIGNATURE.len()]
        .windows(METADATA_SIGNATURE.len())
        .position(|window| window == METADATA_SIGNATURE)
}

const FIXED_FILE_INFO_SIGNATURE: u32 = 0xFEEF_04BD;

// The leading fields of a VS_FIXEDFILEINFO block.
#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct FixedFileInfo {
    signature:       u32,
    struc_version:   u32,
    file_version_ms: u32,
    file_version_ls: u32,
}

/// Reads the embedded fixed file version of an executable or library by
/// scanning for the version-info signature. Absence is not an error.
pub fn read_file_version(path: &Path) -> Option<(u16, u16, u16, u16)> {
    let bytes = fs::read(path).ok()?;
    let signature = FIXED_FILE_INFO_SIGNATURE.to_le_bytes();
    let position = bytes
        .windows(signature.len())
        .position(|window| window == signature)?;
    let info = FixedFileInfo::read_from_prefix(&bytes[position..])?;
    let ms = info.file_version_ms;
    let ls = info.file_version_ls;
    Some((
        (ms >> 16) as u16,
        (ms & 0xffff) as u16,
        (ls >> 16) as u16,
        (ls & 0xffff) as u16,
    ))
}

/// The human-readable version written into the metadata record: the version
/// fields of the configured source file when it has any, the configured
/// string verbatim otherwise.
pub fn version_string(settings: &PackageSettings, base_dir: &Path) -> String {
    if !settings.version_file.is_empty() {
        let path = matcher::resolve(base_dir, &settings.version_file);
        if path.is_file() {
            if let Some((major, minor, release, build)) = read_file_version(&path) {
                return format!("Version {}.{}.{}.{}", major, minor, release, build);
            }
        }
    }
    settings.version_file.clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{get_str, FLAG_EXPLORE, FLAG_SPAN};

    fn volume_with_placeholder(leading: &[u8], trailing: &[u8]) -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.exe");
        let mut bytes = leading.to_vec();
        bytes.extend_from_slice(MetadataRecord::placeholder().as_bytes());
        let exe_len = bytes.len() as u64;
        bytes.extend_from_slice(trailing);
        bytes.extend_from_slice(&exe_len.to_le_bytes());
        fs::write(&path, bytes).unwrap();
        (dir, path)
    }

    fn read_record(path: &Path) -> MetadataRecord {
        let bytes = fs::read(path).unwrap();
        let position = find_signature(&bytes).unwrap();
        MetadataRecord::read_from_prefix(&bytes[position..]).unwrap()
    }

    #[test]
    fn fixup_overwrites_in_place_and_is_idempotent() {
        let (_dir, path) = volume_with_placeholder(b"prefix bytes", b"archive data");
        let settings = PackageSettings {
            explore_on_complete: true,
            ..PackageSettings::default()
        };
        write_metadata(&path, "setup.exe /s", "Version 1.2.3.4", false, 42, 1000, &settings)
            .unwrap();
        let len_after_first = fs::metadata(&path).unwrap().len();
        write_metadata(&path, "setup.exe /s", "Version 1.2.3.4", false, 42, 1000, &settings)
            .unwrap();
        assert_eq!(fs::metadata(&path).unwrap().len(), len_after_first);

        let record = read_record(&path);
        assert_eq!(get_str(&record.launch_command), "setup.exe /s");
        assert_eq!(get_str(&record.version), "Version 1.2.3.4");
        let flags = record.flags;
        let count = record.file_count;
        let space = record.space_required;
        assert_eq!(flags & FLAG_EXPLORE, FLAG_EXPLORE);
        assert_eq!(flags & FLAG_SPAN, 0);
        assert_eq!(count, 42);
        assert_eq!(space, 1000);
    }

    #[test]
    fn spanned_volumes_never_explore() {
        let (_dir, path) = volume_with_placeholder(b"x", b"y");
        let settings = PackageSettings {
            explore_on_complete: true,
            ..PackageSettings::default()
        };
        write_metadata(&path, "next_part2.exe", "", true, 10, 0, &settings).unwrap();
        let record = read_record(&path);
        let flags = record.flags;
        assert_eq!(flags & FLAG_SPAN, FLAG_SPAN);
        assert_eq!(flags & FLAG_EXPLORE, 0);
    }

    #[test]
    fn missing_placeholder_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("volume.exe");
        let mut bytes = vec![0u8; 600];
        bytes.extend_from_slice(&600u64.to_le_bytes());
        fs::write(&path, bytes).unwrap();
        let result = write_metadata(&path, "", "", false, 0, 0, &PackageSettings::default());
        assert!(matches!(
            result,
            Err(BuildError::MetadataSignatureNotFound(_))
        ));
    }

    #[test]
    fn long_launch_commands_truncate_without_growing_the_record() {
        let (_dir, path) = volume_with_placeholder(b"", b"");
        let long = "x".repeat(4096);
        write_metadata(&path, &long, "", false, 1, 1, &PackageSettings::default()).unwrap();
        let record = read_record(&path);
        let stored = get_str(&record.launch_command);
        assert_eq!(stored.len(), crate::types::LAUNCH_SIZE - 1);
    }

    #[test]
    fn version_string_falls_back_to_the_literal_value() {
        let dir = tempfile::tempdir().unwrap();
        let settings = PackageSettings {
            version_file: "2.0 beta".into(),
            ..PackageSettings::default()
        };
        assert_eq!(version_string(&settings, dir.path()), "2.0 beta");
    }

    #[test]
    fn version_read_from_embedded_fields() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tool.dll");
        let mut bytes = vec![0u8; 100];
        let info = FixedFileInfo {
            signature:       FIXED_FILE_INFO_SIGNATURE,
            struc_version:   0x0001_0000,
            file_version_ms: (3 << 16) | 1,
            file_version_ls: (7 << 16) | 22,
        };
        bytes.extend_from_slice(info.as_bytes());
        fs::write(&path, bytes).unwrap();
        assert_eq!(read_file_version(&path), Some((3, 1, 7, 22)));

        let settings = PackageSettings {
            version_file: "tool.dll".into(),
            ..PackageSettings::default()
        };
        assert_eq!(version_string(&settings, dir.path()), "Version 3.1.7.22");
    }
}
