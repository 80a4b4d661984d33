use std::{
    fs,
    mem::size_of,
    path::{Path, PathBuf},
};

use editpe::{
    Image, ResourceData, ResourceDirectory, ResourceEntry, ResourceEntryName, ResourceTable,
};

use crate::{
    error::BuildError,
    matcher,
    project::{PackageSettings, ScriptBundle},
    types::{AsBytes, FromBytes, FromZeroes, MetadataRecord},
};

const RT_BITMAP: u32 = 2;
const RT_ICON: u32 = 3;
const RT_RCDATA: u32 = 10;
const RT_GROUP_ICON: u32 = 14;
const RT_HTML: u32 = 23;

const LANG_EN_US: u32 = 1033;

// Resource identifiers read back by the extractor stub.
pub const RES_CAPTION: u32 = 1;
pub const RES_INSTALL_PATH: u32 = 2;
pub const RES_SCRIPT_INIT: u32 = 3;
pub const RES_SCRIPT_PERFILE: u32 = 4;
pub const RES_SCRIPT_FINISH: u32 = 5;
pub const RES_METADATA: u32 = 6;
pub const RES_WELCOME: u32 = 1;
pub const RES_LICENSE: u32 = 2;
pub const RES_BANNER: u32 = 1;

/// Prepares one volume executable from the template. The production
/// implementation rewrites the template's resource section; tests and
/// alternative layouts can substitute their own preparation.
pub trait Stamper {
    fn stamp(
        &self, template: &Path, target: &Path, settings: &PackageSettings,
        scripts: &ScriptBundle, span_index: u32, log: &dyn Fn(&str),
    ) -> Result<(), BuildError>;
}

/// Stamps volumes by rebuilding the template's resource directory: icon,
/// banner, text blocks, scripts, caption, and the zeroed metadata
/// placeholder. All edits are committed through a single directory rebuild,
/// so a volume is either fully stamped or reported unusable.
pub struct ResourceStamper {
    base_dir: PathBuf,
}

impl ResourceStamper {
    pub fn new(base_dir: &Path) -> Self {
        Self {
            base_dir: base_dir.to_path_buf(),
        }
    }
}

impl Stamper for ResourceStamper {
    fn stamp(
        &self, template: &Path, target: &Path, settings: &PackageSettings,
        scripts: &ScriptBundle, span_index: u32, log: &dyn Fn(&str),
    ) -> Result<(), BuildError> {
        let template_bytes =
            fs::read(template).map_err(|e| BuildError::setup(template, e))?;
        let mut image = Image::parse(&template_bytes)
            .map_err(|e| BuildError::commit(template, e.to_string()))?;
        let mut resources = image.resource_directory().cloned().unwrap_or_default();

        if !settings.icon_file.is_empty() {
            let icon_path = matcher::resolve(&self.base_dir, &settings.icon_file);
            if icon_path.is_file() {
                let icon_bytes = fs::read(&icon_path)?;
                let existing = existing_icon_ids(&resources);
                let icon = renumber_icon(&icon_bytes, &existing)?;
                for (id, data) in icon.images {
                    set_resource(&mut resources, RT_ICON, ResourceEntryName::ID(id), data)?;
                }
                let group_name =
                    first_name(&resources, RT_GROUP_ICON).unwrap_or(ResourceEntryName::ID(1));
                set_resource(&mut resources, RT_GROUP_ICON, group_name, icon.directory)?;
            }
        }

        if !settings.image_file.is_empty() {
            let image_path = matcher::resolve(&self.base_dir, &settings.image_file);
            if image_path.is_file() {
                let image_bytes = fs::read(&image_path)?;
                match banner_resource(&image_bytes)? {
                    Some(data) => {
                        set_resource(
                            &mut resources,
                            RT_BITMAP,
                            ResourceEntryName::ID(RES_BANNER),
                            data,
                        )?;
                    }
                    None => {
                        log("    WARNING: Image file may not be more than 24bpp!");
                    }
                }
            }
        }

        let caption = if span_index > 0 {
            format!("{} (part {})", settings.caption, span_index + 1)
        } else {
            settings.caption.clone()
        };
        set_resource(
            &mut resources,
            RT_RCDATA,
            ResourceEntryName::ID(RES_CAPTION),
            text_resource(&caption),
        )?;
        set_resource(
            &mut resources,
            RT_RCDATA,
            ResourceEntryName::ID(RES_INSTALL_PATH),
            text_resource(&settings.default_path),
        )?;

        let welcome = text_or_file_contents(&self.base_dir, &settings.description)?;
        set_resource(
            &mut resources,
            RT_HTML,
            ResourceEntryName::ID(RES_WELCOME),
            welcome,
        )?;
        if !settings.license_text.is_empty() {
            let license = text_or_file_contents(&self.base_dir, &settings.license_text)?;
            set_resource(
                &mut resources,
                RT_HTML,
                ResourceEntryName::ID(RES_LICENSE),
                license,
            )?;
        }

        // Scripts are written even when empty: an empty resource still tells
        // the extractor "no script" unambiguously.
        set_resource(
            &mut resources,
            RT_RCDATA,
            ResourceEntryName::ID(RES_SCRIPT_INIT),
            text_resource(&scripts.init),
        )?;
        set_resource(
            &mut resources,
            RT_RCDATA,
            ResourceEntryName::ID(RES_SCRIPT_PERFILE),
            text_resource(&scripts.per_file),
        )?;
        set_resource(
            &mut resources,
            RT_RCDATA,
            ResourceEntryName::ID(RES_SCRIPT_FINISH),
            text_resource(&scripts.finish),
        )?;

        set_resource(
            &mut resources,
            RT_RCDATA,
            ResourceEntryName::ID(RES_METADATA),
            MetadataRecord::placeholder().as_bytes().to_vec(),
        )?;

        image
            .set_resource_directory(resources)
            .map_err(|e| BuildError::commit(target, e.to_string()))?;
        fs::write(target, image.data()).map_err(|e| BuildError::setup(target, e))?;
        Ok(())
    }
}

// The on-disk icon directory. The stored variant replaces each image offset
// with a resource identifier; everything else carries over unchanged.
#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct IconDirHeader {
    reserved: u16,
    kind:     u16,
    count:    u16,
}

#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct IconFileEntry {
    width:     u8,
    height:    u8,
    colors:    u8,
    reserved:  u8,
    planes:    u16,
    bit_count: u16,
    size:      u32,
    offset:    u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct IconResEntry {
    width:     u8,
    height:    u8,
    colors:    u8,
    reserved:  u8,
    planes:    u16,
    bit_count: u16,
    size:      u32,
    id:        u16,
}

struct RenumberedIcon {
    directory: Vec<u8>,
    images:    Vec<(u32, Vec<u8>)>,
}

/// Rebuilds an icon file's directory for resource storage. Each sub-image
/// reuses the template identifier at the same index where one exists, and is
/// assigned past the highest existing identifier otherwise.
fn renumber_icon(bytes: &[u8], existing: &[u32]) -> Result<RenumberedIcon, BuildError> {
    let header = IconDirHeader::read_from_prefix(bytes)
        .ok_or_else(|| BuildError::Archive("icon file is truncated".into()))?;
    let kind = header.kind;
    let count = header.count as usize;
    if header.reserved != 0 || kind != 1 || count == 0 {
        return Err(BuildError::Archive("not an icon file".into()));
    }

    let mut existing = existing.to_vec();
    existing.sort_unstable();
    let mut next_id = existing.last().copied().unwrap_or(0);

    let mut directory = Vec::with_capacity(
        size_of::<IconDirHeader>() + count * size_of::<IconResEntry>(),
    );
    directory.extend_from_slice(header.as_bytes());
    let mut images = Vec::with_capacity(count);

    for index in 0..count {
        let entry_offset = size_of::<IconDirHeader>() + index * size_of::<IconFileEntry>();
        let entry = bytes
            .get(entry_offset..)
            .and_then(IconFileEntry::read_from_prefix)
            .ok_or_else(|| BuildError::Archive("icon directory is truncated".into()))?;
        let start = entry.offset as usize;
        let size = entry.size as usize;
        let data = bytes
            .get(start..start + size)
            .ok_or_else(|| BuildError::Archive("icon image offset out of range".into()))?;

        let id = existing.get(index).copied().unwrap_or_else(|| {
            next_id += 1;
            next_id
        });
        let stored = IconResEntry {
            width:     entry.width,
            height:    entry.height,
            colors:    entry.colors,
            reserved:  entry.reserved,
            planes:    entry.planes,
            bit_count: entry.bit_count,
            size:      entry.size,
            id:        id as u16,
        };
        directory.extend_from_slice(stored.as_bytes());
        images.push((id, data.to_vec()));
    }

    Ok(RenumberedIcon { directory, images })
}

#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct BitmapFileHeader {
    magic:       [u8; 2],
    size:        u32,
    reserved1:   u16,
    reserved2:   u16,
    data_offset: u32,
}

#[repr(C, packed)]
#[derive(Clone, Copy, AsBytes, FromBytes, FromZeroes)]
struct BitmapInfoPrefix {
    header_size: u32,
    width:       i32,
    height:      i32,
    planes:      u16,
    bit_count:   u16,
}

/// Strips the bitmap file header for resource storage. Returns `None` for
/// images deeper than 24 bits per pixel, which the installer dialog cannot
/// display.
fn banner_resource(bytes: &[u8]) -> Result<Option<Vec<u8>>, BuildError> {
    let header = BitmapFileHeader::read_from_prefix(bytes)
        .ok_or_else(|| BuildError::Archive("bitmap file is truncated".into()))?;
    if &header.magic != b"BM" {
        return Err(BuildError::Archive("not a bitmap file".into()));
    }
    let info = bytes
        .get(size_of::<BitmapFileHeader>()..)
        .and_then(BitmapInfoPrefix::read_from_prefix)
        .ok_or_else(|| BuildError::Archive("bitmap header is truncated".into()))?;
    let bit_count = info.bit_count;
    if bit_count > 24 {
        return Ok(None);
    }
    Ok(Some(bytes[size_of::<BitmapFileHeader>()..].to_vec()))
}

fn text_resource(text: &str) -> Vec<u8> {
    let mut data = text.as_bytes().to_vec();
    data.push(0);
    data
}

/// Reads the configured value as a file when it resolves to one, and embeds
/// the literal text otherwise.
fn text_or_file_contents(base_dir: &Path, value: &str) -> Result<Vec<u8>, BuildError> {
    let path = matcher::resolve(base_dir, value);
    if path.is_file() {
        Ok(fs::read(&path)?)
    } else {
        Ok(value.as_bytes().to_vec())
    }
}

fn existing_icon_ids(resources: &ResourceDirectory) -> Vec<u32> {
    let mut ids = Vec::new();
    if let Some(ResourceEntry::Table(table)) =
        resources.root().get(ResourceEntryName::ID(RT_ICON))
    {
        for (name, _) in table.entries() {
            if let ResourceEntryName::ID(id) = name {
                ids.push(*id);
            }
        }
    }
    ids
}

fn first_name(resources: &ResourceDirectory, rtype: u32) -> Option<ResourceEntryName> {
    match resources.root().get(ResourceEntryName::ID(rtype)) {
        Some(ResourceEntry::Table(table)) => {
            table.entries().iter().map(|(name, _)| name.clone()).next()
        }
        _ => None,
    }
}

/// Replaces the `type / name / language` leaf for one resource, creating the
/// intermediate tables as needed.
fn set_resource(
    resources: &mut ResourceDirectory, rtype: u32, name: ResourceEntryName, data: Vec<u8>,
) -> Result<(), BuildError> {
    let root = resources.root_mut();
    let type_name = ResourceEntryName::ID(rtype);
    if !matches!(root.get(type_name.clone()), Some(ResourceEntry::Table(_))) {
        root.insert(
            type_name.clone(),
            ResourceEntry::Table(ResourceTable::default()),
        );
    }
    let types = match root.get_mut(type_name) {
        Some(ResourceEntry::Table(table)) => table,
        _ => {
            return Err(BuildError::Archive(
                "resource type table could not be created".into(),
            ))
        }
    };
    if !matches!(types.get(name.clone()), Some(ResourceEntry::Table(_))) {
        types.insert(name.clone(), ResourceEntry::Table(ResourceTable::default()));
    }
    let languages = match types.get_mut(name) {
        Some(ResourceEntry::Table(table)) => table,
        _ => {
            return Err(BuildError::Archive(
                "resource name table could not be created".into(),
            ))
        }
    };
    let mut resource = ResourceData::default();
    resource.set_data(data);
    languages.insert(
        ResourceEntryName::ID(LANG_EN_US),
        ResourceEntry::Data(resource),
    );
    Ok(())
}
