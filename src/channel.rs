use std::{
    fs::{File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::{Path, PathBuf},
};

use crate::{
    embed::Stamper,
    error::BuildError,
    fixup,
    project::{PackageSettings, ScriptBundle},
};

/// Physical layout of a build's output files.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputLayout {
    /// Archive bytes are appended to the stamped executable itself.
    Appended,
    /// The executable stays untouched after stamping; archive bytes go into a
    /// `.data` sidecar file next to it.
    Sidecar,
}

impl OutputLayout {
    pub fn for_settings(settings: &PackageSettings) -> Self {
        if settings.external_archive {
            OutputLayout::Sidecar
        } else {
            OutputLayout::Appended
        }
    }
}

/// Owns the output stream(s) of one build: stamps volume executables from the
/// template, tracks the archive write position, and rolls over to the next
/// volume when the archiver spans.
///
/// Ordering is strict: a volume is fully stamped before any archive byte is
/// written, and fully written before its metadata is fixed up. Volume N's
/// fixup names volume N+1 as its launch chain, so spanning is inherently
/// sequential.
pub struct OutputChannel<'a> {
    layout:        OutputLayout,
    template:      PathBuf,
    base_path:     PathBuf,
    current_exe:   PathBuf,
    file:          Option<File>,
    span_index:    u32,
    archive_start: u64,
    spanned_bytes: u64,
    version:       String,
    settings:      &'a PackageSettings,
    scripts:       &'a ScriptBundle,
    stamper:       &'a dyn Stamper,
    log:           &'a dyn Fn(&str),
}

impl<'a> OutputChannel<'a> {
    /// Stamps the first volume and opens its archive stream.
    pub fn open(
        template: &Path, output: &Path, settings: &'a PackageSettings,
        scripts: &'a ScriptBundle, version: String, stamper: &'a dyn Stamper,
        log: &'a dyn Fn(&str),
    ) -> Result<Self, BuildError> {
        let layout = OutputLayout::for_settings(settings);
        stamper.stamp(template, output, settings, scripts, 0, log)?;

        let (file, archive_start) = match layout {
            OutputLayout::Appended => {
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(output)
                    .map_err(|e| BuildError::setup(output, e))?;
                let start = file.seek(SeekFrom::End(0))?;
                (file, start)
            }
            OutputLayout::Sidecar => {
                let data_path = output.with_extension("data");
                let file =
                    File::create(&data_path).map_err(|e| BuildError::setup(&data_path, e))?;
                (file, 0)
            }
        };

        Ok(Self {
            layout,
            template: template.to_path_buf(),
            base_path: output.to_path_buf(),
            current_exe: output.to_path_buf(),
            file: Some(file),
            span_index: 0,
            archive_start,
            spanned_bytes: 0,
            version,
            settings,
            scripts,
            stamper,
            log,
        })
    }

    /// Offset where archive data begins in the current volume file.
    pub fn archive_start(&self) -> u64 {
        self.archive_start
    }

    /// Position the next archive byte will be written at.
    pub fn offset(&mut self) -> Result<u64, BuildError> {
        Ok(self.file_mut()?.stream_position()?)
    }

    pub fn write_all(&mut self, data: &[u8]) -> Result<(), BuildError> {
        self.file_mut()?.write_all(data)?;
        Ok(())
    }

    /// Closes the current volume and opens the next one. The caller has
    /// already finalized the archive table on the current volume;
    /// `span_file_count` is the number of entries it received. The just-closed
    /// executable volume is fixed up as spanned, chained to the next volume's
    /// file name; sidecar data files carry no metadata of their own.
    pub fn span(
        &mut self, span_file_count: u64, uncompressed_so_far: u64,
    ) -> Result<(), BuildError> {
        let closed_size = self.close_current()?;
        self.spanned_bytes += closed_size;
        self.span_index += 1;

        match self.layout {
            OutputLayout::Appended => {
                let next_exe = part_path(&self.base_path, self.span_index + 1, None);
                let chain_command = next_exe
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                fixup::write_metadata(
                    &self.current_exe,
                    &chain_command,
                    &self.version,
                    true,
                    span_file_count,
                    uncompressed_so_far,
                    self.settings,
                )?;
                (self.log)(&format!(
                    "    Spanning to \"{}\" ...",
                    next_exe.display()
                ));
                self.stamper.stamp(
                    &self.template,
                    &next_exe,
                    self.settings,
                    self.scripts,
                    self.span_index,
                    self.log,
                )?;
                let mut file = OpenOptions::new()
                    .read(true)
                    .write(true)
                    .open(&next_exe)
                    .map_err(|e| BuildError::setup(&next_exe, e))?;
                self.archive_start = file.seek(SeekFrom::End(0))?;
                self.file = Some(file);
                self.current_exe = next_exe;
            }
            OutputLayout::Sidecar => {
                let next_data = part_path(&self.base_path, self.span_index + 1, Some("data"));
                (self.log)(&format!(
                    "    Spanning to \"{}\" ...",
                    next_data.display()
                ));
                let file =
                    File::create(&next_data).map_err(|e| BuildError::setup(&next_data, e))?;
                self.archive_start = 0;
                self.file = Some(file);
            }
        }
        Ok(())
    }

    /// Closes the last volume and fixes it up with the final counts. The last
    /// volume is never marked as spanned. Returns the volume count and the
    /// total bytes written across all volumes.
    pub fn finish(
        &mut self, total_file_count: u64, uncompressed_total: u64,
    ) -> Result<(u32, u64), BuildError> {
        let final_size = self.close_current()?;
        let target = match self.layout {
            OutputLayout::Appended => self.current_exe.clone(),
            OutputLayout::Sidecar => self.base_path.clone(),
        };
        fixup::write_metadata(
            &target,
            &self.settings.launch_command,
            &self.version,
            false,
            total_file_count,
            uncompressed_total,
            self.settings,
        )?;
        Ok((self.span_index + 1, self.spanned_bytes + final_size))
    }

    fn close_current(&mut self) -> Result<u64, BuildError> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| BuildError::Archive("output channel already closed".into()))?;
        file.flush()?;
        let size = file.stream_position()?;
        Ok(size)
    }

    fn file_mut(&mut self) -> Result<&mut File, BuildError> {
        self.file
            .as_mut()
            .ok_or_else(|| BuildError::Archive("output channel already closed".into()))
    }
}

/// Inserts the `_partN` span suffix before the extension, optionally swapping
/// the extension for sidecar data files.
fn part_path(base: &Path, part: u32, extension: Option<&str>) -> PathBuf {
    let stem = base
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let extension = extension
        .map(str::to_string)
        .or_else(|| base.extension().map(|e| e.to_string_lossy().into_owned()));
    let name = match extension {
        Some(ext) => format!("{}_part{}.{}", stem, part, ext),
        None => format!("{}_part{}", stem, part),
    };
    base.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_paths_insert_the_suffix_before_the_extension() {
        assert_eq!(
            part_path(Path::new("/out/setup.exe"), 2, None),
            Path::new("/out/setup_part2.exe")
        );
        assert_eq!(
            part_path(Path::new("/out/setup.exe"), 3, Some("data")),
            Path::new("/out/setup_part3.data")
        );
        assert_eq!(
            part_path(Path::new("setup"), 2, None),
            Path::new("setup_part2")
        );
    }

    #[test]
    fn layout_follows_the_external_archive_flag() {
        let mut settings = PackageSettings::default();
        assert_eq!(OutputLayout::for_settings(&settings), OutputLayout::Appended);
        settings.external_archive = true;
        assert_eq!(OutputLayout::for_settings(&settings), OutputLayout::Sidecar);
    }
}
