use std::{
    fs::File,
    hash::Hasher,
    io::{copy, Read, Result as IoResult, Write},
    mem::size_of,
};

use twox_hash::XxHash64;
use zstd::Encoder;

use crate::{
    channel::OutputChannel,
    error::BuildError,
    matcher::Matched,
    types::{
        put_str, AsBytes, EntryRecord, FromZeroes, IndexHeader, ENTRY_DOWNLOAD, ENTRY_FILE,
        HASH_SEED, PATH_SIZE, SNIPPET_SIZE,
    },
};

pub const DEFAULT_COMPRESSION: i32 = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountScope {
    /// Entries across the whole build.
    Whole,
    /// Entries since the last span.
    Span,
}

#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    pub file_count:   u64,
    pub volume_count: u32,
    pub output_bytes: u64,
}

/// The byte-accumulating, size-limited sink the pipeline streams matched
/// items into. Compression choice sits behind this boundary.
pub trait Archiver {
    fn set_maximum_size(&mut self, bytes: u64);
    /// Adds one matched item and returns its (uncompressed, compressed)
    /// sizes. Download references contribute zero to both.
    fn add(&mut self, item: &Matched, snippet: &str) -> Result<(u64, u64), BuildError>;
    fn file_count(&self, scope: CountScope) -> u64;
    /// Finalizes the last volume's table and closes the output channel.
    fn finish(&mut self) -> Result<ArchiveSummary, BuildError>;
}

/// Counts and hashes the bytes it passes through.
pub struct HashReader<R: Read, H: Hasher> {
    reader: R,
    hasher: H,
    bytes:  u64,
}

impl<R: Read, H: Hasher> HashReader<R, H> {
    pub fn new(reader: R, hasher: H) -> Self {
        HashReader {
            reader,
            hasher,
            bytes: 0,
        }
    }

    pub fn finish(self) -> (u64, u64) {
        (self.hasher.finish(), self.bytes)
    }
}

impl<R: Read, H: Hasher> Read for HashReader<R, H> {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        let bytes = self.reader.read(buf)?;
        if bytes > 0 {
            self.hasher.write(&buf[0..bytes]);
            self.bytes += bytes as u64;
        }
        Ok(bytes)
    }
}

pub fn copy_encode<R: Read, W: Write>(
    mut source: R, destination: W, level: i32,
) -> IoResult<()> {
    let mut encoder = Encoder::new(destination, level)?;
    copy(&mut source, &mut encoder)?;
    encoder.finish()?;
    Ok(())
}

/// Sequential zstd archive writer over a [`OutputChannel`].
///
/// Each file is compressed as its own frame; the volume's table of entry
/// records, an index header, and the start-of-archive trailer follow the data
/// at finalization. When the projected volume size would cross the configured
/// maximum, the current table is finalized and the channel spans before the
/// next frame is written, so a volume never ends up empty.
pub struct ZstdArchiver<'a> {
    channel:         Option<OutputChannel<'a>>,
    records:         Vec<EntryRecord>,
    max_size:        u64,
    level:           i32,
    whole_count:     u64,
    span_count:      u64,
    uncompressed:    u64,
}

impl<'a> ZstdArchiver<'a> {
    pub fn new(channel: OutputChannel<'a>) -> Self {
        Self {
            channel:      Some(channel),
            records:      Vec::new(),
            max_size:     u64::MAX,
            level:        DEFAULT_COMPRESSION,
            whole_count:  0,
            span_count:   0,
            uncompressed: 0,
        }
    }

    fn channel_mut(&mut self) -> Result<&mut OutputChannel<'a>, BuildError> {
        self.channel
            .as_mut()
            .ok_or_else(|| BuildError::Archive("archive already finalized".into()))
    }

    /// Table and trailer bytes a volume with `entries` records will need.
    fn index_size(entries: usize) -> u64 {
        (entries * size_of::<EntryRecord>() + size_of::<IndexHeader>() + 8) as u64
    }

    /// Spans to the next volume first when the incoming frame would push the
    /// current volume past the maximum. Volumes always take at least one
    /// entry so the build makes progress.
    fn reserve(&mut self, incoming: u64) -> Result<(), BuildError> {
        if self.max_size == u64::MAX || self.span_count == 0 {
            return Ok(());
        }
        let projected = self.channel_mut()?.offset()?
            + incoming
            + Self::index_size(self.records.len() + 1);
        if projected > self.max_size {
            self.finalize_table()?;
            let span_count = self.span_count;
            let uncompressed = self.uncompressed;
            self.channel_mut()?.span(span_count, uncompressed)?;
            self.records.clear();
            self.span_count = 0;
        }
        Ok(())
    }

    /// Writes the current volume's entry records, index header and
    /// start-of-archive trailer.
    fn finalize_table(&mut self) -> Result<(), BuildError> {
        let mut hasher = XxHash64::with_seed(HASH_SEED);
        for record in &self.records {
            hasher.write(record.as_bytes());
        }
        let records = std::mem::take(&mut self.records);
        let channel = self.channel_mut()?;
        let archive_start = channel.archive_start();
        let archive_size = channel.offset()? - archive_start;
        let header = IndexHeader {
            entry_count: records.len() as u64,
            archive_size,
            index_hash: hasher.finish(),
        };
        for record in &records {
            channel.write_all(record.as_bytes())?;
        }
        channel.write_all(header.as_bytes())?;
        channel.write_all(&archive_start.to_le_bytes())?;
        self.records = records;
        Ok(())
    }

    fn push_record(
        &mut self, offset: u64, compressed: u64, uncompressed: u64, hash: u64, kind: u8,
        dest: &str, snippet: &str,
    ) -> Result<(), BuildError> {
        if dest.len() >= PATH_SIZE {
            return Err(BuildError::Archive(format!(
                "destination path is longer than {} bytes: {}",
                PATH_SIZE - 1,
                dest
            )));
        }
        if snippet.len() >= SNIPPET_SIZE {
            return Err(BuildError::Archive(format!(
                "script snippet is longer than {} bytes",
                SNIPPET_SIZE - 1
            )));
        }
        let mut record = EntryRecord::new_zeroed();
        record.offset = offset;
        record.compressed_size = compressed;
        record.uncompressed_size = uncompressed;
        record.content_hash = hash;
        record.kind = kind;
        put_str(&mut record.path, dest);
        put_str(&mut record.snippet, snippet);
        self.records.push(record);
        self.whole_count += 1;
        self.span_count += 1;
        Ok(())
    }
}

impl Archiver for ZstdArchiver<'_> {
    fn set_maximum_size(&mut self, bytes: u64) {
        self.max_size = bytes;
    }

    fn add(&mut self, item: &Matched, snippet: &str) -> Result<(u64, u64), BuildError> {
        match item {
            Matched::Local { source, dest } => {
                let file = File::open(source)
                    .map_err(|_| BuildError::SourceNotFound(source.display().to_string()))?;
                let mut reader = HashReader::new(file, XxHash64::with_seed(HASH_SEED));
                let mut data = Vec::new();
                copy_encode(&mut reader, &mut data, self.level)?;
                let (hash, uncompressed) = reader.finish();

                self.reserve(data.len() as u64)?;
                let channel = self.channel_mut()?;
                let offset = channel.offset()? - channel.archive_start();
                channel.write_all(&data)?;
                self.push_record(
                    offset,
                    data.len() as u64,
                    uncompressed,
                    hash,
                    ENTRY_FILE,
                    dest,
                    snippet,
                )?;
                self.uncompressed += uncompressed;
                Ok((uncompressed, data.len() as u64))
            }
            Matched::Download { url, dest } => {
                let data = url.as_bytes();
                let mut hasher = XxHash64::with_seed(HASH_SEED);
                hasher.write(data);
                let hash = hasher.finish();

                self.reserve(data.len() as u64)?;
                let channel = self.channel_mut()?;
                let offset = channel.offset()? - channel.archive_start();
                channel.write_all(data)?;
                self.push_record(
                    offset,
                    data.len() as u64,
                    0,
                    hash,
                    ENTRY_DOWNLOAD,
                    dest,
                    snippet,
                )?;
                Ok((0, 0))
            }
        }
    }

    fn file_count(&self, scope: CountScope) -> u64 {
        match scope {
            CountScope::Whole => self.whole_count,
            CountScope::Span => self.span_count,
        }
    }

    fn finish(&mut self) -> Result<ArchiveSummary, BuildError> {
        self.finalize_table()?;
        let whole_count = self.whole_count;
        let uncompressed = self.uncompressed;
        let mut channel = self
            .channel
            .take()
            .ok_or_else(|| BuildError::Archive("archive already finalized".into()))?;
        let (volume_count, output_bytes) = channel.finish(whole_count, uncompressed)?;
        Ok(ArchiveSummary {
            file_count: whole_count,
            volume_count,
            output_bytes,
        })
    }
}
