use std::{
    path::{Path, PathBuf},
    time::Instant,
};

use chrono::Local;

use crate::{
    archive::{Archiver, ZstdArchiver},
    bundle,
    channel::OutputChannel,
    embed::{ResourceStamper, Stamper},
    error::BuildError,
    fixup,
    matcher::{self, Matched},
    project::{PackageSettings, Project},
    session::{BuildOutcome, BuildReport, BuildSession, Progress},
};

/// Runs a build for the project, dispatching on the configured output name:
/// `.exe` produces self-extracting volumes from the template, `.gz`/`.gzip`
/// produces a tar-then-compress bundle through an external archiver.
///
/// The worker runs everything synchronously; the only feedback channels are
/// the log and progress callbacks, and the only inbound signal is the
/// session's cancellation flag.
pub fn run(
    project: &Project, base_dir: &Path, template: Option<&Path>, tool: Option<&Path>,
    session: &BuildSession, log: &dyn Fn(&str), progress: &dyn Fn(Progress),
) -> Result<BuildReport, BuildError> {
    let output = output_path(&project.settings, base_dir);
    let extension = output
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "exe" => {
            let template = template.ok_or_else(|| {
                BuildError::Project(
                    "an extractor template executable is required for .exe output".into(),
                )
            })?;
            let stamper = ResourceStamper::new(base_dir);
            build_sfx(
                project, base_dir, template, &output, &stamper, session, log, progress,
            )
        }
        "gz" | "gzip" => {
            bundle::build_bundle(project, base_dir, &output, tool, session, log, progress)
        }
        _ => Err(BuildError::Project(format!(
            "unrecognized output extension: {}",
            output.display()
        ))),
    }
}

/// The self-extracting build: expand every entry in declared order, stream
/// the matches into the spanning archive, then fix up the final volume with
/// the true totals.
pub fn build_sfx(
    project: &Project, base_dir: &Path, template: &Path, output: &Path, stamper: &dyn Stamper,
    session: &BuildSession, log: &dyn Fn(&str), progress: &dyn Fn(Progress),
) -> Result<BuildReport, BuildError> {
    let start = Instant::now();
    let settings = &project.settings;
    let total = project.len() as u64;
    if total == 0 {
        return Ok(empty_report(start, BuildOutcome::Completed));
    }

    log(&format!(
        "Beginning build of \"{}\" ({}) ...",
        settings.caption,
        output.display()
    ));

    let version = fixup::version_string(settings, base_dir);
    let channel = OutputChannel::open(
        template,
        output,
        settings,
        &project.scripts,
        version,
        stamper,
        log,
    )?;
    let mut archiver = ZstdArchiver::new(channel);
    archiver.set_maximum_size(settings.max_volume_bytes());

    let mut uncompressed_total = 0u64;
    let mut compressed_total = 0u64;
    let mut added = 0u64;

    let mut drive = || -> Result<(), BuildError> {
        for (index, entry) in project.entries().enumerate() {
            session.check()?;
            let matches = matcher::expand_entry(base_dir, entry, session, log, progress)?;
            for item in &matches {
                session.check()?;
                if let Matched::Local { source, dest } = item {
                    log(&format!(
                        "    Adding \"{}\" from \"{}\" ...",
                        dest,
                        source.display()
                    ));
                }
                let (uncompressed, compressed) = archiver.add(item, &entry.snippet)?;
                uncompressed_total += uncompressed;
                compressed_total += compressed;
                added += 1;
            }
            progress(Progress::Percent(
                ((index as u64 + 1) * 100 / total) as u32,
            ));
        }
        Ok(())
    };
    let result = drive();
    progress(Progress::Clear);

    match result {
        Ok(()) => {
            let summary = archiver.finish()?;
            let report = BuildReport {
                added_count:        summary.file_count,
                volume_count:       summary.volume_count,
                uncompressed_bytes: uncompressed_total,
                compressed_bytes:   summary.output_bytes,
                elapsed:            start.elapsed(),
                outcome:            BuildOutcome::Completed,
            };
            log(&format!(
                "Done.\n\nAdded {} files, spanning {} archive(s).",
                report.added_count, report.volume_count
            ));
            log(&format!(
                "Uncompressed Size: {:.2}MB\nCompressed Size: {:.2}MB\nCompression: {:.2}%",
                megabytes(report.uncompressed_bytes),
                megabytes(report.compressed_bytes),
                report.compression_percent()
            ));
            log(&format!("Completed in: {}", report.elapsed_display()));
            Ok(report)
        }
        // Partial volumes stay on disk untouched; cancellation is an outcome,
        // not a failure.
        Err(error) if error.is_cancelled() => {
            let report = BuildReport {
                added_count:        added,
                volume_count:       0,
                uncompressed_bytes: uncompressed_total,
                compressed_bytes:   compressed_total,
                elapsed:            start.elapsed(),
                outcome:            BuildOutcome::Cancelled,
            };
            log(&format!("Cancelled. (after: {})", report.elapsed_display()));
            Ok(report)
        }
        Err(error) => {
            log(&format!("Build failed: {}", error));
            Err(error)
        }
    }
}

pub(crate) fn empty_report(start: Instant, outcome: BuildOutcome) -> BuildReport {
    BuildReport {
        added_count:        0,
        volume_count:       0,
        uncompressed_bytes: 0,
        compressed_bytes:   0,
        elapsed:            start.elapsed(),
        outcome,
    }
}

pub fn megabytes(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}

/// Resolves the configured output file against the project directory and
/// applies the `_<version>` and `_<YYYYMMDD>` name decorations, version
/// first.
pub fn output_path(settings: &PackageSettings, base_dir: &Path) -> PathBuf {
    let path = matcher::resolve(base_dir, &settings.output_file);
    if !settings.append_version && !settings.append_build_date {
        return path;
    }

    let mut suffix = String::new();
    if settings.append_version {
        let version_path = matcher::resolve(base_dir, &settings.version_file);
        if let Some((major, minor, release, build)) = version_path
            .is_file()
            .then(|| fixup::read_file_version(&version_path))
            .flatten()
        {
            suffix.push_str(&format!("_{}.{}", major, minor));
            if release != 0 || build != 0 {
                suffix.push_str(&format!(".{}", release));
                if build != 0 {
                    suffix.push_str(&format!(".{}", build));
                }
            }
        }
    }
    if settings.append_build_date {
        suffix.push_str(&Local::now().format("_%Y%m%d").to_string());
    }
    if suffix.is_empty() {
        return path;
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{}{}.{}", stem, suffix, ext.to_string_lossy()),
        None => format!("{}{}", stem, suffix),
    };
    path.with_file_name(name)
}
