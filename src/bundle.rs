use std::{
    env, fs,
    path::{Path, PathBuf},
    process::Command,
    time::Instant,
};

use rand::distr::{Alphanumeric, SampleString};
use which::which;

use crate::{
    error::BuildError,
    matcher::{self, Matched},
    pipeline::{empty_report, megabytes},
    project::Project,
    session::{BuildOutcome, BuildReport, BuildSession, Progress},
};

/// The tar-then-compress output mode: matched files are copied into a
/// staging tree mirroring their destination paths, the external archiver is
/// invoked twice (pack, then compress), and the staging tree is removed
/// again. No executable is produced and no spanning happens here.
pub fn build_bundle(
    project: &Project, base_dir: &Path, output: &Path, tool: Option<&Path>,
    session: &BuildSession, log: &dyn Fn(&str), progress: &dyn Fn(Progress),
) -> Result<BuildReport, BuildError> {
    let start = Instant::now();
    let total = project.len() as u64;
    if total == 0 {
        return Ok(empty_report(start, BuildOutcome::Completed));
    }

    log(&format!(
        "Beginning build of \"{}\" ({}) ...",
        project.settings.caption,
        output.display()
    ));

    let tool = match tool {
        Some(tool) => tool.to_path_buf(),
        None => which("7z").map_err(|_| {
            BuildError::ExternalTool("couldn't locate the external archiver (7z)".into())
        })?,
    };

    let base_name = strip_extensions(output);
    let staging = staging_dir(&base_name);

    let result = stage_and_pack(
        project, base_dir, &tool, &base_name, &staging, session, log, progress,
    );
    progress(Progress::Clear);

    log("Removing temporary files...");
    if let Err(error) = fs::remove_dir_all(&staging) {
        if error.kind() != std::io::ErrorKind::NotFound {
            log(&format!(
                "    WARNING: couldn't remove \"{}\": {}",
                staging.display(),
                error
            ));
        }
    }

    match result {
        Ok((added, uncompressed, compressed)) => {
            let report = BuildReport {
                added_count:        added,
                volume_count:       0,
                uncompressed_bytes: uncompressed,
                compressed_bytes:   compressed,
                elapsed:            start.elapsed(),
                outcome:            BuildOutcome::Completed,
            };
            log(&format!(
                "Done. (completed in: {}, {:.2}MB compressed)",
                report.elapsed_display(),
                megabytes(report.compressed_bytes)
            ));
            Ok(report)
        }
        Err(error) if error.is_cancelled() => {
            let report = BuildReport {
                added_count:        0,
                volume_count:       0,
                uncompressed_bytes: 0,
                compressed_bytes:   0,
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

fn stage_and_pack(
    project: &Project, base_dir: &Path, tool: &Path, base_name: &Path, staging: &Path,
    session: &BuildSession, log: &dyn Fn(&str), progress: &dyn Fn(Progress),
) -> Result<(u64, u64, u64), BuildError> {
    log("Pre-processing...");
    let total = project.len() as u64;
    let mut added = 0u64;
    let mut staged_bytes = 0u64;

    for (index, entry) in project.entries().enumerate() {
        session.check()?;
        let matches = matcher::expand_entry(base_dir, entry, session, log, progress)?;
        for item in matches {
            session.check()?;
            match item {
                Matched::Local { source, dest } => {
                    let target = staging.join(&dest);
                    if let Some(parent) = target.parent() {
                        fs::create_dir_all(parent)?;
                    }
                    log(&format!(
                        "    Copying temp file \"{}\" from \"{}\"...",
                        dest,
                        source.display()
                    ));
                    staged_bytes += fs::copy(&source, &target)?;
                    added += 1;
                }
                Matched::Download { url, .. } => {
                    log(&format!(
                        "    WARNING: download references are not bundled, skipping ({})",
                        url
                    ));
                }
            }
        }
        progress(Progress::Percent(((index as u64 + 1) * 100 / total) as u32));
    }

    let tar_path = PathBuf::from(format!("{}.tar", base_name.display()));
    let gzip_path = PathBuf::from(format!("{}.tar.gzip", base_name.display()));
    let _ = fs::remove_file(&tar_path);
    let _ = fs::remove_file(&gzip_path);

    log("Creating tarball(s)...");
    run_tool(
        tool,
        &[
            "-ttar",
            "-r",
            "a",
            &tar_path.display().to_string(),
            &format!("{}/*", staging.display()),
        ],
    )?;

    log("Performing final gzip operation...");
    run_tool(
        tool,
        &[
            "-tgzip",
            "a",
            &gzip_path.display().to_string(),
            &tar_path.display().to_string(),
        ],
    )?;
    let _ = fs::remove_file(&tar_path);

    let compressed = fs::metadata(&gzip_path).map(|m| m.len()).unwrap_or(0);
    Ok((added, staged_bytes, compressed))
}

fn run_tool(tool: &Path, args: &[&str]) -> Result<(), BuildError> {
    let status = Command::new(tool).args(args).status().map_err(|error| {
        BuildError::ExternalTool(format!("couldn't run {}: {}", tool.display(), error))
    })?;
    if !status.success() {
        return Err(BuildError::ExternalTool(format!(
            "{} exited with {}",
            tool.display(),
            status
        )));
    }
    Ok(())
}

/// Strips every extension: `release.tar.gz` becomes `release`.
fn strip_extensions(path: &Path) -> PathBuf {
    let mut path = path.to_path_buf();
    while path.extension().is_some() {
        path = path.with_extension("");
    }
    path
}

fn staging_dir(base_name: &Path) -> PathBuf {
    let stem = base_name
        .file_name()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "bundle".into());
    env::temp_dir().join(format!(
        "{}-{}",
        stem,
        Alphanumeric.sample_string(&mut rand::rng(), 12)
    ))
}
