use std::path::{Path, PathBuf};

use glob::{MatchOptions, Pattern};
use path_slash::PathExt;
use walkdir::WalkDir;

use crate::{
    error::BuildError,
    project::FileEntry,
    session::{BuildSession, Progress},
};

/// One expanded source item: either a local file to compress or a download
/// reference resolved by the extractor at install time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Matched {
    Local { source: PathBuf, dest: String },
    Download { url: String, dest: String },
}

impl Matched {
    pub fn dest(&self) -> &str {
        match self {
            Matched::Local { dest, .. } => dest,
            Matched::Download { dest, .. } => dest,
        }
    }
}

// Name matching keeps the case-insensitive behavior of the original
// installer projects.
const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive:              false,
    require_literal_separator:   false,
    require_literal_leading_dot: false,
};

/// Expands one declared entry into its matched items, in traversal order.
///
/// Wildcard entries (a `*` in the name, or a directory source) recurse and
/// always name destinations after the matched files; literal entries map one
/// source file onto one destination name. `http(s)` sources skip the
/// filesystem entirely. A literal or wildcard spec that matches nothing is a
/// hard failure unless the spec itself is a directory.
pub fn expand_entry(
    base_dir: &Path, entry: &FileEntry, session: &BuildSession, log: &dyn Fn(&str),
    progress: &dyn Fn(Progress),
) -> Result<Vec<Matched>, BuildError> {
    session.check()?;

    if let Some(url) = as_url(&entry.source_path) {
        let dest = join_dest(&entry.destination_path, &entry.name);
        log(&format!(
            "    Adding download reference to \"{}\" from ({}) ...",
            dest, url
        ));
        return Ok(vec![Matched::Download {
            url: url.to_string(),
            dest,
        }]);
    }

    let source = resolve(base_dir, &entry.source_path);
    let wildcard = entry.name.contains('*') || source.is_dir();
    let excludes = parse_excludes(&entry.exclude_spec);
    let mut matched = Vec::new();

    if wildcard {
        let (root, pattern) = if entry.name.contains('*') {
            (source.clone(), entry.name.clone())
        } else {
            (source.clone(), "*".to_string())
        };
        progress(Progress::Indeterminate);
        let walked = expand_dir(
            &root,
            &pattern,
            &entry.destination_path,
            &excludes,
            session,
            log,
            &mut matched,
        );
        progress(Progress::Clear);
        walked?;
        // An existing directory that yields nothing is not an error, but a
        // glob that matched nothing is.
        if matched.is_empty() && !(pattern == "*" && root.is_dir()) {
            return Err(BuildError::SourceNotFound(entry.source_path.clone()));
        }
    } else {
        if !source.is_file() {
            log(&format!(
                "    WARNING: \"{}\" NOT FOUND!",
                source.display()
            ));
            return Err(BuildError::SourceNotFound(entry.source_path.clone()));
        }
        let name = if entry.name.is_empty() {
            source
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default()
        } else {
            entry.name.clone()
        };
        matched.push(Matched::Local {
            source,
            dest: join_dest(&entry.destination_path, &name),
        });
    }

    Ok(matched)
}

/// Serial recursive walk, pruned by the glob pattern at every level. Empty
/// directories contribute nothing; cancellation is polled before each entry.
fn expand_dir(
    root: &Path, pattern: &str, dest_base: &str, excludes: &[Pattern], session: &BuildSession,
    log: &dyn Fn(&str), matched: &mut Vec<Matched>,
) -> Result<(), BuildError> {
    let pattern = compile_pattern(pattern);
    let walk = WalkDir::new(root)
        .min_depth(1)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| {
            pattern.matches_with(&entry.file_name().to_string_lossy(), MATCH_OPTIONS)
        });
    for entry in walk {
        session.check()?;
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                log(&format!("    WARNING: couldn't read entry: {}", e));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy();
        if is_excluded(&name, excludes) {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(root)
            .unwrap_or_else(|_| entry.path())
            .to_path_buf();
        matched.push(Matched::Local {
            source: entry.path().to_path_buf(),
            dest:   join_dest(dest_base, &rel.to_slash_lossy()),
        });
    }
    Ok(())
}

/// Recognizes `http://` and `https://` source specs, case-insensitively.
fn as_url(spec: &str) -> Option<&str> {
    let lower = spec.to_ascii_lowercase();
    if lower.starts_with("http://") || lower.starts_with("https://") {
        Some(spec)
    } else {
        None
    }
}

pub fn resolve(base_dir: &Path, spec: &str) -> PathBuf {
    let path = PathBuf::from(spec);
    if path.is_absolute() {
        path
    } else {
        base_dir.join(path)
    }
}

fn compile_pattern(pattern: &str) -> Pattern {
    Pattern::new(pattern)
        .or_else(|_| Pattern::new(&Pattern::escape(pattern)))
        .unwrap_or_else(|_| Pattern::new("*").expect("the wildcard pattern is valid"))
}

/// Splits the semicolon-separated exclusion spec into patterns. Pattern order
/// never changes the outcome: any match excludes.
fn parse_excludes(spec: &str) -> Vec<Pattern> {
    spec.split(';')
        .map(str::trim)
        .filter(|piece| !piece.is_empty())
        .map(compile_pattern)
        .collect()
}

fn is_excluded(name: &str, excludes: &[Pattern]) -> bool {
    excludes
        .iter()
        .any(|pattern| pattern.matches_with(name, MATCH_OPTIONS))
}

/// Joins an archive destination directory and a file name with forward
/// slashes. A leading separator is dropped unless the path is a UNC-style
/// network reference.
pub fn join_dest(dest_base: &str, name: &str) -> String {
    let mut base = dest_base.replace('\\', "/");
    if base.starts_with('/') && !dest_base.starts_with("\\\\") {
        base.remove(0);
    }
    let name = name.replace('\\', "/");
    let name = name.trim_start_matches('/');
    if base.is_empty() {
        name.to_string()
    } else {
        if !base.ends_with('/') {
            base.push('/');
        }
        base + name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn entry(name: &str, src: &str, dst: &str, exclude: &str) -> FileEntry {
        FileEntry {
            name:             name.into(),
            source_path:      src.into(),
            destination_path: dst.into(),
            exclude_spec:     exclude.into(),
            snippet:          String::new(),
        }
    }

    fn expand(base: &Path, entry: &FileEntry) -> Result<Vec<Matched>, BuildError> {
        let session = BuildSession::new();
        expand_entry(base, entry, &session, &|_| {}, &|_| {})
    }

    #[test]
    fn literal_file_uses_the_declared_name() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let matched = expand(dir.path(), &entry("a.txt", "a.txt", "", "")).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].dest(), "a.txt");
    }

    #[test]
    fn missing_literal_source_is_a_hard_failure() {
        let dir = tempfile::tempdir().unwrap();
        let result = expand(dir.path(), &entry("a.txt", "a.txt", "", ""));
        assert!(matches!(result, Err(BuildError::SourceNotFound(_))));
    }

    #[test]
    fn wildcard_applies_excludes_any_of() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x.txt"), b"x").unwrap();
        fs::write(dir.path().join("y.tmp"), b"y").unwrap();
        fs::write(dir.path().join("z.bak"), b"z").unwrap();
        let matched = expand(dir.path(), &entry("*", ".", "", "*.tmp;*.bak")).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].dest(), "x.txt");
    }

    #[test]
    fn recursion_preserves_relative_destination() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub/inner")).unwrap();
        fs::write(dir.path().join("top.txt"), b"t").unwrap();
        fs::write(dir.path().join("sub/inner/deep.txt"), b"d").unwrap();
        let matched = expand(dir.path(), &entry("*", ".", "data", "")).unwrap();
        let mut dests: Vec<_> = matched.iter().map(|m| m.dest().to_string()).collect();
        dests.sort();
        assert_eq!(dests, ["data/sub/inner/deep.txt", "data/top.txt"]);
    }

    #[test]
    fn empty_directory_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("empty/nested")).unwrap();
        let matched = expand(dir.path(), &entry("*", "empty", "", "")).unwrap();
        assert!(matched.is_empty());
    }

    #[test]
    fn wildcard_matching_nothing_fails() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let result = expand(dir.path(), &entry("*.doc", ".", "", ""));
        assert!(matches!(result, Err(BuildError::SourceNotFound(_))));
    }

    #[test]
    fn url_specs_bypass_the_filesystem() {
        let dir = tempfile::tempdir().unwrap();
        let matched = expand(
            dir.path(),
            &entry("tool.exe", "HTTPS://example.com/tool.exe", "bin", ""),
        )
        .unwrap();
        assert_eq!(
            matched,
            vec![Matched::Download {
                url:  "HTTPS://example.com/tool.exe".into(),
                dest: "bin/tool.exe".into(),
            }]
        );
    }

    #[test]
    fn leading_separator_is_stripped_from_destinations() {
        assert_eq!(join_dest("\\install", "a.txt"), "install/a.txt");
        assert_eq!(join_dest("/install", "a.txt"), "install/a.txt");
        assert_eq!(join_dest("", "a.txt"), "a.txt");
        assert_eq!(join_dest("\\\\server\\share", "a.txt"), "//server/share/a.txt");
    }

    #[test]
    fn cancellation_aborts_the_walk() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), b"a").unwrap();
        let session = BuildSession::new();
        session.cancel();
        let result = expand_entry(
            dir.path(),
            &entry("*", ".", "", ""),
            &session,
            &|_| {},
            &|_| {},
        );
        assert!(matches!(result, Err(BuildError::Cancelled)));
    }

    #[test]
    fn case_insensitive_matching() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("README.TXT"), b"r").unwrap();
        let matched = expand(dir.path(), &entry("*.txt", ".", "", "")).unwrap();
        assert_eq!(matched.len(), 1);
    }
}
