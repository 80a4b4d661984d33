use std::{fs, path::Path};

use indexmap::IndexMap;

use crate::error::BuildError;

/// Build configuration of a package, frozen for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSettings {
    pub output_file:              String,
    pub caption:                  String,
    pub description:              String,
    pub license_text:             String,
    pub icon_file:                String,
    pub image_file:               String,
    pub launch_command:           String,
    pub default_path:             String,
    pub version_file:             String,
    /// Maximum volume size in megabytes; zero or negative disables spanning.
    pub max_volume_mb:            i32,
    pub explore_on_complete:      bool,
    pub allow_destination_change: bool,
    pub require_admin:            bool,
    pub require_reboot:           bool,
    pub append_build_date:        bool,
    pub append_version:           bool,
    pub external_archive:         bool,
}

impl Default for PackageSettings {
    fn default() -> Self {
        Self {
            output_file:              "package.exe".into(),
            caption:                  "Installer".into(),
            description:              "Describe the files being installed".into(),
            license_text:             String::new(),
            icon_file:                String::new(),
            image_file:               String::new(),
            launch_command:           String::new(),
            default_path:             String::new(),
            version_file:             String::new(),
            max_volume_mb:            -1,
            explore_on_complete:      false,
            allow_destination_change: true,
            require_admin:            false,
            require_reboot:           false,
            append_build_date:        false,
            append_version:           false,
            external_archive:         false,
        }
    }
}

impl PackageSettings {
    /// Spanning threshold in bytes, with the unbounded sentinel.
    pub fn max_volume_bytes(&self) -> u64 {
        if self.max_volume_mb > 0 {
            self.max_volume_mb as u64 * 1024 * 1024
        } else {
            u64::MAX
        }
    }
}

/// The three scripting hooks passed through verbatim into the output.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptBundle {
    pub init:     String,
    pub per_file: String,
    pub finish:   String,
}

/// One source-to-destination mapping; may expand into many files through
/// wildcard or directory matching.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileEntry {
    pub name:             String,
    pub source_path:      String,
    pub destination_path: String,
    pub exclude_spec:     String,
    pub snippet:          String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MoveDirection {
    Up,
    Down,
    Top,
    Bottom,
}

/// A package project: settings, scripts, and the ordered entry list. Entries
/// are keyed by a monotonically increasing handle; their order is the archive
/// order and can be adjusted by swapping positions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Project {
    pub settings:   PackageSettings,
    pub scripts:    ScriptBundle,
    entries:        IndexMap<u32, FileEntry>,
    next_handle:    u32,
}

impl Project {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&mut self, entry: FileEntry) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.entries.insert(handle, entry);
        handle
    }

    pub fn remove_entry(&mut self, handle: u32) -> Option<FileEntry> {
        self.entries.shift_remove(&handle)
    }

    pub fn entry(&self, handle: u32) -> Option<&FileEntry> {
        self.entries.get(&handle)
    }

    pub fn entry_mut(&mut self, handle: u32) -> Option<&mut FileEntry> {
        self.entries.get_mut(&handle)
    }

    pub fn entries(&self) -> impl Iterator<Item = &FileEntry> {
        self.entries.values()
    }

    pub fn handles(&self) -> impl Iterator<Item = u32> + '_ {
        self.entries.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Swaps the entry at `handle` with its target slot. Returns false when
    /// the move is impossible (unknown handle, or already at the edge).
    pub fn move_entry(&mut self, handle: u32, direction: MoveDirection) -> bool {
        let Some(index) = self.entries.get_index_of(&handle) else {
            return false;
        };
        let last = self.entries.len() - 1;
        let target = match direction {
            MoveDirection::Up if index > 0 => index - 1,
            MoveDirection::Down if index < last => index + 1,
            MoveDirection::Top => 0,
            MoveDirection::Bottom => last,
            _ => return false,
        };
        if target == index {
            return false;
        }
        self.entries.swap_indices(index, target);
        true
    }

    pub fn load(path: &Path) -> Result<Self, BuildError> {
        let text = fs::read_to_string(path)?;
        parse(&text)
    }

    pub fn save(&self, path: &Path) -> Result<(), BuildError> {
        fs::write(path, self.to_document())?;
        Ok(())
    }

    /// Serializes the project as a tagged-element document. Every attribute
    /// value is entity-escaped; empty scripts are omitted.
    pub fn to_document(&self) -> String {
        let mut s = String::new();
        s.push_str("<sfxpack>\n");
        s.push_str("\t<settings>");
        setting_line(&mut s, "output", &self.settings.output_file);
        setting_line(&mut s, "caption", &self.settings.caption);
        setting_line(&mut s, "description", &self.settings.description);
        setting_line(&mut s, "licensemsg", &self.settings.license_text);
        setting_line(&mut s, "icon", &self.settings.icon_file);
        setting_line(&mut s, "image", &self.settings.image_file);
        setting_line(&mut s, "launchcmd", &self.settings.launch_command);
        setting_line(&mut s, "explore", bool_str(self.settings.explore_on_complete));
        setting_line(&mut s, "defaultpath", &self.settings.default_path);
        setting_line(&mut s, "versionid", &self.settings.version_file);
        setting_line(&mut s, "requireadmin", bool_str(self.settings.require_admin));
        setting_line(&mut s, "requirereboot", bool_str(self.settings.require_reboot));
        setting_line(
            &mut s,
            "allowdestchg",
            bool_str(self.settings.allow_destination_change),
        );
        setting_line(
            &mut s,
            "appendbuilddate",
            bool_str(self.settings.append_build_date),
        );
        setting_line(&mut s, "appendversion", bool_str(self.settings.append_version));
        setting_line(
            &mut s,
            "externalarchive",
            bool_str(self.settings.external_archive),
        );
        setting_line(&mut s, "maxsize", &self.settings.max_volume_mb.to_string());
        s.push_str("\n\t</settings>\n");

        s.push_str("\n\t<scripts>");
        script_line(&mut s, "init", &self.scripts.init);
        script_line(&mut s, "perfile", &self.scripts.per_file);
        script_line(&mut s, "finish", &self.scripts.finish);
        s.push_str("\n\t</scripts>\n");

        s.push_str("\n\t<files>\n");
        for entry in self.entries.values() {
            s.push_str(&format!(
                "\t\t<file name=\"{}\" src=\"{}\" dst=\"{}\" exclude=\"{}\" snippet=\"{}\" />\n",
                escape(&entry.name),
                escape(&entry.source_path),
                escape(&entry.destination_path),
                escape(&entry.exclude_spec),
                escape(&entry.snippet),
            ));
        }
        s.push_str("\t</files>\n");
        s.push_str("</sfxpack>\n");
        s
    }
}

fn setting_line(s: &mut String, key: &str, value: &str) {
    s.push_str(&format!("\n\t\t<{} value=\"{}\"/>", key, escape(value)));
}

fn script_line(s: &mut String, kind: &str, text: &str) {
    if !text.is_empty() {
        s.push_str(&format!(
            "\n\t\t<script type=\"{}\">{}</script>",
            kind,
            escape(text)
        ));
    }
}

fn bool_str(value: bool) -> &'static str {
    if value {
        "true"
    } else {
        "false"
    }
}

/// Escapes the four reserved document characters.
pub fn escape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '&' => out.push_str("&amp;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn unescape(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut rest = input;
    while let Some(idx) = rest.find('&') {
        out.push_str(&rest[..idx]);
        let tail = &rest[idx..];
        if let Some(after) = tail.strip_prefix("&lt;") {
            out.push('<');
            rest = after;
        } else if let Some(after) = tail.strip_prefix("&gt;") {
            out.push('>');
            rest = after;
        } else if let Some(after) = tail.strip_prefix("&amp;") {
            out.push('&');
            rest = after;
        } else if let Some(after) = tail.strip_prefix("&quot;") {
            out.push('"');
            rest = after;
        } else {
            out.push('&');
            rest = &tail[1..];
        }
    }
    out.push_str(rest);
    out
}

struct Tag<'a> {
    name:    &'a str,
    attrs:   Vec<(&'a str, String)>,
    closing: bool,
}

impl Tag<'_> {
    fn attr(&self, name: &str) -> Option<&str> {
        self.attrs
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    fn attr_or_default(&self, name: &str) -> String {
        self.attr(name).unwrap_or_default().to_string()
    }
}

struct Scanner<'a> {
    text: &'a str,
    pos:  usize,
}

impl<'a> Scanner<'a> {
    fn new(text: &'a str) -> Self {
        Self { text, pos: 0 }
    }

    /// Advances to the next element and parses its name and attributes.
    fn next_tag(&mut self) -> Result<Option<Tag<'a>>, BuildError> {
        let rest = &self.text[self.pos..];
        let Some(open) = rest.find('<') else {
            self.pos = self.text.len();
            return Ok(None);
        };
        let mut cursor = self.pos + open + 1;
        let bytes = self.text.as_bytes();
        let closing = bytes.get(cursor) == Some(&b'/');
        if closing {
            cursor += 1;
        }
        let name_start = cursor;
        while cursor < bytes.len()
            && (bytes[cursor].is_ascii_alphanumeric() || bytes[cursor] == b'_')
        {
            cursor += 1;
        }
        let name = &self.text[name_start..cursor];
        if name.is_empty() {
            return Err(BuildError::Project(format!(
                "unnamed element at offset {}",
                name_start
            )));
        }
        let mut attrs = Vec::new();
        loop {
            while cursor < bytes.len() && bytes[cursor].is_ascii_whitespace() {
                cursor += 1;
            }
            match bytes.get(cursor) {
                Some(b'>') => {
                    cursor += 1;
                    break;
                }
                Some(b'/') => {
                    cursor += 1;
                }
                Some(_) => {
                    let attr_start = cursor;
                    while cursor < bytes.len()
                        && bytes[cursor] != b'='
                        && !bytes[cursor].is_ascii_whitespace()
                    {
                        cursor += 1;
                    }
                    let key = &self.text[attr_start..cursor];
                    while cursor < bytes.len() && bytes[cursor] != b'"' {
                        cursor += 1;
                    }
                    cursor += 1;
                    let value_start = cursor;
                    while cursor < bytes.len() && bytes[cursor] != b'"' {
                        cursor += 1;
                    }
                    if cursor >= bytes.len() {
                        return Err(BuildError::Project(format!(
                            "unterminated attribute '{}' in <{}>",
                            key, name
                        )));
                    }
                    attrs.push((key, unescape(&self.text[value_start..cursor])));
                    cursor += 1;
                }
                None => {
                    return Err(BuildError::Project(format!(
                        "unterminated element <{}>",
                        name
                    )));
                }
            }
        }
        self.pos = cursor;
        Ok(Some(Tag {
            name,
            attrs,
            closing,
        }))
    }

    /// Raw text from the cursor up to the next closing element, still escaped.
    fn raw_until_close(&mut self) -> &'a str {
        let rest = &self.text[self.pos..];
        let end = rest.find("</").unwrap_or(rest.len());
        let raw = &rest[..end];
        self.pos += end;
        raw
    }
}

/// Parses a project document produced by [`Project::to_document`]. Element
/// and attribute names are matched case-insensitively.
pub fn parse(text: &str) -> Result<Project, BuildError> {
    let mut project = Project::new();
    let mut scanner = Scanner::new(text);
    while let Some(tag) = scanner.next_tag()? {
        if tag.closing {
            continue;
        }
        if tag.name.eq_ignore_ascii_case("settings") {
            parse_settings(&mut scanner, &mut project.settings)?;
        } else if tag.name.eq_ignore_ascii_case("scripts") {
            parse_scripts(&mut scanner, &mut project.scripts)?;
        } else if tag.name.eq_ignore_ascii_case("files") {
            parse_files(&mut scanner, &mut project)?;
        }
    }
    Ok(project)
}

fn parse_settings(
    scanner: &mut Scanner, settings: &mut PackageSettings,
) -> Result<(), BuildError> {
    while let Some(tag) = scanner.next_tag()? {
        if tag.closing {
            if tag.name.eq_ignore_ascii_case("settings") {
                break;
            }
            continue;
        }
        let value = tag.attr_or_default("value");
        let key = tag.name;
        if key.eq_ignore_ascii_case("output") {
            settings.output_file = value;
        } else if key.eq_ignore_ascii_case("caption") {
            settings.caption = value;
        } else if key.eq_ignore_ascii_case("description") {
            settings.description = value;
        } else if key.eq_ignore_ascii_case("licensemsg") {
            settings.license_text = value;
        } else if key.eq_ignore_ascii_case("icon") {
            settings.icon_file = value;
        } else if key.eq_ignore_ascii_case("image") {
            settings.image_file = value;
        } else if key.eq_ignore_ascii_case("launchcmd") {
            settings.launch_command = value;
        } else if key.eq_ignore_ascii_case("explore") {
            settings.explore_on_complete = parse_bool(&value);
        } else if key.eq_ignore_ascii_case("defaultpath") {
            settings.default_path = value;
        } else if key.eq_ignore_ascii_case("versionid") {
            settings.version_file = value;
        } else if key.eq_ignore_ascii_case("requireadmin") {
            settings.require_admin = parse_bool(&value);
        } else if key.eq_ignore_ascii_case("requirereboot") {
            settings.require_reboot = parse_bool(&value);
        } else if key.eq_ignore_ascii_case("allowdestchg") {
            settings.allow_destination_change = parse_bool(&value);
        } else if key.eq_ignore_ascii_case("appendbuilddate") {
            settings.append_build_date = parse_bool(&value);
        } else if key.eq_ignore_ascii_case("appendversion") {
            settings.append_version = parse_bool(&value);
        } else if key.eq_ignore_ascii_case("externalarchive") {
            settings.external_archive = parse_bool(&value);
        } else if key.eq_ignore_ascii_case("maxsize") {
            settings.max_volume_mb = value.trim().parse().unwrap_or(0);
        }
    }
    Ok(())
}

fn parse_scripts(scanner: &mut Scanner, scripts: &mut ScriptBundle) -> Result<(), BuildError> {
    while let Some(tag) = scanner.next_tag()? {
        if tag.closing {
            if tag.name.eq_ignore_ascii_case("scripts") {
                break;
            }
            continue;
        }
        if !tag.name.eq_ignore_ascii_case("script") {
            continue;
        }
        let kind = tag.attr_or_default("type");
        let text = unescape(scanner.raw_until_close());
        if kind.eq_ignore_ascii_case("init") {
            scripts.init = text;
        } else if kind.eq_ignore_ascii_case("perfile") {
            scripts.per_file = text;
        } else if kind.eq_ignore_ascii_case("finish") {
            scripts.finish = text;
        }
    }
    Ok(())
}

fn parse_files(scanner: &mut Scanner, project: &mut Project) -> Result<(), BuildError> {
    while let Some(tag) = scanner.next_tag()? {
        if tag.closing {
            if tag.name.eq_ignore_ascii_case("files") {
                break;
            }
            continue;
        }
        if !tag.name.eq_ignore_ascii_case("file") {
            continue;
        }
        project.add_entry(FileEntry {
            name:             tag.attr_or_default("name"),
            source_path:      tag.attr_or_default("src"),
            destination_path: tag.attr_or_default("dst"),
            exclude_spec:     tag.attr_or_default("exclude"),
            snippet:          tag.attr_or_default("snippet"),
        });
    }
    Ok(())
}

fn parse_bool(value: &str) -> bool {
    value.eq_ignore_ascii_case("true")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_project() -> Project {
        let mut project = Project::new();
        project.settings.output_file = "setup.exe".into();
        project.settings.caption = "Tools & \"Extras\" <v2>".into();
        project.settings.description = "a > b & c".into();
        project.settings.version_file = "bin\\tool.dll".into();
        project.settings.launch_command = "tool.exe --install".into();
        project.settings.max_volume_mb = 650;
        project.settings.require_admin = true;
        project.settings.append_version = true;
        project.scripts.init = "if a < b { quote(\"x\") }".into();
        project.scripts.finish = "done()".into();
        project.add_entry(FileEntry {
            name:             "readme.txt".into(),
            source_path:      "docs/readme.txt".into(),
            destination_path: String::new(),
            exclude_spec:     String::new(),
            snippet:          String::new(),
        });
        project.add_entry(FileEntry {
            name:             "*".into(),
            source_path:      "payload".into(),
            destination_path: "data".into(),
            exclude_spec:     "*.tmp;*.bak".into(),
            snippet:          "mark(\"<done>\")".into(),
        });
        project
    }

    #[test]
    fn document_round_trip_preserves_everything() {
        let project = sample_project();
        let text = project.to_document();
        let reread = parse(&text).unwrap();
        assert_eq!(reread.settings, project.settings);
        assert_eq!(reread.scripts, project.scripts);
        let original: Vec<_> = project.entries().cloned().collect();
        let parsed: Vec<_> = reread.entries().cloned().collect();
        assert_eq!(parsed, original);
    }

    #[test]
    fn escaping_round_trips_reserved_characters() {
        let raw = "<a href=\"x\">&amp; literal &</a>";
        assert_eq!(unescape(&escape(raw)), raw);
        assert_eq!(escape("<"), "&lt;");
        assert_eq!(escape("\""), "&quot;");
        assert_eq!(unescape("&lt;&gt;&amp;&quot;"), "<>&\"");
    }

    #[test]
    fn empty_destination_survives_round_trip() {
        let mut project = Project::new();
        project.add_entry(FileEntry {
            name: "a.txt".into(),
            source_path: "C:\\proj\\a.txt".into(),
            ..FileEntry::default()
        });
        let reread = parse(&project.to_document()).unwrap();
        assert_eq!(reread.len(), 1);
        assert_eq!(
            reread.entries().next().unwrap().destination_path,
            ""
        );
    }

    #[test]
    fn move_operations_swap_positions() {
        let mut project = Project::new();
        let a = project.add_entry(FileEntry {
            name: "a".into(),
            ..FileEntry::default()
        });
        let b = project.add_entry(FileEntry {
            name: "b".into(),
            ..FileEntry::default()
        });
        let c = project.add_entry(FileEntry {
            name: "c".into(),
            ..FileEntry::default()
        });

        assert!(!project.move_entry(a, MoveDirection::Up));
        assert!(!project.move_entry(c, MoveDirection::Down));
        assert!(project.move_entry(c, MoveDirection::Top));
        let order: Vec<_> = project.entries().map(|e| e.name.clone()).collect();
        assert_eq!(order, ["c", "b", "a"]);
        assert!(project.move_entry(b, MoveDirection::Down));
        let order: Vec<_> = project.entries().map(|e| e.name.clone()).collect();
        assert_eq!(order, ["c", "a", "b"]);
        assert!(!project.move_entry(99, MoveDirection::Up));

        project.remove_entry(a);
        let order: Vec<_> = project.entries().map(|e| e.name.clone()).collect();
        assert_eq!(order, ["c", "b"]);
    }

    #[test]
    fn unknown_settings_are_ignored() {
        let text = "<sfxpack><settings><mystery value=\"1\"/><maxsize value=\"7\"/></settings></sfxpack>";
        let project = parse(text).unwrap();
        assert_eq!(project.settings.max_volume_mb, 7);
        assert_eq!(project.settings.max_volume_bytes(), 7 * 1024 * 1024);
        assert_eq!(PackageSettings::default().max_volume_bytes(), u64::MAX);
    }
}
