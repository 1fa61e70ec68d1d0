//! Name handling for logical paths and transfer targets.

use std::path::{Path, PathBuf};

use url::Url;

const SEPARATORS: [char; 2] = ['/', '\\'];

/// A logical path split the way the resolver searches for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogicalPath {
    pub file_name: String,
    /// Extension including the leading dot, empty when there is none.
    pub file_extension: String,
    pub file_name_without_extension: String,
    /// Directory part, without leading or trailing separators.
    pub parent_path: String,
}

impl LogicalPath {
    pub fn parse(path: &str) -> Self {
        let file_name = path
            .rsplit(SEPARATORS)
            .next()
            .unwrap_or_default()
            .to_string();

        let file_extension = match file_name.rfind('.') {
            Some(idx) if idx > 0 => file_name[idx..].to_string(),
            _ => String::new(),
        };

        // Plain replacement: an extension that also appears earlier in the
        // name is removed there too.
        let file_name_without_extension = if file_extension.is_empty() {
            file_name.clone()
        } else {
            file_name.replace(&file_extension, "")
        };

        let parent_path = path
            .strip_suffix(file_name.as_str())
            .unwrap_or(path)
            .trim_end_matches(SEPARATORS)
            .trim_start_matches(SEPARATORS)
            .to_string();

        Self {
            file_name,
            file_extension,
            file_name_without_extension,
            parent_path,
        }
    }

    /// Extension without the dot.
    pub fn extension(&self) -> &str {
        self.file_extension.trim_start_matches('.')
    }
}

pub fn filename_from_url(url_str: &str) -> Option<String> {
    let url = Url::parse(url_str).ok()?;
    url.path_segments()?
        .last()
        .filter(|segment| !segment.is_empty())
        .map(|segment| segment.to_string())
}

pub fn sanitize_filename(filename: &str) -> String {
    filename.replace(
        |c: char| !c.is_alphanumeric() && c != '.' && c != '-' && c != '_' && c != ' ',
        "_",
    )
}

/// `movie.mkv` -> `movie.mkv.part`
pub fn part_path(target: &Path) -> PathBuf {
    let mut name = target
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    target.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_logical_path() {
        let parsed = LogicalPath::parse("Show.S01/Show.S01E01/Show.S01E01.mkv");
        assert_eq!(parsed.file_name, "Show.S01E01.mkv");
        assert_eq!(parsed.file_extension, ".mkv");
        assert_eq!(parsed.extension(), "mkv");
        assert_eq!(parsed.file_name_without_extension, "Show.S01E01");
        assert_eq!(parsed.parent_path, "Show.S01/Show.S01E01");
    }

    #[test]
    fn parses_bare_file_name() {
        let parsed = LogicalPath::parse("/movie.mp4");
        assert_eq!(parsed.file_name, "movie.mp4");
        assert_eq!(parsed.file_name_without_extension, "movie");
        assert_eq!(parsed.parent_path, "");
    }

    #[test]
    fn accepts_backslash_separators() {
        let parsed = LogicalPath::parse("Album\\CD1\\track.flac\\");
        assert_eq!(parsed.file_name, "");
        let parsed = LogicalPath::parse("Album\\CD1\\track.flac");
        assert_eq!(parsed.file_name, "track.flac");
        assert_eq!(parsed.parent_path, "Album\\CD1");
    }

    #[test]
    fn extension_text_repeated_in_name_is_removed_everywhere() {
        // Known edge case: the stem is not path-aware, so ".mkv" inside the
        // name disappears as well.
        let parsed = LogicalPath::parse("dir/clip.mkv.sample.mkv");
        assert_eq!(parsed.file_extension, ".mkv");
        assert_eq!(parsed.file_name_without_extension, "clip.sample");
    }

    #[test]
    fn dotfile_has_no_extension() {
        let parsed = LogicalPath::parse("dir/.hidden");
        assert_eq!(parsed.file_extension, "");
        assert_eq!(parsed.file_name_without_extension, ".hidden");
    }

    #[test]
    fn filename_from_url_takes_last_segment() {
        assert_eq!(
            filename_from_url("https://cdn.example.com/d/abc/Movie.2020.mkv").as_deref(),
            Some("Movie.2020.mkv")
        );
        assert_eq!(filename_from_url("https://cdn.example.com/"), None);
        assert_eq!(filename_from_url("not a url"), None);
    }

    #[test]
    fn part_path_appends_suffix() {
        assert_eq!(
            part_path(Path::new("/data/a/movie.mkv")),
            PathBuf::from("/data/a/movie.mkv.part")
        );
    }

    #[test]
    fn sanitize_replaces_unsafe_chars() {
        assert_eq!(sanitize_filename("a/b:c?.mkv"), "a_b_c_.mkv");
    }
}
