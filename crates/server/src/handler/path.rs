//! Mapping request paths onto the filesystem.
//!
//! Request paths are percent-decoded once, split into segments and resolved against a
//! root directory. A path whose `..` segments would climb above the root does not
//! resolve at all.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use http::StatusCode;

/// Decodes `%XX` escapes. Fails on malformed escapes, NUL bytes and non UTF-8 results.
pub fn percent_decode(path: &str) -> Option<String> {
    let bytes = path.as_bytes();
    let mut decoded = Vec::with_capacity(bytes.len());

    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3)?;
                let hex = std::str::from_utf8(hex).ok()?;
                let byte = u8::from_str_radix(hex, 16).ok()?;
                decoded.push(byte);
                i += 3;
            }
            byte => {
                decoded.push(byte);
                i += 1;
            }
        }
    }

    if decoded.contains(&0) {
        return None;
    }
    String::from_utf8(decoded).ok()
}

/// Encodes everything but unreserved characters and `/`, for links in generated pages.
pub fn percent_encode(path: &str) -> String {
    let mut encoded = String::with_capacity(path.len());
    for byte in path.bytes() {
        if byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'.' | b'_' | b'~' | b'/') {
            encoded.push(char::from(byte));
        } else {
            encoded.push_str(&format!("%{byte:02X}"));
        }
    }
    encoded
}

/// Segments of `path` after resolving `.` and `..`, or `None` if it escapes the root.
pub fn normalize(path: &str) -> Option<Vec<&str>> {
    let mut segments = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            segment => segments.push(segment),
        }
    }
    Some(segments)
}

/// Joins the normalised `relative` path onto `root`.
pub fn resolve(root: &Path, relative: &str) -> Option<PathBuf> {
    let mut resolved = root.to_path_buf();
    for segment in normalize(relative)? {
        resolved.push(segment);
    }
    Some(resolved)
}

/// Whether the existing `path` stays under `root` once symlinks are followed.
///
/// The last component itself is not followed, so a link inside the root is judged by
/// where it lives rather than where it points.
pub fn is_within(root: &Path, path: &Path) -> bool {
    let Ok(root) = fs::canonicalize(root) else {
        return false;
    };
    let parent = path.parent().unwrap_or(path);
    match fs::canonicalize(parent) {
        Ok(parent) => parent.starts_with(&root),
        Err(_) => false,
    }
}

/// Status for a failed filesystem lookup.
pub fn io_status(e: &io::Error) -> StatusCode {
    match e.kind() {
        io::ErrorKind::NotFound | io::ErrorKind::NotADirectory => StatusCode::NOT_FOUND,
        io::ErrorKind::PermissionDenied => StatusCode::FORBIDDEN,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode() {
        assert_eq!(percent_decode("/a%20b/c").as_deref(), Some("/a b/c"));
        assert_eq!(percent_decode("/%E4%BD%A0").as_deref(), Some("/你"));
        assert_eq!(percent_decode("/plain").as_deref(), Some("/plain"));
        assert_eq!(percent_decode("/bad%2"), None);
        assert_eq!(percent_decode("/bad%zz"), None);
        assert_eq!(percent_decode("/nul%00"), None);
        assert_eq!(percent_decode("/%FF"), None);
    }

    #[test]
    fn encode() {
        assert_eq!(percent_encode("/a b/c.txt"), "/a%20b/c.txt");
        assert_eq!(percent_encode("<x>"), "%3Cx%3E");
    }

    #[test]
    fn normalize_segments() {
        assert_eq!(normalize("/a/./b//c/").unwrap(), vec!["a", "b", "c"]);
        assert_eq!(normalize("/a/../b").unwrap(), vec!["b"]);
        assert_eq!(normalize("/").unwrap(), Vec::<&str>::new());
        assert_eq!(normalize("/../etc/passwd"), None);
        assert_eq!(normalize("/a/../../etc"), None);
    }

    #[test]
    fn resolve_under_root() {
        assert_eq!(resolve(Path::new("/srv"), "/a/../b.txt"), Some(PathBuf::from("/srv/b.txt")));
        assert_eq!(resolve(Path::new("/srv"), "/"), Some(PathBuf::from("/srv")));
        assert_eq!(resolve(Path::new("/srv"), "/.."), None);
    }

    #[test]
    fn within_root() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/file"), b"x").unwrap();

        assert!(is_within(dir.path(), &dir.path().join("sub/file")));
        assert!(!is_within(&dir.path().join("sub"), &dir.path().join("file")));
    }
}
