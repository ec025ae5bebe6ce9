//! HTML directory listings.

use std::fs;
use std::io;
use std::path::Path;

use crate::handler::path::percent_encode;

/// Renders the listing of `dir`, served at `request_path` (slash-terminated).
pub fn render(dir: &Path, request_path: &str) -> io::Result<String> {
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let is_dir = entry.file_type()?.is_dir();
        entries.push((is_dir, name));
    }
    // directories first, then by name
    entries.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| a.1.cmp(&b.1)));

    let title = escape_html(request_path);
    let mut page = format!("<!DOCTYPE html>\n<html>\n<head><title>Index of {title}</title></head>\n<body>\n<h1>Index of {title}</h1>\n<hr>\n<ul>\n");

    if request_path != "/" {
        page.push_str("<li><a href=\"../\">../</a></li>\n");
    }

    for (is_dir, name) in entries {
        let suffix = if is_dir { "/" } else { "" };
        let href = percent_encode(&name);
        page.push_str(&format!("<li><a href=\"{href}{suffix}\">{}{suffix}</a></li>\n", escape_html(&name)));
    }

    page.push_str("</ul>\n<hr>\n</body>\n</html>\n");
    Ok(page)
}

fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            c => escaped.push(c),
        }
    }
    escaped
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lists_directories_first() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("b.txt"), "").unwrap();
        fs::write(dir.path().join("a <x>.txt"), "").unwrap();
        fs::create_dir(dir.path().join("zeta")).unwrap();

        let page = render(dir.path(), "/files/").unwrap();

        let zeta = page.find("zeta/").unwrap();
        let a = page.find("a &lt;x&gt;.txt").unwrap();
        let b = page.find(">b.txt<").unwrap();
        assert!(zeta < a && a < b);
        assert!(page.contains("href=\"a%20%3Cx%3E.txt\""));
        assert!(page.contains("<title>Index of /files/</title>"));
        assert!(page.contains("href=\"../\""));
    }

    #[test]
    fn root_has_no_parent_link() {
        let dir = tempfile::tempdir().unwrap();
        let page = render(dir.path(), "/").unwrap();
        assert!(!page.contains("../"));
    }
}
