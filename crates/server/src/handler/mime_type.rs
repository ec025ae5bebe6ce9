//! Content type lookup by file extension.

use std::path::Path;

use mime::Mime;

/// The content type served for `path`, `application/octet-stream` when unknown.
pub fn for_path(path: &Path) -> Mime {
    let extension = path.extension().and_then(|ext| ext.to_str()).map(str::to_ascii_lowercase);

    match extension.as_deref() {
        Some("html" | "htm") => mime::TEXT_HTML_UTF_8,
        Some("txt") => mime::TEXT_PLAIN_UTF_8,
        Some("css") => mime::TEXT_CSS_UTF_8,
        Some("js" | "mjs") => mime::APPLICATION_JAVASCRIPT_UTF_8,
        Some("json") => mime::APPLICATION_JSON,
        Some("xml") => mime::TEXT_XML,
        Some("csv") => mime::TEXT_CSV_UTF_8,
        Some("png") => mime::IMAGE_PNG,
        Some("jpg" | "jpeg") => mime::IMAGE_JPEG,
        Some("gif") => mime::IMAGE_GIF,
        Some("bmp") => mime::IMAGE_BMP,
        Some("svg") => mime::IMAGE_SVG,
        Some("pdf") => mime::APPLICATION_PDF,
        Some("woff") => mime::FONT_WOFF,
        Some("woff2") => mime::FONT_WOFF2,
        Some(other) => by_name(other).unwrap_or(mime::APPLICATION_OCTET_STREAM),
        None => mime::APPLICATION_OCTET_STREAM,
    }
}

// types without a constant in the mime crate
fn by_name(extension: &str) -> Option<Mime> {
    let name = match extension {
        "ico" => "image/x-icon",
        "webp" => "image/webp",
        "wasm" => "application/wasm",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "zip" => "application/zip",
        "gz" => "application/gzip",
        _ => return None,
    };
    name.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_extensions() {
        assert_eq!(for_path(Path::new("index.html")), mime::TEXT_HTML_UTF_8);
        assert_eq!(for_path(Path::new("LOGO.PNG")), mime::IMAGE_PNG);
        assert_eq!(for_path(Path::new("a/b/app.js")).as_ref(), "application/javascript; charset=utf-8");
        assert_eq!(for_path(Path::new("favicon.ico")).as_ref(), "image/x-icon");
    }

    #[test]
    fn unknown_extensions() {
        assert_eq!(for_path(Path::new("data.bin")), mime::APPLICATION_OCTET_STREAM);
        assert_eq!(for_path(Path::new("Makefile")), mime::APPLICATION_OCTET_STREAM);
    }
}
