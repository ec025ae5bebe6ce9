use mime::Mime;

/// The parameters of a part's `content-disposition` header that matter for form uploads.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ContentDisposition {
    pub disposition: String,
    pub name: Option<String>,
    pub filename: Option<String>,
}

impl ContentDisposition {
    /// Parses `form-data; name="field"; filename="a.txt"`.
    ///
    /// Parameter values may be tokens or quoted strings with backslash escapes. Unknown
    /// parameters are skipped. Returns `None` when the disposition type is missing.
    pub fn parse(value: &str) -> Option<Self> {
        let mut params = Params { rest: value };

        let disposition = params.next_item()?.trim().to_ascii_lowercase();
        if disposition.is_empty() {
            return None;
        }

        let mut result = ContentDisposition { disposition, ..Default::default() };
        while let Some((key, value)) = params.next_param() {
            match key.as_str() {
                "name" => result.name = Some(value),
                "filename" => result.filename = Some(value),
                _ => {}
            }
        }
        Some(result)
    }

    pub fn is_file(&self) -> bool {
        self.filename.is_some()
    }
}

struct Params<'a> {
    rest: &'a str,
}

impl Params<'_> {
    /// The text up to the next `;`, outside of any quoted string.
    fn next_item(&mut self) -> Option<&str> {
        if self.rest.is_empty() {
            return None;
        }
        let end = self.rest.find(';').unwrap_or(self.rest.len());
        let item = &self.rest[..end];
        self.rest = self.rest.get(end + 1..).unwrap_or("");
        Some(item)
    }

    fn next_param(&mut self) -> Option<(String, String)> {
        loop {
            self.rest = self.rest.trim_start_matches([' ', '\t', ';']);
            if self.rest.is_empty() {
                return None;
            }

            let Some(eq) = self.rest.find(['=', ';']).filter(|i| self.rest.as_bytes()[*i] == b'=') else {
                // a parameter without value, skip it
                self.next_item();
                continue;
            };

            let key = self.rest[..eq].trim().to_ascii_lowercase();
            self.rest = self.rest[eq + 1..].trim_start();

            let value = if self.rest.starts_with('"') {
                self.quoted()
            } else {
                self.next_item().unwrap_or("").trim().to_string()
            };
            return Some((key, value));
        }
    }

    fn quoted(&mut self) -> String {
        let mut value = String::new();
        let mut chars = self.rest[1..].char_indices();
        let mut end = self.rest.len();

        while let Some((i, c)) = chars.next() {
            match c {
                '\\' => {
                    if let Some((_, escaped)) = chars.next() {
                        value.push(escaped);
                    }
                }
                '"' => {
                    end = i + 2;
                    break;
                }
                c => value.push(c),
            }
        }

        self.rest = &self.rest[end.min(self.rest.len())..];
        // drop anything up to the next separator
        self.next_item();
        value
    }
}

/// Extracts the boundary of a `multipart/form-data` content type.
pub fn boundary_from_content_type(content_type: &str) -> Option<String> {
    let mime: Mime = content_type.parse().ok()?;
    if mime.type_() != mime::MULTIPART || mime.subtype() != mime::FORM_DATA {
        return None;
    }
    mime.get_param(mime::BOUNDARY).map(|b| b.as_str().to_string())
}
