//! File-access selectors and the extension → MIME fallback table.

/// Extension to MIME type fallback, consulted when the system registry
/// doesn't know an extension. Deliberately small — only the types a
/// workflow resource is realistically asked to select by.
const FALLBACK_MIME_TABLE: &[(&str, &str)] = &[
    ("txt", "text/plain"),
    ("md", "text/markdown"),
    ("json", "application/json"),
    ("csv", "text/csv"),
    ("html", "text/html"),
    ("htm", "text/html"),
    ("xml", "application/xml"),
    ("pdf", "application/pdf"),
    ("png", "image/png"),
    ("jpg", "image/jpeg"),
    ("jpeg", "image/jpeg"),
    ("gif", "image/gif"),
    ("webp", "image/webp"),
    ("svg", "image/svg+xml"),
    ("mp3", "audio/mpeg"),
    ("wav", "audio/wav"),
    ("mp4", "video/mp4"),
    ("webm", "video/webm"),
];

/// Best-effort MIME detection by extension. Returns `None` for unknown
/// extensions, which excludes the file from MIME-filtered selection.
pub fn detect_mime(path: &str) -> Option<&'static str> {
    let ext = path.rsplit('.').next()?.to_ascii_lowercase();
    FALLBACK_MIME_TABLE
        .iter()
        .find(|(e, _)| *e == ext)
        .map(|(_, mime)| *mime)
}

/// Returns whether `candidate` matches a `type/subtype` MIME pattern, where
/// either half may be `*`.
pub fn mime_matches(pattern: &str, candidate: &str) -> bool {
    let (p_type, p_sub) = split_mime(pattern);
    let (c_type, c_sub) = split_mime(candidate);
    (p_type == "*" || p_type == c_type) && (p_sub == "*" || p_sub == c_sub)
}

fn split_mime(mime: &str) -> (&str, &str) {
    match mime.split_once('/') {
        Some((t, s)) => (t, s),
        None => (mime, "*"),
    }
}

/// A file-selection chain parsed from trailing selector strings, e.g.
/// `["mime:image/*", "first"]`.
#[derive(Clone, Debug, Default)]
pub struct SelectorChain {
    pub mime_filter: Option<String>,
    pub pick: Pick,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Pick {
    #[default]
    All,
    First,
    Last,
    Count,
}

impl SelectorChain {
    pub fn parse(selectors: &[String]) -> Self {
        let mut chain = SelectorChain::default();
        for selector in selectors {
            if let Some(mime) = selector.strip_prefix("mime:") {
                chain.mime_filter = Some(mime.to_string());
                continue;
            }
            chain.pick = match selector.as_str() {
                "first" => Pick::First,
                "last" => Pick::Last,
                "count" => Pick::Count,
                "all" => Pick::All,
                _ => chain.pick,
            };
        }
        chain
    }

    /// Applies the selector chain to a set of glob matches, given a mime
    /// classifier for each path. Empty mime-filtered results yield an error
    /// for `first`/`last`, `0` for `count` and an empty sequence for `all`.
    pub fn apply(&self, mut paths: Vec<String>) -> SelectorResult {
        if let Some(pattern) = &self.mime_filter {
            paths.retain(|p| detect_mime(p).map(|m| mime_matches(pattern, m)).unwrap_or(false));
        }
        match self.pick {
            Pick::First => paths.first().cloned().map(SelectorResult::One).unwrap_or(SelectorResult::Empty),
            Pick::Last => paths.last().cloned().map(SelectorResult::One).unwrap_or(SelectorResult::Empty),
            Pick::Count => SelectorResult::Count(paths.len()),
            Pick::All => SelectorResult::Many(paths),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SelectorResult {
    One(String),
    Many(Vec<String>),
    Count(usize),
    Empty,
}
