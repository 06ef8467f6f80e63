//! Resource classification for the priority queues
//!
//! A request is queued by what its URL path points at: page documents first,
//! then stylesheets, then scripts, then everything else. The class is derived
//! from the path extension through a read-only MIME table; `/` and
//! extension-less paths count as documents. Page-blocking resources dispatch
//! before dependent assets; this is a heuristic, not an invariant.

use std::collections::HashMap;
use std::sync::LazyLock;

use url::Url;

/// Queue class of a request, in strict dispatch-priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceClass {
    Document,
    Stylesheet,
    Script,
    Other,
}

impl ResourceClass {
    /// All classes in dispatch-priority order.
    pub const ORDERED: [ResourceClass; 4] = [
        ResourceClass::Document,
        ResourceClass::Stylesheet,
        ResourceClass::Script,
        ResourceClass::Other,
    ];

    /// Queue index of this class.
    #[must_use]
    pub fn index(&self) -> usize {
        match self {
            ResourceClass::Document => 0,
            ResourceClass::Stylesheet => 1,
            ResourceClass::Script => 2,
            ResourceClass::Other => 3,
        }
    }
}

/// MIME type keywords that select the three named queues.
const DOCUMENT_TYPE_KEYWORD: &str = "html";
const STYLESHEET_TYPE_KEYWORD: &str = "css";
const SCRIPT_TYPE_KEYWORD: &str = "javascript";

/// Read-only extension-to-MIME table covering the types a page fetch sees.
static MIME_BY_EXTENSION: LazyLock<HashMap<&'static str, &'static str>> = LazyLock::new(|| {
    HashMap::from([
        ("html", "text/html"),
        ("htm", "text/html"),
        ("xhtml", "application/xhtml+xml"),
        ("css", "text/css"),
        ("js", "text/javascript"),
        ("mjs", "text/javascript"),
        ("json", "application/json"),
        ("xml", "application/xml"),
        ("txt", "text/plain"),
        ("csv", "text/csv"),
        ("png", "image/png"),
        ("jpg", "image/jpeg"),
        ("jpeg", "image/jpeg"),
        ("gif", "image/gif"),
        ("svg", "image/svg+xml"),
        ("webp", "image/webp"),
        ("ico", "image/vnd.microsoft.icon"),
        ("woff", "font/woff"),
        ("woff2", "font/woff2"),
        ("ttf", "font/ttf"),
        ("otf", "font/otf"),
        ("mp3", "audio/mpeg"),
        ("mp4", "video/mp4"),
        ("webm", "video/webm"),
        ("pdf", "application/pdf"),
        ("wasm", "application/wasm"),
        ("zip", "application/zip"),
        ("gz", "application/gzip"),
        ("bin", "application/octet-stream"),
    ])
});

/// Classify a request URL into its priority queue.
#[must_use]
pub fn classify(url: &Url) -> ResourceClass {
    let path = url.path();
    if path == "/" {
        return ResourceClass::Document;
    }

    let extension = path
        .rsplit('/')
        .next()
        .and_then(|name| name.rsplit_once('.'))
        .map(|(_, ext)| ext)
        .unwrap_or("");
    if extension.is_empty() {
        // extension-less paths are navigations
        return ResourceClass::Document;
    }

    let Some(mime) = MIME_BY_EXTENSION.get(extension.to_ascii_lowercase().as_str()) else {
        return ResourceClass::Other;
    };
    if mime.contains(DOCUMENT_TYPE_KEYWORD) {
        ResourceClass::Document
    } else if mime.contains(STYLESHEET_TYPE_KEYWORD) {
        ResourceClass::Stylesheet
    } else if mime.contains(SCRIPT_TYPE_KEYWORD) {
        ResourceClass::Script
    } else {
        ResourceClass::Other
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(path: &str) -> Url {
        Url::parse(&format!("https://example.com{path}")).unwrap()
    }

    #[test]
    fn root_is_document() {
        assert_eq!(classify(&url("/")), ResourceClass::Document);
    }

    #[test]
    fn extension_less_path_is_document() {
        assert_eq!(classify(&url("/articles/today")), ResourceClass::Document);
    }

    #[test]
    fn html_and_xhtml_are_documents() {
        assert_eq!(classify(&url("/index.html")), ResourceClass::Document);
        assert_eq!(classify(&url("/page.xhtml")), ResourceClass::Document);
    }

    #[test]
    fn css_is_stylesheet() {
        assert_eq!(classify(&url("/site.css")), ResourceClass::Stylesheet);
    }

    #[test]
    fn scripts_match_javascript_mime() {
        assert_eq!(classify(&url("/app.js")), ResourceClass::Script);
        assert_eq!(classify(&url("/app.mjs")), ResourceClass::Script);
    }

    #[test]
    fn assets_fall_through_to_other() {
        assert_eq!(classify(&url("/logo.png")), ResourceClass::Other);
        assert_eq!(classify(&url("/video.mp4")), ResourceClass::Other);
        assert_eq!(classify(&url("/unknown.xyz")), ResourceClass::Other);
    }

    #[test]
    fn extension_lookup_ignores_case() {
        assert_eq!(classify(&url("/INDEX.HTML")), ResourceClass::Document);
    }

    #[test]
    fn query_does_not_affect_class() {
        assert_eq!(classify(&url("/style.css?v=3")), ResourceClass::Stylesheet);
    }
}
