//! URL to filesystem mapping and derivative path layout.
//!
//! Documents refer to images by URL; the engine needs filesystem paths.
//! [`PathMapper`] owns that translation: site-absolute references
//! (leading `/`) resolve against the site root, relative ones against
//! the referring document's directory. Query strings, fragments and
//! percent-escapes are stripped/decoded before touching the disk.
//!
//! Derivatives land next to their source, namespaced by rule:
//!
//! ```text
//! <source-dir>/<derivative-dir>/<rule>/<stem>[.<descriptor>].<ext>
//! ```
//!
//! The URL written back into the markup is derived textually from the
//! original reference with the same insertion, so relative references
//! stay relative and absolute ones stay absolute.

use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use std::borrow::Cow;
use std::path::{Path, PathBuf};

/// Characters that must be escaped inside a srcset URL: a space ends
/// the URL and a comma separates candidates.
const SRCSET_ESCAPE: &AsciiSet = &CONTROLS.add(b' ').add(b',');

/// Escape a URL for use inside a `srcset` attribute value.
pub fn encode_for_srcset(url: &str) -> Cow<'_, str> {
    utf8_percent_encode(url, SRCSET_ESCAPE).into()
}

/// Decode percent-escapes in a document URL.
pub fn decode_url(url: &str) -> String {
    percent_decode_str(url).decode_utf8_lossy().into_owned()
}

/// Drop any query string or fragment from a URL.
pub fn strip_query_fragment(url: &str) -> &str {
    match url.find(['?', '#']) {
        Some(pos) => &url[..pos],
        None => url,
    }
}

/// Build the derivative file name: `stem[.descriptor].ext`.
fn derivative_filename(filename: &str, descriptor: Option<&str>) -> String {
    let Some(descriptor) = descriptor else {
        return filename.to_string();
    };
    match filename.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}.{descriptor}.{ext}"),
        None => format!("{filename}.{descriptor}"),
    }
}

/// Filesystem destination for a derivative of `source`.
pub fn derivative_path(
    source: &Path,
    derivative_dir: &str,
    rule: &str,
    descriptor: Option<&str>,
) -> PathBuf {
    let parent = source.parent().unwrap_or_else(|| Path::new(""));
    let filename = source
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    parent
        .join(derivative_dir)
        .join(rule)
        .join(derivative_filename(&filename, descriptor))
}

/// Markup URL for a derivative, built textually from the original
/// reference so its flavor (relative/absolute) is preserved.
pub fn derivative_url(
    src_url: &str,
    derivative_dir: &str,
    rule: &str,
    descriptor: Option<&str>,
) -> String {
    let clean = strip_query_fragment(src_url);
    let (dir, filename) = match clean.rsplit_once('/') {
        Some((dir, file)) => (dir, file),
        None => ("", clean),
    };
    let name = derivative_filename(filename, descriptor);
    if dir.is_empty() && !clean.starts_with('/') {
        format!("{derivative_dir}/{rule}/{name}")
    } else {
        format!("{dir}/{derivative_dir}/{rule}/{name}")
    }
}

/// Translates document URLs into filesystem paths.
#[derive(Debug, Clone)]
pub struct PathMapper {
    site_root: PathBuf,
}

impl PathMapper {
    pub fn new(site_root: impl Into<PathBuf>) -> Self {
        PathMapper {
            site_root: site_root.into(),
        }
    }

    /// Resolve an image reference from a document in `doc_dir`.
    pub fn resolve_source(&self, src_url: &str, doc_dir: &Path) -> PathBuf {
        let decoded = decode_url(strip_query_fragment(src_url));
        match decoded.strip_prefix('/') {
            Some(rest) => self.site_root.join(rest),
            None => doc_dir.join(decoded),
        }
    }
}
