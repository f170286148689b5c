//! Site configuration module.
//!
//! Everything the pipeline needs comes from a single `config.toml` at the
//! site root: global switches plus the named transformation rules.
//! Settings are threaded explicitly into the resolver, engine and
//! rewriter; nothing reads configuration from ambient state.
//!
//! ## Configuration Options
//!
//! ```toml
//! # All global options are optional - defaults shown below
//!
//! derivative_dir = "derivatives"    # Subdirectory for derived images
//! class_prefix = "image-process-"   # Class token prefix that marks elements
//! add_class = true                  # Keep the class token on rewritten elements
//! force = false                     # Re-derive even when destinations are fresh
//! copy_metadata = false             # Copy EXIF/IPTC/XMP tags onto derivatives
//!
//! [rules.thumb]
//! type = "image"
//! ops = ["scale_in 300 300 false"]
//!
//! [rules.article]
//! type = "responsive-image"
//! sizes = "(min-width: 1200px) 800px, 100vw"
//! srcset = [
//!     ["1x", ["scale_in 800 600"]],
//!     ["2x", ["scale_in 1600 1200"]],
//! ]
//! default = "1x"
//!
//! [rules.hero]
//! type = "picture"
//! default = { source = "wide", item = "1x" }
//!
//! [[rules.hero.sources]]
//! name = "wide"
//! media = "(min-width: 640px)"
//! srcset = [["1x", ["scale_in 1200 800"]], ["2x", ["scale_in 2400 1600"]]]
//!
//! [[rules.hero.sources]]
//! name = "narrow"
//! srcset = [["1x", ["crop 10% 0 90% 100%", "scale_in 640 960"]]]
//! ```
//!
//! Config files are sparse — omit anything you don't need. Unknown
//! top-level keys are rejected to catch typos early. Rule tables are
//! validated structurally after parsing (see [`crate::rules`]).

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Site-wide settings loaded from `config.toml`.
///
/// All global fields have defaults; a config file need only carry the
/// rules and the values it overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SiteSettings {
    /// Directory (relative to each source image) receiving derivatives.
    pub derivative_dir: String,
    /// Class token prefix that marks elements for processing.
    pub class_prefix: String,
    /// Keep the classification token on rewritten elements.
    pub add_class: bool,
    /// Re-derive every image even when the destination is fresh.
    pub force: bool,
    /// Copy metadata tags from sources onto derivatives (needs exiftool).
    pub copy_metadata: bool,
    /// Markup parser hint, carried for the document loader.
    pub parser: Option<String>,
    /// Document character encoding, carried for the document loader.
    pub encoding: String,
    /// Named transformation rules, keyed by the class token suffix.
    pub rules: BTreeMap<String, RuleConfig>,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            derivative_dir: "derivatives".to_string(),
            class_prefix: "image-process-".to_string(),
            add_class: true,
            force: false,
            copy_metadata: false,
            parser: None,
            encoding: "utf-8".to_string(),
            rules: BTreeMap::new(),
        }
    }
}

/// One transformation rule as it appears in the config file, before
/// compilation and validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum RuleConfig {
    /// Replace the image with a single transformed copy.
    Image { ops: Vec<String> },
    /// Offer several candidates through `srcset` on the `<img>` itself.
    ResponsiveImage {
        srcset: Vec<SrcsetEntryConfig>,
        #[serde(default)]
        sizes: Option<String>,
        default: ResponsiveDefaultConfig,
    },
    /// Generate `<source>` children inside a `<picture>` wrapper.
    Picture {
        sources: Vec<PictureSourceConfig>,
        #[serde(default)]
        default: Option<PictureDefaultConfig>,
    },
}

/// A `["descriptor", ["op", ...]]` pair from the config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SrcsetEntryConfig(pub String, pub Vec<String>);

/// The fallback `src` of a responsive-image rule: either the descriptor
/// of an existing srcset entry, or a dedicated operation list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResponsiveDefaultConfig {
    Descriptor(String),
    Ops { ops: Vec<String> },
}

/// One `<source>` declaration of a picture rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PictureSourceConfig {
    /// Matches the class of a `<source>` element in the document. The
    /// reserved name `default` designates the `<img>`'s own `src`.
    pub name: String,
    #[serde(default)]
    pub media: Option<String>,
    #[serde(default)]
    pub sizes: Option<String>,
    pub srcset: Vec<SrcsetEntryConfig>,
}

/// The fallback `src` of a picture rule: a source plus either the
/// descriptor of one of its entries (`item`) or a dedicated op list.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PictureDefaultConfig {
    pub source: String,
    #[serde(default)]
    pub item: Option<String>,
    #[serde(default)]
    pub ops: Option<Vec<String>>,
}

/// Load settings from a `config.toml` file.
pub fn load_settings(path: &Path) -> Result<SiteSettings, ConfigError> {
    let content = fs::read_to_string(path)?;
    let settings: SiteSettings = toml::from_str(&content)?;
    Ok(settings)
}

/// Returns a fully-commented stock `config.toml` with all keys and explanations.
///
/// Used by the `gen-config` CLI command.
pub fn stock_config_toml() -> &'static str {
    r##"# image-mill Configuration
# ========================
# Global settings are optional; values shown are the defaults.
# Rules are what make the tool do anything: each [rules.<name>] table
# defines a transformation applied to elements carrying the class
# token "<class_prefix><name>" (by default "image-process-<name>").

# Subdirectory, next to each source image, receiving derived copies.
derivative_dir = "derivatives"

# Class token prefix that marks elements for processing.
class_prefix = "image-process-"

# Keep the classification token on rewritten elements.
# Set to false to strip it from the published markup.
add_class = true

# Re-derive every image even when the destination is up to date.
force = false

# Copy EXIF/IPTC/XMP tags from each source onto its derivatives.
# Requires the exiftool binary on the PATH.
copy_metadata = false

# ---------------------------------------------------------------------------
# Rules
# ---------------------------------------------------------------------------
# Operation vocabulary:
#   crop L T R B            box corners; absolute pixels or percentages
#   resize W H              exact resize, aspect ratio not preserved
#   scale_in W H [upscale]  largest fit inside the box (W or H may be "none")
#   scale_out W H [upscale] smallest cover of the box
#   rotate DEG              counter-clockwise, canvas expanded
#   flip_horizontal / flip_vertical / grayscale
#   blur contour detail edge_enhance edge_enhance_more emboss
#   find_edges sharpen smooth smooth_more

# A plain image rule: the <img> src is pointed at one derived copy.
[rules.thumb]
type = "image"
ops = ["scale_in 300 300 false"]

# A responsive-image rule: the <img> gains a srcset of candidates.
# Descriptors are either all density ("1x") or all width ("800w").
# "default" picks the candidate used for the plain src attribute,
# or defines its own op list: default = { ops = ["..."] }.
[rules.article]
type = "responsive-image"
sizes = "(min-width: 1200px) 800px, 100vw"
srcset = [
    ["1x", ["scale_in 800 600"]],
    ["1.5x", ["scale_in 1200 900"]],
    ["2x", ["scale_in 1600 1200"]],
]
default = "1x"

# A picture rule: <source> elements are generated inside the <picture>
# wrapper. Each source's name matches the class of a declaring <source>
# in the document; the reserved name "default" uses the <img>'s own src.
[rules.hero]
type = "picture"
default = { source = "wide", item = "1x" }

[[rules.hero.sources]]
name = "wide"
media = "(min-width: 640px)"
srcset = [
    ["1x", ["scale_in 1200 800"]],
    ["2x", ["scale_in 2400 1600"]],
]

[[rules.hero.sources]]
name = "narrow"
srcset = [["1x", ["crop 10% 0 90% 100%", "scale_in 640 960"]]]
"##
}
