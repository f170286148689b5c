//! # image-mill
//!
//! A build-time image pipeline for static sites. Documents opt images in
//! with a class token (`image-process-<rule>` by default); image-mill
//! derives transformed copies according to per-site rules and rewrites
//! the markup to point at them, as a plain `src`, a responsive
//! `srcset`, or generated `<source>` elements inside a `<picture>`.
//!
//! # Architecture: Plan, Derive, Rewrite
//!
//! A build is a single synchronous pass over the site's HTML documents:
//!
//! ```text
//! 1. Load     config.toml  →  SiteSettings + compiled RuleSet
//! 2. Rewrite  each .html   →  matched elements planned and mutated
//! 3. Derive   each plan    →  image files under <src-dir>/derivatives/
//! ```
//!
//! Rules compile (and fail) entirely at load time, so a build either
//! starts with a valid rule set or not at all. Per-element problems
//! during rewriting (an unknown rule name, a missing image, a crop that
//! resolves to nothing) are logged and skipped without disturbing the
//! rest of the document.
//!
//! Derived images are cached by mtime: a destination at least as new as
//! its source is reused without decoding anything, which makes repeat
//! builds cheap and idempotent.
//!
//! # Module Map
//!
//! | Module | Role |
//! |--------|------|
//! | [`config`] | `config.toml` loading: site settings + raw rule tables |
//! | [`rules`] | Rule compilation and structural validation |
//! | [`imaging`] | Operand grammar, operation compiler, derivation engine |
//! | [`resolver`] | Rule + matched element → ordered derivation plan |
//! | [`rewrite`] | Streaming HTML rewriter with per-element error isolation |
//! | [`paths`] | URL ↔ filesystem mapping, derivative path layout |
//! | [`tags`] | Metadata tag copying onto derivatives (exiftool) |
//! | [`summary`] | Build counters and the end-of-run report line |

pub mod config;
pub mod imaging;
pub mod paths;
pub mod resolver;
pub mod rewrite;
pub mod rules;
pub mod summary;
pub mod tags;

#[cfg(test)]
pub(crate) mod test_helpers;
