//! Expands a matched element's rule into a derivation plan.
//!
//! The resolver is pure planning: given a compiled rule, the element's
//! `src` and (for picture rules) the sibling `<source>` declarations, it
//! produces the ordered list of derivation requests together with the
//! attribute values the rewriter will emit. Nothing here touches pixels
//! or the filesystem; the rewriter drives the engine with the requests
//! afterwards.
//!
//! Candidate order follows the rule's srcset order exactly, and the
//! emitted `srcset` string lists candidates in that same order.

use crate::config::SiteSettings;
use crate::imaging::engine::DerivationRequest;
use crate::paths::{self, PathMapper};
use crate::rules::{
    OpSequence, PictureDefault, ResponsiveDefault, SrcsetEntry, TransformationRule,
};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("image reference `{0}` has no file name")]
    NoFileName(String),

    #[error("rule `{rule}`: no <source> declaration named `{source_name}` in this picture")]
    UnknownSourceName { rule: String, source_name: String },

    #[error("rule `{rule}`: source `{source_name}` has no srcset entry `{descriptor}`")]
    UnknownDescriptor {
        rule: String,
        source_name: String,
        descriptor: String,
    },
}

/// One srcset candidate: the descriptor and URL to emit, plus the
/// request that produces the underlying file.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub descriptor: String,
    pub url: String,
    pub request: DerivationRequest,
}

/// A derivation that backs only the `src` attribute.
#[derive(Debug, Clone)]
pub struct OwnDefault {
    pub url: String,
    pub request: DerivationRequest,
}

/// Where the rewritten `src` comes from.
#[derive(Debug, Clone)]
pub enum DefaultTarget {
    /// Reuse a srcset candidate by index.
    Srcset(usize),
    /// A dedicated derivation.
    Own(OwnDefault),
}

/// Plan for an `<img>` processed by an image or responsive-image rule.
#[derive(Debug, Clone)]
pub struct PlannedImage {
    /// Empty for plain image rules.
    pub srcset: Vec<Candidate>,
    pub default: DefaultTarget,
    pub sizes: Option<String>,
}

/// Plan for one generated `<source>` element.
#[derive(Debug, Clone)]
pub struct PlannedSource {
    pub name: String,
    pub media: Option<String>,
    pub sizes: Option<String>,
    pub srcset: Vec<Candidate>,
}

/// Where a picture plan's `src` comes from.
#[derive(Debug, Clone)]
pub enum PictureDefaultTarget {
    /// `(source index, candidate index)` into the plan's sources.
    Entry(usize, usize),
    Own(OwnDefault),
}

/// Plan for an `<img>` processed by a picture rule.
#[derive(Debug, Clone)]
pub struct PlannedPicture {
    pub sources: Vec<PlannedSource>,
    /// Names of document `<source>` declarations consumed by the plan.
    pub consumed: Vec<String>,
    pub default: Option<PictureDefaultTarget>,
}

#[derive(Debug, Clone)]
pub enum Plan {
    Image(PlannedImage),
    Picture(PlannedPicture),
}

/// The matched element as the rewriter saw it.
#[derive(Debug, Clone, Default)]
pub struct ElementContext {
    /// The `<img>`'s own `src` attribute, decoded.
    pub src: String,
    /// `(class name, src)` of sibling `<source>` declarations, in
    /// document order. Only populated inside `<picture>` subtrees.
    pub picture_sources: Vec<(String, String)>,
}

/// Plans derivations for matched elements.
pub struct Resolver<'a> {
    settings: &'a SiteSettings,
    mapper: &'a PathMapper,
}

impl<'a> Resolver<'a> {
    pub fn new(settings: &'a SiteSettings, mapper: &'a PathMapper) -> Self {
        Resolver { settings, mapper }
    }

    /// Expand `rule` against a matched element.
    pub fn plan(
        &self,
        rule_name: &str,
        rule: &TransformationRule,
        ctx: &ElementContext,
        doc_dir: &Path,
    ) -> Result<Plan, ResolveError> {
        match rule {
            TransformationRule::Image { ops } => {
                let own = self.own_default(rule_name, &ctx.src, doc_dir, None, ops)?;
                Ok(Plan::Image(PlannedImage {
                    srcset: Vec::new(),
                    default: DefaultTarget::Own(own),
                    sizes: None,
                }))
            }
            TransformationRule::ResponsiveImage {
                srcset,
                sizes,
                default,
            } => {
                let candidates =
                    self.candidates(rule_name, &ctx.src, doc_dir, None, srcset)?;
                let default = match default {
                    ResponsiveDefault::Entry(index) => DefaultTarget::Srcset(*index),
                    ResponsiveDefault::Ops(ops) => DefaultTarget::Own(self.own_default(
                        rule_name,
                        &ctx.src,
                        doc_dir,
                        Some("default"),
                        ops,
                    )?),
                };
                Ok(Plan::Image(PlannedImage {
                    srcset: candidates,
                    default,
                    sizes: sizes.clone(),
                }))
            }
            TransformationRule::Picture { sources, default } => {
                self.plan_picture(rule_name, sources, default.as_ref(), ctx, doc_dir)
            }
        }
    }

    fn plan_picture(
        &self,
        rule_name: &str,
        sources: &[crate::rules::PictureSource],
        default: Option<&PictureDefault>,
        ctx: &ElementContext,
        doc_dir: &Path,
    ) -> Result<Plan, ResolveError> {
        let mut planned = Vec::with_capacity(sources.len());
        let mut consumed = Vec::new();
        for source in sources {
            let url = self.source_url(rule_name, &source.name, ctx, &mut consumed)?;
            let candidates = self.candidates(
                rule_name,
                &url,
                doc_dir,
                Some(&source.name),
                &source.srcset,
            )?;
            planned.push(PlannedSource {
                name: source.name.clone(),
                media: source.media.clone(),
                sizes: source.sizes.clone(),
                srcset: candidates,
            });
        }

        let default = match default {
            None => None,
            Some(PictureDefault::Entry(source_index, entry_index)) => {
                // Validated at load time against the rule itself; the
                // indices always land on a planned candidate.
                let source = &sources[*source_index];
                if planned[*source_index].srcset.len() <= *entry_index {
                    return Err(ResolveError::UnknownDescriptor {
                        rule: rule_name.to_string(),
                        source_name: source.name.clone(),
                        descriptor: format!("#{entry_index}"),
                    });
                }
                Some(PictureDefaultTarget::Entry(*source_index, *entry_index))
            }
            Some(PictureDefault::Ops { source, ops }) => {
                let name = &sources[*source].name;
                let url = self.source_url(rule_name, name, ctx, &mut consumed)?;
                let slot = format!("{name}.default");
                let own = self.own_default(rule_name, &url, doc_dir, Some(&slot), ops)?;
                Some(PictureDefaultTarget::Own(own))
            }
        };

        consumed.dedup();
        Ok(Plan::Picture(PlannedPicture {
            sources: planned,
            consumed,
            default,
        }))
    }

    /// URL backing a named picture source. The reserved name `default`
    /// is the img's own src; anything else must match a declared
    /// `<source>` sibling.
    fn source_url(
        &self,
        rule_name: &str,
        name: &str,
        ctx: &ElementContext,
        consumed: &mut Vec<String>,
    ) -> Result<String, ResolveError> {
        if name == "default" {
            return Ok(ctx.src.clone());
        }
        let url = ctx
            .picture_sources
            .iter()
            .find(|(declared, _)| declared == name)
            .map(|(_, url)| url.clone())
            .ok_or_else(|| ResolveError::UnknownSourceName {
                rule: rule_name.to_string(),
                source_name: name.to_string(),
            })?;
        if !consumed.iter().any(|c| c == name) {
            consumed.push(name.to_string());
        }
        Ok(url)
    }

    fn candidates(
        &self,
        rule_name: &str,
        src_url: &str,
        doc_dir: &Path,
        source_name: Option<&str>,
        srcset: &[SrcsetEntry],
    ) -> Result<Vec<Candidate>, ResolveError> {
        srcset
            .iter()
            .map(|entry| {
                let slot = match source_name {
                    Some(name) => format!("{name}.{}", entry.descriptor),
                    None => entry.descriptor.clone(),
                };
                let (url, request) =
                    self.target(rule_name, src_url, doc_dir, Some(&slot), &entry.ops)?;
                Ok(Candidate {
                    descriptor: entry.descriptor.clone(),
                    url,
                    request,
                })
            })
            .collect()
    }

    fn own_default(
        &self,
        rule_name: &str,
        src_url: &str,
        doc_dir: &Path,
        slot: Option<&str>,
        ops: &OpSequence,
    ) -> Result<OwnDefault, ResolveError> {
        let (url, request) = self.target(rule_name, src_url, doc_dir, slot, ops)?;
        Ok(OwnDefault { url, request })
    }

    /// Derivative URL + request for one (source, slot, ops) combination.
    fn target(
        &self,
        rule_name: &str,
        src_url: &str,
        doc_dir: &Path,
        slot: Option<&str>,
        ops: &OpSequence,
    ) -> Result<(String, DerivationRequest), ResolveError> {
        let clean = paths::strip_query_fragment(src_url);
        if clean.is_empty() || clean.ends_with('/') {
            return Err(ResolveError::NoFileName(src_url.to_string()));
        }
        let source = self.mapper.resolve_source(src_url, doc_dir);
        let destination =
            paths::derivative_path(&source, &self.settings.derivative_dir, rule_name, slot);
        let url = paths::derivative_url(clean, &self.settings.derivative_dir, rule_name, slot);
        Ok((
            url,
            DerivationRequest {
                source,
                destination,
                ops: Arc::clone(ops),
            },
        ))
    }
}
