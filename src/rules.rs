//! Compiled transformation rules.
//!
//! [`RuleSet::from_config`] turns the raw [`RuleConfig`] tables into
//! compiled rules: every op string goes through the operation compiler
//! and every structural invariant is checked, so a bad config fails the
//! build before any document is touched. Errors name the offending rule.
//!
//! Invariants enforced here:
//! - srcset lists are non-empty and every descriptor is `Nx` or `Nw`;
//! - one srcset never mixes density (`x`) and width (`w`) descriptors;
//! - a responsive default given as a descriptor names an existing entry;
//! - a picture default names a declared source, and its `item` names an
//!   entry of that source's srcset;
//! - a picture default carries exactly one of `item` / `ops`.

use crate::config::{
    PictureDefaultConfig, PictureSourceConfig, ResponsiveDefaultConfig, RuleConfig,
    SrcsetEntryConfig,
};
use crate::imaging::ops::{self, CompileError, Op, OpSpec};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

/// Compiled operation sequence, shared across derivation requests.
pub type OpSequence = Arc<[Op]>;

#[derive(Error, Debug)]
pub enum RuleError {
    #[error("rule `{rule}`: {source}")]
    Compile {
        rule: String,
        #[source]
        source: CompileError,
    },

    #[error("rule `{rule}`: srcset is empty")]
    EmptySrcset { rule: String },

    #[error("rule `{rule}`: descriptor `{descriptor}` is not of the form `<number>x` or `<number>w`")]
    BadDescriptor { rule: String, descriptor: String },

    #[error("rule `{rule}`: srcset mixes density (`x`) and width (`w`) descriptors")]
    MixedDescriptors { rule: String },

    #[error("rule `{rule}`: duplicate descriptor `{descriptor}`")]
    DuplicateDescriptor { rule: String, descriptor: String },

    #[error("rule `{rule}`: default `{descriptor}` does not name a srcset entry")]
    DanglingDefault { rule: String, descriptor: String },

    #[error("rule `{rule}`: default names undeclared source `{source_name}`")]
    DanglingDefaultSource { rule: String, source_name: String },

    #[error("rule `{rule}`: picture rule declares no sources")]
    NoSources { rule: String },

    #[error("rule `{rule}`: duplicate source name `{source_name}`")]
    DuplicateSource { rule: String, source_name: String },

    #[error("rule `{rule}`: picture default needs exactly one of `item` or `ops`")]
    AmbiguousDefault { rule: String },
}

/// Suffix class of a srcset descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DescriptorClass {
    /// `1x`, `1.5x`, ...
    Density,
    /// `480w`, `800w`, ...
    Width,
}

/// Classify a descriptor, or `None` if it is malformed.
pub fn descriptor_class(descriptor: &str) -> Option<DescriptorClass> {
    let (number, class) = match descriptor.strip_suffix('x') {
        Some(n) => (n, DescriptorClass::Density),
        None => (descriptor.strip_suffix('w')?, DescriptorClass::Width),
    };
    let valid = match class {
        DescriptorClass::Density => number.parse::<f64>().is_ok_and(|v| v > 0.0),
        DescriptorClass::Width => number.parse::<u32>().is_ok_and(|v| v > 0),
    };
    valid.then_some(class)
}

/// One candidate of a srcset: its descriptor plus the ops producing it.
#[derive(Debug, Clone)]
pub struct SrcsetEntry {
    pub descriptor: String,
    pub ops: OpSequence,
}

/// Fallback `src` of a responsive-image rule.
#[derive(Debug, Clone)]
pub enum ResponsiveDefault {
    /// Index into the rule's srcset.
    Entry(usize),
    /// Dedicated op sequence.
    Ops(OpSequence),
}

/// One `<source>` declaration of a compiled picture rule.
#[derive(Debug, Clone)]
pub struct PictureSource {
    pub name: String,
    pub media: Option<String>,
    pub sizes: Option<String>,
    pub srcset: Vec<SrcsetEntry>,
}

/// Fallback `src` of a picture rule.
#[derive(Debug, Clone)]
pub enum PictureDefault {
    /// `(source index, srcset entry index)` into the rule's sources.
    Entry(usize, usize),
    /// Dedicated op sequence applied to the named source's image.
    Ops { source: usize, ops: OpSequence },
}

/// A compiled, validated transformation rule.
#[derive(Debug, Clone)]
pub enum TransformationRule {
    Image {
        ops: OpSequence,
    },
    ResponsiveImage {
        srcset: Vec<SrcsetEntry>,
        sizes: Option<String>,
        default: ResponsiveDefault,
    },
    Picture {
        sources: Vec<PictureSource>,
        default: Option<PictureDefault>,
    },
}

/// All compiled rules of a site, keyed by class token suffix.
#[derive(Debug, Default, Clone)]
pub struct RuleSet {
    rules: BTreeMap<String, TransformationRule>,
}

impl RuleSet {
    /// Compile and validate every rule table from the config.
    pub fn from_config(configs: &BTreeMap<String, RuleConfig>) -> Result<Self, RuleError> {
        let mut rules = BTreeMap::new();
        for (name, config) in configs {
            rules.insert(name.clone(), compile_rule(name, config)?);
        }
        Ok(RuleSet { rules })
    }

    pub fn get(&self, name: &str) -> Option<&TransformationRule> {
        self.rules.get(name)
    }

    /// Register a rule built programmatically (e.g. with custom ops).
    /// The caller is responsible for its internal consistency.
    pub fn insert(&mut self, name: impl Into<String>, rule: TransformationRule) {
        self.rules.insert(name.into(), rule);
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

fn compile_rule(name: &str, config: &RuleConfig) -> Result<TransformationRule, RuleError> {
    match config {
        RuleConfig::Image { ops } => Ok(TransformationRule::Image {
            ops: compile_ops(name, ops)?,
        }),
        RuleConfig::ResponsiveImage {
            srcset,
            sizes,
            default,
        } => {
            let srcset = compile_srcset(name, srcset)?;
            let default = match default {
                ResponsiveDefaultConfig::Descriptor(descriptor) => {
                    let index = srcset
                        .iter()
                        .position(|entry| entry.descriptor == *descriptor)
                        .ok_or_else(|| RuleError::DanglingDefault {
                            rule: name.to_string(),
                            descriptor: descriptor.clone(),
                        })?;
                    ResponsiveDefault::Entry(index)
                }
                ResponsiveDefaultConfig::Ops { ops } => {
                    ResponsiveDefault::Ops(compile_ops(name, ops)?)
                }
            };
            Ok(TransformationRule::ResponsiveImage {
                srcset,
                sizes: sizes.clone(),
                default,
            })
        }
        RuleConfig::Picture { sources, default } => {
            let sources = compile_sources(name, sources)?;
            let default = default
                .as_ref()
                .map(|d| compile_picture_default(name, d, &sources))
                .transpose()?;
            Ok(TransformationRule::Picture { sources, default })
        }
    }
}

fn compile_ops(rule: &str, specs: &[String]) -> Result<OpSequence, RuleError> {
    let specs: Vec<OpSpec> = specs.iter().map(|s| OpSpec::from(s.clone())).collect();
    ops::compile(&specs)
        .map(Into::into)
        .map_err(|source| RuleError::Compile {
            rule: rule.to_string(),
            source,
        })
}

fn compile_srcset(
    rule: &str,
    entries: &[SrcsetEntryConfig],
) -> Result<Vec<SrcsetEntry>, RuleError> {
    if entries.is_empty() {
        return Err(RuleError::EmptySrcset {
            rule: rule.to_string(),
        });
    }
    let mut srcset = Vec::with_capacity(entries.len());
    let mut class: Option<DescriptorClass> = None;
    for SrcsetEntryConfig(descriptor, specs) in entries {
        let this_class =
            descriptor_class(descriptor).ok_or_else(|| RuleError::BadDescriptor {
                rule: rule.to_string(),
                descriptor: descriptor.clone(),
            })?;
        match class {
            None => class = Some(this_class),
            Some(seen) if seen != this_class => {
                return Err(RuleError::MixedDescriptors {
                    rule: rule.to_string(),
                });
            }
            Some(_) => {}
        }
        if srcset
            .iter()
            .any(|e: &SrcsetEntry| e.descriptor == *descriptor)
        {
            return Err(RuleError::DuplicateDescriptor {
                rule: rule.to_string(),
                descriptor: descriptor.clone(),
            });
        }
        srcset.push(SrcsetEntry {
            descriptor: descriptor.clone(),
            ops: compile_ops(rule, specs)?,
        });
    }
    Ok(srcset)
}

fn compile_sources(
    rule: &str,
    configs: &[PictureSourceConfig],
) -> Result<Vec<PictureSource>, RuleError> {
    if configs.is_empty() {
        return Err(RuleError::NoSources {
            rule: rule.to_string(),
        });
    }
    let mut sources: Vec<PictureSource> = Vec::with_capacity(configs.len());
    for config in configs {
        if sources.iter().any(|s| s.name == config.name) {
            return Err(RuleError::DuplicateSource {
                rule: rule.to_string(),
                source_name: config.name.clone(),
            });
        }
        sources.push(PictureSource {
            name: config.name.clone(),
            media: config.media.clone(),
            sizes: config.sizes.clone(),
            srcset: compile_srcset(rule, &config.srcset)?,
        });
    }
    Ok(sources)
}

fn compile_picture_default(
    rule: &str,
    config: &PictureDefaultConfig,
    sources: &[PictureSource],
) -> Result<PictureDefault, RuleError> {
    let source = sources
        .iter()
        .position(|s| s.name == config.source)
        .ok_or_else(|| RuleError::DanglingDefaultSource {
            rule: rule.to_string(),
            source_name: config.source.clone(),
        })?;
    match (&config.item, &config.ops) {
        (Some(item), None) => {
            let entry = sources[source]
                .srcset
                .iter()
                .position(|e| e.descriptor == *item)
                .ok_or_else(|| RuleError::DanglingDefault {
                    rule: rule.to_string(),
                    descriptor: item.clone(),
                })?;
            Ok(PictureDefault::Entry(source, entry))
        }
        (None, Some(ops)) => Ok(PictureDefault::Ops {
            source,
            ops: compile_ops(rule, ops)?,
        }),
        _ => Err(RuleError::AmbiguousDefault {
            rule: rule.to_string(),
        }),
    }
}
