//! Streaming HTML rewriter.
//!
//! Documents are run through a quick-xml reader/writer pair: every event
//! that does not belong to a matched element is written back untouched,
//! so the original formatting, comments and doctype survive byte for
//! byte. Only matched `<img>` (and generated/consumed `<source>`) tags
//! are re-serialized with mutated attributes.
//!
//! Elements opt in through a class token: `<class_prefix><rule>`, by
//! default `image-process-<rule>`. `<picture>` subtrees are buffered in
//! memory so a picture rule can see the sibling `<source>` declarations
//! before anything is emitted.
//!
//! Failure policy: anything wrong with a single element (unknown rule,
//! missing declaration, unreadable or degenerate image) is logged with
//! the document and `src` for context, the element is left exactly as it
//! was, and processing continues with the next element.

use crate::config::SiteSettings;
use crate::imaging::engine::{DerivationRequest, Derived, DeriveError, Engine};
use crate::paths::{PathMapper, encode_for_srcset, strip_query_fragment};
use crate::resolver::{
    Candidate, DefaultTarget, ElementContext, Plan, PictureDefaultTarget, ResolveError, Resolver,
};
use crate::rules::{RuleSet, TransformationRule};
use crate::summary::BuildSummary;
use quick_xml::events::attributes::Attribute;
use quick_xml::events::{BytesStart, Event};
use quick_xml::{Reader, Writer};
use std::collections::HashSet;
use std::io::Cursor;
use std::path::Path;
use thiserror::Error;

/// Document-level failures. Per-element failures never surface here.
#[derive(Error, Debug)]
pub enum RewriteError {
    #[error("markup error: {0}")]
    Markup(#[from] quick_xml::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// What happened while rewriting one document.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DocumentReport {
    pub elements_processed: u32,
    pub elements_skipped: u32,
    pub images_derived: u32,
    pub cache_hits: u32,
}

impl DocumentReport {
    pub fn merge_into(&self, summary: &mut BuildSummary) {
        summary.elements_processed += self.elements_processed;
        summary.elements_skipped += self.elements_skipped;
        summary.images_derived += self.images_derived;
        summary.cache_hits += self.cache_hits;
    }
}

#[derive(Error, Debug)]
enum ElementError {
    #[error("no rule named `{0}` is configured")]
    UnknownRule(String),

    #[error("element has no src attribute")]
    MissingSrc,

    #[error("picture rule `{0}` applied outside a <picture> element")]
    NotInPicture(String),

    #[error(transparent)]
    Resolve(#[from] ResolveError),

    #[error(transparent)]
    Derive(#[from] DeriveError),
}

/// How the `class` attribute of a rewritten element changes.
enum ClassAction {
    Keep,
    Set(String),
    Drop,
}

/// Attribute mutations applied to a matched tag. `None` leaves the
/// original attribute (or its absence) alone.
struct AttrEdits {
    src: Option<String>,
    srcset: Option<String>,
    sizes: Option<String>,
    width: Option<String>,
    height: Option<String>,
    class: ClassAction,
}

impl AttrEdits {
    fn class_only(class: ClassAction) -> Self {
        AttrEdits {
            src: None,
            srcset: None,
            sizes: None,
            width: None,
            height: None,
            class,
        }
    }
}

pub struct Rewriter<'a> {
    settings: &'a SiteSettings,
    rules: &'a RuleSet,
    engine: &'a Engine<'a>,
    resolver: Resolver<'a>,
}

impl<'a> Rewriter<'a> {
    pub fn new(
        settings: &'a SiteSettings,
        rules: &'a RuleSet,
        engine: &'a Engine<'a>,
        mapper: &'a PathMapper,
    ) -> Self {
        Rewriter {
            settings,
            rules,
            engine,
            resolver: Resolver::new(settings, mapper),
        }
    }

    /// Rewrite one document, deriving images as needed. Returns the new
    /// markup (identical to the input when nothing matched) and a
    /// per-document report.
    pub fn rewrite_document(
        &self,
        html: &str,
        doc_path: &Path,
    ) -> Result<(String, DocumentReport), RewriteError> {
        let doc_dir = doc_path.parent().unwrap_or_else(|| Path::new(""));
        let mut reader = Reader::from_str(html);
        // HTML void elements have no closing tags.
        reader.config_mut().check_end_names = false;
        let mut writer = Writer::new(Cursor::new(Vec::new()));
        let mut report = DocumentReport::default();

        loop {
            let ev = reader.read_event()?;
            match ev {
                Event::Eof => break,
                Event::Start(ref e) if name_eq(e.name().as_ref(), b"picture") => {
                    let group = buffer_picture(&mut reader, e)?;
                    for out in self.process_picture_group(group, doc_dir, doc_path, &mut report)
                    {
                        writer.write_event(out)?;
                    }
                }
                Event::Start(ref e) if name_eq(e.name().as_ref(), b"img") => {
                    match self.rewrite_img(e, false, &[], doc_dir, doc_path, &mut report) {
                        Some(tag) => writer.write_event(Event::Start(tag))?,
                        None => writer.write_event(ev)?,
                    }
                }
                Event::Empty(ref e) if name_eq(e.name().as_ref(), b"img") => {
                    match self.rewrite_img(e, false, &[], doc_dir, doc_path, &mut report) {
                        Some(tag) => writer.write_event(Event::Empty(tag))?,
                        None => writer.write_event(ev)?,
                    }
                }
                other => writer.write_event(other)?,
            }
        }

        let bytes = writer.into_inner().into_inner();
        Ok((String::from_utf8_lossy(&bytes).into_owned(), report))
    }

    /// Rewrite a single `<img>` tag, or `None` to leave it untouched.
    /// Per-element errors are logged and counted here.
    fn rewrite_img(
        &self,
        e: &BytesStart,
        in_picture: bool,
        picture_sources: &[(String, String)],
        doc_dir: &Path,
        doc_path: &Path,
        report: &mut DocumentReport,
    ) -> Option<BytesStart<'static>> {
        let class_value = attr_value(e, b"class")?;
        let rule_name = matched_token(&class_value, &self.settings.class_prefix)?.to_string();

        match self.rewrite_img_inner(
            e,
            &class_value,
            &rule_name,
            in_picture,
            picture_sources,
            doc_dir,
            report,
        ) {
            Ok(Some(tag)) => {
                report.elements_processed += 1;
                Some(tag)
            }
            Ok(None) => None,
            Err(err) => {
                log_element_error(doc_path, e, &err);
                report.elements_skipped += 1;
                None
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn rewrite_img_inner(
        &self,
        e: &BytesStart,
        class_value: &str,
        rule_name: &str,
        in_picture: bool,
        picture_sources: &[(String, String)],
        doc_dir: &Path,
        report: &mut DocumentReport,
    ) -> Result<Option<BytesStart<'static>>, ElementError> {
        let rule = self
            .rules
            .get(rule_name)
            .ok_or_else(|| ElementError::UnknownRule(rule_name.to_string()))?;

        if matches!(rule, TransformationRule::Picture { .. }) {
            if in_picture {
                // Handled by the picture group pass.
                return Ok(None);
            }
            return Err(ElementError::NotInPicture(rule_name.to_string()));
        }

        if matches!(rule, TransformationRule::ResponsiveImage { .. })
            && attr_value(e, b"srcset").is_some()
        {
            log::debug!("srcset already present, leaving element alone");
            return Ok(None);
        }

        let src = attr_value(e, b"src").ok_or(ElementError::MissingSrc)?;
        if already_derived(&src, &self.settings.derivative_dir, rule_name) {
            log::debug!("src already points at a derivative, leaving element alone");
            return Ok(None);
        }
        let ctx = ElementContext {
            src,
            picture_sources: picture_sources.to_vec(),
        };
        let Plan::Image(plan) = self.resolver.plan(rule_name, rule, &ctx, doc_dir)? else {
            return Ok(None);
        };

        let mut derived = Vec::with_capacity(plan.srcset.len());
        for candidate in &plan.srcset {
            derived.push(self.derive_counted(&candidate.request, report)?);
        }
        let (src_url, dims) = match &plan.default {
            DefaultTarget::Srcset(i) => (
                plan.srcset[*i].url.clone(),
                (derived[*i].width, derived[*i].height),
            ),
            DefaultTarget::Own(own) => {
                let d = self.derive_counted(&own.request, report)?;
                (own.url.clone(), (d.width, d.height))
            }
        };

        let edits = AttrEdits {
            src: Some(src_url),
            srcset: (!plan.srcset.is_empty()).then(|| srcset_value(&plan.srcset)),
            sizes: plan.sizes.clone(),
            width: Some(dims.0.to_string()),
            height: Some(dims.1.to_string()),
            class: self.class_action(class_value, rule_name),
        };
        Ok(Some(rebuild_tag(e, &edits)))
    }

    /// Process a buffered `<picture>` subtree: run the picture rule for
    /// its `<img>` (inserting generated sources, removing consumed
    /// declarations) and then any plain/responsive img rules in place.
    fn process_picture_group(
        &self,
        mut events: Vec<Event<'static>>,
        doc_dir: &Path,
        doc_path: &Path,
        report: &mut DocumentReport,
    ) -> Vec<Event<'static>> {
        // `(index, class tokens, src)` of declaring <source> elements.
        let mut declarations: Vec<(usize, Vec<String>, String)> = Vec::new();
        for (idx, ev) in events.iter().enumerate() {
            if let Event::Start(e) | Event::Empty(e) = ev {
                if name_eq(e.name().as_ref(), b"source") {
                    if let (Some(class), Some(src)) =
                        (attr_value(e, b"class"), attr_value(e, b"src"))
                    {
                        let tokens =
                            class.split_whitespace().map(str::to_string).collect();
                        declarations.push((idx, tokens, src));
                    }
                }
            }
        }

        let picture_img = events.iter().enumerate().find_map(|(idx, ev)| {
            let e = match ev {
                Event::Start(e) | Event::Empty(e) if name_eq(e.name().as_ref(), b"img") => e,
                _ => return None,
            };
            let class_value = attr_value(e, b"class")?;
            let rule_name = matched_token(&class_value, &self.settings.class_prefix)?;
            match self.rules.get(rule_name) {
                Some(TransformationRule::Picture { .. }) => {
                    Some((idx, class_value.clone(), rule_name.to_string()))
                }
                _ => None,
            }
        });

        // A src already under <derivative_dir>/<rule>/ means an earlier
        // run rewrote this picture; there is nothing left to do.
        let already = picture_img.as_ref().is_some_and(|(img_idx, _, rule_name)| {
            match &events[*img_idx] {
                Event::Start(e) | Event::Empty(e) => attr_value(e, b"src").is_some_and(|src| {
                    already_derived(&src, &self.settings.derivative_dir, rule_name)
                }),
                _ => false,
            }
        });

        if let Some((img_idx, class_value, rule_name)) = picture_img.filter(|_| !already) {
            match self.apply_picture_rule(
                &events,
                img_idx,
                &class_value,
                &rule_name,
                &declarations,
                doc_dir,
                report,
            ) {
                Ok((img_tag, new_sources, consumed)) => {
                    report.elements_processed += 1;
                    events = splice_picture(
                        events,
                        img_idx,
                        img_tag,
                        new_sources,
                        &consumed,
                        &declarations,
                    );
                }
                Err(err) => {
                    if let Event::Start(e) | Event::Empty(e) = &events[img_idx] {
                        log_element_error(doc_path, e, &err);
                    }
                    report.elements_skipped += 1;
                }
            }
        }

        // Plain and responsive img rules apply inside pictures too.
        let source_ctx: Vec<(String, String)> = declarations
            .iter()
            .flat_map(|(_, tokens, src)| {
                tokens.iter().map(|t| (t.clone(), src.clone()))
            })
            .collect();
        for idx in 0..events.len() {
            let replacement = match &events[idx] {
                Event::Start(e) if name_eq(e.name().as_ref(), b"img") => self
                    .rewrite_img(e, true, &source_ctx, doc_dir, doc_path, report)
                    .map(Event::Start),
                Event::Empty(e) if name_eq(e.name().as_ref(), b"img") => self
                    .rewrite_img(e, true, &source_ctx, doc_dir, doc_path, report)
                    .map(Event::Empty),
                _ => None,
            };
            if let Some(ev) = replacement {
                events[idx] = ev;
            }
        }

        events
    }

    /// Plan and derive everything for one picture img. Nothing is
    /// mutated until every derivation has succeeded.
    #[allow(clippy::too_many_arguments, clippy::type_complexity)]
    fn apply_picture_rule(
        &self,
        events: &[Event<'static>],
        img_idx: usize,
        class_value: &str,
        rule_name: &str,
        declarations: &[(usize, Vec<String>, String)],
        doc_dir: &Path,
        report: &mut DocumentReport,
    ) -> Result<(BytesStart<'static>, Vec<BytesStart<'static>>, Vec<String>), ElementError> {
        let (Event::Start(img) | Event::Empty(img)) = &events[img_idx] else {
            return Err(ElementError::MissingSrc);
        };
        let rule = self
            .rules
            .get(rule_name)
            .ok_or_else(|| ElementError::UnknownRule(rule_name.to_string()))?;

        let src = attr_value(img, b"src").ok_or(ElementError::MissingSrc)?;
        let ctx = ElementContext {
            src,
            picture_sources: declarations
                .iter()
                .flat_map(|(_, tokens, url)| {
                    tokens.iter().map(|t| (t.clone(), url.clone()))
                })
                .collect(),
        };
        let Plan::Picture(plan) = self.resolver.plan(rule_name, rule, &ctx, doc_dir)? else {
            return Err(ElementError::UnknownRule(rule_name.to_string()));
        };

        let mut derived: Vec<Vec<Derived>> = Vec::with_capacity(plan.sources.len());
        for source in &plan.sources {
            let mut per_source = Vec::with_capacity(source.srcset.len());
            for candidate in &source.srcset {
                per_source.push(self.derive_counted(&candidate.request, report)?);
            }
            derived.push(per_source);
        }
        let default = match &plan.default {
            None => None,
            Some(PictureDefaultTarget::Entry(si, ci)) => Some((
                plan.sources[*si].srcset[*ci].url.clone(),
                (derived[*si][*ci].width, derived[*si][*ci].height),
            )),
            Some(PictureDefaultTarget::Own(own)) => {
                let d = self.derive_counted(&own.request, report)?;
                Some((own.url.clone(), (d.width, d.height)))
            }
        };

        let new_sources = plan
            .sources
            .iter()
            .map(|source| {
                let mut tag = BytesStart::new("source");
                if let Some(media) = &source.media {
                    tag.push_attribute(("media", media.as_str()));
                }
                if let Some(sizes) = &source.sizes {
                    tag.push_attribute(("sizes", sizes.as_str()));
                }
                tag.push_attribute(("srcset", srcset_value(&source.srcset).as_str()));
                tag
            })
            .collect();

        let edits = match default {
            Some((url, (w, h))) => AttrEdits {
                src: Some(url),
                srcset: None,
                sizes: None,
                width: Some(w.to_string()),
                height: Some(h.to_string()),
                class: self.class_action(class_value, rule_name),
            },
            None => AttrEdits::class_only(self.class_action(class_value, rule_name)),
        };
        Ok((rebuild_tag(img, &edits), new_sources, plan.consumed))
    }

    fn derive_counted(
        &self,
        request: &DerivationRequest,
        report: &mut DocumentReport,
    ) -> Result<Derived, ElementError> {
        let derived = self.engine.derive(request)?;
        if derived.cached {
            report.cache_hits += 1;
        } else {
            report.images_derived += 1;
        }
        Ok(derived)
    }

    fn class_action(&self, class_value: &str, rule_name: &str) -> ClassAction {
        if self.settings.add_class {
            return ClassAction::Keep;
        }
        let token = format!("{}{}", self.settings.class_prefix, rule_name);
        let remaining: Vec<&str> = class_value
            .split_whitespace()
            .filter(|t| *t != token)
            .collect();
        if remaining.is_empty() {
            ClassAction::Drop
        } else {
            ClassAction::Set(remaining.join(" "))
        }
    }
}

/// Buffer a `<picture>` subtree, opening tag included, into owned events.
fn buffer_picture(
    reader: &mut Reader<&[u8]>,
    start: &BytesStart,
) -> Result<Vec<Event<'static>>, RewriteError> {
    let mut events = vec![Event::Start(start.clone().into_owned())];
    let mut depth = 1u32;
    loop {
        let ev = reader.read_event()?;
        match &ev {
            Event::Start(e) if name_eq(e.name().as_ref(), b"picture") => depth += 1,
            Event::End(e) if name_eq(e.name().as_ref(), b"picture") => depth -= 1,
            Event::Eof => break,
            _ => {}
        }
        events.push(ev.into_owned());
        if depth == 0 {
            break;
        }
    }
    Ok(events)
}

/// Rebuild the picture buffer: drop consumed declarations (with their
/// leading indentation), insert generated sources before the img, and
/// swap in the rewritten img.
fn splice_picture(
    events: Vec<Event<'static>>,
    img_idx: usize,
    img_tag: BytesStart<'static>,
    new_sources: Vec<BytesStart<'static>>,
    consumed: &[String],
    declarations: &[(usize, Vec<String>, String)],
) -> Vec<Event<'static>> {
    let mut to_remove: HashSet<usize> = HashSet::new();
    for name in consumed {
        for (idx, tokens, _) in declarations {
            if !tokens.iter().any(|t| t == name) {
                continue;
            }
            to_remove.insert(*idx);
            if let Some(Event::End(end)) = events.get(idx + 1) {
                if name_eq(end.name().as_ref(), b"source") {
                    to_remove.insert(idx + 1);
                }
            }
            if *idx > 0 && is_whitespace_text(&events[idx - 1]) {
                to_remove.insert(idx - 1);
            }
        }
    }

    let indent = (img_idx > 0
        && !to_remove.contains(&(img_idx - 1))
        && is_whitespace_text(&events[img_idx - 1]))
    .then(|| events[img_idx - 1].clone());

    let img_was_empty = matches!(events[img_idx], Event::Empty(_));
    let mut out = Vec::with_capacity(events.len() + new_sources.len() * 2);
    for (idx, ev) in events.into_iter().enumerate() {
        if to_remove.contains(&idx) {
            continue;
        }
        if idx == img_idx {
            for tag in &new_sources {
                out.push(Event::Empty(tag.clone()));
                if let Some(indent) = &indent {
                    out.push(indent.clone());
                }
            }
            out.push(if img_was_empty {
                Event::Empty(img_tag.clone())
            } else {
                Event::Start(img_tag.clone())
            });
            continue;
        }
        out.push(ev);
    }
    out
}

fn name_eq(name: &[u8], expected: &[u8]) -> bool {
    name.eq_ignore_ascii_case(expected)
}

/// True when a reference already points into `<derivative_dir>/<rule>/`,
/// meaning an earlier run over this document rewrote the element. Such
/// elements are left alone so reprocessing a rewritten document never
/// derives derivatives of derivatives.
fn already_derived(src: &str, derivative_dir: &str, rule: &str) -> bool {
    let clean = strip_query_fragment(src);
    let mut prev: Option<&str> = None;
    for segment in clean.split('/') {
        if prev == Some(derivative_dir) && segment == rule {
            return true;
        }
        prev = Some(segment);
    }
    false
}

/// Log a skipped element with enough context to find it in the source.
fn log_element_error(doc_path: &Path, e: &BytesStart, err: &ElementError) {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let src = attr_value(e, b"src").unwrap_or_default();
    log::error!(
        "{}: skipping <{name} src=\"{src}\">: {err}",
        doc_path.display()
    );
}

fn is_whitespace_text(ev: &Event<'_>) -> bool {
    match ev {
        Event::Text(t) => t.iter().all(u8::is_ascii_whitespace),
        _ => false,
    }
}

/// Unescaped value of an attribute, matched case-insensitively.
fn attr_value(e: &BytesStart, name: &[u8]) -> Option<String> {
    e.attributes().with_checks(false).flatten().find_map(|attr| {
        if !attr.key.as_ref().eq_ignore_ascii_case(name) {
            return None;
        }
        Some(match attr.unescape_value() {
            Ok(value) => value.into_owned(),
            Err(_) => String::from_utf8_lossy(&attr.value).into_owned(),
        })
    })
}

/// First class token carrying the prefix, with the prefix stripped.
fn matched_token<'s>(class_value: &'s str, prefix: &str) -> Option<&'s str> {
    class_value
        .split_whitespace()
        .find_map(|token| token.strip_prefix(prefix))
}

/// `url descriptor` candidates joined with `, `. URLs are escaped for
/// the srcset grammar (space and comma).
fn srcset_value(candidates: &[Candidate]) -> String {
    candidates
        .iter()
        .map(|c| format!("{} {}", encode_for_srcset(&c.url), c.descriptor))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Re-serialize a tag with edits applied. Untouched attributes keep
/// their order and raw bytes; replaced or appended values are escaped.
fn rebuild_tag(e: &BytesStart, edits: &AttrEdits) -> BytesStart<'static> {
    let name = String::from_utf8_lossy(e.name().as_ref()).into_owned();
    let mut tag = BytesStart::new(name);
    let mut present: HashSet<Vec<u8>> = HashSet::new();

    for attr in e.attributes().with_checks(false).flatten() {
        let key = attr.key.as_ref();
        let lower = key.to_ascii_lowercase();
        let replacement: Option<Option<&str>> = match lower.as_slice() {
            b"src" => edits.src.as_deref().map(Some),
            b"srcset" => edits.srcset.as_deref().map(Some),
            b"sizes" => edits.sizes.as_deref().map(Some),
            b"width" => edits.width.as_deref().map(Some),
            b"height" => edits.height.as_deref().map(Some),
            b"class" => match &edits.class {
                ClassAction::Keep => None,
                ClassAction::Set(v) => Some(Some(v.as_str())),
                ClassAction::Drop => Some(None),
            },
            _ => None,
        };
        present.insert(lower);
        match replacement {
            None => tag.push_attribute(Attribute {
                key: attr.key,
                value: attr.value.clone(),
            }),
            Some(Some(value)) => {
                let key = String::from_utf8_lossy(key).into_owned();
                tag.push_attribute((key.as_str(), value));
            }
            Some(None) => {}
        }
    }

    let mut append = |name: &str, value: &Option<String>| {
        if let Some(value) = value {
            if !present.contains(name.as_bytes()) {
                tag.push_attribute((name, value.as_str()));
            }
        }
    };
    append("src", &edits.src);
    append("srcset", &edits.srcset);
    append("sizes", &edits.sizes);
    append("width", &edits.width);
    append("height", &edits.height);

    tag
}
