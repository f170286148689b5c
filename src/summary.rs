//! Build counters reported at the end of a run.

use std::fmt;

/// What a build did, tallied across all documents.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildSummary {
    pub rules_loaded: usize,
    pub documents: u32,
    pub elements_processed: u32,
    pub elements_skipped: u32,
    pub images_derived: u32,
    pub cache_hits: u32,
}

impl BuildSummary {
    pub fn images_total(&self) -> u32 {
        self.images_derived + self.cache_hits
    }
}

impl fmt::Display for BuildSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} rules, {} documents, {} elements rewritten, {} images ({} derived, {} cached)",
            self.rules_loaded,
            self.documents,
            self.elements_processed,
            self.images_total(),
            self.images_derived,
            self.cache_hits,
        )?;
        if self.elements_skipped > 0 {
            write!(f, ", {} elements skipped", self.elements_skipped)?;
        }
        Ok(())
    }
}
