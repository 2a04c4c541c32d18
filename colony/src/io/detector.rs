//! Pattern-detector effector consumed by the Discover role.
//!
//! Language-specific heuristics live behind [`PatternDetector`]; the built-in
//! implementation scans for a configured vocabulary of legacy tokens and
//! resolves intra-repo references textually. A structural pass may be layered
//! on top by an external implementation; when it cannot parse a file the
//! contract is to degrade to the textual strategy, never to drop the file.

use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use regex::Regex;

use crate::core::types::DetectionSource;

/// Detector output for one candidate file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionReport {
    /// Ordered, deduplicated pattern tags.
    pub patterns_found: Vec<String>,
    pub detection_source: DetectionSource,
    /// Intra-repo references, as file ids drawn from `known_files`.
    pub dependencies: Vec<String>,
}

impl DetectionReport {
    pub fn pattern_count(&self) -> u32 {
        self.patterns_found.len() as u32
    }

    pub fn dep_count(&self) -> u32 {
        self.dependencies.len() as u32
    }
}

/// Best-effort analysis of one file's legacy constructs.
pub trait PatternDetector {
    fn analyze(
        &self,
        file_id: &str,
        content: &str,
        known_files: &BTreeSet<String>,
    ) -> Result<DetectionReport>;
}

/// Token-vocabulary detector.
///
/// Each configured token becomes a pattern tag (non-alphanumerics folded to
/// underscores). Dependencies are other known files whose stem appears in the
/// content as a standalone word; the word patterns are compiled once per stem
/// and cached across the whole Discover pass.
pub struct TextualDetector {
    tokens: Vec<(String, String)>,
    stem_patterns: RefCell<BTreeMap<String, Regex>>,
}

impl TextualDetector {
    pub fn new(tokens: &[String]) -> Self {
        let tokens = tokens
            .iter()
            .filter(|token| !token.trim().is_empty())
            .map(|token| (token.clone(), tag_for(token)))
            .collect();
        Self {
            tokens,
            stem_patterns: RefCell::new(BTreeMap::new()),
        }
    }

    /// Whole-word pattern for one stem, compiled on first use.
    ///
    /// The stem is escaped into a literal, so compilation cannot fail for any
    /// real file name.
    fn stem_matches(&self, stem: &str, content: &str) -> bool {
        let mut cache = self.stem_patterns.borrow_mut();
        let pattern = cache.entry(stem.to_string()).or_insert_with(|| {
            Regex::new(&format!(r"\b{}\b", regex::escape(stem))).expect("stem pattern")
        });
        pattern.is_match(content)
    }
}

fn tag_for(token: &str) -> String {
    let tag: String = token
        .trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    tag.trim_matches('_').to_string()
}

fn stem_of(file_id: &str) -> &str {
    let name = file_id.rsplit('/').next().unwrap_or(file_id);
    name.rsplit_once('.').map_or(name, |(stem, _)| stem)
}

impl PatternDetector for TextualDetector {
    fn analyze(
        &self,
        file_id: &str,
        content: &str,
        known_files: &BTreeSet<String>,
    ) -> Result<DetectionReport> {
        let mut patterns: BTreeSet<String> = BTreeSet::new();
        for (token, tag) in &self.tokens {
            if content.contains(token.as_str()) && !tag.is_empty() {
                patterns.insert(tag.clone());
            }
        }

        let mut dependencies: BTreeSet<String> = BTreeSet::new();
        for other in known_files {
            if other == file_id {
                continue;
            }
            let stem = stem_of(other);
            if stem.is_empty() {
                continue;
            }
            if self.stem_matches(stem, content) {
                dependencies.insert(other.clone());
            }
        }

        Ok(DetectionReport {
            patterns_found: patterns.into_iter().collect(),
            detection_source: DetectionSource::Textual,
            dependencies: dependencies.into_iter().collect(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn detector() -> TextualDetector {
        TextualDetector::new(&[
            "xrange".to_string(),
            "print >>".to_string(),
            "iteritems".to_string(),
        ])
    }

    fn known(ids: &[&str]) -> BTreeSet<String> {
        ids.iter().map(|id| id.to_string()).collect()
    }

    #[test]
    fn finds_configured_tokens() {
        let report = detector()
            .analyze(
                "a.py",
                "for i in xrange(10):\n    print >> sys.stderr, i\n",
                &known(&["a.py"]),
            )
            .expect("analyze");
        assert_eq!(report.patterns_found, vec!["print", "xrange"]);
        assert_eq!(report.detection_source, DetectionSource::Textual);
        assert_eq!(report.pattern_count(), 2);
    }

    #[test]
    fn resolves_dependencies_by_stem() {
        let report = detector()
            .analyze(
                "app.py",
                "import helpers\n\nhelpers.run()\n",
                &known(&["app.py", "helpers.py", "unused.py"]),
            )
            .expect("analyze");
        assert_eq!(report.dependencies, vec!["helpers.py"]);
        assert_eq!(report.dep_count(), 1);
    }

    #[test]
    fn does_not_depend_on_itself() {
        let report = detector()
            .analyze("app.py", "app = build_app()\n", &known(&["app.py"]))
            .expect("analyze");
        assert!(report.dependencies.is_empty());
    }

    #[test]
    fn clean_file_yields_empty_report() {
        let report = detector()
            .analyze("a.py", "print('modern')\n", &known(&["a.py"]))
            .expect("analyze");
        assert!(report.patterns_found.is_empty());
    }

    #[test]
    fn stem_patterns_are_cached_across_candidates() {
        let detector = detector();
        let known = known(&["app.py", "helpers.py", "util.py"]);
        for candidate in ["app.py", "helpers.py", "util.py"] {
            detector
                .analyze(candidate, "import helpers\nimport util\n", &known)
                .expect("analyze");
        }
        // One compiled pattern per distinct stem, not per candidate pass.
        assert_eq!(detector.stem_patterns.borrow().len(), 3);
    }
}
