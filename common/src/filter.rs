//! Rule-based path filtering for manifest entries and source scans
//!
//! A filter is built from a list of textual rules. Each rule either selects a directory subtree
//! or attaches a filename regex to one specific directory.
//!
//! # Rule Syntax
//!
//! - `+ <dir>/` includes the subtree rooted at `<dir>`
//! - `- <dir>/` excludes the subtree rooted at `<dir>`
//! - `+ <dir>/ <regex>` includes files directly inside `<dir>` whose name matches `<regex>`
//! - `- <dir>/ <regex>` excludes files directly inside `<dir>` whose name matches `<regex>`
//!
//! The directory `/` is the root and matches every path. The nearest enclosing directory rule
//! decides whether a directory is included; file rules refine that decision for the files of one
//! directory, with exclude rules applied after include rules.
//!
//! # Examples
//!
//! ```
//! use common::filter::PathFilter;
//!
//! let filter = PathFilter::new(["- /", "+ A/B/", "+ C/ .*\\.fastq\\.gz"]).unwrap();
//! assert!(!filter.is_dir_included("A"));
//! assert!(filter.is_dir_included("A/B/C"));
//! assert!(filter.is_file_included("C/x.fastq.gz"));
//! assert!(!filter.is_file_included("C/x.txt"));
//! ```

use anyhow::Context;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

/// Directory used for rules and paths without a directory component
const ROOT: &str = "/";

/// Configuration error raised while building a filter
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid filter rule '{0}': expected '<+|-> <dir>/' or '<+|-> <dir>/ <regex>'")]
    Syntax(String),
    #[error("invalid filter rule '{0}': the sign must be '+' or '-'")]
    Sign(String),
    #[error("invalid filter rule '{0}': directory must end in '/'")]
    TrailingSlash(String),
    #[error("invalid filter rule '{rule}': bad regex")]
    Regex {
        rule: String,
        #[source]
        source: regex::Error,
    },
}

#[derive(Debug, Clone)]
struct DirRule {
    include: bool,
    dir: String,
}

#[derive(Debug, Clone)]
struct FileRule {
    original: String,
    regex: regex::Regex,
}

/// Compiled set of directory and file rules
#[derive(Debug, Clone, Default)]
pub struct PathFilter {
    dir_rules: Vec<DirRule>,
    file_includes: HashMap<String, Vec<FileRule>>,
    file_excludes: HashMap<String, Vec<FileRule>>,
}

/// Lexically normalize a '/' separated path: drop empty and `.` components, resolve `..`.
/// Leading `/` is kept. An empty relative result becomes `.`.
pub fn normalize(path: &str) -> String {
    let absolute = path.starts_with('/');
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                if parts.last().is_some_and(|last| *last != "..") {
                    parts.pop();
                } else if !absolute {
                    parts.push("..");
                }
            }
            _ => parts.push(part),
        }
    }
    let joined = parts.join("/");
    match (absolute, joined.is_empty()) {
        (true, _) => format!("/{}", joined),
        (false, true) => ".".to_string(),
        (false, false) => joined,
    }
}

/// Number of non-empty components, so that `/` is 0 and `/A/` is 1
fn depth(path: &str) -> usize {
    path.split('/').filter(|part| !part.is_empty()).count()
}

/// Score of `rule_dir` as an ancestor of `candidate`, lower is nearer, `None` when unrelated
fn ancestor_score(candidate: &str, rule_dir: &str) -> Option<usize> {
    let candidate = normalize(candidate);
    if candidate == rule_dir {
        return Some(0);
    }
    if candidate.starts_with(&format!("{}/", rule_dir)) {
        return Some(depth(&candidate) - depth(rule_dir));
    }
    if rule_dir == ROOT {
        return Some(depth(&candidate));
    }
    None
}

fn rule_dir(dir: &str) -> String {
    let dir = normalize(dir);
    if dir == "." { ROOT.to_string() } else { dir }
}

impl PathFilter {
    /// Build a filter from rule definitions, failing on the first malformed rule
    pub fn new<I, S>(rules: I) -> Result<Self, Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut filter = Self::default();
        for rule in rules {
            filter.add_rule(rule.as_ref())?;
        }
        Ok(filter)
    }

    fn add_rule(&mut self, rule: &str) -> Result<(), Error> {
        let parts: Vec<&str> = rule.split(' ').collect();
        if parts.len() != 2 && parts.len() != 3 {
            return Err(Error::Syntax(rule.to_string()));
        }
        let include = match parts[0] {
            "+" => true,
            "-" => false,
            _ => return Err(Error::Sign(rule.to_string())),
        };
        let Some(dir) = parts[1].strip_suffix('/') else {
            return Err(Error::TrailingSlash(rule.to_string()));
        };
        let dir = rule_dir(dir);
        if parts.len() == 2 {
            self.dir_rules.push(DirRule { include, dir });
            return Ok(());
        }
        let regex = regex::RegexBuilder::new(&format!("^(?:{})", parts[2]))
            .case_insensitive(true)
            .build()
            .map_err(|source| Error::Regex {
                rule: rule.to_string(),
                source,
            })?;
        let file_rule = FileRule {
            original: rule.to_string(),
            regex,
        };
        let rules = if include {
            &mut self.file_includes
        } else {
            &mut self.file_excludes
        };
        rules.entry(dir).or_default().push(file_rule);
        Ok(())
    }

    /// Load rules from a YAML document with a top-level `filter:` list
    ///
    /// # File Format
    /// ```text
    /// filter:
    ///   - "+ /"
    ///   - "- Data/Intensities/BaseCalls/"
    ///   - "+ Data/Intensities/BaseCalls/ .*\.fastq\.gz"
    /// ```
    pub fn from_yaml(content: &str) -> Result<Self, anyhow::Error> {
        #[derive(Deserialize)]
        struct FilterFile {
            #[serde(default)]
            filter: Vec<String>,
        }
        let file: FilterFile =
            serde_yaml::from_str(content).context("failed to parse filter document")?;
        Ok(Self::new(file.filter)?)
    }

    /// Read and parse a YAML filter file
    pub fn from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read filter file: {:?}", path))?;
        Self::from_yaml(&content).with_context(|| format!("invalid filter file: {:?}", path))
    }

    /// Check if this filter has any rules
    pub fn is_empty(&self) -> bool {
        self.dir_rules.is_empty() && self.file_includes.is_empty() && self.file_excludes.is_empty()
    }

    fn nearest_dir_rule(&self, path: &str) -> Option<&DirRule> {
        // earliest declared rule wins among equal scores
        self.dir_rules
            .iter()
            .enumerate()
            .filter_map(|(idx, rule)| {
                ancestor_score(path, &rule.dir).map(|score| (score, idx, rule))
            })
            .min_by_key(|(score, idx, _)| (*score, *idx))
            .map(|(_, _, rule)| rule)
    }

    /// Decide whether the directory at `path` should be traversed
    pub fn is_dir_included(&self, path: &str) -> bool {
        self.nearest_dir_rule(path)
            .map(|rule| rule.include)
            .unwrap_or(true)
    }

    /// Check if a scan still has to descend into the directory at `path`: either the directory
    /// is included, or some include rule targets it or a directory beneath it.
    pub fn could_contain_included(&self, path: &str) -> bool {
        if self.is_dir_included(path) {
            return true;
        }
        let dir = rule_dir(path);
        let beneath = |candidate: &str| {
            candidate == dir
                || dir == ROOT
                || candidate.starts_with(&format!("{}/", dir))
        };
        self.dir_rules
            .iter()
            .any(|rule| rule.include && beneath(&rule.dir))
            || self.file_includes.keys().any(|rule_dir| beneath(rule_dir))
    }

    /// Decide whether the file at `path` participates
    pub fn is_file_included(&self, path: &str) -> bool {
        let (dir, file_name) = match path.rsplit_once('/') {
            Some(("", name)) => (ROOT.to_string(), name),
            Some((dir, name)) => (normalize(dir), name),
            None => (ROOT.to_string(), path),
        };
        if file_name.is_empty() {
            tracing::warn!("path '{}' doesn't contain a filename", path);
            return false;
        }
        let mut include = self.is_dir_included(&dir);
        let mut matches = 0;
        for rule in self.file_includes.get(&dir).into_iter().flatten() {
            if rule.regex.is_match(file_name) {
                tracing::trace!("'{}' matched '{}'", path, rule.original);
                matches += 1;
                include = true;
            }
        }
        for rule in self.file_excludes.get(&dir).into_iter().flatten() {
            if rule.regex.is_match(file_name) {
                tracing::trace!("'{}' matched '{}'", path, rule.original);
                matches += 1;
                include = false;
            }
        }
        if matches > 1 {
            tracing::warn!("multiple filter rules match path: '{}'", path);
        }
        include
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn filter(rules: &[&str]) -> PathFilter {
        PathFilter::new(rules).unwrap()
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("A/B"), "A/B");
        assert_eq!(normalize("A/./B/"), "A/B");
        assert_eq!(normalize("A/C/../B"), "A/B");
        assert_eq!(normalize("/A//B"), "/A/B");
        assert_eq!(normalize("/"), "/");
        assert_eq!(normalize(""), ".");
        assert_eq!(normalize("../A"), "../A");
    }
    #[test]
    fn test_no_rules() {
        let pf = filter(&[]);
        assert!(pf.is_empty());
        assert!(pf.is_file_included("path/to/file.txt"));
        assert!(pf.is_dir_included("path/to/somewhere"));
    }
    #[test]
    fn test_all_excluded() {
        let pf = filter(&["- /"]);
        assert!(!pf.is_file_included("path/to/file.txt"));
        assert!(!pf.is_dir_included("path/to/somewhere"));
    }
    #[test]
    fn test_all_included() {
        let pf = filter(&["+ /"]);
        assert!(pf.is_file_included("path/to/file.txt"));
        assert!(pf.is_file_included("file.txt"));
        assert!(pf.is_dir_included("path/to/somewhere"));
    }
    #[test]
    fn test_exclude_subtree() {
        let pf = filter(&["+ /", "- path/to/"]);
        assert!(!pf.is_file_included("path/to/file.txt"));
        assert!(!pf.is_dir_included("path/to/somewhere"));
        assert!(pf.is_dir_included("path"));
    }
    #[test]
    fn test_nearest_directory_rule_wins() {
        let pf = filter(&["- /", "+ A/B/"]);
        assert!(pf.is_dir_included("A/B"));
        assert!(pf.is_dir_included("A/B/C"));
        assert!(!pf.is_dir_included("A"));
        // sibling with a shared name prefix is not a descendant
        assert!(!pf.is_dir_included("A/BC"));
    }
    #[test]
    fn test_file_rules_refine_directory() {
        let pf = filter(&[
            "- /",
            "+ A/A2/A3/ .*\\.in",
            "- A/A2/A3/ .*\\.ex",
            "+ B/",
            "- B/B2/",
        ]);
        assert!(!pf.is_file_included("file.txt"));
        assert!(!pf.is_file_included("A/file.txt"));
        assert!(!pf.is_file_included("A/A2/A3/file.txt"));
        assert!(pf.is_file_included("A/A2/A3/file.in"));
        assert!(!pf.is_file_included("A/A2/A3/file.ex"));
        assert!(pf.is_file_included("B/file.txt"));
        assert!(pf.is_file_included("B/X/file.txt"));
        assert!(!pf.is_file_included("B/B2/file.txt"));
        assert!(!pf.is_file_included("BV/A/file.txt"));
    }
    #[test]
    fn test_file_rules_refine_directory_inverted() {
        let pf = filter(&[
            "+ /",
            "- A/A2/A3/ .*\\.in",
            "+ A/A2/A3/ .*\\.ex",
            "- B/",
            "+ B/B2/",
        ]);
        assert!(pf.is_file_included("file.txt"));
        assert!(pf.is_file_included("A/A2/A3/file.txt"));
        assert!(!pf.is_file_included("A/A2/A3/file.in"));
        assert!(pf.is_file_included("A/A2/A3/file.ex"));
        assert!(!pf.is_file_included("B/file.txt"));
        assert!(!pf.is_file_included("B/X/file.txt"));
        assert!(!pf.is_file_included("B/B2A/file.txt"));
        assert!(pf.is_file_included("B/B2/file.txt"));
    }
    #[test]
    fn test_file_rule_in_excluded_directory() {
        let pf = filter(&["- /", "- A/A2/A3/", "+ A/A2/A3/ .*\\.in"]);
        assert!(!pf.is_file_included("A/A2/A3/file.txt"));
        assert!(pf.is_file_included("A/A2/A3/file.in"));
    }
    #[test]
    fn test_root_file_rules() {
        let pf = filter(&["- /", "+ / .*\\.in"]);
        assert!(pf.is_file_included("file.in"));
        assert!(!pf.is_file_included("file.txt"));
        // file rules only apply to their own directory
        assert!(!pf.is_file_included("sub/file.in"));
    }
    #[test]
    fn test_absolute_paths_are_distinct_from_relative() {
        let pf = filter(&["- /", "+ /A/"]);
        assert!(!pf.is_file_included("A/file.txt"));
        assert!(pf.is_file_included("/A/file.in"));
    }
    #[test]
    fn test_base_calls_layout() {
        let pf = filter(&[
            "+ /",
            "- Data/Intensities/BaseCalls/",
            "+ Data/Intensities/BaseCalls/ .*",
        ]);
        assert!(!pf.is_dir_included("Data/Intensities/BaseCalls/SubDir"));
        assert!(!pf.is_file_included("Data/Intensities/BaseCalls/Phasing/test.txt"));
        assert!(pf.is_file_included("Data/Intensities/BaseCalls/11_S11_L001_R1_001.fastq.gz"));
        assert!(pf.is_dir_included("Data/Intensities"));
    }
    #[test]
    fn test_could_contain_included() {
        let pf = filter(&[
            "+ /",
            "- Data/",
            "+ Data/Intensities/BaseCalls/ .*",
            "- Logs/",
            "+ Logs/Keep/",
        ]);
        assert!(pf.could_contain_included("Data"));
        assert!(pf.could_contain_included("Data/Intensities"));
        assert!(pf.could_contain_included("Data/Intensities/BaseCalls"));
        assert!(!pf.could_contain_included("Data/Other"));
        assert!(pf.could_contain_included("Logs"));
        assert!(!pf.could_contain_included("Logs/Drop"));
        assert!(pf.could_contain_included("Logs/Keep/Deeper"));
    }
    #[test]
    fn test_exclude_file_rule_beats_include_file_rule() {
        // both rules match "x.fastq.gz", exclusion is applied last
        let pf = filter(&["+ /", "+ Data/ .*\\.fastq\\.gz", "- Data/ x\\..*"]);
        assert!(!pf.is_file_included("Data/x.fastq.gz"));
        assert!(pf.is_file_included("Data/y.fastq.gz"));
    }
    #[test]
    fn test_regex_is_case_insensitive_and_anchored_at_start() {
        let pf = filter(&["- /", "+ / run.*"]);
        assert!(pf.is_file_included("RUN_01.txt"));
        assert!(!pf.is_file_included("myrun.txt"));
    }
    #[test]
    fn test_equal_scores_earliest_rule_wins() {
        // "A/" and "A/./" normalize to the same directory
        let pf = filter(&["- A/", "+ A/./"]);
        assert!(!pf.is_dir_included("A"));
        let pf = filter(&["+ A/./", "- A/"]);
        assert!(pf.is_dir_included("A/B"));
    }
    #[test]
    fn test_dot_means_root() {
        let pf = filter(&["- ./", "+ keep/"]);
        assert!(!pf.is_dir_included("other"));
        assert!(pf.is_dir_included("keep/deeper"));
    }
    #[test]
    fn test_missing_filename() {
        let pf = filter(&["+ /"]);
        assert!(!pf.is_file_included("some/dir/"));
    }
    #[test]
    fn test_malformed_rules() {
        assert!(matches!(PathFilter::new(["+"]), Err(Error::Syntax(_))));
        assert!(matches!(PathFilter::new(["+ a/ b c"]), Err(Error::Syntax(_))));
        assert!(matches!(PathFilter::new(["* a/"]), Err(Error::Sign(_))));
        assert!(matches!(PathFilter::new(["+ a"]), Err(Error::TrailingSlash(_))));
        assert!(matches!(PathFilter::new(["+ a/ ("]), Err(Error::Regex { .. })));
    }
    #[test]
    fn test_yaml_document() {
        let content = r#"
filter:
  - "+ /"
  - "- Data/Intensities/BaseCalls/"
  - "+ Data/Intensities/BaseCalls/ .*"
"#;
        let pf = PathFilter::from_yaml(content).unwrap();
        assert!(!pf.is_dir_included("Data/Intensities/BaseCalls/L001"));
        assert!(PathFilter::from_yaml("other: 1\n").unwrap().is_empty());
        assert!(PathFilter::from_yaml("filter:\n  - \"+ nodir\"\n").is_err());
    }
    #[test]
    fn test_yaml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("filter.yml");
        std::fs::write(&path, "filter:\n  - \"- /\"\n").unwrap();
        let pf = PathFilter::from_file(&path).unwrap();
        assert!(!pf.is_file_included("a.txt"));
        assert!(PathFilter::from_file(&dir.path().join("missing.yml")).is_err());
    }

    proptest! {
        #[test]
        fn decisions_do_not_depend_on_query_history(
            paths in proptest::collection::vec("[ab]{1,2}(/[ab]{1,2}){0,3}", 1..8)
        ) {
            let pf = filter(&["- /", "+ a/", "- a/b/", "+ a/b/ a.*", "- a/ b.*"]);
            let first: Vec<(bool, bool)> = paths
                .iter()
                .map(|p| (pf.is_dir_included(p), pf.is_file_included(p)))
                .collect();
            // query a fresh filter in reverse order
            let fresh = filter(&["- /", "+ a/", "- a/b/", "+ a/b/ a.*", "- a/ b.*"]);
            let mut again: Vec<(bool, bool)> = paths
                .iter()
                .rev()
                .map(|p| (fresh.is_dir_included(p), fresh.is_file_included(p)))
                .collect();
            again.reverse();
            prop_assert_eq!(first, again);
        }
    }
}
