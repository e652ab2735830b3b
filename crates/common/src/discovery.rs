//! Spec file discovery
//!
//! Framework configs are arbitrary JavaScript, so they are never evaluated.
//! Include/exclude patterns are scraped out of them with regular expressions
//! (string or array-of-string literals only). When nothing is found the
//! fallback table below applies.
//!
//! | Framework | Include | Exclude |
//! |-----------|---------|---------|
//! | Cypress 10+ | `cypress/{e2e,component}/**/*.cy.{js,jsx,ts,tsx}` | `*.hot-update.js` |
//! | Cypress (`cypress.json`) | `integrationFolder` (`cypress/integration`) + `testFiles` (`**/*.*`) | `ignoreTestFiles` (`*.hot-update.js`) |
//! | Playwright | `**/*.{spec,test}.{js,jsx,ts,tsx,cjs,cts,mjs,mts}` under `testDir` | none |
//!
//! Patterns without a `/` match the file name; everything else matches the
//! path relative to the search root, with `*` never crossing `/`.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use regex::Regex;
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::types::TestFramework;
use crate::{Error, Result};

const CYPRESS_CONFIGS: &[&str] = &[
    "cypress.config.ts",
    "cypress.config.js",
    "cypress.config.mjs",
    "cypress.config.cjs",
];
const CYPRESS_LEGACY_CONFIG: &str = "cypress.json";
const PLAYWRIGHT_CONFIGS: &[&str] = &[
    "playwright.config.ts",
    "playwright.config.js",
    "playwright.config.mjs",
    "playwright.config.cjs",
];

pub const CYPRESS_DEFAULT_INCLUDE: &[&str] = &["cypress/{e2e,component}/**/*.cy.{js,jsx,ts,tsx}"];
pub const CYPRESS_DEFAULT_EXCLUDE: &[&str] = &["*.hot-update.js"];
pub const CYPRESS_LEGACY_INTEGRATION_FOLDER: &str = "cypress/integration";
pub const CYPRESS_LEGACY_TEST_FILES: &str = "**/*.*";
pub const CYPRESS_LEGACY_IGNORE: &str = "*.hot-update.js";
pub const PLAYWRIGHT_DEFAULT_INCLUDE: &[&str] =
    &["**/*.{spec,test}.{js,jsx,ts,tsx,cjs,cts,mjs,mts}"];

/// Directories never searched for specs
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git"];

/// Where to look and what to match, relative to the project root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpecPatterns {
    /// Directory the patterns are relative to; empty for the project root
    pub search_root: String,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
}

/// Find the spec files of a project, relative to `root` and sorted.
pub fn discover_specs(
    root: &Path,
    framework: TestFramework,
    filter: Option<&str>,
) -> Result<Vec<String>> {
    let mut patterns = resolve_patterns(root, framework)?;

    if let Some(filter) = filter.map(str::trim).filter(|f| !f.is_empty()) {
        info!("Using explicit spec filter {:?}", filter);
        patterns.include = filter
            .split(',')
            .map(|p| normalize_pattern(p.trim()))
            .filter(|p| !p.is_empty())
            .collect();
        patterns.exclude.clear();
        patterns.search_root = String::new();
    }

    debug!("Spec patterns for {}: {:?}", framework, patterns);
    let specs = match_files(root, &patterns)?;
    info!("Discovered {} {} specs", specs.len(), framework);
    Ok(specs)
}

/// Locate the framework config and pull patterns out of it.
pub fn resolve_patterns(root: &Path, framework: TestFramework) -> Result<SpecPatterns> {
    match framework {
        TestFramework::Cypress => cypress_patterns(root),
        TestFramework::Playwright => playwright_patterns(root),
    }
}

fn cypress_patterns(root: &Path) -> Result<SpecPatterns> {
    if let Some(source) = read_first(root, CYPRESS_CONFIGS)? {
        let include = extract_patterns(&source, "specPattern")?;
        let exclude = extract_patterns(&source, "excludeSpecPattern")?;
        return Ok(SpecPatterns {
            search_root: String::new(),
            include: or_default(include, CYPRESS_DEFAULT_INCLUDE),
            exclude: or_default(exclude, CYPRESS_DEFAULT_EXCLUDE),
        });
    }

    let legacy = root.join(CYPRESS_LEGACY_CONFIG);
    if legacy.is_file() {
        return legacy_cypress_patterns(&std::fs::read_to_string(&legacy)?);
    }

    Err(Error::ConfigNotFound {
        framework: TestFramework::Cypress.to_string(),
        dir: root.display().to_string(),
    })
}

/// `cypress.json` is plain JSON, so it is parsed properly.
fn legacy_cypress_patterns(source: &str) -> Result<SpecPatterns> {
    let config: serde_json::Value = serde_json::from_str(source)?;
    let folder = config
        .get("integrationFolder")
        .and_then(|v| v.as_str())
        .unwrap_or(CYPRESS_LEGACY_INTEGRATION_FOLDER);
    let include = json_patterns(config.get("testFiles"));
    let exclude = json_patterns(config.get("ignoreTestFiles"));

    Ok(SpecPatterns {
        search_root: normalize_pattern(folder),
        include: or_default(include, &[CYPRESS_LEGACY_TEST_FILES]),
        exclude: or_default(exclude, &[CYPRESS_LEGACY_IGNORE]),
    })
}

fn json_patterns(value: Option<&serde_json::Value>) -> Vec<String> {
    match value {
        Some(serde_json::Value::String(s)) => vec![normalize_pattern(s)],
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|v| v.as_str())
            .map(normalize_pattern)
            .collect(),
        _ => Vec::new(),
    }
}

fn playwright_patterns(root: &Path) -> Result<SpecPatterns> {
    let Some(source) = read_first(root, PLAYWRIGHT_CONFIGS)? else {
        return Err(Error::ConfigNotFound {
            framework: TestFramework::Playwright.to_string(),
            dir: root.display().to_string(),
        });
    };

    let test_dir = extract_patterns(&source, "testDir")?
        .into_iter()
        .next()
        .unwrap_or_default();
    let include = extract_patterns(&source, "testMatch")?;
    let exclude = extract_patterns(&source, "testIgnore")?;

    Ok(SpecPatterns {
        search_root: test_dir,
        include: or_default(include, PLAYWRIGHT_DEFAULT_INCLUDE),
        exclude,
    })
}

fn read_first(root: &Path, candidates: &[&str]) -> Result<Option<String>> {
    for name in candidates {
        let path = root.join(name);
        if path.is_file() {
            debug!("Using config file {:?}", path);
            return Ok(Some(std::fs::read_to_string(path)?));
        }
    }
    Ok(None)
}

fn or_default(found: Vec<String>, fallback: &[&str]) -> Vec<String> {
    if found.is_empty() {
        fallback.iter().map(|s| s.to_string()).collect()
    } else {
        found
    }
}

/// Literal values assigned to `key` in a JS/TS config.
///
/// Accepts `key: 'a'`, `key: "a"`, `` key: `a` `` and `key: ['a', "b"]`.
/// Every occurrence is collected, so per-mode blocks (`e2e`, `component`)
/// all contribute.
pub fn extract_patterns(source: &str, key: &str) -> Result<Vec<String>> {
    let assignment = Regex::new(&format!(
        r#"\b{}\s*:\s*(\[[^\]]*\]|'[^']*'|"[^"]*"|`[^`]*`)"#,
        regex::escape(key)
    ))
    .map_err(|e| Error::Internal(format!("pattern regex: {}", e)))?;
    let literal = Regex::new(r#"'([^']*)'|"([^"]*)"|`([^`]*)`"#)
        .map_err(|e| Error::Internal(format!("literal regex: {}", e)))?;

    let mut out = Vec::new();
    for caps in assignment.captures_iter(source) {
        for lit in literal.captures_iter(&caps[1]) {
            let value = lit
                .get(1)
                .or_else(|| lit.get(2))
                .or_else(|| lit.get(3))
                .map(|m| normalize_pattern(m.as_str()))
                .unwrap_or_default();
            if !value.is_empty() && !out.contains(&value) {
                out.push(value);
            }
        }
    }
    Ok(out)
}

/// Strip `./` and trailing `/`, and turn `@(a|b)` groups into `{a,b}`.
fn normalize_pattern(pattern: &str) -> String {
    let mut p = pattern.trim();
    while let Some(rest) = p.strip_prefix("./") {
        p = rest;
    }
    let p = p.trim_end_matches('/');
    if p == "." {
        return String::new();
    }
    translate_extglob(p)
}

fn translate_extglob(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut chars = pattern.chars().peekable();
    while let Some(c) = chars.next() {
        if c == '@' && chars.peek() == Some(&'(') {
            chars.next();
            out.push('{');
            for inner in chars.by_ref() {
                match inner {
                    ')' => break,
                    '|' => out.push(','),
                    other => out.push(other),
                }
            }
            out.push('}');
        } else {
            out.push(c);
        }
    }
    out
}

/// Path-relative and name-only globs built from one pattern list
struct Matcher {
    by_path: GlobSet,
    by_name: GlobSet,
}

impl Matcher {
    fn new(patterns: &[String]) -> Result<Self> {
        let mut by_path = GlobSetBuilder::new();
        let mut by_name = GlobSetBuilder::new();
        for pattern in patterns {
            let glob = GlobBuilder::new(pattern).literal_separator(true).build()?;
            if pattern.contains('/') {
                by_path.add(glob);
            } else {
                by_name.add(glob);
            }
        }
        Ok(Self {
            by_path: by_path.build()?,
            by_name: by_name.build()?,
        })
    }

    fn is_match(&self, rel: &str, name: &str) -> bool {
        self.by_path.is_match(rel) || self.by_name.is_match(name)
    }
}

fn match_files(root: &Path, patterns: &SpecPatterns) -> Result<Vec<String>> {
    let search_dir = if patterns.search_root.is_empty() {
        root.to_path_buf()
    } else {
        root.join(&patterns.search_root)
    };
    if !search_dir.is_dir() {
        debug!("Spec directory {:?} does not exist", search_dir);
        return Ok(Vec::new());
    }

    let include = Matcher::new(&patterns.include)?;
    let exclude = Matcher::new(&patterns.exclude)?;
    let mut found = BTreeSet::new();

    let walker = WalkDir::new(&search_dir)
        .follow_links(false)
        .into_iter()
        .filter_entry(|e| {
            !(e.file_type().is_dir()
                && e.file_name()
                    .to_str()
                    .is_some_and(|n| SKIPPED_DIRS.contains(&n)))
        });

    for entry in walker {
        let entry = entry.map_err(|e| Error::Io(e.into()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(rel) = entry.path().strip_prefix(&search_dir) else {
            continue;
        };
        let rel = to_slash(rel);
        let name = entry.file_name().to_string_lossy();

        if include.is_match(&rel, &name) && !exclude.is_match(&rel, &name) {
            let spec = if patterns.search_root.is_empty() {
                rel
            } else {
                format!("{}/{}", patterns.search_root, rel)
            };
            found.insert(spec);
        }
    }

    Ok(found.into_iter().collect())
}

fn to_slash(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}
