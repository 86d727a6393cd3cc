//! Issue domain classifier — pure heuristic, no network, no LLM calls.
//!
//! Four tiers are tried in strict order; the first that produces a match
//! wins: explicit title tags, tracker labels, path-like tokens in the text,
//! then a keyword vocabulary. Each tier carries a fixed confidence so the
//! origin of a label is always visible in logs and session output.
//!
//! The scheduler reasons about conflicts purely in terms of the resulting
//! [`Domain`]; the compatibility matrix lives here next to it.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

use serde::{Deserialize, Serialize};

use crate::issue::IssueRecord;

// ── Domain ──────────────────────────────────────────────────────────────────

/// Coarse label for the area of code a task touches.
///
/// Declaration order is the canonical order used for every tie-break.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    Backend,
    Frontend,
    Database,
    Infrastructure,
    Security,
    Testing,
    Documentation,
    /// No tier produced a signal. Scheduled exclusively — it may touch anything.
    Unknown,
}

impl Domain {
    /// Every domain, in canonical order.
    pub const ALL: [Domain; 8] = [
        Domain::Backend,
        Domain::Frontend,
        Domain::Database,
        Domain::Infrastructure,
        Domain::Security,
        Domain::Testing,
        Domain::Documentation,
        Domain::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Backend => "backend",
            Domain::Frontend => "frontend",
            Domain::Database => "database",
            Domain::Infrastructure => "infrastructure",
            Domain::Security => "security",
            Domain::Testing => "testing",
            Domain::Documentation => "documentation",
            Domain::Unknown => "unknown",
        }
    }

    /// Case-insensitive membership test against the canonical names.
    pub fn parse(s: &str) -> Option<Domain> {
        let lower = s.to_ascii_lowercase();
        Domain::ALL.iter().copied().find(|d| d.as_str() == lower)
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Membership test against the canonical domain names.
pub fn is_valid_domain(s: &str) -> bool {
    Domain::parse(s).is_some()
}

/// True iff two running tasks may occupy slots at the same time.
///
/// Unknown-domain tasks run alone, same-domain tasks are assumed to touch
/// overlapping files, and database tasks conflict with everything.
/// Symmetric, deliberately not transitive.
pub fn are_domains_compatible(a: Domain, b: Domain) -> bool {
    if a == Domain::Unknown || b == Domain::Unknown {
        return false;
    }
    if a == b {
        return false;
    }
    if a == Domain::Database || b == Domain::Database {
        return false;
    }
    true
}

// ── Classification ──────────────────────────────────────────────────────────

pub const CONFIDENCE_TITLE_TAG: f64 = 1.0;
pub const CONFIDENCE_LABEL: f64 = 0.9;
pub const CONFIDENCE_PATH: f64 = 0.7;
pub const CONFIDENCE_KEYWORD: f64 = 0.5;

/// Result of classifying one issue. Produced once per task, read-only after.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Classification {
    pub domain: Domain,
    /// Exactly 1.0, 0.9, 0.7, 0.5, or 0.0 depending on the tier that fired.
    pub confidence: f64,
    /// The triggering evidence, in the order it was found.
    pub reasons: Vec<String>,
}

/// Classify an issue. Deterministic and side-effect free.
pub fn classify(issue: &IssueRecord) -> Classification {
    if let Some(c) = classify_title_tag(&issue.title) {
        return c;
    }
    if let Some(c) = classify_labels(&issue.labels) {
        return c;
    }
    let text = format!("{}\n{}", issue.title, issue.body);
    if let Some(c) = classify_paths(&text) {
        return c;
    }
    if let Some(c) = classify_keywords(&text) {
        return c;
    }
    Classification {
        domain: Domain::Unknown,
        confidence: 0.0,
        reasons: vec!["No classification signal matched".to_string()],
    }
}

// ── Tier 1: title tags ──────────────────────────────────────────────────────

/// Bracketed title tags, matched case-insensitively at any position.
pub static TITLE_TAGS: &[(&str, Domain)] = &[
    ("[backend]", Domain::Backend),
    ("[frontend]", Domain::Frontend),
    ("[database]", Domain::Database),
    ("[infra]", Domain::Infrastructure),
    ("[infrastructure]", Domain::Infrastructure),
    ("[security]", Domain::Security),
    ("[testing]", Domain::Testing),
    ("[docs]", Domain::Documentation),
    ("[documentation]", Domain::Documentation),
];

fn classify_title_tag(title: &str) -> Option<Classification> {
    let lower = title.to_lowercase();
    // Leftmost tag wins; table order breaks the (theoretical) same-position tie.
    let (tag, domain, _) = TITLE_TAGS
        .iter()
        .filter_map(|(tag, domain)| lower.find(tag).map(|pos| (*tag, *domain, pos)))
        .min_by_key(|(_, _, pos)| *pos)?;
    Some(Classification {
        domain,
        confidence: CONFIDENCE_TITLE_TAG,
        reasons: vec![format!("Title tag: {tag}")],
    })
}

// ── Tier 2: labels ──────────────────────────────────────────────────────────

/// Label names (lowercased) that vote for a domain: the canonical domain
/// names plus the documented synonyms.
pub static LABEL_RULES: &[(&str, Domain)] = &[
    ("backend", Domain::Backend),
    ("frontend", Domain::Frontend),
    ("ui", Domain::Frontend),
    ("database", Domain::Database),
    ("db", Domain::Database),
    ("infrastructure", Domain::Infrastructure),
    ("infra", Domain::Infrastructure),
    ("security", Domain::Security),
    ("testing", Domain::Testing),
    ("documentation", Domain::Documentation),
];

fn classify_labels(labels: &[String]) -> Option<Classification> {
    let mut votes: BTreeMap<Domain, Vec<&str>> = BTreeMap::new();
    for label in labels {
        let lower = label.to_lowercase();
        if let Some((_, domain)) = LABEL_RULES.iter().find(|(name, _)| *name == lower) {
            votes.entry(*domain).or_default().push(label.as_str());
        }
    }
    // BTreeMap iterates in canonical Domain order, so a strict `>` keeps the
    // canonically-first domain on ties.
    let (domain, supporters) = votes
        .iter()
        .fold(None::<(Domain, &Vec<&str>)>, |best, (d, s)| match best {
            Some((_, bs)) if s.len() <= bs.len() => best,
            _ => Some((*d, s)),
        })?;
    Some(Classification {
        domain,
        confidence: CONFIDENCE_LABEL,
        reasons: supporters.iter().map(|l| format!("Label: {l}")).collect(),
    })
}

// ── Tier 3: path patterns ───────────────────────────────────────────────────

/// How a path fragment is matched against a token.
#[derive(Debug, Clone, Copy)]
pub enum PathPattern {
    /// Directory fragment; matches at the token start or after a `/`.
    Dir(&'static str),
    /// File extension; matches the token suffix.
    Ext(&'static str),
    /// Fragment anywhere inside the token.
    Infix(&'static str),
    /// Final path segment starting with this name.
    File(&'static str),
}

impl PathPattern {
    pub fn fragment(&self) -> &'static str {
        match self {
            PathPattern::Dir(s) | PathPattern::Ext(s) | PathPattern::Infix(s) | PathPattern::File(s) => s,
        }
    }

    fn matches(&self, token: &str) -> bool {
        match self {
            PathPattern::Dir(frag) => token
                .match_indices(frag)
                .any(|(i, _)| i == 0 || token.as_bytes()[i - 1] == b'/'),
            PathPattern::Ext(frag) => token.ends_with(frag),
            PathPattern::Infix(frag) => token.contains(frag),
            PathPattern::File(frag) => token
                .rsplit('/')
                .next()
                .is_some_and(|segment| segment.starts_with(frag)),
        }
    }
}

/// Path-like fragments recognized by tier 3. Matching is case-sensitive.
pub static PATH_RULES: &[(PathPattern, Domain)] = &[
    (PathPattern::Dir("src/api/"), Domain::Backend),
    (PathPattern::Dir("server/"), Domain::Backend),
    (PathPattern::Dir("backend/"), Domain::Backend),
    (PathPattern::Dir("src/components/"), Domain::Frontend),
    (PathPattern::Dir("ui/"), Domain::Frontend),
    (PathPattern::Dir("frontend/"), Domain::Frontend),
    (PathPattern::Ext(".tsx"), Domain::Frontend),
    (PathPattern::Ext(".jsx"), Domain::Frontend),
    (PathPattern::Dir("src/db/"), Domain::Database),
    (PathPattern::Dir("migrations/"), Domain::Database),
    (PathPattern::Infix("schema."), Domain::Database),
    (PathPattern::Dir("infra/"), Domain::Infrastructure),
    (PathPattern::Dir("deploy/"), Domain::Infrastructure),
    (PathPattern::File("Dockerfile"), Domain::Infrastructure),
    (PathPattern::Dir(".github/workflows/"), Domain::Infrastructure),
    (PathPattern::Dir("test/"), Domain::Testing),
    (PathPattern::Dir("__tests__/"), Domain::Testing),
    (PathPattern::Infix(".test."), Domain::Testing),
    (PathPattern::Infix(".spec."), Domain::Testing),
    (PathPattern::Dir("docs/"), Domain::Documentation),
    (PathPattern::File("README"), Domain::Documentation),
];

const TOKEN_TRIM: &[char] = &['`', '"', '\'', '(', ')', '[', ']', '{', '}', ',', ';', ':'];

fn classify_paths(text: &str) -> Option<Classification> {
    let mut votes: BTreeMap<Domain, Vec<String>> = BTreeMap::new();
    for raw_token in text.split_whitespace() {
        let token = raw_token.trim_matches(TOKEN_TRIM);
        if token.is_empty() {
            continue;
        }
        // One vote per (token, domain) pair, however many fragments hit.
        let mut token_domains: Vec<Domain> = PATH_RULES
            .iter()
            .filter(|(pattern, _)| pattern.matches(token))
            .map(|(_, domain)| *domain)
            .collect();
        token_domains.sort();
        token_domains.dedup();
        for domain in token_domains {
            votes.entry(domain).or_default().push(token.to_string());
        }
    }
    let (domain, tokens) = votes
        .iter()
        .fold(None::<(Domain, &Vec<String>)>, |best, (d, t)| match best {
            Some((_, bt)) if t.len() <= bt.len() => best,
            _ => Some((*d, t)),
        })?;
    Some(Classification {
        domain,
        confidence: CONFIDENCE_PATH,
        reasons: tokens.iter().map(|t| format!("Path: {t}")).collect(),
    })
}

// ── Tier 4: keywords ────────────────────────────────────────────────────────

/// Keyword vocabulary, matched case-insensitively on whole words.
pub static KEYWORDS: &[(&str, Domain)] = &[
    ("api", Domain::Backend),
    ("endpoint", Domain::Backend),
    ("handler", Domain::Backend),
    ("mutation", Domain::Backend),
    ("trpc", Domain::Backend),
    ("middleware", Domain::Backend),
    ("webhook", Domain::Backend),
    ("react", Domain::Frontend),
    ("component", Domain::Frontend),
    ("modal", Domain::Frontend),
    ("button", Domain::Frontend),
    ("shadcn", Domain::Frontend),
    ("css", Domain::Frontend),
    ("layout", Domain::Frontend),
    ("migration", Domain::Database),
    ("schema", Domain::Database),
    ("table", Domain::Database),
    ("drizzle", Domain::Database),
    ("postgres", Domain::Database),
    ("cve", Domain::Security),
    ("xss", Domain::Security),
    ("csrf", Domain::Security),
    ("sql injection", Domain::Security),
    ("vulnerability", Domain::Security),
    ("exploit", Domain::Security),
    ("docker", Domain::Infrastructure),
    ("kubernetes", Domain::Infrastructure),
    ("terraform", Domain::Infrastructure),
    ("deploy", Domain::Infrastructure),
    ("pipeline", Domain::Infrastructure),
    ("test", Domain::Testing),
    ("jest", Domain::Testing),
    ("vitest", Domain::Testing),
    ("coverage", Domain::Testing),
    ("flaky", Domain::Testing),
    ("readme", Domain::Documentation),
    ("docs", Domain::Documentation),
    ("documentation", Domain::Documentation),
    ("changelog", Domain::Documentation),
    ("tutorial", Domain::Documentation),
];

fn keyword_regexes() -> &'static Vec<(regex::Regex, &'static str, Domain)> {
    static RES: OnceLock<Vec<(regex::Regex, &'static str, Domain)>> = OnceLock::new();
    RES.get_or_init(|| {
        KEYWORDS
            .iter()
            .map(|(kw, domain)| {
                let pattern = format!(r"(?i)\b{}\b", regex::escape(kw));
                (
                    regex::Regex::new(&pattern).expect("keyword regex"),
                    *kw,
                    *domain,
                )
            })
            .collect()
    })
}

fn classify_keywords(text: &str) -> Option<Classification> {
    let mut hits: BTreeMap<Domain, Vec<(usize, &'static str)>> = BTreeMap::new();
    for (re, kw, domain) in keyword_regexes() {
        let count = re.find_iter(text).count();
        if count > 0 {
            hits.entry(*domain).or_default().push((count, kw));
        }
    }
    let (domain, matched) = hits
        .iter()
        .fold(None::<(Domain, &Vec<(usize, &'static str)>)>, |best, (d, m)| {
            let total: usize = m.iter().map(|(n, _)| n).sum();
            match best {
                Some((_, bm)) if total <= bm.iter().map(|(n, _)| n).sum::<usize>() => best,
                _ => Some((*d, m)),
            }
        })?;
    Some(Classification {
        domain,
        confidence: CONFIDENCE_KEYWORD,
        reasons: matched
            .iter()
            .map(|(count, kw)| {
                if *count > 1 {
                    format!("Keyword: {kw} ×{count}")
                } else {
                    format!("Keyword: {kw}")
                }
            })
            .collect(),
    })
}

// ── Tests ───────────────────────────────────────────────────────────────────
