use regex::Regex;
use scraper::{ElementRef, Html};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;

use crate::utils::dom::{count_matches, is_visible, truncate_chars, visible_text};

const DEFAULT_MAX_SUGGESTIONS: usize = 10;
const DEFAULT_SAMPLE_LEN: usize = 80;
const MAX_CANDIDATE_TEXT: usize = 300;
const MAX_CANDIDATES: usize = 1500;
const MAX_ANCESTOR_DEPTH: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SelectorInfo {
    pub selector: String,
    pub count: usize,
    pub valid: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SelectorSuggestion {
    pub selector: String,
    pub match_count: usize,
    pub sample_text: String,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SuggestionReport {
    pub current_selector_info: SelectorInfo,
    pub suggestions: Vec<SelectorSuggestion>,
}

/// Proposes replacement selectors by analysing a DOM snapshot. Read-only
/// and deterministic for a given input.
#[derive(Debug, Clone)]
pub struct SuggestionEngine {
    max_suggestions: usize,
    sample_len: usize,
}

impl Default for SuggestionEngine {
    fn default() -> Self {
        Self {
            max_suggestions: DEFAULT_MAX_SUGGESTIONS,
            sample_len: DEFAULT_SAMPLE_LEN,
        }
    }
}

/// Memoised selector match counts over one document.
struct MatchCounter<'a> {
    document: &'a Html,
    cache: HashMap<String, usize>,
}

impl<'a> MatchCounter<'a> {
    fn new(document: &'a Html) -> Self {
        Self {
            document,
            cache: HashMap::new(),
        }
    }

    fn count(&mut self, selector: &str) -> usize {
        if let Some(count) = self.cache.get(selector) {
            return *count;
        }
        let count = count_matches(self.document, selector).unwrap_or(0);
        self.cache.insert(selector.to_string(), count);
        count
    }
}

struct Candidate {
    selector: String,
    match_count: usize,
    text: String,
}

impl SuggestionEngine {
    pub fn new(max_suggestions: usize, sample_len: usize) -> Self {
        Self {
            max_suggestions,
            sample_len,
        }
    }

    pub fn suggest(&self, dom: &str, current_selector: &str, expected_text: Option<&str>) -> SuggestionReport {
        let document = Html::parse_document(dom);
        let mut counter = MatchCounter::new(&document);

        let current_count = counter.count(current_selector);
        let current_selector_info = SelectorInfo {
            selector: current_selector.to_string(),
            count: current_count,
            valid: current_count >= 1,
        };

        let candidates: Vec<Candidate> = collect_elements(&document)
            .into_iter()
            .filter_map(|(element, text)| {
                let selector = synthesize_selector(element, &mut counter)?;
                let match_count = counter.count(&selector);
                (match_count > 0).then_some(Candidate {
                    selector,
                    match_count,
                    text,
                })
            })
            .collect();

        let expected = expected_text
            .map(normalize_for_match)
            .filter(|expected| !expected.is_empty());

        let mut suggestions: Vec<SelectorSuggestion> = match expected.as_deref() {
            Some(expected) => candidates
                .iter()
                .map(|c| self.to_suggestion(c, text_similarity(&c.text, expected)))
                .filter(|s| s.score > 0.0)
                .collect(),
            None => Vec::new(),
        };

        // Nothing resembles the expected text: fall back to structure
        if suggestions.is_empty() {
            suggestions = candidates
                .iter()
                .map(|c| self.to_suggestion(c, structural_score(c.match_count, &c.text)))
                .collect();
        }

        suggestions.sort_by(rank);

        let mut seen = HashSet::new();
        suggestions.retain(|s| seen.insert(s.selector.clone()));
        suggestions.truncate(self.max_suggestions);

        SuggestionReport {
            current_selector_info,
            suggestions,
        }
    }

    fn to_suggestion(&self, candidate: &Candidate, score: f64) -> SelectorSuggestion {
        SelectorSuggestion {
            selector: candidate.selector.clone(),
            match_count: candidate.match_count,
            sample_text: truncate_chars(&candidate.text, self.sample_len),
            score,
        }
    }
}

fn rank(a: &SelectorSuggestion, b: &SelectorSuggestion) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.match_count.cmp(&b.match_count))
        .then_with(|| a.selector.len().cmp(&b.selector.len()))
        .then_with(|| a.selector.cmp(&b.selector))
}

/// Visible elements carrying short, human-meaningful text, in document order.
fn collect_elements(document: &Html) -> Vec<(ElementRef<'_>, String)> {
    let mut out = Vec::new();
    walk(document.root_element(), &mut out);
    out
}

fn walk<'a>(element: ElementRef<'a>, out: &mut Vec<(ElementRef<'a>, String)>) {
    for child in element.children().filter_map(ElementRef::wrap) {
        if out.len() >= MAX_CANDIDATES {
            return;
        }
        if !is_visible(child) {
            continue;
        }

        let name = child.value().name();
        if name != "body" && name != "html" {
            let text = visible_text(child);
            if text.chars().count() <= MAX_CANDIDATE_TEXT && text.chars().any(char::is_alphanumeric) {
                out.push((child, text));
            }
        }
        walk(child, out);
    }
}

fn ident_pattern() -> Option<&'static Regex> {
    static IDENT: OnceLock<Option<Regex>> = OnceLock::new();
    IDENT
        .get_or_init(|| Regex::new(r"^-?[A-Za-z_][A-Za-z0-9_-]*$").ok())
        .as_ref()
}

fn generated_prefixes() -> &'static [Regex] {
    static PREFIXES: OnceLock<Vec<Regex>> = OnceLock::new();
    PREFIXES.get_or_init(|| {
        [
            r"^css-[A-Za-z0-9]+",
            r"^sc-[A-Za-z0-9]+",
            r"^jsx-\d+",
            r"^emotion-\d+",
            r"^svelte-[A-Za-z0-9]+",
            r"^_[A-Za-z0-9]{5,}$",
        ]
        .iter()
        .filter_map(|pattern| Regex::new(pattern).ok())
        .collect()
    })
}

fn is_css_ident(token: &str) -> bool {
    ident_pattern().is_some_and(|re| re.is_match(token))
}

/// Class or id tokens that build tooling mints per deploy.
pub fn looks_auto_generated(token: &str) -> bool {
    if generated_prefixes().iter().any(|re| re.is_match(token)) {
        return true;
    }

    // Hash suffix after the last `__` or `-`
    let suffix = token
        .rsplit_once("__")
        .or_else(|| token.rsplit_once('-'))
        .map(|(_, suffix)| suffix);
    if let Some(suffix) = suffix {
        if suffix.len() >= 5
            && suffix.chars().all(|c| c.is_ascii_alphanumeric())
            && suffix.chars().any(|c| c.is_ascii_digit())
            && suffix.chars().any(|c| c.is_ascii_alphabetic())
        {
            return true;
        }
    }

    let digits = token.chars().filter(char::is_ascii_digit).count();
    token.len() >= 5 && digits >= 3 && token.chars().any(|c| c.is_ascii_alphabetic())
}

fn stable_id(element: ElementRef<'_>) -> Option<String> {
    element
        .value()
        .id()
        .filter(|id| is_css_ident(id) && !looks_auto_generated(id))
        .map(|id| format!("#{}", id))
}

fn stable_classes(element: ElementRef<'_>) -> Vec<&str> {
    element
        .value()
        .classes()
        .filter(|class| is_css_ident(class) && !looks_auto_generated(class))
        .collect()
}

/// Own-element selector variants, most specific-looking first.
fn own_variants(element: ElementRef<'_>) -> Vec<String> {
    let tag = element.value().name();
    let classes = stable_classes(element);
    let mut variants = Vec::with_capacity(4);

    if let Some(id) = stable_id(element) {
        variants.push(id);
    }
    if let Some(first) = classes.first() {
        variants.push(format!("{}.{}", tag, first));
    }
    if classes.len() >= 2 {
        variants.push(format!("{}.{}.{}", tag, classes[0], classes[1]));
    }
    variants.push(tag.to_string());
    variants
}

/// Short label used when an ancestor joins a child combinator chain.
fn anchor_label(element: ElementRef<'_>) -> (String, bool) {
    if let Some(id) = stable_id(element) {
        return (id, true);
    }
    let tag = element.value().name();
    match stable_classes(element).first() {
        Some(class) => (format!("{}.{}", tag, class), false),
        None => (tag.to_string(), false),
    }
}

fn better(candidate: (usize, String), best: Option<(usize, String)>) -> Option<(usize, String)> {
    match best {
        Some(best) if (best.0, best.1.len()) <= (candidate.0, candidate.1.len()) => Some(best),
        _ => Some(candidate),
    }
}

/// Minimal stable selector for `element`: the first unique variant, else
/// the one matching fewest elements.
fn synthesize_selector(element: ElementRef<'_>, counter: &mut MatchCounter<'_>) -> Option<String> {
    let mut best: Option<(usize, String)> = None;

    for variant in own_variants(element) {
        let count = counter.count(&variant);
        if count == 1 {
            return Some(variant);
        }
        if count > 0 {
            best = better((count, variant), best);
        }
    }

    let (_, mut chain) = best.clone()?;
    let mut ancestor = element.parent().and_then(ElementRef::wrap);

    for _ in 0..MAX_ANCESTOR_DEPTH {
        let Some(parent) = ancestor else { break };
        if parent.value().name() == "html" {
            break;
        }

        let (label, anchored) = anchor_label(parent);
        chain = format!("{} > {}", label, chain);
        let count = counter.count(&chain);
        if count == 1 {
            return Some(chain);
        }
        if count > 0 {
            best = better((count, chain.clone()), best);
        }
        if anchored {
            break;
        }
        ancestor = parent.parent().and_then(ElementRef::wrap);
    }

    best.map(|(_, selector)| selector)
}

fn normalize_for_match(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn digits_of(text: &str) -> String {
    text.chars().filter(char::is_ascii_digit).collect()
}

/// Similarity in [0, 1] between an element's text and the expected text
/// (already normalised).
fn text_similarity(text: &str, expected: &str) -> f64 {
    let text = normalize_for_match(text);
    if text.is_empty() || expected.is_empty() {
        return 0.0;
    }
    if text == expected {
        return 1.0;
    }

    let text_len = text.chars().count() as f64;
    let expected_len = expected.chars().count() as f64;

    if text.contains(expected) {
        return 0.5 + 0.4 * (expected_len / text_len);
    }
    if expected.contains(text.as_str()) {
        return 0.2 + 0.3 * (text_len / expected_len);
    }

    let expected_digits = digits_of(expected);
    if !expected_digits.is_empty() && digits_of(&text) == expected_digits {
        return 0.45;
    }

    let text_tokens: HashSet<&str> = text.split(' ').collect();
    let expected_tokens: HashSet<&str> = expected.split(' ').collect();
    let shared = text_tokens.intersection(&expected_tokens).count() as f64;
    let union = text_tokens.union(&expected_tokens).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        0.4 * shared / union
    }
}

/// Prefers specific selectors over short-but-not-trivial text.
fn structural_score(match_count: usize, text: &str) -> f64 {
    let len = text.chars().count();
    let length_score = match len {
        0 => 0.0,
        1..=2 => 0.2,
        3..=60 => 1.0,
        _ => 60.0 / len as f64,
    };
    0.6 / match_count.max(1) as f64 + 0.4 * length_score
}
