//! DOM helpers shared by the extractor, the consent handler and the
//! selector suggestion engine.

use scraper::node::Element;
use scraper::{ElementRef, Html, Selector};

/// Elements whose text never reaches the reader.
pub const NON_CONTENT_TAGS: &[&str] = &[
    "head", "script", "style", "noscript", "template", "svg", "iframe", "object", "canvas",
    "meta", "link", "title",
];

/// Root markers left behind by client-side frameworks before hydration.
const FRAMEWORK_ROOT_MARKERS: &[&str] = &[
    "#app",
    "#root",
    "#__next",
    "#__nuxt",
    "[data-reactroot]",
    "[ng-version]",
    "app-root",
    "script#__NEXT_DATA__",
];

/// Body text shorter than this is treated as an empty shell.
const NEAR_EMPTY_BODY_CHARS: usize = 64;

pub fn is_hidden(element: &Element) -> bool {
    if element.attr("hidden").is_some() || element.attr("aria-hidden") == Some("true") {
        return true;
    }
    if element.name() == "input" && element.attr("type") == Some("hidden") {
        return true;
    }
    match element.attr("style") {
        Some(style) => {
            let compact: String = style
                .chars()
                .filter(|c| !c.is_whitespace())
                .collect::<String>()
                .to_lowercase();
            compact.contains("display:none") || compact.contains("visibility:hidden")
        }
        None => false,
    }
}

/// An element is visible when it carries content and is not explicitly hidden.
pub fn is_visible(element: ElementRef<'_>) -> bool {
    let value = element.value();
    !NON_CONTENT_TAGS.contains(&value.name()) && !is_hidden(value)
}

/// Text a reader would see inside `element`, whitespace collapsed.
pub fn visible_text(element: ElementRef<'_>) -> String {
    let mut raw = String::new();
    collect_visible(element, &mut raw);
    normalize_whitespace(&raw)
}

fn collect_visible(element: ElementRef<'_>, out: &mut String) {
    for child in element.children() {
        if let Some(text) = child.value().as_text() {
            out.push_str(text);
            out.push(' ');
        } else if let Some(child_element) = ElementRef::wrap(child) {
            if is_visible(child_element) {
                collect_visible(child_element, out);
            }
        }
    }
}

pub fn normalize_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// DOM `textContent` of an element, trimmed.
pub fn text_content(element: ElementRef<'_>) -> String {
    element.text().collect::<String>().trim().to_string()
}

/// Number of elements `selector` matches, `None` when it does not parse.
pub fn count_matches(document: &Html, selector: &str) -> Option<usize> {
    let parsed = Selector::parse(selector).ok()?;
    Some(document.select(&parsed).count())
}

/// Heuristic for pages that ship an empty shell and build their content
/// in the browser.
pub fn looks_client_rendered(document: &Html) -> bool {
    let body_text = Selector::parse("body")
        .ok()
        .and_then(|body| document.select(&body).next())
        .map(visible_text)
        .unwrap_or_default();

    if body_text.chars().count() < NEAR_EMPTY_BODY_CHARS {
        return true;
    }

    FRAMEWORK_ROOT_MARKERS.iter().any(|marker| {
        Selector::parse(marker)
            .map(|selector| document.select(&selector).next().is_some())
            .unwrap_or(false)
    }) || document.html().contains("window.__NUXT__")
}

/// Truncate on a character boundary, appending an ellipsis when shortened.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars.saturating_sub(3)).collect();
    truncated.push_str("...");
    truncated
}
