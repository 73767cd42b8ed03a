use crate::dom::ElementInfo;
use crate::error::Result;
use crate::selector::types::{Selector, SelectorCandidate, SelectorStrategy};
use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

static GENERATED_ID_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile_all(&[
        r"(?i)^[a-f0-9]{8,}$",
        r"(?i)^[a-z0-9]{20,}$",
        r"^:r[0-9]+:$",
        r"^__[a-z]+_[0-9]+$",
        r"^ember[0-9]+$",
        r"^ng-[a-z]+-[0-9]+$",
    ])
});

static GENERATED_CLASS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    compile_all(&[
        r"(?i)^[a-z]{1,2}[0-9]+$",
        r"(?i)^css-[a-z0-9]+$",
        r"(?i)^sc-[a-z]+$",
        r"(?i)^_[a-z0-9]+$",
        r"(?i)^[a-f0-9]{6,}$",
    ])
});

fn compile_all(patterns: &[&str]) -> Vec<Regex> {
    patterns.iter().filter_map(|p| Regex::new(p).ok()).collect()
}

/// Hash-like or framework-generated ids (React `:r1:`, Ember, Angular, hex hashes)
pub fn is_generated_id(id: &str) -> bool {
    GENERATED_ID_PATTERNS.iter().any(|re| re.is_match(id))
}

/// Minified, CSS-in-JS or hash-based class names
pub fn is_generated_class(class_name: &str) -> bool {
    GENERATED_CLASS_PATTERNS.iter().any(|re| re.is_match(class_name))
}

/// Escape an identifier for use after `#` or `.` in CSS
pub fn escape_css_ident(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for (i, c) in value.chars().enumerate() {
        if i == 0 && c.is_ascii_digit() {
            escaped.push_str(&format!("\\{:x} ", c as u32));
            continue;
        }
        if "!\"#$%&'()*+,./:;<=>?@[\\]^`{|}~".contains(c) || c.is_whitespace() {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Escape a value for a double-quoted CSS attribute selector string
pub fn escape_css_string(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

/// Quote a string as an XPath literal, falling back to `concat()` when it holds both quote kinds
pub fn xpath_literal(value: &str) -> String {
    if !value.contains('"') {
        return format!("\"{}\"", value);
    }
    if !value.contains('\'') {
        return format!("'{}'", value);
    }
    let parts: Vec<String> = value.split('"').map(|part| format!("\"{}\"", part)).collect();
    format!("concat({})", parts.join(", '\"', "))
}

fn unescape_backslashes(value: &str) -> String {
    let mut unescaped = String::with_capacity(value.len());
    let mut chars = value.chars();
    while let Some(c) = chars.next() {
        match c {
            '\\' => unescaped.extend(chars.next()),
            c => unescaped.push(c),
        }
    }
    unescaped
}

/// Partial text locator. A leading quote or backslash is escaped so the
/// result never reads as an exact locator.
pub fn partial_text_locator(text: &str) -> String {
    if text.starts_with(['"', '\\']) { format!("text=\\{}", text) } else { format!("text={}", text) }
}

/// Text a locator looks for and whether it must match exactly.
///
/// `text="..."` is exact with CSS-string escapes; anything else is a partial
/// whose single leading backslash, if any, is dropped.
pub fn parse_text_locator(text_selector: &str) -> (String, bool) {
    let body = text_selector.strip_prefix("text=").unwrap_or(text_selector);
    if let Some(exact) = body.strip_prefix('"').and_then(|b| b.strip_suffix('"')) {
        return (unescape_backslashes(exact), true);
    }
    (body.strip_prefix('\\').unwrap_or(body).to_string(), false)
}

/// XPath equivalent of a text locator (`text="Save"` or `text=Sav`)
pub fn text_to_xpath(text_selector: &str) -> String {
    match parse_text_locator(text_selector) {
        (text, true) => format!("//*[normalize-space()={}]", xpath_literal(&text)),
        (text, false) => format!("//*[contains(normalize-space(), {})]", xpath_literal(&text)),
    }
}

/// Best-effort structural translation of a CSS selector to XPath.
///
/// Handles type selectors, `#id`, `.class`, attribute selectors (`=`, `^=`, `*=`, `~=`
/// and presence), `:nth-child(n)` and the descendant / child combinators.
/// Unsupported pseudo-classes are dropped.
pub fn css_to_xpath(css: &str) -> String {
    let chars: Vec<char> = css.trim().chars().collect();
    let mut xpath = String::new();
    let mut axis = "//";
    let mut i = 0;

    while i < chars.len() {
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i < chars.len() && chars[i] == '>' {
            axis = "/";
            i += 1;
            continue;
        }
        if i >= chars.len() {
            break;
        }

        let mut tag = String::from("*");
        if chars[i] == '*' {
            i += 1;
        } else if is_ident_char(chars[i]) {
            tag = read_ident(&chars, &mut i).to_ascii_lowercase();
        }

        let mut predicates = String::new();
        while i < chars.len() && !chars[i].is_whitespace() && chars[i] != '>' {
            match chars[i] {
                '#' => {
                    i += 1;
                    let id = read_ident(&chars, &mut i);
                    predicates.push_str(&format!("[@id={}]", xpath_literal(&id)));
                }
                '.' => {
                    i += 1;
                    let class = read_ident(&chars, &mut i);
                    predicates.push_str(&format!(
                        "[contains(concat(' ', normalize-space(@class), ' '), {})]",
                        xpath_literal(&format!(" {} ", class))
                    ));
                }
                '[' => {
                    i += 1;
                    predicates.push_str(&read_attribute(&chars, &mut i));
                }
                ':' => {
                    i += 1;
                    let pseudo = read_ident(&chars, &mut i);
                    let argument = read_parenthesized(&chars, &mut i);
                    if pseudo == "nth-child" {
                        if let Ok(n) = argument.trim().parse::<usize>() {
                            predicates.push_str(&format!("[{}]", n));
                        }
                    }
                }
                _ => i += 1,
            }
        }

        xpath.push_str(axis);
        xpath.push_str(&tag);
        xpath.push_str(&predicates);
        axis = "//";
    }

    if xpath.is_empty() { "//*".to_string() } else { xpath }
}

fn is_ident_char(c: char) -> bool {
    c.is_alphanumeric() || c == '-' || c == '_' || c == '\\' || !c.is_ascii()
}

fn read_ident(chars: &[char], i: &mut usize) -> String {
    let mut ident = String::new();
    while *i < chars.len() && is_ident_char(chars[*i]) {
        if chars[*i] == '\\' && *i + 1 < chars.len() {
            *i += 1;
        }
        ident.push(chars[*i]);
        *i += 1;
    }
    ident
}

fn read_parenthesized(chars: &[char], i: &mut usize) -> String {
    let mut inner = String::new();
    if *i < chars.len() && chars[*i] == '(' {
        *i += 1;
        while *i < chars.len() && chars[*i] != ')' {
            inner.push(chars[*i]);
            *i += 1;
        }
        *i += 1;
    }
    inner
}

fn read_attribute(chars: &[char], i: &mut usize) -> String {
    while *i < chars.len() && chars[*i].is_whitespace() {
        *i += 1;
    }
    let name = read_ident(chars, i);
    let mut operator = String::new();
    while *i < chars.len() && "^$*~|=".contains(chars[*i]) {
        operator.push(chars[*i]);
        *i += 1;
    }

    let mut value = String::new();
    if *i < chars.len() && (chars[*i] == '"' || chars[*i] == '\'') {
        let quote = chars[*i];
        *i += 1;
        while *i < chars.len() && chars[*i] != quote {
            if chars[*i] == '\\' && *i + 1 < chars.len() {
                *i += 1;
            }
            value.push(chars[*i]);
            *i += 1;
        }
        *i += 1;
    } else {
        while *i < chars.len() && chars[*i] != ']' && !chars[*i].is_whitespace() {
            value.push(chars[*i]);
            *i += 1;
        }
    }
    while *i < chars.len() && chars[*i] != ']' {
        *i += 1;
    }
    *i += 1;

    let literal = xpath_literal(&value);
    match operator.as_str() {
        "" => format!("[@{}]", name),
        "^=" => format!("[starts-with(@{}, {})]", name, literal),
        "*=" => format!("[contains(@{}, {})]", name, literal),
        "~=" => format!(
            "[contains(concat(' ', normalize-space(@{}), ' '), {})]",
            name,
            xpath_literal(&format!(" {} ", value))
        ),
        _ => format!("[@{}={}]", name, literal),
    }
}

/// Confidence and stability assigned to one kind of generated selector
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prior {
    pub confidence: f64,
    pub stability: f64,
}

impl Prior {
    pub const fn new(confidence: f64, stability: f64) -> Self {
        Self { confidence, stability }
    }
}

/// Tunable scoring table for every selector kind the engine produces
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorPriors {
    pub test_id: Prior,
    pub aria_label: Prior,
    pub aria_labelledby: Prior,
    pub role_name: Prior,
    pub css_id: Prior,
    pub css_classes: Prior,
    pub css_attribute: Prior,
    pub css_nth_child: Prior,
    pub xpath_contains: Prior,
    pub xpath_exact: Prior,
    pub xpath_id: Prior,
    pub text_exact: Prior,
    pub text_partial: Prior,
}

impl Default for SelectorPriors {
    fn default() -> Self {
        Self {
            test_id: Prior::new(0.95, 1.0),
            aria_label: Prior::new(0.9, 0.9),
            aria_labelledby: Prior::new(0.85, 0.85),
            role_name: Prior::new(0.8, 0.8),
            css_id: Prior::new(0.92, 0.7),
            css_classes: Prior::new(0.75, 0.6),
            css_attribute: Prior::new(0.7, 0.65),
            css_nth_child: Prior::new(0.5, 0.3),
            xpath_contains: Prior::new(0.75, 0.7),
            xpath_exact: Prior::new(0.8, 0.75),
            xpath_id: Prior::new(0.85, 0.7),
            text_exact: Prior::new(0.7, 0.65),
            text_partial: Prior::new(0.6, 0.55),
        }
    }
}

/// Configuration for [`SelectorEngine`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorEngineConfig {
    /// Strategies to run, in priority order
    pub strategies: Vec<SelectorStrategy>,
    pub min_confidence: f64,
    pub max_candidates_per_strategy: usize,
    pub test_id_attributes: Vec<String>,
    /// Attributes worth pairing with the tag name
    pub meaningful_attributes: Vec<String>,
    pub priors: SelectorPriors,
}

impl Default for SelectorEngineConfig {
    fn default() -> Self {
        Self {
            strategies: vec![
                SelectorStrategy::TestId,
                SelectorStrategy::Aria,
                SelectorStrategy::Css,
                SelectorStrategy::XPath,
                SelectorStrategy::Text,
            ],
            min_confidence: 0.5,
            max_candidates_per_strategy: 3,
            test_id_attributes: ["data-testid", "data-test-id", "data-cy", "data-test"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            meaningful_attributes: ["name", "type", "placeholder", "title", "alt"].iter().map(|s| s.to_string()).collect(),
            priors: SelectorPriors::default(),
        }
    }
}

/// Live page check used to verify generated selectors
#[async_trait]
pub trait SelectorProbe: Send + Sync {
    /// Number of elements the selector currently matches
    async fn count_matches(&self, selector: &Selector) -> Result<usize>;
}

/// Multi-strategy selector generator
#[derive(Debug, Clone, Default)]
pub struct SelectorEngine {
    config: SelectorEngineConfig,
}

impl SelectorEngine {
    pub fn new(config: SelectorEngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SelectorEngineConfig {
        &self.config
    }

    /// Generate candidates for every configured strategy, best `confidence × stability` first
    pub fn generate(&self, element: &ElementInfo) -> Vec<SelectorCandidate> {
        let mut candidates: Vec<SelectorCandidate> = self
            .config
            .strategies
            .iter()
            .flat_map(|strategy| self.generate_for_strategy(element, *strategy))
            .collect();

        candidates.sort_by(|a, b| b.score().partial_cmp(&a.score()).unwrap_or(Ordering::Equal));
        log::debug!("Generated {} selector candidates for <{}>", candidates.len(), element.tag());
        candidates
    }

    /// Generate candidates and verify them against the page, dropping ones that match nothing
    pub async fn generate_verified(&self, element: &ElementInfo, probe: &dyn SelectorProbe) -> Vec<SelectorCandidate> {
        let mut verified = Vec::new();
        for mut candidate in self.generate(element) {
            match probe.count_matches(&candidate.selector).await {
                Ok(0) => log::debug!("Dropping {}: no matches", candidate.selector),
                Ok(count) => {
                    candidate.match_count = Some(count);
                    candidate.is_unique = count == 1;
                    verified.push(candidate);
                }
                Err(e) => {
                    log::debug!("Could not verify {}: {}", candidate.selector, e);
                    verified.push(candidate);
                }
            }
        }
        verified
    }

    /// Candidates from a single strategy, filtered and capped
    pub fn generate_for_strategy(&self, element: &ElementInfo, strategy: SelectorStrategy) -> Vec<SelectorCandidate> {
        let mut candidates = match strategy {
            SelectorStrategy::TestId => self.test_id_selectors(element),
            SelectorStrategy::Aria => self.aria_selectors(element),
            SelectorStrategy::Css => self.css_selectors(element),
            SelectorStrategy::XPath => self.xpath_selectors(element),
            SelectorStrategy::Text => self.text_selectors(element),
            // produced by the visual provider, never from metadata
            SelectorStrategy::Visual => Vec::new(),
        };
        candidates.retain(|c| c.confidence() >= self.config.min_confidence);
        candidates.truncate(self.config.max_candidates_per_strategy);
        candidates
    }

    fn candidate(&self, value: String, strategy: SelectorStrategy, prior: Prior, reason: String) -> SelectorCandidate {
        SelectorCandidate::new(value, strategy, prior.confidence, prior.stability, reason)
    }

    fn test_id_selectors(&self, element: &ElementInfo) -> Vec<SelectorCandidate> {
        self.config
            .test_id_attributes
            .iter()
            .filter_map(|attr| {
                element.get_attribute(attr).map(|value| {
                    self.candidate(
                        format!("[{}=\"{}\"]", attr, escape_css_string(value)),
                        SelectorStrategy::TestId,
                        self.config.priors.test_id,
                        format!("Test ID attribute: {}", attr),
                    )
                    .unique(true)
                })
            })
            .collect()
    }

    fn aria_selectors(&self, element: &ElementInfo) -> Vec<SelectorCandidate> {
        let priors = &self.config.priors;
        let mut candidates = Vec::new();

        if let Some(label) = element.get_attribute("aria-label") {
            candidates.push(
                self.candidate(
                    format!("[aria-label=\"{}\"]", escape_css_string(label)),
                    SelectorStrategy::Aria,
                    priors.aria_label,
                    "ARIA label".to_string(),
                )
                .unique(true),
            );
        }

        if let Some(labelledby) = element.get_attribute("aria-labelledby") {
            candidates.push(
                self.candidate(
                    format!("[aria-labelledby=\"{}\"]", escape_css_string(labelledby)),
                    SelectorStrategy::Aria,
                    priors.aria_labelledby,
                    "ARIA labelledby".to_string(),
                )
                .unique(true),
            );
        }

        if let Some(role) = element.get_attribute("role") {
            let name = match element.get_attribute("aria-label") {
                Some(label) => label.to_string(),
                None => element.text().chars().take(50).collect(),
            };
            if !name.is_empty() {
                candidates.push(
                    self.candidate(
                        format!("[role=\"{}\"][aria-label=\"{}\"]", escape_css_string(role), escape_css_string(&name)),
                        SelectorStrategy::Aria,
                        priors.role_name,
                        format!("Role {} with name", role),
                    )
                    .unique(true),
                );
            }
        }

        candidates
    }

    fn css_selectors(&self, element: &ElementInfo) -> Vec<SelectorCandidate> {
        let priors = &self.config.priors;
        let tag = element.tag();
        let mut candidates = Vec::new();

        if let Some(id) = element.id().filter(|id| !is_generated_id(id)) {
            candidates.push(
                self.candidate(format!("#{}", escape_css_ident(id)), SelectorStrategy::Css, priors.css_id, "Element ID".to_string())
                    .unique(true),
            );
        }

        let classes: Vec<String> =
            element.classes().filter(|c| !is_generated_class(c)).take(3).map(escape_css_ident).collect();
        if !classes.is_empty() {
            candidates.push(self.candidate(
                format!("{}.{}", tag, classes.join(".")),
                SelectorStrategy::Css,
                priors.css_classes,
                "Tag + classes".to_string(),
            ));
        }

        for attr in &self.config.meaningful_attributes {
            if let Some(value) = element.get_attribute(attr) {
                candidates.push(self.candidate(
                    format!("{}[{}=\"{}\"]", tag, attr, escape_css_string(value)),
                    SelectorStrategy::Css,
                    priors.css_attribute,
                    format!("Tag + {} attribute", attr),
                ));
            }
        }

        if let Some(position) = element.get_attribute("data-nth-child") {
            candidates.push(
                self.candidate(
                    format!("{}:nth-child({})", tag, escape_css_ident(position)),
                    SelectorStrategy::Css,
                    priors.css_nth_child,
                    "nth-child position".to_string(),
                )
                .unique(true),
            );
        }

        candidates
    }

    fn xpath_selectors(&self, element: &ElementInfo) -> Vec<SelectorCandidate> {
        let priors = &self.config.priors;
        let tag = element.tag();
        let text = element.text();
        let length = text.chars().count();
        let mut candidates = Vec::new();

        if length > 0 && length < 100 {
            let prefix: String = text.chars().take(50).collect();
            candidates.push(self.candidate(
                format!("//{}[contains(text(), {})]", tag, xpath_literal(&prefix)),
                SelectorStrategy::XPath,
                priors.xpath_contains,
                "Text contains".to_string(),
            ));

            if length < 50 {
                candidates.push(
                    self.candidate(
                        format!("//{}[normalize-space()={}]", tag, xpath_literal(text)),
                        SelectorStrategy::XPath,
                        priors.xpath_exact,
                        "Exact text match".to_string(),
                    )
                    .unique(true),
                );
            }
        }

        if let Some(id) = element.id().filter(|id| !is_generated_id(id)) {
            candidates.push(
                self.candidate(
                    format!("//{}[@id={}]", tag, xpath_literal(id)),
                    SelectorStrategy::XPath,
                    priors.xpath_id,
                    "XPath by ID".to_string(),
                )
                .unique(true),
            );
        }

        candidates
    }

    fn text_selectors(&self, element: &ElementInfo) -> Vec<SelectorCandidate> {
        let priors = &self.config.priors;
        let text = element.text();
        let length = text.chars().count();
        let mut candidates = Vec::new();

        if length > 0 && length < 100 {
            candidates.push(
                self.candidate(
                    format!("text=\"{}\"", escape_css_string(text)),
                    SelectorStrategy::Text,
                    priors.text_exact,
                    "Text content".to_string(),
                )
                .unique(length > 10),
            );

            if length > 20 {
                let partial: String = text.chars().take(30).collect();
                candidates.push(self.candidate(
                    partial_text_locator(&partial),
                    SelectorStrategy::Text,
                    priors.text_partial,
                    "Partial text match".to_string(),
                ));
            }
        }

        candidates
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ResilienceError;

    fn checkout_button() -> ElementInfo {
        ElementInfo::new("button")
            .with_attribute("data-testid", "checkout")
            .with_attribute("id", "checkout-btn")
            .with_attribute("class", "btn css-1x2y3z primary")
            .with_attribute("aria-label", "Proceed to checkout")
            .with_text("Checkout")
    }

    #[test]
    fn test_test_id_outranks_everything() {
        let engine = SelectorEngine::default();
        let candidates = engine.generate(&checkout_button());

        assert_eq!(candidates[0].strategy(), SelectorStrategy::TestId);
        assert_eq!(candidates[0].value(), "[data-testid=\"checkout\"]");
        for other in &candidates[1..] {
            assert!(candidates[0].score() > other.score());
        }
    }

    #[test]
    fn test_candidates_sorted_by_score() {
        let candidates = SelectorEngine::default().generate(&checkout_button());
        assert!(candidates.windows(2).all(|w| w[0].score() >= w[1].score()));
    }

    #[test]
    fn test_generated_identifiers() {
        assert!(is_generated_id(":r12:"));
        assert!(is_generated_id("ember431"));
        assert!(is_generated_id("ng-input-3"));
        assert!(is_generated_id("a3f9c2e1d0"));
        assert!(!is_generated_id("checkout-btn"));

        assert!(is_generated_class("css-1x2y3z"));
        assert!(is_generated_class("sc-button"));
        assert!(is_generated_class("a1"));
        assert!(!is_generated_class("primary"));
    }

    #[test]
    fn test_css_skips_generated_classes_and_ids() {
        let engine = SelectorEngine::default();
        let element = ElementInfo::new("div").with_attribute("id", ":r5:").with_attribute("class", "css-abc123 card _x1");
        let css = engine.generate_for_strategy(&element, SelectorStrategy::Css);

        assert_eq!(css.len(), 1);
        assert_eq!(css[0].value(), "div.card");
    }

    #[test]
    fn test_max_candidates_per_strategy() {
        let engine = SelectorEngine::default();
        let element = ElementInfo::new("input")
            .with_attribute("name", "q")
            .with_attribute("type", "search")
            .with_attribute("placeholder", "Search")
            .with_attribute("title", "Search the site");
        assert_eq!(engine.generate_for_strategy(&element, SelectorStrategy::Css).len(), 3);
    }

    #[test]
    fn test_min_confidence_drops_nth_child() {
        let mut config = SelectorEngineConfig::default();
        config.min_confidence = 0.6;
        let engine = SelectorEngine::new(config);
        let element = ElementInfo::new("li").with_attribute("data-nth-child", "4");
        assert!(engine.generate_for_strategy(&element, SelectorStrategy::Css).is_empty());
    }

    #[test]
    fn test_text_candidates() {
        let engine = SelectorEngine::default();
        let element = ElementInfo::new("a").with_text("Read the full terms and conditions");
        let text = engine.generate_for_strategy(&element, SelectorStrategy::Text);

        assert_eq!(text.len(), 2);
        assert_eq!(text[0].value(), "text=\"Read the full terms and conditions\"");
        assert!(text[0].is_unique);
        assert_eq!(text[1].value(), "text=Read the full terms and condit");
    }

    #[test]
    fn test_quotes_are_escaped() {
        let engine = SelectorEngine::default();
        let element = ElementInfo::new("button").with_attribute("aria-label", "Say \"hi\"").with_text("It's \"on\"");

        let aria = engine.generate_for_strategy(&element, SelectorStrategy::Aria);
        assert_eq!(aria[0].value(), "[aria-label=\"Say \\\"hi\\\"\"]");

        let xpath = engine.generate_for_strategy(&element, SelectorStrategy::XPath);
        assert!(xpath[0].value().contains("concat(\"It's \", '\"', \"on\", '\"', \"\")"));
    }

    #[test]
    fn test_xpath_literal() {
        assert_eq!(xpath_literal("plain"), "\"plain\"");
        assert_eq!(xpath_literal("say \"x\""), "'say \"x\"'");
        assert_eq!(xpath_literal("a'b\"c"), "concat(\"a'b\", '\"', \"c\")");
    }

    #[test]
    fn test_escape_css_ident() {
        assert_eq!(escape_css_ident("user.name"), "user\\.name");
        assert_eq!(escape_css_ident("1st"), "\\31 st");
    }

    #[test]
    fn test_css_to_xpath() {
        assert_eq!(css_to_xpath("#main"), "//*[@id=\"main\"]");
        assert_eq!(
            css_to_xpath("form > input[name=\"email\"]"),
            "//form/input[@name=\"email\"]"
        );
        assert_eq!(
            css_to_xpath("ul.menu li:nth-child(2)"),
            "//ul[contains(concat(' ', normalize-space(@class), ' '), \" menu \")]//li[2]"
        );
        assert_eq!(css_to_xpath("[data-testid^='save']"), "//*[starts-with(@data-testid, \"save\")]");
        assert_eq!(css_to_xpath(""), "//*");
    }

    #[test]
    fn test_text_to_xpath() {
        assert_eq!(text_to_xpath("text=\"Save\""), "//*[normalize-space()=\"Save\"]");
        assert_eq!(text_to_xpath("text=Sav"), "//*[contains(normalize-space(), \"Sav\")]");
    }

    #[test]
    fn test_text_locators_keep_backslashes_and_quotes() {
        let engine = SelectorEngine::default();

        let path = ElementInfo::new("code").with_text(r"C:\Users\me");
        let exact = engine.generate_for_strategy(&path, SelectorStrategy::Text);
        assert_eq!(exact[0].value(), r#"text="C:\\Users\\me""#);
        assert_eq!(parse_text_locator(exact[0].value()), (r"C:\Users\me".to_string(), true));
        assert_eq!(text_to_xpath(exact[0].value()), r#"//*[normalize-space()="C:\Users\me"]"#);

        // long enough for a partial, which must stay a partial despite the quotes
        let quoted = ElementInfo::new("q").with_text(r#""Ship it before the weekend""#);
        let text = engine.generate_for_strategy(&quoted, SelectorStrategy::Text);
        assert_eq!(text.len(), 2);
        assert_eq!(text[1].value(), r#"text=\"Ship it before the weekend""#);
        assert_eq!(parse_text_locator(text[1].value()), (r#""Ship it before the weekend""#.to_string(), false));
        assert_eq!(
            text_to_xpath(text[1].value()),
            r#"//*[contains(normalize-space(), '"Ship it before the weekend"')]"#
        );
        assert_eq!(parse_text_locator(text[0].value()), (r#""Ship it before the weekend""#.to_string(), true));
    }

    struct FixedProbe;

    #[async_trait]
    impl SelectorProbe for FixedProbe {
        async fn count_matches(&self, selector: &Selector) -> Result<usize> {
            match selector.strategy {
                SelectorStrategy::TestId => Ok(1),
                SelectorStrategy::Css => Ok(0),
                SelectorStrategy::Aria => Ok(2),
                _ => Err(ResilienceError::EvaluationFailed("probe offline".to_string())),
            }
        }
    }

    #[tokio::test]
    async fn test_generate_verified() {
        let engine = SelectorEngine::default();
        let candidates = engine.generate_verified(&checkout_button(), &FixedProbe).await;

        assert!(candidates.iter().all(|c| c.strategy() != SelectorStrategy::Css));
        let test_id = candidates.iter().find(|c| c.strategy() == SelectorStrategy::TestId).unwrap();
        assert_eq!(test_id.match_count, Some(1));
        let aria = candidates.iter().find(|c| c.strategy() == SelectorStrategy::Aria).unwrap();
        assert!(!aria.is_unique);
        let text = candidates.iter().find(|c| c.strategy() == SelectorStrategy::Text).unwrap();
        assert_eq!(text.match_count, None);
    }
}
