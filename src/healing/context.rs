use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt};

/// What the step was trying to do with the element
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionKind {
    Click,
    Type,
    Select,
    Hover,
    Extract,
    Scroll,
    #[default]
    Other,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ActionKind::Click => "click",
            ActionKind::Type => "type",
            ActionKind::Select => "select",
            ActionKind::Hover => "hover",
            ActionKind::Extract => "extract",
            ActionKind::Scroll => "scroll",
            ActionKind::Other => "other",
        }
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Surroundings of the element a broken locator used to match
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ElementContext {
    pub action: ActionKind,
    /// Visible text on or next to the element
    pub near_text: Option<String>,
    pub expected_tag: Option<String>,
    pub parent_tag: Option<String>,
    pub sibling_tags: Vec<String>,
    pub attributes: IndexMap<String, String>,
}

impl ElementContext {
    pub fn new(action: ActionKind) -> Self {
        Self { action, ..Default::default() }
    }

    pub fn with_near_text(mut self, text: impl Into<String>) -> Self {
        self.near_text = Some(text.into());
        self
    }

    pub fn with_expected_tag(mut self, tag: impl Into<String>) -> Self {
        self.expected_tag = Some(tag.into().to_lowercase());
        self
    }

    pub fn with_parent_tag(mut self, tag: impl Into<String>) -> Self {
        self.parent_tag = Some(tag.into().to_lowercase());
        self
    }

    pub fn with_sibling_tags(mut self, tags: Vec<String>) -> Self {
        self.sibling_tags = tags;
        self
    }

    pub fn with_attribute(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(name.into(), value.into());
        self
    }

    /// Short human-readable key, e.g. `button|click|near:Place order`
    pub fn describe_element(&self) -> String {
        let mut parts = vec![self.expected_tag.clone().unwrap_or_else(|| "element".to_string())];
        parts.push(self.action.to_string());
        if let Some(text) = self.near_text.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
            parts.push(format!("near:{}", text.chars().take(30).collect::<String>()));
        }
        parts.join("|")
    }

    /// Structural fingerprint used to index procedural patterns
    pub fn fingerprint(&self) -> String {
        let mut parts = Vec::new();
        if let Some(text) = &self.near_text {
            let words: Vec<String> = text.split_whitespace().take(3).map(|w| w.to_lowercase()).collect();
            if !words.is_empty() {
                parts.push(format!("text:{}", words.join("_")));
            }
        }
        if let Some(parent) = &self.parent_tag {
            parts.push(format!("parent:{}", parent));
        }
        if !self.sibling_tags.is_empty() {
            let siblings: Vec<&str> = self.sibling_tags.iter().take(3).map(String::as_str).collect();
            parts.push(format!("siblings:{}", siblings.join(",")));
        }
        if !self.attributes.is_empty() {
            let mut keys: Vec<&str> = self.attributes.keys().map(String::as_str).collect();
            keys.sort_unstable();
            keys.truncate(3);
            parts.push(format!("attrs:{}", keys.join(",")));
        }
        parts.join("|")
    }
}

/// Host part of a URL, or the leading path segment for non-URLs
pub fn extract_domain(url: &str) -> String {
    let rest = match url.find("://") {
        Some(idx) => &url[idx + 3..],
        None => return url.split('/').next().unwrap_or_default().to_lowercase(),
    };
    let authority = rest.split(['/', '?', '#']).next().unwrap_or_default();
    let host = authority.rsplit('@').next().unwrap_or_default();
    host.split(':').next().unwrap_or_default().to_lowercase()
}

/// Jaccard similarity of the lowercase word sets of two strings
pub fn word_jaccard(a: &str, b: &str) -> f64 {
    let left: HashSet<String> = a.split_whitespace().map(str::to_lowercase).collect();
    let right: HashSet<String> = b.split_whitespace().map(str::to_lowercase).collect();
    if left.is_empty() && right.is_empty() {
        return 0.0;
    }
    let intersection = left.intersection(&right).count();
    let union = left.union(&right).count();
    intersection as f64 / union as f64
}
