use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Description of a target element as reported by the browser driver
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ElementInfo {
    /// HTML tag name (e.g., "div", "button", "input")
    pub tag_name: String,

    /// Element attributes (e.g., id, class, data-testid, aria-label)
    #[serde(default)]
    pub attributes: HashMap<String, String>,

    /// Text content of the element
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,

    /// Whether the element is visible in the viewport
    #[serde(default)]
    pub is_visible: bool,

    /// Bounding box information (x, y, width, height)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
}

/// Bounding box coordinates for an element
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct BoundingBox {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ElementInfo {
    /// Create a new ElementInfo
    pub fn new(tag_name: impl Into<String>) -> Self {
        Self { tag_name: tag_name.into(), ..Default::default() }
    }

    /// Builder method: set attributes
    pub fn with_attributes(mut self, attributes: HashMap<String, String>) -> Self {
        self.attributes = attributes;
        self
    }

    /// Builder method: add a single attribute
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Builder method: set text content
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text_content = Some(text.into());
        self
    }

    /// Builder method: set visibility
    pub fn with_visibility(mut self, visible: bool) -> Self {
        self.is_visible = visible;
        self
    }

    /// Builder method: set bounding box
    pub fn with_bounding_box(mut self, x: f64, y: f64, width: f64, height: f64) -> Self {
        self.bounding_box = Some(BoundingBox { x, y, width, height });
        self
    }

    /// Get attribute value by key, ignoring empty values
    pub fn get_attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str).filter(|v| !v.is_empty())
    }

    /// Check if element has a specific class
    pub fn has_class(&self, class_name: &str) -> bool {
        self.classes().any(|c| c == class_name)
    }

    /// Iterate the whitespace separated class list
    pub fn classes(&self) -> impl Iterator<Item = &str> {
        self.get_attribute("class").unwrap_or_default().split_whitespace()
    }

    /// Get element ID
    pub fn id(&self) -> Option<&str> {
        self.get_attribute("id")
    }

    /// Lowercased tag name, as used in generated selectors
    pub fn tag(&self) -> String {
        self.tag_name.to_ascii_lowercase()
    }

    /// Check if element is a specific tag
    pub fn is_tag(&self, tag: &str) -> bool {
        self.tag_name.eq_ignore_ascii_case(tag)
    }

    /// Trimmed text content, empty when absent
    pub fn text(&self) -> &str {
        self.text_content.as_deref().map(str::trim).unwrap_or_default()
    }
}

impl BoundingBox {
    /// Create a new BoundingBox
    pub fn new(x: f64, y: f64, width: f64, height: f64) -> Self {
        Self { x, y, width, height }
    }

    /// Check if the bounding box is visible (has non-zero dimensions)
    pub fn is_visible(&self) -> bool {
        self.width > 0.0 && self.height > 0.0
    }

    /// Calculate the area of the bounding box
    pub fn area(&self) -> f64 {
        self.width * self.height
    }

    /// Center point, used to click at coordinates found by visual identification
    pub fn center(&self) -> (f64, f64) {
        (self.x + self.width / 2.0, self.y + self.height / 2.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_element_info_creation() {
        let element = ElementInfo::new("BUTTON")
            .with_attribute("id", "submit")
            .with_attribute("class", "btn  primary")
            .with_text("  Save changes ")
            .with_visibility(true);

        assert_eq!(element.tag(), "button");
        assert!(element.is_tag("button"));
        assert_eq!(element.id(), Some("submit"));
        assert!(element.has_class("primary"));
        assert!(!element.has_class("btn-primary"));
        assert_eq!(element.text(), "Save changes");
        assert!(element.is_visible);
    }

    #[test]
    fn test_empty_attribute_is_absent() {
        let element = ElementInfo::new("div").with_attribute("id", "");
        assert_eq!(element.id(), None);
        assert_eq!(element.classes().count(), 0);
        assert_eq!(element.text(), "");
    }

    #[test]
    fn test_bounding_box() {
        let bbox = BoundingBox::new(10.0, 20.0, 100.0, 50.0);
        assert!(bbox.is_visible());
        assert_eq!(bbox.area(), 5000.0);
        assert_eq!(bbox.center(), (60.0, 45.0));

        let invisible = BoundingBox::new(0.0, 0.0, 0.0, 10.0);
        assert!(!invisible.is_visible());
    }

    #[test]
    fn test_deserialize_from_driver_json() {
        let json = serde_json::json!({
            "tag_name": "input",
            "attributes": {"name": "email", "type": "email"},
            "is_visible": true
        });
        let element: ElementInfo = serde_json::from_value(json).unwrap();
        assert_eq!(element.get_attribute("name"), Some("email"));
        assert!(element.text_content.is_none());
    }
}
