//! Multi-strategy selector generation
//!
//! Candidates are produced independently by the test-id, ARIA, CSS, XPath and text
//! strategies and ranked by `confidence × stability`. Visual selectors only come
//! from the external visual provider during healing.

pub mod engine;
pub mod types;

pub use engine::{
    Prior, SelectorEngine, SelectorEngineConfig, SelectorPriors, SelectorProbe, css_to_xpath, escape_css_ident,
    escape_css_string, is_generated_class, is_generated_id, parse_text_locator, partial_text_locator, text_to_xpath,
    xpath_literal,
};
pub use types::{Selector, SelectorCandidate, SelectorStrategy};
