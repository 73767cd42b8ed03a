//! Element descriptions consumed by selector generation
//!
//! The browser driver reports the target element as an [`ElementInfo`]: tag,
//! attribute map, text content and (optionally) its bounding box.

pub mod element;

pub use element::{BoundingBox, ElementInfo};
