//! Chrome adapter over `headless_chrome`
//!
//! [`BrowserSession`] implements [`SelectorProbe`](crate::selector::SelectorProbe),
//! [`StepDriver`](crate::mission::StepDriver) and
//! [`ScreenshotSource`](crate::visual::ScreenshotSource), so one session can back
//! the mission runner, selector verification and the cheap healing strategies
//! (through [`ProbeExecutor`](crate::healing::ProbeExecutor)).

pub mod config;
pub mod driver;
pub mod session;

pub use config::{ConnectionOptions, LaunchOptions};
pub use driver::query_script;
pub use session::{BrowserSession, normalize_url};
