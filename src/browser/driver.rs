//! [`BrowserSession`] as the driver behind missions and healing
//!
//! headless_chrome is blocking, so every call runs on the blocking pool with
//! its own handle to the active tab.

use crate::browser::session::{BrowserSession, normalize_url};
use crate::error::{ResilienceError, Result};
use crate::mission::{ActionType, MissionAction, StepDriver};
use crate::selector::{Selector, SelectorProbe, SelectorStrategy, text_to_xpath};
use crate::visual::{ScreenshotSource, parse_coords};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::{Element, Tab};
use serde_json::Value;
use std::time::Duration;

async fn run_blocking<F, T>(f: F) -> Result<T>
where
    F: FnOnce() -> Result<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ResilienceError::EvaluationFailed(format!("Driver task failed: {}", e)))?
}

/// JavaScript expression yielding every element the selector matches
pub fn query_script(selector: &Selector) -> Result<String> {
    let literal = |s: &str| serde_json::to_string(s);
    let xpath_all = |xpath: &str| -> Result<String> {
        Ok(format!(
            "(() => {{ const r = document.evaluate({}, document, null, XPathResult.ORDERED_NODE_SNAPSHOT_TYPE, null); \
             return Array.from({{ length: r.snapshotLength }}, (_, i) => r.snapshotItem(i)); }})()",
            literal(xpath)?
        ))
    };

    match selector.strategy {
        SelectorStrategy::TestId | SelectorStrategy::Aria | SelectorStrategy::Css => {
            Ok(format!("Array.from(document.querySelectorAll({}))", literal(&selector.value)?))
        }
        SelectorStrategy::XPath => xpath_all(&selector.value),
        SelectorStrategy::Text => xpath_all(&text_to_xpath(&selector.value)),
        SelectorStrategy::Visual => {
            let b = parse_coords(&selector.value)?;
            let (x, y) = (b.x + b.width / 2.0, b.y + b.height / 2.0);
            Ok(format!("[document.elementFromPoint({}, {})].filter(Boolean)", x, y))
        }
    }
}

/// Wrap a per-element body; resolves to `null` when nothing matches
fn on_first(selector: &Selector, body: &str) -> Result<String> {
    Ok(format!(
        "(() => {{ const el = ({})[0]; if (!el) return null; {} }})()",
        query_script(selector)?,
        body
    ))
}

fn evaluate(tab: &Tab, script: &str) -> Result<Option<Value>> {
    tab.evaluate(script, false)
        .map(|remote| remote.value)
        .map_err(|e| ResilienceError::EvaluationFailed(e.to_string()))
}

fn find<'a>(tab: &'a Tab, selector: &Selector) -> Result<Element<'a>> {
    let found = match selector.strategy {
        SelectorStrategy::XPath => tab.find_element_by_xpath(&selector.value),
        SelectorStrategy::Text => tab.find_element_by_xpath(&text_to_xpath(&selector.value)),
        SelectorStrategy::Visual => return Err(ResilienceError::UnsupportedStrategy("visual".to_string())),
        _ => tab.find_element(&selector.value),
    };
    found.map_err(|e| ResilienceError::ElementNotFound(format!("Element '{}' not found: {}", selector.value, e)))
}

/// Run `body` on the first match through JavaScript, failing with not-found when there is none
fn run_on_first(tab: &Tab, selector: &Selector, body: &str) -> Result<Value> {
    evaluate(tab, &on_first(selector, body)?)?
        .filter(|v| !v.is_null())
        .ok_or_else(|| ResilienceError::ElementNotFound(selector.value.clone()))
}

fn perform_on(tab: &Tab, action: &MissionAction, selector: Option<&Selector>) -> Result<Option<Value>> {
    let step = action.label();
    let failed = |e: anyhow::Error| ResilienceError::StepFailed { step: step.clone(), reason: e.to_string() };
    let target = || {
        selector
            .or(action.selector.as_ref())
            .ok_or_else(|| ResilienceError::StepFailed { step: step.clone(), reason: "no selector".to_string() })
    };
    let value = action.value.clone().unwrap_or_default();

    match action.kind {
        ActionType::Navigate => {
            let url = normalize_url(&value);
            tab.navigate_to(&url)
                .and_then(|tab| tab.wait_until_navigated())
                .map_err(|e| ResilienceError::NavigationFailed(format!("Failed to navigate to {}: {}", url, e)))?;
            Ok(None)
        }
        ActionType::Wait => Ok(None),
        ActionType::Scroll => match selector.or(action.selector.as_ref()) {
            Some(selector) => run_on_first(tab, selector, "el.scrollIntoView({block: 'center'}); return true;").map(|_| None),
            None => evaluate(tab, "window.scrollBy(0, window.innerHeight); true").map(|_| None),
        },
        ActionType::Click => {
            let selector = target()?;
            if selector.strategy == SelectorStrategy::Visual {
                run_on_first(tab, selector, "el.click(); return true;")?;
            } else {
                find(tab, selector)?.click().map_err(failed)?;
            }
            Ok(None)
        }
        ActionType::Type => {
            let selector = target()?;
            if selector.strategy == SelectorStrategy::Visual {
                run_on_first(tab, selector, "el.focus(); return true;")?;
                tab.send_character(&value).map_err(failed)?;
            } else {
                find(tab, selector)?.type_into(&value).map_err(failed)?;
            }
            Ok(None)
        }
        ActionType::Hover => {
            find(tab, target()?)?.move_mouse_over().map_err(failed)?;
            Ok(None)
        }
        ActionType::Select => {
            let body = format!(
                "el.value = {}; el.dispatchEvent(new Event('input', {{bubbles: true}})); \
                 el.dispatchEvent(new Event('change', {{bubbles: true}})); return true;",
                serde_json::to_string(&value)?
            );
            run_on_first(tab, target()?, &body)?;
            Ok(None)
        }
        ActionType::Extract => {
            let text = run_on_first(tab, target()?, "return (el.innerText ?? el.textContent ?? '').trim();")?;
            Ok(Some(text))
        }
    }
}

fn verify_on(tab: &Tab, action: &MissionAction, selector: &Selector) -> Result<bool> {
    match action.kind {
        ActionType::Type | ActionType::Select => {
            let expected = action.value.clone().unwrap_or_default();
            let actual = run_on_first(tab, selector, "return String(el.value ?? el.textContent ?? '');")?;
            Ok(actual.as_str().is_some_and(|v| v.contains(&expected)))
        }
        _ => Ok(true),
    }
}

#[async_trait]
impl SelectorProbe for BrowserSession {
    async fn count_matches(&self, selector: &Selector) -> Result<usize> {
        let script = format!("(() => {{ try {{ return ({}).length; }} catch (e) {{ return -1; }} }})()", query_script(selector)?);
        let session = self.clone();
        let value = selector.value.clone();
        run_blocking(move || {
            let tab = session.tab()?;
            let count = evaluate(&tab, &script)?.and_then(|v| v.as_i64()).unwrap_or(-1);
            usize::try_from(count)
                .map_err(|_| ResilienceError::EvaluationFailed(format!("Invalid selector '{}'", value)))
        })
        .await
    }
}

#[async_trait]
impl StepDriver for BrowserSession {
    async fn perform(&self, action: &MissionAction, selector: Option<&Selector>) -> Result<Option<Value>> {
        if action.kind == ActionType::Wait {
            let ms = action.value.as_deref().and_then(|v| v.parse().ok()).unwrap_or(0);
            tokio::time::sleep(Duration::from_millis(ms)).await;
            return Ok(None);
        }

        let session = self.clone();
        let action = action.clone();
        let selector = selector.cloned();
        run_blocking(move || {
            let tab = session.tab()?;
            perform_on(&tab, &action, selector.as_ref())
        })
        .await
    }

    async fn verify(&self, action: &MissionAction, _output: Option<&Value>) -> Result<bool> {
        let Some(selector) = action.selector.clone() else {
            return Ok(true);
        };
        let session = self.clone();
        let action = action.clone();
        run_blocking(move || {
            let tab = session.tab()?;
            verify_on(&tab, &action, &selector)
        })
        .await
    }

    async fn current_url(&self) -> Result<String> {
        let session = self.clone();
        run_blocking(move || session.current_url()).await
    }
}

#[async_trait]
impl ScreenshotSource for BrowserSession {
    async fn screenshot(&self) -> Result<Vec<u8>> {
        let session = self.clone();
        run_blocking(move || {
            session
                .tab()?
                .capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
                .map_err(|e| ResilienceError::EvaluationFailed(format!("Screenshot failed: {}", e)))
        })
        .await
    }
}
