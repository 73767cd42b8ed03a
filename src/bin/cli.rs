//! browser-heal command line
//!
//! Inspection tools for the resilience core: rank locators for an element,
//! print retry schedules, diff screenshots, and heal a broken selector against
//! a live page.

use anyhow::{Context, bail};
use browser_heal::browser::{BrowserSession, LaunchOptions};
use browser_heal::healing::{
    CragEngine, DriftDetector, HealRequest, HealingMemory, HealingOrchestrator, ProbeExecutor, SelfHealer,
    StrategyAttempt,
};
use browser_heal::mission::{ActionType, MissionAction};
use browser_heal::resilience::{RetryEngine, RetryPreset};
use browser_heal::selector::{Selector, SelectorEngine, SelectorStrategy};
use browser_heal::visual::{PixelDiffConfig, PixelDiffEngine};
use browser_heal::{ElementInfo, SelectorProbe};
use clap::{Parser, Subcommand, ValueEnum};
use std::{
    path::{Path, PathBuf},
    sync::Arc,
};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "browser-heal")]
#[command(version)]
#[command(about = "Self-healing selector and resilience toolkit", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Rank locators for an element description (JSON file, `-` for stdin)
    Selectors {
        element: PathBuf,

        /// Print candidates as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the backoff schedule of a retry preset
    Backoff {
        #[arg(default_value = "dom")]
        preset: RetryPreset,

        /// Disable jitter to show the deterministic schedule
        #[arg(long)]
        no_jitter: bool,
    },

    /// Pixel-diff two screenshots
    Diff {
        before: PathBuf,
        after: PathBuf,

        /// Colour distance tolerance in 0..=1
        #[arg(long, default_value = "0.1")]
        threshold: f64,

        /// Write the before image with changes highlighted
        #[arg(long, value_name = "PNG")]
        highlight: Option<PathBuf>,
    },

    /// Open a page and heal a broken selector
    Heal {
        #[arg(long)]
        url: String,

        /// The locator that stopped working
        #[arg(long)]
        selector: String,

        /// Last known description of the target element (JSON file)
        #[arg(long)]
        element: PathBuf,

        #[arg(long, value_enum, default_value = "click")]
        action: Action,

        /// Healing memory to load before and save after
        #[arg(long, value_name = "JSON")]
        memory: Option<PathBuf>,

        /// Launch browser in headed mode (default: headless)
        #[arg(long, short = 'H')]
        headed: bool,
    },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Action {
    Click,
    Type,
    Select,
    Hover,
    Extract,
}

impl From<Action> for ActionType {
    fn from(action: Action) -> Self {
        match action {
            Action::Click => ActionType::Click,
            Action::Type => ActionType::Type,
            Action::Select => ActionType::Select,
            Action::Hover => ActionType::Hover,
            Action::Extract => ActionType::Extract,
        }
    }
}

fn read_element(path: &Path) -> anyhow::Result<ElementInfo> {
    let raw = if path.as_os_str() == "-" {
        std::io::read_to_string(std::io::stdin())?
    } else {
        std::fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))?
    };
    serde_json::from_str(&raw).context("Element description is not valid JSON")
}

fn selectors(element: PathBuf, json: bool) -> anyhow::Result<()> {
    let candidates = SelectorEngine::default().generate(&read_element(&element)?);
    if json {
        println!("{}", serde_json::to_string_pretty(&candidates)?);
        return Ok(());
    }
    if candidates.is_empty() {
        bail!("No usable locator for this element");
    }
    for (rank, candidate) in candidates.iter().enumerate() {
        println!(
            "{:>2}. [{:<6}] {:.3}  {}  ({})",
            rank + 1,
            candidate.strategy().as_str(),
            candidate.score(),
            candidate.value(),
            candidate.reason
        );
    }
    Ok(())
}

fn backoff(preset: RetryPreset, no_jitter: bool) {
    let mut config = preset.config();
    if no_jitter {
        config.enable_jitter = false;
    }
    let engine = RetryEngine::new(config);
    let config = engine.config();

    println!("Preset: {} ({} attempts, {}ms per attempt)", preset, config.max_attempts, config.timeout_per_attempt_ms);
    for (retry, delay) in engine.delay_sequence().iter().enumerate() {
        println!("  before attempt {}: {}ms", retry + 2, delay);
    }
    println!("Worst case: {}ms", engine.max_duration().as_millis());
}

fn diff(before: PathBuf, after: PathBuf, threshold: f64, highlight: Option<PathBuf>) -> anyhow::Result<()> {
    let before_bytes = std::fs::read(&before).with_context(|| format!("Failed to read {}", before.display()))?;
    let after_bytes = std::fs::read(&after).with_context(|| format!("Failed to read {}", after.display()))?;

    let engine = PixelDiffEngine::new(PixelDiffConfig { threshold, ..Default::default() });
    let result = engine.compare(&before_bytes, &after_bytes)?;

    println!(
        "{} of {} pixels changed ({:.2}%){}",
        result.diff_pixels,
        result.total_pixels,
        result.change_percentage,
        if engine.has_significant_change(&result) { ", significant" } else { "" }
    );
    for region in &result.regions {
        let b = region.bounds;
        println!(
            "  {}x{} at ({}, {}): {} pixels, {:.0}% dense",
            b.width, b.height, b.x, b.y, region.pixel_count, region.change_intensity
        );
    }

    if let Some(path) = highlight {
        std::fs::write(&path, engine.highlight(&before_bytes, &result)?)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        println!("Highlighted diff written to {}", path.display());
    }
    Ok(())
}

async fn heal(
    url: String,
    selector: String,
    element: PathBuf,
    action: Action,
    memory_path: Option<PathBuf>,
    headed: bool,
) -> anyhow::Result<()> {
    let element = read_element(&element)?;
    let broken = Selector::new(selector, SelectorStrategy::Css, 1.0);
    let context = MissionAction::new(action.into()).with_selector(broken.clone()).with_element(element.clone()).element_context();

    let session = Arc::new(BrowserSession::launch(LaunchOptions::new().headless(!headed))?);
    session.navigate(&url)?;

    let matches = session.count_matches(&broken).await.unwrap_or(0);
    if matches > 0 {
        println!("'{}' still matches {} element(s), nothing to heal", broken.value, matches);
        return Ok(());
    }

    let memory = Arc::new(HealingMemory::default());
    if let Some(path) = memory_path.as_ref().filter(|p| p.exists()) {
        memory.import_json(&std::fs::read_to_string(path)?)?;
    }

    let orchestrator = HealingOrchestrator::builder().dom_executor(Arc::new(ProbeExecutor::new(session.clone()))).build();
    orchestrator.on_attempt(Arc::new(|attempt: &StrategyAttempt| {
        eprintln!(
            "  {:<6} {} in {}ms",
            attempt.strategy.as_str(),
            if attempt.success { "ok" } else { "failed" },
            attempt.duration_ms
        );
    }));

    let healer = SelfHealer::new(
        SelectorEngine::default(),
        memory.clone(),
        Arc::new(DriftDetector::default()),
        Arc::new(CragEngine::default()),
        Arc::new(orchestrator),
    )
    .with_probe(session.clone());

    let request = HealRequest::new(broken, context, session.current_url()?).with_element(element);
    let healed = healer.heal(&request, &CancellationToken::new()).await?;
    println!("{}", serde_json::to_string_pretty(&healed)?);

    if let Some(path) = memory_path {
        std::fs::write(&path, memory.export_json()?).with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(())
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Selectors { element, json } => selectors(element, json),
        Command::Backoff { preset, no_jitter } => {
            backoff(preset, no_jitter);
            Ok(())
        }
        Command::Diff { before, after, threshold, highlight } => diff(before, after, threshold, highlight),
        Command::Heal { url, selector, element, action, memory, headed } => {
            heal(url, selector, element, action, memory, headed).await
        }
    }
}
