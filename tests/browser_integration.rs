use browser_heal::healing::{
    CragEngine, DriftDetector, HealingMemory, HealingOrchestrator, ProbeExecutor, SelfHealer,
};
use browser_heal::mission::{MissionAction, MissionConfig, MissionControl, MissionRunner, MissionState, MissionStateMachine};
use browser_heal::resilience::{CircuitBreakerConfig, CircuitBreakerRegistry};
use browser_heal::visual::PixelDiffEngine;
use browser_heal::{BrowserSession, ElementInfo, LaunchOptions, ScreenshotSource, Selector, SelectorEngine};
use std::sync::Arc;

fn page(html: &str) -> String {
    format!("data:text/html,{}", urlencoding::encode(html))
}

fn launch() -> Arc<BrowserSession> {
    Arc::new(BrowserSession::launch(LaunchOptions::new().headless(true)).expect("Failed to launch browser"))
}

fn healer(session: &Arc<BrowserSession>) -> Arc<SelfHealer> {
    let orchestrator = HealingOrchestrator::builder().dom_executor(Arc::new(ProbeExecutor::new(session.clone()))).build();
    Arc::new(
        SelfHealer::new(
            SelectorEngine::default(),
            Arc::new(HealingMemory::default()),
            Arc::new(DriftDetector::default()),
            Arc::new(CragEngine::default()),
            Arc::new(orchestrator),
        )
        .with_probe(session.clone()),
    )
}

#[tokio::test(flavor = "multi_thread")]
#[ignore] // Requires Chrome to be installed
async fn test_mission_heals_renamed_button() {
    let session = launch();
    let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig::default());
    let runner = MissionRunner::new(session.clone(), healer(&session), breakers.get("driver"));

    // the button was #submit-old when the mission was recorded
    let html = r#"<form><input name="email"><button data-testid="submit" onclick="document.title='sent'; return false">Send</button></form>"#;
    let mut mission = MissionStateMachine::create(MissionConfig::default());
    mission.initialize(vec![
        MissionAction::navigate(page(html)),
        MissionAction::type_text(Selector::css("input[name=\"email\"]"), "someone@example.com"),
        MissionAction::click(Selector::css("#submit-old"))
            .with_element(ElementInfo::new("button").with_attribute("data-testid", "submit").with_text("Send")),
    ]);

    let progress = runner.run(&mut mission, &MissionControl::new()).await.expect("mission failed");

    assert_eq!(progress.state, MissionState::Completed);
    let step = &mission.steps()[2];
    let result = step.result.clone().unwrap();
    assert!(result.healed);
    assert_eq!(result.selector_used.unwrap().value, "[data-testid=\"submit\"]");
    assert_eq!(session.tab().unwrap().get_title().unwrap(), "sent");
}

#[tokio::test(flavor = "multi_thread")]
#[ignore]
async fn test_screenshots_diff_after_change() {
    let session = launch();
    session.navigate(&page(r#"<body style="margin:0;background:#fff"><div id="box"></div></body>"#)).unwrap();
    let before = session.screenshot().await.unwrap();

    session
        .tab()
        .unwrap()
        .evaluate(
            "document.getElementById('box').style.cssText = 'width:200px;height:200px;background:#000'",
            false,
        )
        .unwrap();
    let after = session.screenshot().await.unwrap();

    let diff = PixelDiffEngine::default().compare(&before, &after).unwrap();
    assert!(diff.changed);
    let region = diff.largest_region().unwrap();
    assert!(region.pixel_count >= 200 * 200);
}
