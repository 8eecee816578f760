// tests/shipped_config.rs
//
// The sample files under config/ must stay loadable.

use std::path::Path;
use std::time::Duration;

use ephemeral_recorder::config::Settings;
use ephemeral_recorder::monitor::PollStrategy;
use ephemeral_recorder::target::load_targets;
use ephemeral_recorder::{ItemKind, Priority};

#[test]
fn sample_settings_parse_with_defaults_intact() {
    let s = Settings::load_from_file("config/settings.toml").expect("load sample settings");
    assert_eq!(
        s.check_interval(),
        (Duration::from_secs(60), Duration::from_secs(120))
    );
    let mc = s.monitor_config();
    assert_eq!(mc.strategy, PollStrategy::Aggregate);
    assert_eq!(mc.kinds, vec![ItemKind::Broadcast, ItemKind::Story]);
    let cc = s.capture_config();
    assert_eq!(cc.max_concurrent, 3);
    assert_eq!(cc.max_attempts, 3);
    assert_eq!(s.ledger.horizon_hours, 24);
    assert!(s.server.enabled);
}

#[tokio::test]
async fn sample_targets_load_in_file_order() {
    let targets = load_targets(Path::new("config/targets.json"))
        .await
        .expect("load sample targets");
    let ids: Vec<&str> = targets.iter().map(|t| t.id.as_str()).collect();
    assert_eq!(ids, vec!["example_account", "another.account", "third_account"]);
    assert_eq!(targets[0].priority, Priority::High);
    assert_eq!(targets[0].display_name, "Example");
    assert!(targets.iter().all(|t| t.enabled && !t.is_resolved()));
}
