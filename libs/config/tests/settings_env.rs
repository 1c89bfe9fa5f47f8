//! Environment overrides, isolated by a prefix no other test uses

use relay_config::Settings;
use std::fs;

#[test]
fn environment_overrides_file_values() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("conduit.toml");
    fs::write(&path, "log_level = \"warn\"\nchannel_capacity = 8\n").unwrap();

    std::env::set_var("CONDUITENVTEST_LOG_LEVEL", "trace");
    std::env::set_var("CONDUITENVTEST_LOG_JSON", "true");

    let settings = Settings::load_with_prefix(Some(&path), "CONDUITENVTEST").unwrap();

    std::env::remove_var("CONDUITENVTEST_LOG_LEVEL");
    std::env::remove_var("CONDUITENVTEST_LOG_JSON");

    assert_eq!(settings.log_level, "trace");
    assert!(settings.log_json);
    assert_eq!(settings.channel_capacity, 8);
}
