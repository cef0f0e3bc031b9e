use super::settings::Settings;
use super::{ConfigSource, load_config, load_config_from};
use serial_test::serial;
use std::fs;
use std::time::Duration;
use tempfile::TempDir;

const SAMPLE: &str = r#"
base_url = "http://gateway.local:8400/app/"

[logging]
level = "debug"

[agent]
resubscribe_attempts = 2

[channels.primary]
uri = "ws://primary:2037/messages"
failover_uris = ["ws://backup:2037/messages"]
connect_timeout_secs = 5
login_after_disconnect = true

[channels.polling]
uri = "messages/poll"
small_messages = true

[destinations.quotes]
channels = ["primary", "polling", "missing"]
clustered = true
heartbeat_interval_ms = 30000
"#;

fn write_sample() -> (TempDir, String) {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("session.toml");
    fs::write(&path, SAMPLE).unwrap();
    let path = path.to_str().unwrap().to_string();
    (dir, path)
}

#[test]
fn test_default_settings() {
    let settings = Settings::default();
    assert_eq!(settings.logging.level, "info");
    assert_eq!(settings.agent.request_timeout_secs, 0);
    assert_eq!(settings.agent.resubscribe_attempts, 5);
    assert_eq!(settings.agent.resubscribe_interval(), Duration::from_millis(5000));
    assert_eq!(settings.agent.reconnect_attempts, 0);
    assert!(settings.channels.is_empty());
    assert!(settings.destination("quotes").is_none());
}

#[test]
#[serial]
fn test_load_config_without_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    let missing = dir.path().join("absent");
    let settings = load_config_from(missing.to_str().unwrap()).unwrap();
    assert_eq!(settings.logging.level, "info");
    assert_eq!(settings.agent.resubscribe_attempts, 5);
}

#[test]
#[serial]
fn test_file_values_override_defaults() {
    let (_dir, path) = write_sample();
    let settings = load_config_from(&path).unwrap();

    assert_eq!(settings.logging.level, "debug");
    assert_eq!(settings.agent.resubscribe_attempts, 2);
    assert_eq!(settings.agent.reconnect_interval_ms, 5000);
    assert_eq!(settings.base_url.as_deref(), Some("http://gateway.local:8400/app/"));
    assert_eq!(settings.channels["primary"].connect_timeout_secs, 5);
}

#[test]
#[serial]
fn test_destination_resolves_channels_in_order() {
    let (_dir, path) = write_sample();
    let settings = load_config_from(&path).unwrap();

    let destination = settings.destination("quotes").unwrap();
    let ids: Vec<_> = destination.channels.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(ids, vec!["primary", "polling"]);
    assert!(destination.clustered);
    assert_eq!(destination.heartbeat_interval, Duration::from_secs(30));

    let primary = &destination.channels[0];
    assert_eq!(primary.failover_uris, vec!["ws://backup:2037/messages".to_string()]);
    assert_eq!(primary.connect_timeout, Duration::from_secs(5));
    assert!(primary.login_after_disconnect);
    assert!(destination.channels[1].small_messages);
}

#[test]
#[serial]
fn test_environment_overrides_file() {
    let (_dir, path) = write_sample();
    temp_env::with_vars(
        [
            ("MSGSESSION_LOGGING__LEVEL", Some("warn")),
            ("MSGSESSION_AGENT__RECONNECT_ATTEMPTS", Some("-1")),
        ],
        || {
            let settings = load_config_from(&path).unwrap();
            assert_eq!(settings.logging.level, "warn");
            assert_eq!(settings.agent.reconnect_attempts, -1);
            assert_eq!(settings.agent.resubscribe_attempts, 2);
        },
    );
}

#[test]
#[serial]
fn test_load_config_reads_default_location() {
    let dir = TempDir::new().unwrap();
    fs::create_dir(dir.path().join("config")).unwrap();
    fs::write(
        dir.path().join("config").join("default.toml"),
        "[agent]\nrequest_timeout_secs = 9\n",
    )
    .unwrap();
    let previous = std::env::current_dir().unwrap();
    std::env::set_current_dir(dir.path()).unwrap();
    let loaded = load_config();
    std::env::set_current_dir(previous).unwrap();

    assert_eq!(loaded.unwrap().agent.request_timeout_secs, 9);
}
