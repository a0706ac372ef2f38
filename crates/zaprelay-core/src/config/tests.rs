use super::*;
use std::collections::HashMap;

#[test]
fn test_defaults_when_sections_missing() {
    let cfg: Config = toml::from_str("").unwrap();
    assert_eq!(cfg.relay.name, "zaprelay");
    assert_eq!(cfg.queue.batch_size, 10);
    assert_eq!(cfg.queue.max_attempts, 3);
    assert_eq!(cfg.flows.max_nodes, 20);
    assert_eq!(cfg.flows.max_delay_secs, 10);
    assert_eq!(cfg.api.port, 8080);
    assert!(cfg.flows.intents.contains(&"agendamento".to_string()));
}

#[test]
fn test_partial_section_keeps_field_defaults() {
    let toml_str = r#"
        [queue]
        max_attempts = 5

        [flows]
        intents = ["vendas", "suporte"]
    "#;
    let cfg: Config = toml::from_str(toml_str).unwrap();
    assert_eq!(cfg.queue.max_attempts, 5);
    assert_eq!(cfg.queue.batch_size, 10);
    assert_eq!(cfg.flows.intents, vec!["vendas", "suporte"]);
    assert_eq!(cfg.flows.anti_loop_secs, 5);
}

#[test]
fn test_refresh_buffer_is_clamped() {
    let mut crm = CrmConfig::default();
    assert_eq!(crm.refresh_buffer(), 600);
    crm.refresh_buffer_secs = 30;
    assert_eq!(crm.refresh_buffer(), 300);
    crm.refresh_buffer_secs = 3600;
    assert_eq!(crm.refresh_buffer(), 600);
}

#[test]
fn test_env_overrides_win_over_file() {
    let mut cfg: Config = toml::from_str(
        r#"
        [crm]
        client_id = "from-file"
        client_secret = "file-secret"
    "#,
    )
    .unwrap();

    let env: HashMap<&str, &str> = [("CRM_CLIENT_ID", "from-env"), ("OPENAI_API_KEY", "  ")]
        .into_iter()
        .collect();
    apply_overrides(&mut cfg, |k| env.get(k).map(|v| v.to_string()));

    assert_eq!(cfg.crm.client_id, "from-env");
    assert_eq!(cfg.crm.client_secret, "file-secret");
    // Blank values never clobber the file.
    assert!(cfg.ai.api_key.is_empty());
}

#[test]
fn test_load_missing_file_returns_defaults() {
    let cfg = load("/nonexistent/__zaprelay_config__.toml").unwrap();
    assert_eq!(cfg.store.db_path, "~/.zaprelay/data/relay.db");
}

#[test]
fn test_load_rejects_invalid_toml() {
    let dir = tempfile_dir("__zaprelay_bad_config__");
    let path = dir.join("config.toml");
    std::fs::write(&path, "[queue\nbatch_size = ").unwrap();
    let err = load(path.to_str().unwrap()).unwrap_err();
    assert!(err.to_string().contains("failed to parse config"));
    let _ = std::fs::remove_dir_all(&dir);
}

fn tempfile_dir(name: &str) -> std::path::PathBuf {
    let dir = std::env::temp_dir().join(format!("{name}{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).unwrap();
    dir
}
