use super::data::{path_display, Config, McpServerConfig, ProviderSettings};
use super::io::ConfigError;
use crate::core::providers::ProviderKind;
use crate::core::registry::{ModelEntry, ModelRegistry, ProviderCapability};
use chrono::NaiveDate;
use std::time::Duration;
use tempfile::TempDir;

#[test]
fn test_load_nonexistent_config() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("nonexistent_config.toml");

    let config = Config::load_from_path(&config_path).expect("Failed to load config");

    assert_eq!(config, Config::default());
    assert_eq!(config.max_tool_iterations(), 25);
    assert_eq!(config.tool_timeout(), Duration::from_secs(60));
}

#[test]
fn test_config_persistence_lifecycle() {
    let temp_dir = TempDir::new().expect("Failed to create temp directory");
    let config_path = temp_dir.path().join("nested").join("config.toml");

    let mut config = Config {
        preferred_model: Some("claude-sonnet-4-5".to_string()),
        tool_timeout_secs: Some(5),
        ..Default::default()
    };
    config.providers.insert(
        "ollama".to_string(),
        ProviderSettings {
            base_url: Some("http://gpu-box:11434".to_string()),
        },
    );
    config.mcp_servers.insert(
        "calc".to_string(),
        McpServerConfig::stdio("calc-server", vec!["--quiet".to_string()])
            .with_allowed_tools(["add"]),
    );
    config
        .save_to_path(&config_path)
        .expect("Failed to save config");

    let loaded = Config::load_from_path(&config_path).expect("Failed to load config");
    assert_eq!(loaded, config);
    assert_eq!(
        loaded.provider_base_url(ProviderKind::Ollama),
        Some("http://gpu-box:11434")
    );
    assert_eq!(loaded.provider_base_url(ProviderKind::OpenAi), None);
    assert_eq!(loaded.tool_timeout(), Duration::from_secs(5));

    let mut updated = loaded;
    updated.last_used_model = Some("gpt-4o".to_string());
    updated.preferred_model = None;
    updated.save_to_path(&config_path).expect("Failed to resave");
    let reloaded = Config::load_from_path(&config_path).expect("Failed to reload");
    assert_eq!(reloaded.last_used_model.as_deref(), Some("gpt-4o"));
    assert_eq!(reloaded.preferred_model, None);
}

#[test]
fn parses_documented_layout() {
    let toml = r#"
        preferred_model = "llama3.1:8b"
        custom_system_prompt = "Answer in French."
        max_tool_iterations = 10

        [providers.watsonx]
        base_url = "https://eu-de.ml.cloud.ibm.com"

        [[models]]
        id = "llava:13b"
        provider = "ollama"
        supports_images = true
        context_length = 4096

        [mcp_servers.search]
        url = "http://localhost:8931/mcp"
        allowed_tools = ["web_search"]

        [mcp_servers.files]
        command = "mcp-files"
        args = ["/tmp"]
        enabled = false
    "#;
    let config: Config = toml::from_str(toml).expect("parse");
    config.validate().expect("valid");

    assert_eq!(config.max_tool_iterations(), 10);
    assert_eq!(config.models[0].provider, ProviderKind::Ollama);
    assert!(config.models[0].supports_images);
    assert!(!config.models[0].supports_tools);
    let enabled: Vec<_> = config.enabled_mcp_servers().map(|(id, _)| id.as_str()).collect();
    assert_eq!(enabled, vec!["search"]);
    assert_eq!(
        config.mcp_servers["search"].allowed_tools.as_deref(),
        Some(&["web_search".to_string()][..])
    );
}

#[test]
fn invalid_tool_server_entries_are_rejected() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    std::fs::write(
        &config_path,
        "[mcp_servers.broken]\ncommand = \"x\"\nurl = \"http://localhost\"\n",
    )
    .unwrap();

    match Config::load_from_path(&config_path) {
        Err(ConfigError::InvalidToolServer { id, .. }) => assert_eq!(id, "broken"),
        other => panic!("expected invalid tool server, got {other:?}"),
    }

    let empty = Config {
        mcp_servers: [("empty".to_string(), McpServerConfig::default())].into(),
        ..Default::default()
    };
    assert!(matches!(
        empty.validate(),
        Err(ConfigError::InvalidToolServer { .. })
    ));
}

#[test]
fn malformed_toml_reports_parse_error_with_path() {
    let temp_dir = TempDir::new().unwrap();
    let config_path = temp_dir.path().join("config.toml");
    std::fs::write(&config_path, "preferred_model = [").unwrap();

    let err = Config::load_from_path(&config_path).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
    assert!(err.to_string().contains("config.toml"));
}

#[test]
fn model_selection_order() {
    let registry = ModelRegistry::from_entries([
        ModelEntry::new("claude-sonnet-4-5", ProviderKind::Anthropic, ProviderCapability::default()),
        ModelEntry::new("gpt-4o", ProviderKind::OpenAi, ProviderCapability::default()),
        ModelEntry::new("llama3.1", ProviderKind::Ollama, ProviderCapability::default()),
    ]);
    let only_local = |provider: ProviderKind| provider == ProviderKind::Ollama;
    let everything = |_: ProviderKind| true;

    let config = Config {
        preferred_model: Some("gpt-4o".to_string()),
        last_used_model: Some("retired-model".to_string()),
        ..Default::default()
    };
    assert_eq!(
        config.select_model(Some("custom"), &registry, everything).as_deref(),
        Some("custom")
    );
    assert_eq!(
        config.select_model(None, &registry, everything).as_deref(),
        Some("gpt-4o")
    );
    assert_eq!(
        config.select_model(None, &registry, only_local).as_deref(),
        Some("llama3.1")
    );
    assert_eq!(
        Config::default().select_model(None, &registry, |_| false),
        None
    );
}

#[test]
fn system_prompt_has_date_and_custom_section() {
    let today = NaiveDate::from_ymd_opt(2025, 3, 14).unwrap();
    let plain = Config::default().system_prompt(today);
    assert!(plain.contains("The current date is 2025-03-14."));

    let custom = Config {
        custom_system_prompt: Some("  Reply in haiku.  ".to_string()),
        ..Default::default()
    }
    .system_prompt(today);
    assert!(custom.ends_with("\n\nReply in haiku."));
}

#[test]
#[cfg(unix)]
fn test_path_display_uses_tilde_under_home() {
    if let Some(home) = std::env::var_os("HOME") {
        let path = std::path::PathBuf::from(home).join(".config/rapport/config.toml");
        assert_eq!(path_display(&path), "~/.config/rapport/config.toml");
    }
}
