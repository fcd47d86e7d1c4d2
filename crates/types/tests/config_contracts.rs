use std::path::PathBuf;

use types::{
    BUILTIN_TOOL_NAMES, ConfigError, EngineConfig, ModelId, ProviderConfig, ProviderKind,
    SandboxConfig, SandboxSpec,
};

#[test]
fn default_engine_config_is_valid() {
    let config = EngineConfig::default();
    assert_eq!(config.provider.kind, ProviderKind::OpenAi);
    assert_eq!(config.provider.model, ModelId::from("gpt-4o-mini"));
    assert_eq!(config.tools.enabled.len(), BUILTIN_TOOL_NAMES.len());
    assert!(config.sandbox.is_none());
    assert!(config.validate().is_ok());
}

#[test]
fn zero_step_budget_is_rejected() {
    let mut config = EngineConfig::default();
    config.agent.max_steps = 0;
    assert_eq!(
        config.validate(),
        Err(ConfigError::InvalidLimit {
            field: "agent.max_steps",
            value: 0
        })
    );
}

#[test]
fn zero_timeout_and_truncation_limit_are_rejected() {
    let mut config = EngineConfig::default();
    config.tools.command_timeout_secs = 0;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidLimit {
            field: "tools.command_timeout_secs",
            ..
        })
    ));

    let mut config = EngineConfig::default();
    config.tools.max_output_bytes = 0;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidLimit {
            field: "tools.max_output_bytes",
            ..
        })
    ));
}

#[test]
fn unknown_tool_names_are_rejected() {
    let mut config = EngineConfig::default();
    config.tools.enabled.push("web_search".to_owned());
    assert_eq!(
        config.validate(),
        Err(ConfigError::UnknownTool {
            name: "web_search".to_owned()
        })
    );
}

#[test]
fn disabling_task_done_is_rejected() {
    let mut config = EngineConfig::default();
    config.tools.enabled = vec!["bash".to_owned()];
    assert_eq!(config.validate(), Err(ConfigError::TerminalToolDisabled));
}

#[test]
fn sandbox_requires_exactly_one_source() {
    let empty = SandboxConfig::default();
    assert_eq!(
        empty.spec(),
        Err(ConfigError::AmbiguousSandboxSource { count: 0 })
    );

    let both = SandboxConfig {
        image: Some("ubuntu:24.04".to_owned()),
        container: Some("abc123".to_owned()),
        ..SandboxConfig::default()
    };
    assert_eq!(
        both.spec(),
        Err(ConfigError::AmbiguousSandboxSource { count: 2 })
    );

    let image = SandboxConfig {
        image: Some("ubuntu:24.04".to_owned()),
        ..SandboxConfig::default()
    };
    assert_eq!(
        image.spec(),
        Ok(SandboxSpec::Image("ubuntu:24.04".to_owned()))
    );
}

#[test]
fn dockerfile_build_context_defaults_to_dockerfile_directory() {
    let config = SandboxConfig {
        dockerfile: Some(PathBuf::from("/srv/env/Dockerfile")),
        ..SandboxConfig::default()
    };
    assert_eq!(
        config.spec(),
        Ok(SandboxSpec::Dockerfile {
            dockerfile: PathBuf::from("/srv/env/Dockerfile"),
            context: PathBuf::from("/srv/env"),
        })
    );
}

#[test]
fn relative_container_workspace_is_rejected() {
    let config = EngineConfig {
        sandbox: Some(SandboxConfig {
            image: Some("alpine".to_owned()),
            container_workspace: "workspace".to_owned(),
            ..SandboxConfig::default()
        }),
        ..EngineConfig::default()
    };
    assert!(matches!(
        config.validate(),
        Err(ConfigError::RelativeContainerWorkspace { .. })
    ));
}

#[test]
fn provider_kinds_use_lowercase_wire_labels_and_default_urls() {
    let encoded = serde_json::to_string(&ProviderKind::OpenRouter).expect("kind should serialize");
    assert_eq!(encoded, "\"openrouter\"");

    let config = ProviderConfig {
        kind: ProviderKind::Ollama,
        ..ProviderConfig::default()
    };
    assert_eq!(config.resolved_base_url(), "http://localhost:11434/v1");
    assert_eq!(ProviderKind::Ollama.default_api_key_env(), None);

    let config = ProviderConfig {
        base_url: Some("https://llm.internal/v1/".to_owned()),
        ..ProviderConfig::default()
    };
    assert_eq!(config.resolved_base_url(), "https://llm.internal/v1");
}

#[test]
fn invalid_reliability_backoff_is_rejected() {
    let mut config = EngineConfig::default();
    config.reliability.backoff_base_ms = 5_000;
    config.reliability.backoff_max_ms = 100;
    assert!(matches!(
        config.validate(),
        Err(ConfigError::InvalidReliabilityBackoff { .. })
    ));
}
