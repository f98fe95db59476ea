mod common;

use common::{FakeLlm, harness};
use structura_core::SessionError;
use structura_core::preferences::{BACKEND_MODELS_KEY, SELECTED_BACKEND_KEY};
use structura_llm::backend::DEFAULT_VLLM_BASE_URL;
use structura_llm::{Backend, OutputFormat};
use structura_storage::{BackendSetting, ConversationStore, PreferenceStore, SettingsStore};

#[tokio::test]
async fn late_model_list_for_previous_backend_is_discarded() {
    let h = harness(
        FakeLlm::new()
            .with_models(Backend::Vllm, &["mistral-7b"])
            .with_models(Backend::Ollama, &["llama3"]),
    );
    let (entered, release) = h.llm.gate(Backend::Vllm);

    let session = h.session.clone();
    let pending = tokio::spawn(async move { session.switch_backend(Backend::Vllm).await });
    entered.await.unwrap();

    h.session.switch_backend(Backend::Ollama).await;
    release.send(()).unwrap();
    pending.await.unwrap();

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.selection.backend(), Backend::Ollama);
    assert_eq!(snapshot.selection.catalog().ids(), vec!["llama3".to_string()]);
    assert!(snapshot.selection.is_connected());
}

#[tokio::test]
async fn formats_are_gated_by_backend_capabilities() {
    let h = harness(
        FakeLlm::new()
            .with_capabilities(Backend::Vllm, &["json", "regex"])
            .with_capabilities(Backend::Ollama, &["json"])
            .with_models(Backend::Vllm, &["m"])
            .with_models(Backend::Ollama, &["llama3"]),
    );
    h.session.start().await;

    assert_eq!(
        h.session.snapshot().selection.formats(),
        vec![OutputFormat::Default, OutputFormat::Json]
    );
    let error = h.session.select_format(OutputFormat::Regex).unwrap_err();
    assert!(matches!(error, SessionError::UnsupportedFormat { .. }));

    h.session.switch_backend(Backend::Vllm).await;
    h.session.select_format(OutputFormat::Regex).unwrap();
    h.session.set_format_spec("[0-9]+").unwrap();

    h.session.switch_backend(Backend::Ollama).await;
    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.format.active(), OutputFormat::Default);
    assert_eq!(snapshot.format.spec(), None);
    assert_eq!(snapshot.format.spec_for(OutputFormat::Regex), Some("[0-9]+"));
}

#[tokio::test]
async fn disconnection_falls_back_to_default_format() {
    let h = harness(
        FakeLlm::new()
            .with_capabilities(Backend::Ollama, &["json"])
            .with_capabilities(Backend::OpenAi, &["json"])
            .with_models(Backend::Ollama, &["llama3"]),
    );
    h.session.start().await;
    h.session.select_format(OutputFormat::Json).unwrap();

    h.session.switch_backend(Backend::OpenAi).await;
    let snapshot = h.session.snapshot();
    assert!(!snapshot.selection.is_connected());
    assert_eq!(snapshot.format.active(), OutputFormat::Default);
    assert!(!snapshot.can_send());
}

#[tokio::test]
async fn invalid_spec_is_reported_and_not_stored() {
    let h = harness(
        FakeLlm::new()
            .with_capabilities(Backend::Ollama, &["regex"])
            .with_models(Backend::Ollama, &["llama3"]),
    );
    h.session.start().await;
    h.session.select_format(OutputFormat::Regex).unwrap();

    let error = h.session.set_format_spec("(?<=a)b").unwrap_err();
    assert!(matches!(error, SessionError::InvalidFormatSpec { .. }));
    assert_eq!(h.session.snapshot().format.spec(), Some("[A-Za-z0-9]+"));
}

#[tokio::test]
async fn saved_setting_overrides_the_default_connection() {
    let h = harness(FakeLlm::new().with_models(Backend::Vllm, &["m"]));
    h.storage
        .save_backend_setting(BackendSetting::new(
            "vllm",
            Some("http://gpu-box:8000".to_string()),
            Some("secret".to_string()),
        ))
        .await
        .unwrap();

    h.session.switch_backend(Backend::Vllm).await;
    let connection = h.session.snapshot().selection.connection().clone();
    assert_eq!(connection.base_url.as_deref(), Some("http://gpu-box:8000"));
    assert_eq!(connection.api_key.as_deref(), Some("secret"));

    h.session.switch_backend(Backend::Ollama).await;
    h.session
        .save_backend_setting(BackendSetting::new(
            "ollama",
            Some("http://laptop:11434".to_string()),
            None,
        ))
        .await
        .unwrap();
    let snapshot = h.session.snapshot();
    assert_eq!(
        snapshot.selection.connection().base_url.as_deref(),
        Some("http://laptop:11434")
    );
    assert_eq!(snapshot.backend_settings.len(), 2);
}

#[tokio::test]
async fn switching_resets_the_connection_before_settings_arrive() {
    let h = harness(
        FakeLlm::new()
            .with_models(Backend::Vllm, &["m"])
            .with_models(Backend::Ollama, &["llama3"]),
    );
    h.storage
        .save_backend_setting(BackendSetting::new(
            "vllm",
            Some("http://gpu-box:8000".to_string()),
            None,
        ))
        .await
        .unwrap();
    h.session.start().await;
    h.session.select_model(Some("llama3".to_string())).await;
    let (entered, release) = h.gated.gate_settings();

    let session = h.session.clone();
    let pending = tokio::spawn(async move { session.switch_backend(Backend::Vllm).await });
    entered.await.unwrap();

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.selection.backend(), Backend::Vllm);
    assert_eq!(
        snapshot.selection.connection().base_url.as_deref(),
        Some(DEFAULT_VLLM_BASE_URL)
    );
    assert_eq!(snapshot.selection.model(), None);
    assert!(snapshot.selection.catalog().models.is_empty());

    release.send(()).unwrap();
    pending.await.unwrap();

    let snapshot = h.session.snapshot();
    assert_eq!(
        snapshot.selection.connection().base_url.as_deref(),
        Some("http://gpu-box:8000")
    );
    assert_eq!(snapshot.selection.catalog().ids(), vec!["m".to_string()]);
}

#[tokio::test]
async fn selection_survives_a_restart() {
    let h = harness(FakeLlm::new().with_models(Backend::Vllm, &["mistral-7b"]));
    h.session.switch_backend(Backend::Vllm).await;
    h.session.select_model(Some("mistral-7b".to_string())).await;

    assert_eq!(
        h.preferences.get(SELECTED_BACKEND_KEY).await.unwrap().as_deref(),
        Some("vllm")
    );
    assert!(
        h.preferences
            .get(BACKEND_MODELS_KEY)
            .await
            .unwrap()
            .is_some_and(|raw| raw.contains("mistral-7b"))
    );

    let restarted = harness(FakeLlm::new().with_models(Backend::Vllm, &["mistral-7b"]));
    for key in [SELECTED_BACKEND_KEY, BACKEND_MODELS_KEY] {
        let value = h.preferences.get(key).await.unwrap().unwrap();
        restarted.preferences.set(key, value).await.unwrap();
    }
    restarted.session.start().await;

    let snapshot = restarted.session.snapshot();
    assert_eq!(snapshot.selection.backend(), Backend::Vllm);
    assert_eq!(snapshot.selection.model(), Some("mistral-7b"));
    assert!(snapshot.can_send());
}

#[tokio::test]
async fn model_missing_from_fresh_list_is_cleared() {
    let h = harness(FakeLlm::new().with_models(Backend::Ollama, &["llama3"]));
    h.session.select_model(Some("retired".to_string())).await;

    assert!(h.session.refresh_models().await);
    assert_eq!(h.session.snapshot().selection.model(), None);
    assert_eq!(
        h.preferences.get(BACKEND_MODELS_KEY).await.unwrap().as_deref(),
        Some("{}")
    );
}

#[tokio::test]
async fn conversation_list_management() {
    let h = harness(FakeLlm::new());
    let older = h
        .storage
        .create_conversation(Default::default())
        .await
        .unwrap();

    h.session.start().await;
    assert_eq!(h.session.snapshot().conversation_id, Some(older.id));

    let created = h
        .session
        .create_conversation(Some("Cats".to_string()))
        .await
        .unwrap();
    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.conversation_id, Some(created.id));
    assert_eq!(snapshot.conversations.len(), 2);
    assert!(snapshot.messages.is_empty());

    let renamed = h
        .session
        .rename_conversation(created.id, "Dogs")
        .await
        .unwrap();
    assert_eq!(renamed.title, "Dogs");
    assert_eq!(
        h.session.snapshot().current_conversation().map(|record| record.title.as_str()),
        Some("Dogs")
    );

    h.session.delete_conversation(created.id).await.unwrap();
    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.conversation_id, Some(older.id));
    assert_eq!(snapshot.conversations.len(), 1);
}
