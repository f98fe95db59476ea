mod common;

use std::time::Duration;

use common::{FakeLlm, ScriptedStream, harness, sse};
use futures::channel::mpsc;
use structura_core::{GENERIC_FAILURE_NOTICE, MessageKey, SessionError, SessionSnapshot};
use structura_llm::{ApiResult, Backend, OutputFormat, StreamOutcome};
use structura_storage::{
    ConversationStore, MessageId, MessageRole, MessageStore, NewConversation,
};

const SCHEMA: &str = r#"{"type":"object","properties":{}}"#;

fn ollama() -> FakeLlm {
    FakeLlm::new()
        .with_capabilities(Backend::Ollama, &["default", "json", "template", "csv"])
        .with_models(Backend::Ollama, &["llama3", "mistral"])
}

async fn wait_until(
    session: &structura_core::ChatSession,
    condition: impl Fn(&SessionSnapshot) -> bool,
) {
    let mut revisions = session.subscribe();
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition(&session.snapshot()) {
            revisions.changed().await.unwrap();
        }
    })
    .await
    .expect("condition not reached in time");
}

#[tokio::test]
async fn hello_on_ollama_is_tagged_and_persisted() {
    let h = harness(ollama());
    h.llm.push_stream(ScriptedStream::Chunks(vec![sse(&[
        r#"{"user_message_id": 11}"#,
        r#"{"assistant_message_id": 12, "content": "Hi"}"#,
        r#"{"content": " there"}"#,
        "[DONE]",
    ])]));

    h.session.start().await;
    h.session.select_model(Some("llama3".to_string())).await;
    h.session.set_prompt("Hello");

    let outcome = h.session.send().await.unwrap();
    assert_eq!(outcome, StreamOutcome::Completed);

    let snapshot = h.session.snapshot();
    assert!(!snapshot.is_loading());
    assert!(snapshot.prompt.is_empty());
    assert!(snapshot.conversation_id.is_some());
    assert_eq!(snapshot.messages.len(), 2);

    let (user, assistant) = (&snapshot.messages[0], &snapshot.messages[1]);
    assert_eq!(user.role, MessageRole::User);
    assert_eq!(user.content, "Hello");
    assert_eq!(user.key, MessageKey::Persisted(MessageId::new(11)));
    assert_eq!(assistant.role, MessageRole::Assistant);
    assert_eq!(assistant.content, "Hi there");
    assert_eq!(assistant.key, MessageKey::Persisted(MessageId::new(12)));
    assert_eq!(snapshot.reply(), Some(assistant));
    for message in [user, assistant] {
        assert_eq!(message.meta.backend, Some(Backend::Ollama));
        assert_eq!(message.meta.model.as_deref(), Some("llama3"));
        assert_eq!(message.meta.output_format, Some(OutputFormat::Default));
    }

    let requests = h.llm.requests();
    assert_eq!(requests.len(), 1);
    assert_eq!(requests[0].message, "Hello");
    assert_eq!(requests[0].format_spec, None);
    assert_eq!(requests[0].message_id, None);
    assert_eq!(Some(requests[0].conversation_id), snapshot.conversation_id);
    assert_eq!(
        requests[0].parameters.get("base_url").and_then(|value| value.as_str()),
        Some("http://localhost:11434")
    );
    assert_eq!(snapshot.history.latest(), Some("Hello"));
}

#[tokio::test]
async fn edit_and_resend_replaces_the_tail() {
    let h = harness(ollama());
    let conversation = h
        .storage
        .create_conversation(NewConversation::default())
        .await
        .unwrap();
    let edited = h
        .storage
        .insert_message(conversation.id, MessageRole::User, "first question")
        .await;
    for (role, content) in [
        (MessageRole::Assistant, "first answer"),
        (MessageRole::User, "second question"),
        (MessageRole::Assistant, "second answer"),
    ] {
        h.storage.insert_message(conversation.id, role, content).await;
    }

    h.session.start().await;
    h.session.select_model(Some("llama3".to_string())).await;
    assert_eq!(h.session.snapshot().conversation_id, Some(conversation.id));
    assert_eq!(h.session.snapshot().messages.len(), 4);

    let user_id = edited.id.get();
    let user_event = format!(r#"{{"user_message_id": {user_id}}}"#);
    h.llm.push_stream(ScriptedStream::Chunks(vec![sse(&[
        user_event.as_str(),
        r#"{"assistant_message_id": 100, "content": "better answer"}"#,
        "[DONE]",
    ])]));

    let outcome = h
        .session
        .edit_and_resend(edited.id, "better question")
        .await
        .unwrap();
    assert_eq!(outcome, StreamOutcome::Completed);

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.messages.len(), 2);
    assert_eq!(snapshot.messages[0].key, MessageKey::Persisted(edited.id));
    assert_eq!(snapshot.messages[0].content, "better question");
    assert_eq!(snapshot.messages[1].key, MessageKey::Persisted(MessageId::new(100)));
    assert_eq!(snapshot.messages[1].content, "better answer");

    assert_eq!(h.llm.requests()[0].message_id, Some(edited.id));
}

#[tokio::test]
async fn json_format_instruction_stays_out_of_the_display() {
    let h = harness(ollama());
    h.llm.push_stream(ScriptedStream::Chunks(vec![sse(&[
        r#"{"content": "{\"name\": \"Tom\"}"}"#,
        "[DONE]",
    ])]));

    h.session.start().await;
    h.session.select_model(Some("llama3".to_string())).await;
    h.session.select_format(OutputFormat::Json).unwrap();
    h.session.set_format_spec(SCHEMA).unwrap();

    h.session.send_text("describe a cat").await.unwrap();

    let request = &h.llm.requests()[0];
    assert!(request.message.starts_with("describe a cat"));
    assert!(request.message.contains("```json\n{"));
    assert!(request.message.contains("respond with valid JSON only"));
    assert_eq!(request.output_format, OutputFormat::Json);
    assert!(request.format_spec.as_deref().is_some_and(|spec| spec.contains("\"object\"")));

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.messages[0].display_text(), "describe a cat");
    assert_eq!(snapshot.messages[1].content, "{\"name\": \"Tom\"}");
}

#[tokio::test]
async fn stop_keeps_partial_content_without_an_error() {
    let h = harness(ollama());
    let (chunk_tx, chunk_rx) = mpsc::unbounded::<ApiResult<Vec<u8>>>();
    h.llm.push_stream(ScriptedStream::Channel(chunk_rx));

    h.session.start().await;
    h.session.select_model(Some("llama3".to_string())).await;

    let session = h.session.clone();
    let task = tokio::spawn(async move { session.send_text("tell me a story").await });

    chunk_tx
        .unbounded_send(Ok(sse(&[r#"{"assistant_message_id": 7, "content": "Once"}"#])))
        .unwrap();
    wait_until(&h.session, |snapshot| {
        snapshot
            .last_assistant()
            .is_some_and(|message| message.content == "Once")
    })
    .await;
    assert!(h.session.snapshot().is_streaming());

    assert!(h.session.stop());
    let outcome = task.await.unwrap().unwrap();
    assert_eq!(outcome, StreamOutcome::Cancelled);

    let _ = chunk_tx.unbounded_send(Ok(sse(&[r#"{"content": " upon"}"#])));
    let snapshot = h.session.snapshot();
    assert!(!snapshot.is_loading());
    assert_eq!(snapshot.notice, None);
    assert_eq!(snapshot.last_outcome, Some(StreamOutcome::Cancelled));
    assert_eq!(snapshot.last_assistant().unwrap().content, "Once");
    assert!(!h.session.stop());
}

#[tokio::test]
async fn second_send_is_rejected_while_streaming() {
    let h = harness(ollama());
    let (chunk_tx, chunk_rx) = mpsc::unbounded::<ApiResult<Vec<u8>>>();
    h.llm.push_stream(ScriptedStream::Channel(chunk_rx));

    h.session.start().await;
    h.session.select_model(Some("llama3".to_string())).await;

    let session = h.session.clone();
    let task = tokio::spawn(async move { session.send_text("first").await });
    wait_until(&h.session, SessionSnapshot::is_streaming).await;

    let error = h.session.send_text("second").await.unwrap_err();
    assert!(matches!(error, SessionError::Busy { .. }));
    assert_eq!(h.llm.requests().len(), 1);

    chunk_tx.unbounded_send(Ok(sse(&["[DONE]"]))).unwrap();
    assert_eq!(task.await.unwrap().unwrap(), StreamOutcome::Completed);
}

#[tokio::test]
async fn completed_reply_without_content_leaves_no_placeholder() {
    let h = harness(ollama());
    h.llm.push_stream(ScriptedStream::Chunks(vec![sse(&[
        r#"{"user_message_id": 5}"#,
        "[DONE]",
    ])]));

    h.session.start().await;
    h.session.select_model(Some("llama3".to_string())).await;

    let outcome = h.session.send_text("hi").await.unwrap();
    assert_eq!(outcome, StreamOutcome::Completed);

    let snapshot = h.session.snapshot();
    assert!(!snapshot.is_loading());
    assert_eq!(snapshot.notice, None);
    assert_eq!(snapshot.reply, None);
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].key, MessageKey::Persisted(MessageId::new(5)));
    assert!(snapshot.messages.iter().all(|message| !message.key.is_pending()));
}

#[tokio::test]
async fn transport_failure_sets_notice_and_clears_loading() {
    let h = harness(ollama());
    h.llm.push_stream(ScriptedStream::Reject(502));

    h.session.start().await;
    h.session.select_model(Some("llama3".to_string())).await;

    let outcome = h.session.send_text("hi").await.unwrap();
    assert!(matches!(outcome, StreamOutcome::Failed(_)));

    let snapshot = h.session.snapshot();
    assert!(!snapshot.is_loading());
    assert_eq!(snapshot.notice.as_deref(), Some(GENERIC_FAILURE_NOTICE));
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].role, MessageRole::User);
}

#[tokio::test]
async fn validation_errors_never_reach_the_network() {
    let h = harness(ollama());
    h.session.start().await;

    let error = h.session.send_text("hi").await.unwrap_err();
    assert!(matches!(error, SessionError::NoModel { .. }));

    h.session.select_model(Some("llama3".to_string())).await;
    let error = h.session.send_text("   ").await.unwrap_err();
    assert!(matches!(error, SessionError::EmptyPrompt { .. }));

    h.session.switch_backend(Backend::Vllm).await;
    h.session.select_model(Some("anything".to_string())).await;
    let error = h.session.send_text("hi").await.unwrap_err();
    assert!(matches!(error, SessionError::Disconnected { .. }));
    assert!(error.is_validation());

    assert!(h.llm.requests().is_empty());
    assert!(!h.session.snapshot().is_loading());
}

#[tokio::test]
async fn delete_converges_when_the_store_already_lost_the_message() {
    let h = harness(ollama());
    let conversation = h
        .storage
        .create_conversation(NewConversation::default())
        .await
        .unwrap();
    let kept = h
        .storage
        .insert_message(conversation.id, MessageRole::User, "keep")
        .await;
    let gone = h
        .storage
        .insert_message(conversation.id, MessageRole::Assistant, "gone")
        .await;

    h.session.start().await;
    h.storage
        .delete_message(conversation.id, gone.id)
        .await
        .unwrap();

    h.session.delete_message(gone.id).await.unwrap();
    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].id(), Some(kept.id));
}

#[tokio::test]
async fn plain_edit_reloads_the_truncated_list() {
    let h = harness(ollama());
    let conversation = h
        .storage
        .create_conversation(NewConversation::default())
        .await
        .unwrap();
    let first = h
        .storage
        .insert_message(conversation.id, MessageRole::User, "one")
        .await;
    h.storage
        .insert_message(conversation.id, MessageRole::Assistant, "two")
        .await;

    h.session.start().await;
    h.session.edit_message_content(first.id, "uno").await.unwrap();

    let snapshot = h.session.snapshot();
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].content, "uno");
}
