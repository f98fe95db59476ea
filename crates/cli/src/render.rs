use std::fmt::Write;

use structura_core::{Message, SessionSnapshot};
use structura_llm::{Backend, OutputFormat};
use structura_storage::MessageRole;

pub fn status(snapshot: &SessionSnapshot) -> String {
    let selection = &snapshot.selection;
    let connection = selection.connection();
    let mut out = String::new();

    let _ = writeln!(out, "backend:  {}", selection.backend());
    let _ = writeln!(
        out,
        "model:    {}",
        selection.model().unwrap_or("(none selected)")
    );
    let _ = writeln!(
        out,
        "endpoint: {}{}",
        connection.base_url.as_deref().unwrap_or("(server default)"),
        if connection.api_key.is_some() {
            " (api key set)"
        } else {
            ""
        }
    );
    if !selection.is_connected() {
        let _ = writeln!(out, "          backend unreachable, no models listed");
    }
    let _ = writeln!(out, "format:   {}", snapshot.format.active());
    if let Some(spec) = snapshot.format.spec() {
        let _ = writeln!(out, "spec:     {}", one_line(spec));
    }
    if !snapshot.parameters.is_empty() {
        let _ = writeln!(
            out,
            "params:   {}",
            serde_json::Value::Object(snapshot.parameters.clone())
        );
    }
    if let Some(conversation) = snapshot.current_conversation() {
        let _ = writeln!(out, "chat:     {} {}", conversation.id, conversation.title);
    }
    out
}

pub fn backends(snapshot: &SessionSnapshot) -> String {
    let current = snapshot.selection.backend();
    Backend::ALL
        .iter()
        .map(|backend| format!("{} {backend}\n", marker(*backend == current)))
        .collect()
}

pub fn models(snapshot: &SessionSnapshot) -> String {
    let selection = &snapshot.selection;
    let catalog = selection.catalog();
    if !catalog.is_connected() {
        return match &catalog.warning {
            Some(warning) => format!("no models for {}: {warning}\n", selection.backend()),
            None => format!("no models for {}\n", selection.backend()),
        };
    }

    catalog
        .models
        .iter()
        .map(|model| {
            format!(
                "{} {}\n",
                marker(selection.model() == Some(model.id.as_str())),
                model.id
            )
        })
        .collect()
}

pub fn formats(snapshot: &SessionSnapshot) -> String {
    let active = snapshot.format.active();
    let available = snapshot.selection.formats();
    OutputFormat::ALL
        .iter()
        .map(|format| {
            let note = if available.contains(format) {
                ""
            } else {
                " (unsupported by backend)"
            };
            format!("{} {format}{note}\n", marker(*format == active))
        })
        .collect()
}

pub fn spec(snapshot: &SessionSnapshot) -> String {
    match snapshot.format.spec() {
        Some(spec) => format!("{}:\n{spec}\n", snapshot.format.active()),
        None => format!("{} takes no spec\n", snapshot.format.active()),
    }
}

pub fn presets(snapshot: &SessionSnapshot) -> String {
    if snapshot.presets.is_empty() {
        return format!("no saved {} specs\n", snapshot.format.active());
    }

    let current = snapshot.format.spec();
    snapshot
        .presets
        .iter()
        .map(|preset| {
            format!(
                "{} {:>4}  {}: {}\n",
                marker(current == Some(preset.body.as_str())),
                preset.id.get(),
                preset.name,
                one_line(&preset.body)
            )
        })
        .collect()
}

pub fn conversations(snapshot: &SessionSnapshot) -> String {
    if snapshot.conversations.is_empty() {
        return "no conversations yet\n".to_string();
    }

    snapshot
        .conversations
        .iter()
        .map(|conversation| {
            format!(
                "{} {:>4}  {}\n",
                marker(snapshot.conversation_id == Some(conversation.id)),
                conversation.id.get(),
                conversation.title
            )
        })
        .collect()
}

pub fn messages(snapshot: &SessionSnapshot) -> String {
    if snapshot.messages.is_empty() {
        return "no messages\n".to_string();
    }

    snapshot.messages.iter().map(message).collect()
}

pub fn message(message: &Message) -> String {
    let speaker = match message.role {
        MessageRole::User => "you".to_string(),
        MessageRole::Assistant => match (&message.meta.model, message.meta.output_format) {
            (Some(model), Some(format)) if format != OutputFormat::Default => {
                format!("{model} [{format}]")
            }
            (Some(model), _) => model.clone(),
            _ => "assistant".to_string(),
        },
    };
    format!("{} {speaker}: {}\n", message.key, message.display_text())
}

pub fn history(snapshot: &SessionSnapshot) -> String {
    if snapshot.history.is_empty() {
        return "no prompts yet\n".to_string();
    }

    snapshot
        .history
        .entries()
        .enumerate()
        .map(|(index, prompt)| format!("{:>3}  {}\n", index + 1, one_line(prompt)))
        .collect()
}

fn marker(selected: bool) -> char {
    if selected { '*' } else { ' ' }
}

fn one_line(text: &str) -> String {
    text.replace('\n', "\\n")
}
