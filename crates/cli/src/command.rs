use serde_json::Value;
use snafu::Snafu;
use structura_llm::{Backend, OutputFormat};
use structura_storage::{ConversationId, MessageId, PresetId};

pub const HELP: &str = "\
Type a message and press enter to send it. Ctrl-C stops a running reply.

  /status                      backend, model, format and connection
  /backend [name]              list backends or switch to one
  /models                      refresh and list models of the backend
  /model <name>|-              select a model, `-` clears the selection
  /format [name]               list available formats or select one
  /spec [text]                 show or replace the spec of the format
  /preset [list]               list saved specs of the format
  /preset use|delete <id>      apply or delete a saved spec
  /preset save <name>          save the current spec
  /param <key> [json]          set a generation parameter, no value removes it
  /connect <url>|- [api-key]   save the connection of the backend
  /conversations               list conversations
  /new [title]                 start a conversation
  /open <id>                   switch to a conversation
  /rename <title>              rename the current conversation
  /drop <id>                   delete a conversation
  /messages                    show the current conversation
  /edit <id> <text>            replace a user message and regenerate
  /patch <id> <text>           replace a message without regenerating
  /delete <id>                 delete a message
  /history                     recent prompts
  /quit                        exit

Start a message with `//` to send text beginning with a slash.
";

#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Send(String),
    Help,
    Quit,
    Status,
    Backend(Option<Backend>),
    Models,
    Model(String),
    ClearModel,
    Format(Option<OutputFormat>),
    Spec(Option<String>),
    Presets,
    UsePreset(PresetId),
    SavePreset(String),
    DeletePreset(PresetId),
    Param {
        key: String,
        value: Option<Value>,
    },
    Connect {
        base_url: Option<String>,
        api_key: Option<String>,
    },
    Conversations,
    New(Option<String>),
    Open(ConversationId),
    Rename(String),
    Drop(ConversationId),
    Messages,
    Edit {
        message_id: MessageId,
        text: String,
    },
    Patch {
        message_id: MessageId,
        text: String,
    },
    Delete(MessageId),
    History,
}

#[derive(Debug, Snafu, PartialEq, Eq)]
pub enum CommandError {
    #[snafu(display("unknown command `/{name}`, try /help"))]
    Unknown { name: String },
    #[snafu(display("`/{command}` needs {argument}"))]
    MissingArgument {
        command: &'static str,
        argument: &'static str,
    },
    #[snafu(display("`/{command}`: {reason}"))]
    InvalidArgument {
        command: &'static str,
        reason: String,
    },
}

/// Parses one input line. Blank lines yield `None`.
pub fn parse(line: &str) -> Result<Option<Command>, CommandError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return Ok(None);
    }

    let Some(body) = line.strip_prefix('/') else {
        return Ok(Some(Command::Send(line.to_string())));
    };
    if body.starts_with('/') {
        return Ok(Some(Command::Send(body.to_string())));
    }

    let (name, rest) = match body.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (body, ""),
    };
    let argument = (!rest.is_empty()).then_some(rest);

    let command = match name {
        "help" | "?" => Command::Help,
        "quit" | "exit" => Command::Quit,
        "status" => Command::Status,
        "backend" => Command::Backend(
            argument
                .map(|raw| {
                    raw.parse::<Backend>().map_err(|error| {
                        InvalidArgumentSnafu {
                            command: "backend",
                            reason: error.to_string(),
                        }
                        .build()
                    })
                })
                .transpose()?,
        ),
        "models" => Command::Models,
        "model" => match required(argument, "model", "a model name")? {
            "-" => Command::ClearModel,
            name => Command::Model(name.to_string()),
        },
        "format" => Command::Format(
            argument
                .map(|raw| {
                    raw.parse::<OutputFormat>().map_err(|error| {
                        InvalidArgumentSnafu {
                            command: "format",
                            reason: error.to_string(),
                        }
                        .build()
                    })
                })
                .transpose()?,
        ),
        // Format specs keep their inner whitespace.
        "spec" => Command::Spec(body["spec".len()..].strip_prefix(' ').and_then(|spec| {
            (!spec.trim().is_empty()).then(|| spec.to_string())
        })),
        "preset" | "presets" => {
            let (action, rest) = match argument {
                Some(raw) => match raw.split_once(char::is_whitespace) {
                    Some((action, rest)) => (action, Some(rest.trim())),
                    None => (raw, None),
                },
                None => ("list", None),
            };
            match action {
                "list" | "ls" => Command::Presets,
                "use" => Command::UsePreset(PresetId::new(parse_id(rest, "preset")?)),
                "save" => Command::SavePreset(required(rest, "preset", "a name")?.to_string()),
                "delete" | "rm" => {
                    Command::DeletePreset(PresetId::new(parse_id(rest, "preset")?))
                }
                action => {
                    return InvalidArgumentSnafu {
                        command: "preset",
                        reason: format!("unknown action `{action}`"),
                    }
                    .fail();
                }
            }
        }
        "param" => {
            let raw = required(argument, "param", "a parameter name")?;
            let (key, value) = match raw.split_once(char::is_whitespace) {
                Some((key, value)) => (key, Some(parse_value(value.trim()))),
                None => (raw, None),
            };
            Command::Param {
                key: key.to_string(),
                value,
            }
        }
        "connect" => {
            let raw = required(argument, "connect", "a base URL or `-`")?;
            let (base_url, api_key) = match raw.split_once(char::is_whitespace) {
                Some((base_url, api_key)) => (base_url, Some(api_key.trim().to_string())),
                None => (raw, None),
            };
            Command::Connect {
                base_url: (base_url != "-").then(|| base_url.to_string()),
                api_key,
            }
        }
        "conversations" | "ls" => Command::Conversations,
        "new" => Command::New(argument.map(str::to_string)),
        "open" => Command::Open(ConversationId::new(parse_id(argument, "open")?)),
        "rename" => Command::Rename(required(argument, "rename", "a title")?.to_string()),
        "drop" => Command::Drop(ConversationId::new(parse_id(argument, "drop")?)),
        "messages" => Command::Messages,
        "edit" => {
            let (message_id, text) = id_and_text(argument, "edit")?;
            Command::Edit { message_id, text }
        }
        "patch" => {
            let (message_id, text) = id_and_text(argument, "patch")?;
            Command::Patch { message_id, text }
        }
        "delete" => Command::Delete(MessageId::new(parse_id(argument, "delete")?)),
        "history" => Command::History,
        name => {
            return UnknownSnafu {
                name: name.to_string(),
            }
            .fail();
        }
    };

    Ok(Some(command))
}

fn required<'a>(
    argument: Option<&'a str>,
    command: &'static str,
    expected: &'static str,
) -> Result<&'a str, CommandError> {
    argument.ok_or_else(|| {
        MissingArgumentSnafu {
            command,
            argument: expected,
        }
        .build()
    })
}

fn parse_id(argument: Option<&str>, command: &'static str) -> Result<i64, CommandError> {
    let raw = required(argument, command, "an id")?;
    raw.trim_start_matches('#').parse::<i64>().map_err(|_| {
        InvalidArgumentSnafu {
            command,
            reason: format!("`{raw}` is not an id"),
        }
        .build()
    })
}

fn id_and_text(
    argument: Option<&str>,
    command: &'static str,
) -> Result<(MessageId, String), CommandError> {
    let raw = required(argument, command, "a message id and text")?;
    let Some((id, text)) = raw.split_once(char::is_whitespace) else {
        return MissingArgumentSnafu {
            command,
            argument: "the new text",
        }
        .fail();
    };
    let id = parse_id(Some(id), command)?;
    Ok((MessageId::new(id), text.trim().to_string()))
}

/// JSON when it parses, otherwise the raw text as a string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}
