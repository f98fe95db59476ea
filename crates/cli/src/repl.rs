use std::io::Write;
use std::sync::Arc;

use snafu::ResultExt;
use structura_core::format::{regex_matches, template_response_ok};
use structura_core::{ChatSession, Message, SessionResult, SessionSnapshot};
use structura_llm::{OutputFormat, StreamOutcome};
use structura_storage::{BackendSetting, MessageId};
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::command::{self, Command, HELP};
use crate::error::{AppResult, ReadInputSnafu};
use crate::render;

enum Generation {
    Send(String),
    Resend { message_id: MessageId, text: String },
}

/// Tracks how much of the streaming reply has been written out.
#[derive(Debug, Default)]
struct ReplyPrinter {
    printed: usize,
}

impl ReplyPrinter {
    fn delta<'a>(&mut self, snapshot: &'a SessionSnapshot) -> Option<&'a str> {
        let content = snapshot.reply()?.content.as_str();
        let delta = content.get(self.printed..).filter(|delta| !delta.is_empty())?;
        self.printed = content.len();
        Some(delta)
    }

    fn print(&mut self, snapshot: &SessionSnapshot) {
        if let Some(delta) = self.delta(snapshot) {
            let mut stdout = std::io::stdout().lock();
            let _ = stdout.write_all(delta.as_bytes());
            let _ = stdout.flush();
        }
    }
}

/// Line-oriented front end over one [`ChatSession`].
pub struct Repl {
    session: Arc<ChatSession>,
}

impl Repl {
    pub fn new(session: Arc<ChatSession>) -> Self {
        Self { session }
    }

    pub async fn run(&self) -> AppResult<()> {
        print!("{}", render::status(&self.session.snapshot()));
        println!("type /help for commands");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            show_prompt();
            let line = tokio::select! {
                line = lines.next_line() => line.context(ReadInputSnafu { stage: "read-line" })?,
                _ = tokio::signal::ctrl_c() => None,
            };
            let Some(line) = line else {
                break;
            };

            match command::parse(&line) {
                Ok(None) => {}
                Ok(Some(Command::Quit)) => break,
                Ok(Some(command)) => {
                    if let Err(error) = self.execute(command).await {
                        tracing::debug!(error = ?error, "command failed");
                        eprintln!("{error}");
                    }
                }
                Err(error) => eprintln!("{error}"),
            }
        }

        println!();
        Ok(())
    }

    async fn execute(&self, command: Command) -> SessionResult<()> {
        let session = &self.session;
        match command {
            Command::Send(text) => self.generate(Generation::Send(text)).await?,
            Command::Edit { message_id, text } => {
                self.generate(Generation::Resend { message_id, text })
                    .await?
            }
            Command::Help => print!("{HELP}"),
            Command::Quit => {}
            Command::Status => print!("{}", render::status(&session.snapshot())),
            Command::Backend(None) => print!("{}", render::backends(&session.snapshot())),
            Command::Backend(Some(backend)) => {
                session.switch_backend(backend).await;
                print!("{}", render::status(&session.snapshot()));
            }
            Command::Models => {
                session.refresh_models().await;
                print!("{}", render::models(&session.snapshot()));
            }
            Command::Model(model) => {
                if !session.snapshot().selection.catalog().contains(&model) {
                    eprintln!("`{model}` is not listed by the backend, selecting it anyway");
                }
                session.select_model(Some(model)).await;
            }
            Command::ClearModel => session.select_model(None).await,
            Command::Format(None) => print!("{}", render::formats(&session.snapshot())),
            Command::Format(Some(format)) => {
                session.select_format(format)?;
                print!("{}", render::spec(&session.snapshot()));
            }
            Command::Spec(None) => print!("{}", render::spec(&session.snapshot())),
            Command::Spec(Some(spec)) => {
                let validated = session.set_format_spec(&spec)?;
                if let Some(warning) = validated.warning {
                    eprintln!("warning: {warning}");
                }
            }
            Command::Presets => {
                session.load_presets().await?;
                print!("{}", render::presets(&session.snapshot()));
            }
            Command::UsePreset(preset_id) => {
                let validated = session.apply_preset(preset_id).await?;
                if let Some(warning) = validated.warning {
                    eprintln!("warning: {warning}");
                }
                print!("{}", render::spec(&session.snapshot()));
            }
            Command::SavePreset(name) => {
                let preset = session.save_preset(name).await?;
                println!("saved {} {}", preset.id, preset.name);
            }
            Command::DeletePreset(preset_id) => session.delete_preset(preset_id).await?,
            Command::Param { key, value } => {
                let mut parameters = session.snapshot().parameters.clone();
                match value {
                    Some(value) => {
                        parameters.insert(key, value);
                    }
                    None => {
                        parameters.remove(&key);
                    }
                }
                session.set_parameters(parameters);
            }
            Command::Connect { base_url, api_key } => {
                let backend = session.snapshot().selection.backend();
                session
                    .save_backend_setting(BackendSetting::new(backend.as_str(), base_url, api_key))
                    .await?;
                print!("{}", render::models(&session.snapshot()));
            }
            Command::Conversations => {
                session.load_conversations().await?;
                print!("{}", render::conversations(&session.snapshot()));
            }
            Command::New(title) => {
                let conversation = session.create_conversation(title).await?;
                println!("started {} {}", conversation.id, conversation.title);
            }
            Command::Open(conversation_id) => {
                session.select_conversation(conversation_id).await?;
                print!("{}", render::messages(&session.snapshot()));
            }
            Command::Rename(title) => match session.snapshot().conversation_id {
                Some(conversation_id) => {
                    session.rename_conversation(conversation_id, title).await?;
                }
                None => eprintln!("no conversation selected"),
            },
            Command::Drop(conversation_id) => session.delete_conversation(conversation_id).await?,
            Command::Messages => print!("{}", render::messages(&session.snapshot())),
            Command::Patch { message_id, text } => {
                session.edit_message_content(message_id, text).await?;
                print!("{}", render::messages(&session.snapshot()));
            }
            Command::Delete(message_id) => session.delete_message(message_id).await?,
            Command::History => print!("{}", render::history(&session.snapshot())),
        }
        Ok(())
    }

    /// Runs one generation, echoing the reply as it streams. Ctrl-C stops it.
    async fn generate(&self, generation: Generation) -> SessionResult<()> {
        let mut revisions = self.session.subscribe();
        let mut printer = ReplyPrinter::default();

        let running = async {
            match generation {
                Generation::Send(text) => self.session.send_text(text).await,
                Generation::Resend { message_id, text } => {
                    self.session.edit_and_resend(message_id, text).await
                }
            }
        };
        tokio::pin!(running);

        let result = loop {
            tokio::select! {
                result = &mut running => break result,
                changed = revisions.changed() => {
                    if changed.is_ok() {
                        printer.print(&self.session.snapshot());
                    }
                }
                _ = tokio::signal::ctrl_c() => {
                    self.session.stop();
                }
            }
        };

        let snapshot = self.session.snapshot();
        printer.print(&snapshot);
        if printer.printed > 0 {
            println!();
        }

        match result? {
            StreamOutcome::Completed => {
                if let Some(warning) = snapshot.reply().and_then(format_mismatch) {
                    eprintln!("warning: {warning}");
                }
            }
            StreamOutcome::Cancelled => eprintln!("[stopped]"),
            StreamOutcome::Failed(_) => {
                if let Some(notice) = &snapshot.notice {
                    eprintln!("{notice}");
                }
            }
        }
        Ok(())
    }
}

/// Why a completed reply does not fit the format it was requested in, if it does not.
fn format_mismatch(reply: &Message) -> Option<String> {
    let content = reply.content.trim();
    match (reply.meta.output_format?, reply.meta.format_spec.as_deref()) {
        (OutputFormat::Regex, Some(pattern)) if !regex_matches(pattern, content) => {
            Some(format!("reply does not match the pattern `{pattern}`"))
        }
        (OutputFormat::Template, _) if !template_response_ok(content) => {
            Some("template reply is blank".to_string())
        }
        _ => None,
    }
}

fn show_prompt() {
    let mut stdout = std::io::stdout().lock();
    let _ = stdout.write_all(b"> ");
    let _ = stdout.flush();
}
