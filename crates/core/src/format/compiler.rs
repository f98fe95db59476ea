use structura_llm::OutputFormat;

use super::validate::{parse_csv_columns, validate_json};
use super::{SEPARATOR, SLOT_MARKER};

/// What goes over the wire and what the user sees for one prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledPrompt {
    pub outgoing: String,
    pub display: String,
}

/// Appends the instruction block for `format` unless `text` already carries one.
pub fn compile(format: OutputFormat, spec: Option<&str>, text: &str) -> CompiledPrompt {
    let display = display_text(text).to_string();

    if text.contains(SEPARATOR) {
        return CompiledPrompt {
            outgoing: text.to_string(),
            display,
        };
    }

    let outgoing = match instruction(format, spec.unwrap_or_default()) {
        Some(block) => format!("{text}\n\n{SEPARATOR}\n{block}"),
        None => text.to_string(),
    };

    CompiledPrompt { outgoing, display }
}

/// Authored part of a message: everything before the separator, right-trimmed.
pub fn display_text(text: &str) -> &str {
    match text.find(SEPARATOR) {
        Some(index) => text[..index].trim_end(),
        None => text,
    }
}

/// Instruction text for a format, or `None` when nothing should be appended.
pub fn instruction(format: OutputFormat, spec: &str) -> Option<String> {
    let has_spec = !spec.trim().is_empty();

    match format {
        OutputFormat::Default | OutputFormat::Html => None,
        OutputFormat::Json => {
            if !has_spec {
                return None;
            }
            let schema = match validate_json(spec) {
                Ok(schema) => schema,
                Err(error) => {
                    tracing::warn!(error = %error, "skipping json instruction for unparsable schema");
                    return None;
                }
            };
            Some(format!(
                "You must respond with valid JSON only. The output must strictly follow this JSON schema:\n```json\n{schema}\n```\n\nDo not add any explanations or extra text outside the JSON object."
            ))
        }
        OutputFormat::Regex => has_spec.then(|| {
            format!(
                "Your response must match this exact pattern: {}\nDo not add any explanations or extra text.",
                anchor_pattern(spec)
            )
        }),
        OutputFormat::Template => has_spec.then(|| {
            format!(
                "Your response must look exactly like this:\n```\n{}\n```\n\nReplace every {SLOT_MARKER} marker with appropriate generated content and keep all other text unchanged.\nDo not add any explanations, greetings, or extra text. Only output the exact format shown above.",
                expand_escapes(spec)
            )
        }),
        OutputFormat::Csv => {
            let columns = parse_csv_columns(spec);
            let schema = if columns.is_empty() {
                " There is no fixed column schema; choose suitable columns yourself.".to_string()
            } else {
                format!(" Use exactly these columns, in this order: {}.", columns.join(","))
            };
            Some(format!(
                "You must respond in CSV format.{schema} Do not add any explanations or extra text."
            ))
        }
    }
}

/// Anchors a pattern at both ends unless it already is.
pub fn anchor_pattern(pattern: &str) -> String {
    let mut anchored = String::with_capacity(pattern.len() + 2);
    if !pattern.starts_with('^') {
        anchored.push('^');
    }
    anchored.push_str(pattern);
    if !pattern.ends_with('$') || pattern.ends_with("\\$") {
        anchored.push('$');
    }
    anchored
}

/// Expands literal `\n` and `\t` sequences in a stored template.
pub fn expand_escapes(template: &str) -> String {
    template.replace("\\n", "\n").replace("\\t", "\t")
}
