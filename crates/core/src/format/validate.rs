use snafu::ResultExt;
use structura_llm::OutputFormat;

use super::SLOT_MARKER;
use crate::error::{FormatResult, InvalidJsonSnafu, InvalidRegexSnafu, LookaroundSnafu};

const LOOKAROUNDS: [(&str, &str); 4] = [
    ("(?=", "lookahead"),
    ("(?!", "negative lookahead"),
    ("(?<=", "lookbehind"),
    ("(?<!", "negative lookbehind"),
];

/// A spec that passed validation, in its canonical stored form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedSpec {
    pub canonical: String,
    /// Accepted but worth telling the user about.
    pub warning: Option<String>,
}

impl ValidatedSpec {
    fn clean(canonical: String) -> Self {
        Self {
            canonical,
            warning: None,
        }
    }
}

/// Validates `spec` for `format` and returns the form that should be stored.
///
/// An empty spec is always accepted. Formats without a spec store nothing.
pub fn validate(format: OutputFormat, spec: &str) -> FormatResult<ValidatedSpec> {
    if spec.trim().is_empty() {
        return Ok(ValidatedSpec::clean(String::new()));
    }

    match format {
        OutputFormat::Default | OutputFormat::Html => Ok(ValidatedSpec::clean(String::new())),
        OutputFormat::Json => validate_json(spec).map(ValidatedSpec::clean),
        OutputFormat::Regex => validate_regex(spec).map(ValidatedSpec::clean),
        OutputFormat::Template => {
            let slots = count_slots(spec);
            Ok(ValidatedSpec {
                canonical: spec.to_string(),
                warning: (slots == 0)
                    .then(|| format!("template has no {SLOT_MARKER} slot to generate into")),
            })
        }
        OutputFormat::Csv => Ok(ValidatedSpec::clean(spec.trim().to_string())),
    }
}

/// Parses a JSON schema and returns it pretty-printed.
pub fn validate_json(spec: &str) -> FormatResult<String> {
    let value = serde_json::from_str::<serde_json::Value>(spec).context(InvalidJsonSnafu {
        stage: "parse-json-schema",
    })?;
    serde_json::to_string_pretty(&value).context(InvalidJsonSnafu {
        stage: "render-json-schema",
    })
}

/// Rejects lookaround before the pattern is ever handed to the regex engine.
pub fn validate_regex(spec: &str) -> FormatResult<String> {
    if let Some((token, construct)) = find_lookaround(spec) {
        return LookaroundSnafu {
            stage: "check-regex-lookaround",
            construct,
            token,
        }
        .fail();
    }

    regex::Regex::new(spec).context(InvalidRegexSnafu {
        stage: "compile-regex",
    })?;
    Ok(spec.to_string())
}

/// Finds the first lookaround group outside escapes and character classes.
pub fn find_lookaround(pattern: &str) -> Option<(&'static str, &'static str)> {
    let bytes = pattern.as_bytes();
    let mut index = 0;
    let mut in_class = false;

    while index < bytes.len() {
        match bytes[index] {
            b'\\' => {
                index += 2;
                continue;
            }
            b'[' if !in_class => in_class = true,
            b']' if in_class => in_class = false,
            b'(' if !in_class => {
                let rest = &bytes[index..];
                if let Some((token, construct)) = LOOKAROUNDS
                    .iter()
                    .find(|(token, _)| rest.starts_with(token.as_bytes()))
                {
                    return Some((*token, *construct));
                }
            }
            _ => {}
        }
        index += 1;
    }

    None
}

pub fn count_slots(template: &str) -> usize {
    template.matches(SLOT_MARKER).count()
}

/// Splits a column list. Blanks and duplicates are kept; an empty list means no fixed schema.
pub fn parse_csv_columns(spec: &str) -> Vec<String> {
    if spec.trim().is_empty() {
        return Vec::new();
    }
    spec.split(',').map(|column| column.trim().to_string()).collect()
}

/// Full-match check of a completed answer. An invalid pattern never matches.
pub fn regex_matches(pattern: &str, content: &str) -> bool {
    match regex::Regex::new(&format!("^(?:{pattern})$")) {
        Ok(regex) => regex.is_match(content),
        Err(error) => {
            tracing::debug!(error = %error, "response pattern does not compile");
            false
        }
    }
}

/// A template answer only has to be non-blank.
pub fn template_response_ok(content: &str) -> bool {
    !content.trim().is_empty()
}
