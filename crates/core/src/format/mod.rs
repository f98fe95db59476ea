//! Output-format specs: validation, per-format memory and prompt compilation.

use std::collections::HashMap;

use structura_llm::OutputFormat;
use structura_storage::PresetKind;

use crate::error::FormatResult;

pub mod compiler;
pub mod validate;

pub use compiler::{CompiledPrompt, compile, display_text};
pub use validate::{ValidatedSpec, regex_matches, template_response_ok, validate};

/// Boundary between the authored text and the appended instruction block.
pub const SEPARATOR: &str = "%-%-%";
/// Slot marker a template answer must fill in.
pub const SLOT_MARKER: &str = "[GEN]";

pub fn default_spec(format: OutputFormat) -> Option<&'static str> {
    match format {
        OutputFormat::Json => Some(r#"{"type":"object","properties":{}}"#),
        OutputFormat::Template => Some("Name: [GEN]\\nAge: [GEN]"),
        OutputFormat::Regex => Some("[A-Za-z0-9]+"),
        OutputFormat::Csv => Some("Column 1,Column 2"),
        OutputFormat::Default | OutputFormat::Html => None,
    }
}

/// Collection holding saved specs of `format`, if it keeps any.
pub fn preset_kind(format: OutputFormat) -> Option<PresetKind> {
    match format {
        OutputFormat::Json => Some(PresetKind::Schema),
        OutputFormat::Template => Some(PresetKind::Template),
        OutputFormat::Regex => Some(PresetKind::Regex),
        OutputFormat::Csv => Some(PresetKind::Csv),
        OutputFormat::Default | OutputFormat::Html => None,
    }
}

/// Active output format plus the last valid spec remembered for every format.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FormatState {
    active: OutputFormat,
    specs: HashMap<OutputFormat, String>,
}

impl Default for FormatState {
    fn default() -> Self {
        let specs = OutputFormat::ALL
            .into_iter()
            .filter_map(|format| default_spec(format).map(|spec| (format, spec.to_string())))
            .collect();
        Self {
            active: OutputFormat::Default,
            specs,
        }
    }
}

impl FormatState {
    pub fn active(&self) -> OutputFormat {
        self.active
    }

    /// Spec of the active format, `None` when it has none or it is empty.
    pub fn spec(&self) -> Option<&str> {
        self.spec_for(self.active)
    }

    pub fn spec_for(&self, format: OutputFormat) -> Option<&str> {
        if !format.carries_spec() {
            return None;
        }
        self.specs
            .get(&format)
            .map(String::as_str)
            .filter(|spec| !spec.trim().is_empty())
    }

    /// Switches format and restores the spec remembered for it.
    pub fn select(&mut self, format: OutputFormat) {
        self.active = format;
    }

    /// Validates and stores a spec for the active format. A rejected spec leaves the stored one intact.
    pub fn set_spec(&mut self, spec: &str) -> FormatResult<ValidatedSpec> {
        let validated = validate(self.active, spec)?;
        if self.active.carries_spec() {
            self.specs.insert(self.active, validated.canonical.clone());
        }
        Ok(validated)
    }

    /// Falls back to `default`. Returns whether the active format changed.
    pub fn reset_to_default(&mut self) -> bool {
        let changed = self.active != OutputFormat::Default;
        self.active = OutputFormat::Default;
        changed
    }

    pub fn compile(&self, text: &str) -> CompiledPrompt {
        compile(self.active, self.spec(), text)
    }
}
