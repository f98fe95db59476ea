use std::collections::HashMap;

use super::backend::Backend;
use super::output_format::OutputFormat;

/// Output formats each backend supports, as last reported by the capabilities service.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CapabilityMap {
    formats: Option<HashMap<Backend, Vec<OutputFormat>>>,
}

impl CapabilityMap {
    /// State before the first successful fetch.
    pub fn unfetched() -> Self {
        Self::default()
    }

    pub fn new(formats: HashMap<Backend, Vec<OutputFormat>>) -> Self {
        Self {
            formats: Some(formats),
        }
    }

    /// Builds the map from the service's `{backend: [format]}` payload.
    ///
    /// Unknown backend or format names are skipped.
    pub fn from_wire(raw: HashMap<String, Vec<String>>) -> Self {
        let mut formats = HashMap::new();

        for (raw_backend, raw_formats) in raw {
            let Ok(backend) = raw_backend.parse::<Backend>() else {
                tracing::debug!(backend = %raw_backend, "skipping capabilities for unknown backend");
                continue;
            };

            let parsed = raw_formats
                .iter()
                .filter_map(|raw_format| match raw_format.parse::<OutputFormat>() {
                    Ok(format) => Some(format),
                    Err(error) => {
                        tracing::debug!(backend = %backend, error = %error, "skipping capability");
                        None
                    }
                })
                .collect::<Vec<_>>();
            formats.insert(backend, parsed);
        }

        Self::new(formats)
    }

    pub fn is_fetched(&self) -> bool {
        self.formats.is_some()
    }

    /// Ordered formats selectable for `backend`; free text is always first.
    pub fn formats_for(&self, backend: Backend) -> Vec<OutputFormat> {
        let mut selectable = vec![OutputFormat::Default];
        let Some(formats) = &self.formats else {
            return selectable;
        };

        if let Some(supported) = formats.get(&backend) {
            for format in OutputFormat::ALL {
                if format != OutputFormat::Default && supported.contains(&format) {
                    selectable.push(format);
                }
            }
        }

        selectable
    }

    pub fn supports(&self, backend: Backend, format: OutputFormat) -> bool {
        self.formats_for(backend).contains(&format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_default_is_offered_before_first_fetch() {
        let capabilities = CapabilityMap::unfetched();
        for backend in Backend::ALL {
            assert_eq!(capabilities.formats_for(backend), vec![OutputFormat::Default]);
        }
        assert!(!capabilities.supports(Backend::Vllm, OutputFormat::Json));
    }

    #[test]
    fn wire_payload_is_ordered_and_filtered() {
        let raw = HashMap::from([
            (
                "vllm".to_string(),
                vec![
                    "regex".to_string(),
                    "json".to_string(),
                    "bogus".to_string(),
                    "default".to_string(),
                ],
            ),
            ("mystery".to_string(), vec!["json".to_string()]),
        ]);

        let capabilities = CapabilityMap::from_wire(raw);
        assert!(capabilities.is_fetched());
        assert_eq!(
            capabilities.formats_for(Backend::Vllm),
            vec![OutputFormat::Default, OutputFormat::Json, OutputFormat::Regex]
        );
        assert_eq!(
            capabilities.formats_for(Backend::Ollama),
            vec![OutputFormat::Default]
        );
    }
}
