use std::collections::BTreeMap;

use percent_encoding::{AsciiSet, NON_ALPHANUMERIC, utf8_percent_encode};

use crate::circuit::Circuit;
use crate::config::{CapabilitySetting, CapsConfig};

// RFC 3986 unreserved characters stay as they are.
const ESCAPE_SET: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'.')
    .remove(b'_')
    .remove(b'~');

pub fn escape(value: &str) -> String {
    utf8_percent_encode(value, ESCAPE_SET).to_string()
}

/// Values substituted into external capability URL templates.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TemplateValues {
    pub home_uri: String,
    pub inventory_uri: String,
    pub scene_id: String,
    pub session_id: String,
    pub agent_id: String,
}

impl TemplateValues {
    pub fn for_circuit(circuit: &Circuit) -> Self {
        let urls = circuit.services().service_urls(circuit.agent_id());
        Self {
            home_uri: urls.home_uri,
            inventory_uri: urls.inventory_uri,
            scene_id: circuit
                .scene()
                .map(|scene| scene.scene_id().to_string())
                .unwrap_or_default(),
            session_id: circuit.session_id().to_string(),
            agent_id: circuit.agent_id().to_string(),
        }
    }
}

/// Expands `%%`, `%h`, `%i`, `%r`, `%s` and `%u` in `template`. Substituted
/// values are percent-escaped; any other `%x` pair is copied as is.
pub fn expand_template(template: &str, values: &TemplateValues) -> String {
    let mut out = String::with_capacity(template.len() + 64);
    let mut chars = template.chars();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('%') => out.push('%'),
            Some('h') => out.push_str(&escape(&values.home_uri)),
            Some('i') => out.push_str(&escape(&values.inventory_uri)),
            Some('r') => out.push_str(&escape(&values.scene_id)),
            Some('s') => out.push_str(&escape(&values.session_id)),
            Some('u') => out.push_str(&escape(&values.agent_id)),
            Some(other) => {
                out.push('%');
                out.push(other);
            }
            None => out.push('%'),
        }
    }
    out
}

/// Answers a seed request: every requested name that is configured maps to
/// either this server's URL for the circuit's capability or an expanded
/// template.
pub fn resolve_seed(
    circuit: &Circuit,
    config: &CapsConfig,
    requested: &[String],
) -> BTreeMap<String, String> {
    let values = TemplateValues::for_circuit(circuit);
    let mut resolved = BTreeMap::new();

    for name in requested {
        let url = match config.capabilities.get(name) {
            Some(CapabilitySetting::Localhost) => circuit
                .capabilities()
                .get(name)
                .map(|binding| config.capability_url(&binding.id)),
            Some(CapabilitySetting::Template(template)) => {
                Some(expand_template(template, &values))
            }
            None => None,
        };
        if let Some(url) = url {
            resolved.insert(name.clone(), url);
        }
    }
    resolved
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit::testing::test_circuit;

    #[test]
    fn test_template_escapes_each_token() {
        let values = TemplateValues {
            home_uri: "http://home:8002/".into(),
            agent_id: "a b".into(),
            ..Default::default()
        };

        assert_eq!(
            expand_template("%h|%u|%%|%q|%", &values),
            "http%3A%2F%2Fhome%3A8002%2F|a%20b|%|%q|%"
        );
    }

    #[test]
    fn test_template_with_agent_and_scene() {
        let values = TemplateValues {
            agent_id: "A~1".into(),
            scene_id: "R.2".into(),
            ..Default::default()
        };

        assert_eq!(
            expand_template("http://x/%u/%r", &values),
            format!("http://x/{}/{}", escape("A~1"), escape("R.2"))
        );
    }

    #[test]
    fn test_seed_resolves_localhost_and_templates() {
        let (circuit, _, _) = test_circuit();
        let mut config = CapsConfig::default();
        config.capabilities.insert(
            "FetchInventory2".into(),
            CapabilitySetting::Template("http://inv/%u".into()),
        );

        let requested: Vec<String> = ["EventQueueGet", "GetMesh", "FetchInventory2", "Nope"]
            .into_iter()
            .map(String::from)
            .collect();
        let resolved = resolve_seed(&circuit, &config, &requested);

        let queue = circuit.capabilities().get("EventQueueGet").unwrap();
        assert_eq!(resolved["EventQueueGet"], config.capability_url(&queue.id));
        assert_eq!(
            resolved["FetchInventory2"],
            format!("http://inv/{}", circuit.agent_id())
        );
        assert!(!resolved.contains_key("GetMesh"));
        assert!(!resolved.contains_key("Nope"));
    }
}
