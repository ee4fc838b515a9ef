//! Template renderer (C2).
//!
//! Pure transformation from (template text, values document, claim id) to the
//! list of declared resource documents plus the harvested return values. The
//! claim id is the only per-claim uniqueness injected into the output, so the
//! renderer is deterministic given its inputs.

mod engine;

use std::collections::BTreeMap;

use minijinja::context;
use serde::Deserialize;

use crate::claim::RETURN_VALUES_DIRECTIVE_KEY;
use crate::Error;

pub use engine::TemplateEngine;

/// Rendered template output: resource documents plus return values.
#[derive(Clone, Debug, Default)]
pub struct ResourceTemplate {
    /// Decoded resource documents, each with apiVersion/kind/metadata.name
    pub resources: Vec<serde_json::Value>,
    /// Values harvested from `claim.controller/return` directives
    pub return_values: BTreeMap<String, String>,
}

/// Render `template_text` against `values_data` (a YAML document) for the
/// given claim id.
///
/// The rendered output is split as multi-document YAML. Documents that are
/// null or carry no `kind` are skipped; each kept document must have a
/// non-empty `apiVersion`, `kind`, and `metadata.name`. Rendering zero kept
/// documents is an error.
pub fn render_resources(
    template_text: &str,
    values_data: &[u8],
    claim_id: &str,
) -> Result<ResourceTemplate, Error> {
    let values: serde_yaml::Value = serde_yaml::from_slice(values_data)
        .map_err(|e| Error::render(format!("decode values document: {e}")))?;

    let engine = TemplateEngine::new();
    let rendered = engine.render(
        template_text,
        context! {
            values => values,
            claim => context! { id => claim_id },
        },
    )?;

    let mut result = ResourceTemplate::default();
    for document in serde_yaml::Deserializer::from_str(&rendered) {
        let Ok(value) = serde_yaml::Value::deserialize(document) else {
            return Err(Error::render("decode rendered YAML document"));
        };
        if value.is_null() {
            continue;
        }
        if value.get("kind").is_none() {
            continue;
        }

        let resource: serde_json::Value = serde_json::to_value(&value)
            .map_err(|e| Error::render(format!("convert rendered document: {e}")))?;
        validate_resource(&resource)?;
        harvest_return_values(&mut result.return_values, &resource);
        result.resources.push(resource);
    }

    if result.resources.is_empty() {
        return Err(Error::render("template must render at least one resource"));
    }

    Ok(result)
}

fn validate_resource(resource: &serde_json::Value) -> Result<(), Error> {
    if resource["apiVersion"].as_str().unwrap_or("").is_empty() {
        return Err(Error::render("rendered resource missing apiVersion"));
    }
    if resource["kind"].as_str().unwrap_or("").is_empty() {
        return Err(Error::render("rendered resource missing kind"));
    }
    if resource["metadata"]["name"].as_str().unwrap_or("").is_empty() {
        return Err(Error::render("rendered resource missing metadata.name"));
    }
    Ok(())
}

/// Merge `claim.controller/return` directives from the resource's labels and
/// annotations into `target`. Later resources override earlier ones.
fn harvest_return_values(target: &mut BTreeMap<String, String>, resource: &serde_json::Value) {
    for section in ["labels", "annotations"] {
        let Some(entries) = resource["metadata"][section].as_object() else {
            continue;
        };
        let Some(directive) = entries.get(RETURN_VALUES_DIRECTIVE_KEY) else {
            continue;
        };
        let Some(directive) = directive.as_str().filter(|s| !s.trim().is_empty()) else {
            continue;
        };
        for (key, value) in parse_key_value_pairs(directive) {
            target.insert(key, value);
        }
    }
}

/// Parse a comma/semicolon/newline-separated list of `k=v` pairs.
///
/// Empty tokens and tokens without `=` are dropped; keys and values are
/// trimmed; empty keys are dropped.
pub fn parse_key_value_pairs(s: &str) -> BTreeMap<String, String> {
    let mut out = BTreeMap::new();
    for token in s.split(['\n', ';', ',']) {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        let Some((key, value)) = token.split_once('=') else {
            continue;
        };
        let key = key.trim();
        if key.is_empty() {
            continue;
        }
        out.insert(key.to_string(), value.trim().to_string());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEMPLATE: &str = r#"
apiVersion: v1
kind: Pod
metadata:
  name: workload-{{ claim.id }}
  labels:
    app: {{ values.app }}
spec:
  containers:
    - name: main
      image: {{ values.image }}
---
apiVersion: v1
kind: Service
metadata:
  name: endpoint-{{ claim.id }}
  annotations:
    claim.controller/return: "host=endpoint-{{ claim.id }}, port={{ values.port }}"
spec:
  selector:
    app: {{ values.app }}
"#;

    const VALUES: &[u8] = b"app: sandbox\nimage: registry.local/sandbox:v3\nport: 8080\n";

    #[test]
    fn renders_resources_with_claim_id_uniqueness() {
        let out = render_resources(TEMPLATE, VALUES, "ab12cd34").unwrap();
        assert_eq!(out.resources.len(), 2);
        assert_eq!(
            out.resources[0]["metadata"]["name"].as_str(),
            Some("workload-ab12cd34")
        );
        assert_eq!(
            out.resources[1]["metadata"]["name"].as_str(),
            Some("endpoint-ab12cd34")
        );

        // only the claim id differs between two renders
        let again = render_resources(TEMPLATE, VALUES, "zz99yy88").unwrap();
        assert_eq!(
            again.resources[0]["metadata"]["name"].as_str(),
            Some("workload-zz99yy88")
        );
    }

    #[test]
    fn harvests_return_values_from_annotations() {
        let out = render_resources(TEMPLATE, VALUES, "ab12cd34").unwrap();
        assert_eq!(
            out.return_values.get("host").map(String::as_str),
            Some("endpoint-ab12cd34")
        );
        assert_eq!(out.return_values.get("port").map(String::as_str), Some("8080"));
    }

    #[test]
    fn later_resources_override_earlier_return_values() {
        let template = r#"
apiVersion: v1
kind: ConfigMap
metadata:
  name: first-{{ claim.id }}
  labels:
    claim.controller/return: "winner=first"
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: second-{{ claim.id }}
  annotations:
    claim.controller/return: "winner=second"
"#;
        let out = render_resources(template, b"{}", "ab12cd34").unwrap();
        assert_eq!(
            out.return_values.get("winner").map(String::as_str),
            Some("second")
        );
    }

    #[test]
    fn empty_render_is_an_error() {
        let err = render_resources("# nothing here\n", b"{}", "ab12cd34").unwrap_err();
        assert!(err.to_string().contains("at least one resource"));
    }

    #[test]
    fn kindless_documents_are_skipped() {
        let template = r#"
just: a fragment
---
apiVersion: v1
kind: ConfigMap
metadata:
  name: kept-{{ claim.id }}
"#;
        let out = render_resources(template, b"{}", "ab12cd34").unwrap();
        assert_eq!(out.resources.len(), 1);
    }

    #[test]
    fn incomplete_resources_fail_the_render() {
        let template = "apiVersion: v1\nkind: ConfigMap\nmetadata: {}\n";
        let err = render_resources(template, b"{}", "ab12cd34").unwrap_err();
        assert!(err.to_string().contains("metadata.name"));
    }

    #[test]
    fn missing_values_key_fails_the_render() {
        let template = "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ values.absent }}\n";
        assert!(render_resources(template, b"{}", "ab12cd34").is_err());
    }

    #[test]
    fn key_value_pairs_accept_mixed_separators() {
        let parsed = parse_key_value_pairs("a=1,b=2; c=3\nd=4");
        assert_eq!(parsed.len(), 4);
        assert_eq!(parsed.get("a").map(String::as_str), Some("1"));
        assert_eq!(parsed.get("b").map(String::as_str), Some("2"));
        assert_eq!(parsed.get("c").map(String::as_str), Some("3"));
        assert_eq!(parsed.get("d").map(String::as_str), Some("4"));
    }

    #[test]
    fn key_value_pairs_drop_malformed_tokens() {
        let parsed = parse_key_value_pairs("a=1,,no-equals;=anon,  ,b = spaced value ");
        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed.get("a").map(String::as_str), Some("1"));
        assert_eq!(parsed.get("b").map(String::as_str), Some("spaced value"));
    }
}
