//! Compile-input producers
//!
//! Turning a device-agnostic job description into something the compiler
//! accepts is the job of an external transformer; the pipeline only sees it
//! through [`ProgramTransformer`].

use anyhow::{Context, Result};
use serde_yaml::Value;

/// Produces the compiler input for a job description
pub trait ProgramTransformer: Send + Sync {
    /// `target_name` is the base name the compiled program must get
    fn transform(&self, description: &str, target_name: &str) -> Result<String>;
}

/// Hands the description to the compiler unchanged
#[derive(Debug, Clone, Copy, Default)]
pub struct Passthrough;

impl ProgramTransformer for Passthrough {
    fn transform(&self, description: &str, _target_name: &str) -> Result<String> {
        Ok(description.to_string())
    }
}

/// Prepares a flowgraph document for headless compilation
///
/// Only pins the output name and disables the GUI; block rewriting is done
/// upstream.
#[derive(Debug, Clone, Copy, Default)]
pub struct FlowgraphTransformer;

impl ProgramTransformer for FlowgraphTransformer {
    fn transform(&self, description: &str, target_name: &str) -> Result<String> {
        let mut doc: Value =
            serde_yaml::from_str(description).context("job description is not valid YAML")?;

        let parameters = doc
            .get_mut("options")
            .and_then(|options| options.get_mut("parameters"))
            .and_then(Value::as_mapping_mut)
            .context("job description has no options.parameters section")?;

        parameters.insert(Value::from("id"), Value::from(target_name));
        parameters.insert(Value::from("generate_options"), Value::from("no_gui"));

        Ok(serde_yaml::to_string(&doc)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLOWGRAPH: &str = r#"
options:
  parameters:
    id: my_receiver
    generate_options: qt_gui
    title: Receiver
blocks:
  - name: samp_rate
    id: variable
"#;

    #[test]
    fn test_flowgraph_pins_target() {
        let out = FlowgraphTransformer
            .transform(FLOWGRAPH, "target_file")
            .unwrap();
        let doc: Value = serde_yaml::from_str(&out).unwrap();
        let params = &doc["options"]["parameters"];
        assert_eq!(params["id"].as_str(), Some("target_file"));
        assert_eq!(params["generate_options"].as_str(), Some("no_gui"));
        assert_eq!(params["title"].as_str(), Some("Receiver"));
        assert_eq!(doc["blocks"][0]["id"].as_str(), Some("variable"));
    }

    #[test]
    fn test_flowgraph_rejects_garbage() {
        assert!(FlowgraphTransformer.transform("[unclosed", "t").is_err());
        assert!(FlowgraphTransformer.transform("blocks: []", "t").is_err());
    }

    #[test]
    fn test_passthrough() {
        assert_eq!(Passthrough.transform("abc", "t").unwrap(), "abc");
    }
}
