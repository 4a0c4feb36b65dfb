//! Layered configuration loading.
//!
//! Deployment config is a stack of YAML files applied in precedence order
//! (base, then environment, then site overrides). The stack folds into one
//! effective document, which is rendered to canonical JSON and fingerprinted
//! with SHA-256 so two processes can prove they run the same configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::fs;

pub mod settings;

pub use settings::{
    BreakerSettings, CircuitBreakerConfig, DlqConfig, FeaturesConfig, LoaderConfig, RetryConfig,
    UpstreamConfig, ValidationConfig,
};

/// One fully merged configuration: the effective document, its canonical
/// rendering, and the fingerprint of that rendering.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LayeredConfig {
    pub json: Value,
    pub canonical: String,
    pub hash: String,
}

/// Read YAML layers in precedence order and fold them into one document.
/// Mappings combine key-by-key; sequences and scalars from a later layer
/// replace the earlier value outright.
pub fn load_layers(paths: &[&str]) -> Result<LayeredConfig> {
    let mut effective = Value::Object(Default::default());

    for path in paths {
        let text =
            fs::read_to_string(path).with_context(|| format!("read config layer {path}"))?;
        let doc: serde_yaml::Value =
            serde_yaml::from_str(&text).with_context(|| format!("parse yaml layer {path}"))?;
        let doc =
            serde_json::to_value(doc).with_context(|| format!("represent {path} as json"))?;
        effective = overlay(effective, doc);
    }

    let canonical = canonical_json(&effective);
    let hash = hex::encode(Sha256::digest(canonical.as_bytes()));

    Ok(LayeredConfig {
        json: effective,
        canonical,
        hash,
    })
}

/// Load the layers and deserialize into the typed [`LoaderConfig`].
///
/// Missing sections fall back to their defaults so a minimal deployment file
/// only has to name what it overrides.
pub fn load_loader_config(paths: &[&str]) -> Result<(LoaderConfig, LayeredConfig)> {
    let layered = load_layers(paths)?;
    let cfg: LoaderConfig = serde_json::from_value(layered.json.clone())
        .context("config does not match LoaderConfig shape")?;
    Ok((cfg, layered))
}

/// Fold `patch` over `base`. Only object-onto-object recurses; any other
/// pairing takes the patch value wholesale.
fn overlay(base: Value, patch: Value) -> Value {
    match (base, patch) {
        (Value::Object(mut under), Value::Object(over)) => {
            for (key, incoming) in over {
                let folded = match under.remove(&key) {
                    Some(existing) => overlay(existing, incoming),
                    None => incoming,
                };
                under.insert(key, folded);
            }
            Value::Object(under)
        }
        (_, replacement) => replacement,
    }
}

/// Render compact JSON with object keys emitted in sorted order, so two
/// documents with identical content always produce identical bytes.
fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|a, b| a.0.cmp(b.0));

            out.push('{');
            for (i, (key, child)) in entries.into_iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Escaping via the JSON string type keeps keys exact.
                out.push_str(&Value::String(key.clone()).to_string());
                out.push(':');
                write_canonical(child, out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        leaf => out.push_str(&leaf.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_yaml(dir: &tempfile::TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        let mut f = fs::File::create(&path).unwrap();
        f.write_all(body.as_bytes()).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[test]
    fn later_layer_overrides_earlier() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_yaml(&dir, "base.yaml", "batch_size: 500\nprocessing_threads: 4\n");
        let env = write_yaml(&dir, "prod.yaml", "batch_size: 2000\n");

        let layered = load_layers(&[&base, &env]).unwrap();
        assert_eq!(layered.json["batch_size"], 2000);
        assert_eq!(layered.json["processing_threads"], 4);
    }

    #[test]
    fn nested_sections_fold_key_by_key() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_yaml(
            &dir,
            "base.yaml",
            "dlq:\n  max_retries: 3\n  retention_days: 30\n",
        );
        let site = write_yaml(&dir, "site.yaml", "dlq:\n  max_retries: 5\n");

        let layered = load_layers(&[&base, &site]).unwrap();
        assert_eq!(layered.json["dlq"]["max_retries"], 5);
        assert_eq!(
            layered.json["dlq"]["retention_days"], 30,
            "untouched sibling keys survive the overlay"
        );
    }

    #[test]
    fn hash_is_stable_across_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_yaml(&dir, "a.yaml", "x: 1\ny: 2\n");
        let b = write_yaml(&dir, "b.yaml", "y: 2\nx: 1\n");

        let ha = load_layers(&[&a]).unwrap().hash;
        let hb = load_layers(&[&b]).unwrap().hash;
        assert_eq!(ha, hb);
    }

    #[test]
    fn canonical_rendering_sorts_keys_and_stays_compact() {
        let dir = tempfile::tempdir().unwrap();
        let f = write_yaml(&dir, "f.yaml", "b: 2\na: 1\n");

        let layered = load_layers(&[&f]).unwrap();
        assert_eq!(layered.canonical, r#"{"a":1,"b":2}"#);
    }

    #[test]
    fn typed_config_defaults_fill_missing_sections() {
        let dir = tempfile::tempdir().unwrap();
        let base = write_yaml(&dir, "base.yaml", "batch_size: 1000\n");

        let (cfg, _) = load_loader_config(&[&base]).unwrap();
        assert_eq!(cfg.batch_size, 1000);
        assert_eq!(cfg.dlq.max_retries, 3);
        assert!(cfg.features.eod_enabled);
    }
}
