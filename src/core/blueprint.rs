//! Hierarchical blueprint configuration
//!
//! A blueprint root document names a set of backend data sources and an
//! ordered hierarchy of path templates. Lookups interpolate the hierarchy
//! against the caller-supplied context and merge values across layers,
//! most specific first.

use crate::core::error::BlueprintError;
use regex::Regex;
use serde_yaml::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// How values found in multiple layers are combined
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStrategy {
    /// First (most specific) hit wins regardless of shape
    First,
    /// Mappings merge recursively with higher-ranked keys winning;
    /// scalars and sequences still take the first hit
    Deep,
}

/// A named backend data source
#[derive(Debug, Clone)]
pub struct BackendConfig {
    pub name: String,
    pub datadir: PathBuf,
}

/// Layered configuration store for one pipeline blueprint
#[derive(Debug)]
pub struct Blueprint {
    base_dir: PathBuf,
    backends: Vec<BackendConfig>,
    hierarchy: Vec<String>,
    context: HashMap<String, String>,
    context_pattern: Regex,
    env_pattern: Regex,
}

impl Blueprint {
    /// Load and validate a blueprint root document
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, BlueprintError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| BlueprintError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let doc: Value = serde_yaml::from_str(&content).map_err(|source| BlueprintError::Yaml {
            path: path.display().to_string(),
            source,
        })?;

        let base_dir = path.parent().unwrap_or_else(|| Path::new(".")).to_path_buf();
        Self::from_document(&doc, base_dir)
    }

    /// Build a blueprint from an already-parsed root document
    pub fn from_document(doc: &Value, base_dir: PathBuf) -> Result<Self, BlueprintError> {
        let (backends, hierarchy) = Self::validate(doc)?;

        Ok(Self {
            base_dir,
            backends,
            hierarchy,
            context: HashMap::new(),
            context_pattern: Regex::new(r"%\{([A-Za-z0-9_]+)\}")
                .map_err(|e| BlueprintError::Validation(e.to_string()))?,
            env_pattern: Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}")
                .map_err(|e| BlueprintError::Validation(e.to_string()))?,
        })
    }

    /// Structural validation of the root document: `backends`, `context` and
    /// `hierarchy` must be lists, and every named backend must declare a
    /// `datadir`
    fn validate(doc: &Value) -> Result<(Vec<BackendConfig>, Vec<String>), BlueprintError> {
        for key in ["backends", "context", "hierarchy"] {
            match doc.get(key) {
                None => {
                    return Err(BlueprintError::Validation(format!(
                        "'{key}' not defined in the blueprint root document"
                    )))
                }
                Some(Value::Sequence(_)) => {}
                Some(_) => {
                    return Err(BlueprintError::Validation(format!(
                        "'{key}' must be a list"
                    )))
                }
            }
        }

        let backend_names: Vec<String> = doc
            .get("backends")
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        let mut backends = Vec::with_capacity(backend_names.len());
        for name in backend_names {
            let settings = doc.get(&name).ok_or_else(|| {
                BlueprintError::Validation(format!(
                    "backend '{name}' not defined in the blueprint root document"
                ))
            })?;
            if !settings.is_mapping() {
                return Err(BlueprintError::Validation(format!(
                    "backend '{name}' settings must be a mapping"
                )));
            }
            let datadir = settings
                .get("datadir")
                .and_then(Value::as_str)
                .ok_or_else(|| {
                    BlueprintError::Validation(format!(
                        "datadir not found in '{name}' backend configuration"
                    ))
                })?;
            backends.push(BackendConfig {
                name,
                datadir: PathBuf::from(datadir),
            });
        }

        let hierarchy = doc
            .get("hierarchy")
            .and_then(Value::as_sequence)
            .map(|seq| {
                seq.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok((backends, hierarchy))
    }

    /// Merge a single context key; later sets overwrite earlier ones
    pub fn set_context(&mut self, key: &str, value: &str) {
        self.context.insert(key.to_string(), value.to_string());
    }

    /// Merge a whole context map
    pub fn set_context_map(&mut self, context: HashMap<String, String>) {
        self.context.extend(context);
    }

    pub fn context(&self) -> &HashMap<String, String> {
        &self.context
    }

    /// Look up `key` across all layers
    pub fn get(
        &self,
        key: &str,
        merge: MergeStrategy,
        throw_on_missing: bool,
    ) -> Result<Option<Value>, BlueprintError> {
        // Hits in rank order, most specific first
        let mut hits: Vec<Value> = Vec::new();

        for layer in &self.hierarchy {
            let Some(relative) = self.interpolate(layer) else {
                debug!(layer, "skipping layer with unresolved context keys");
                continue;
            };

            for backend in &self.backends {
                let path = self
                    .base_dir
                    .join(&backend.datadir)
                    .join(format!("{relative}.yaml"));
                let Some(doc) = self.load_layer(&path)? else {
                    continue;
                };
                if let Some(hit) = doc.get(key) {
                    debug!(key, backend = %backend.name, path = %path.display(), "hit");
                    hits.push(hit.clone());
                }
            }
        }

        let result = match merge {
            MergeStrategy::First => hits.into_iter().next(),
            MergeStrategy::Deep => combine_deep(hits),
        };

        match result {
            Some(value) => Ok(Some(value)),
            None if throw_on_missing => Err(BlueprintError::MissingKey(key.to_string())),
            None => Ok(None),
        }
    }

    /// Deep-merge lookup that errors on a missing key; the common case for
    /// pipeline definitions
    pub fn get_definition(&self, key: &str) -> Result<Value, BlueprintError> {
        Ok(self
            .get(key, MergeStrategy::Deep, true)?
            .unwrap_or(Value::Null))
    }

    /// Interpolate `%{key}` placeholders; returns None when the context is
    /// missing any referenced key, which skips the layer
    fn interpolate(&self, template: &str) -> Option<String> {
        let mut out = String::with_capacity(template.len());
        let mut last = 0;
        for capture in self.context_pattern.captures_iter(template) {
            let whole = capture.get(0)?;
            let key = &capture[1];
            out.push_str(&template[last..whole.start()]);
            out.push_str(self.context.get(key)?);
            last = whole.end();
        }
        out.push_str(&template[last..]);
        Some(out)
    }

    /// Read one layer file if present, substituting `${NAME}` environment
    /// variable placeholders in every scalar string
    fn load_layer(&self, path: &Path) -> Result<Option<Value>, BlueprintError> {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(source) => {
                return Err(BlueprintError::Io {
                    path: path.display().to_string(),
                    source,
                })
            }
        };
        let mut doc: Value =
            serde_yaml::from_str(&content).map_err(|source| BlueprintError::Yaml {
                path: path.display().to_string(),
                source,
            })?;
        self.substitute_env_vars(&mut doc);
        Ok(Some(doc))
    }

    fn substitute_env_vars(&self, value: &mut Value) {
        match value {
            Value::String(s) => {
                if self.env_pattern.is_match(s) {
                    *s = self
                        .env_pattern
                        .replace_all(s, |caps: &regex::Captures| {
                            // Unset variables keep the literal token
                            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
                        })
                        .into_owned();
                }
            }
            Value::Sequence(seq) => {
                for element in seq {
                    self.substitute_env_vars(element);
                }
            }
            Value::Mapping(map) => {
                for (_, element) in map.iter_mut() {
                    self.substitute_env_vars(element);
                }
            }
            _ => {}
        }
    }
}

/// Combine ranked hits (most specific first). If the most specific hit is
/// not a mapping it wins outright; mapping hits fold from the least specific
/// up, so key order follows the base layer while more specific layers
/// override values.
fn combine_deep(hits: Vec<Value>) -> Option<Value> {
    if !matches!(hits.first(), Some(Value::Mapping(_))) {
        return hits.into_iter().next();
    }

    let mut acc = serde_yaml::Mapping::new();
    for hit in hits.iter().rev() {
        if let Value::Mapping(upper) = hit {
            overlay(&mut acc, upper);
        }
    }
    Some(Value::Mapping(acc))
}

/// Overlay a more specific mapping onto `acc`: existing keys are replaced in
/// place, nested mappings recurse, new keys append
fn overlay(acc: &mut serde_yaml::Mapping, upper: &serde_yaml::Mapping) {
    for (key, upper_value) in upper {
        match (acc.get_mut(key), upper_value) {
            (Some(Value::Mapping(acc_nested)), Value::Mapping(upper_nested)) => {
                overlay(acc_nested, upper_nested);
            }
            (Some(slot), _) => *slot = upper_value.clone(),
            (None, _) => {
                acc.insert(key.clone(), upper_value.clone());
            }
        }
    }
}
