//! Hierarchical key-value configuration document.
//!
//! Grounded in `local/tekkotsu/SimConfig.h` (`plist::Dictionary` loaded from
//! a file, with `addEntry` wiring named fields into the tree) and expressed
//! with `serde`/`serde_json` rather than hand-rolled `plist`. Recognises
//! every top-level configuration key and supports the `Key.Path=Value`
//! command-line override syntax applied after file load.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CoreError, Result};
use crate::runlevel::Runlevel;

fn default_speed() -> f64 {
  1.0
}
fn default_heartbeat() -> u32 {
  0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionConfig {
  #[serde(default)]
  pub verbose: u8,
  /// ms; negative means open-loop (no feedback applied).
  #[serde(default = "default_feedback_delay")]
  pub feedback_delay: i32,
  #[serde(default)]
  pub zero_pid_feedback: bool,
  #[serde(default)]
  pub feedback_range_limits: bool,
  #[serde(default)]
  pub override_sensors: bool,
  #[serde(default)]
  pub start_pose: Option<String>,
}
fn default_feedback_delay() -> i32 {
  -1
}

impl Default for MotionConfig {
  fn default() -> Self {
    MotionConfig {
      verbose: 0,
      feedback_delay: default_feedback_delay(),
      zero_pid_feedback: false,
      feedback_range_limits: false,
      override_sensors: false,
      start_pose: None,
    }
  }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
  #[serde(default = "default_speed")]
  pub framerate: f64,
  #[serde(default)]
  pub verbose: u8,
  #[serde(default = "default_heartbeat")]
  pub heartbeat: u32,
  #[serde(default)]
  pub sources: Vec<String>,
}

impl Default for SourceConfig {
  fn default() -> Self {
    SourceConfig { framerate: default_speed(), verbose: 0, heartbeat: default_heartbeat(), sources: Vec::new() }
  }
}

/// Typed view over the top-level configuration keys. `Multiprocess` is
/// read once via [`Document::multiprocess`] and then frozen in
/// `region::set_multiprocess` — subsequent attempts to change it are logged
/// and ignored, matching the original's "fixed after first read" rule.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Document {
  #[serde(default)]
  pub multiprocess: bool,
  #[serde(default = "default_speed")]
  pub speed: f64,
  #[serde(default)]
  pub initial_time: u32,
  #[serde(default)]
  pub initial_runlevel: Runlevel,
  #[serde(default)]
  pub wait_for_sensors: bool,
  #[serde(default)]
  pub motion: MotionConfig,
  #[serde(default)]
  pub sensors: SourceConfig,
  #[serde(default)]
  pub vision: SourceConfig,
  #[serde(default)]
  pub drivers: BTreeMap<String, Value>,
  #[serde(default)]
  pub comm_ports: BTreeMap<String, Value>,
}

impl Document {
  pub fn load_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    serde_json::from_str(&text)
      .map_err(|source| CoreError::ConfigParse { path: path.display().to_string(), source })
  }

  pub fn save_file(&self, path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let text = serde_json::to_string_pretty(self)
      .map_err(|source| CoreError::ConfigParse { path: path.display().to_string(), source })?;
    std::fs::write(path, text)?;
    Ok(())
  }

  /// Applies a single `Key.Path=Value` command-line override after file
  /// load. Dotted path components address nested objects;
  /// `Drivers.*`/`CommPorts.*` fall through to the free-form registry maps.
  pub fn apply_override(&mut self, arg: &str) -> Result<()> {
    let (path, value) = arg.split_once('=').ok_or_else(|| CoreError::ConfigOverride(arg.to_string()))?;
    let mut root = serde_json::to_value(&*self).expect("Document always serialises");
    set_dotted(&mut root, path, parse_scalar(value))
      .ok_or_else(|| CoreError::ConfigOverride(arg.to_string()))?;
    *self = serde_json::from_value(root).map_err(|source| CoreError::ConfigParse { path: path.to_string(), source })?;
    Ok(())
  }
}

/// Best-effort scalar parse for a command-line value: bool, number, then a
/// bare string, matching the loose typing `plist::Primitive` assignment
/// from a string had in the original.
fn parse_scalar(raw: &str) -> Value {
  if let Ok(b) = raw.parse::<bool>() {
    return Value::Bool(b);
  }
  if let Ok(n) = raw.parse::<i64>() {
    return Value::Number(n.into());
  }
  if let Ok(f) = raw.parse::<f64>() {
    if let Some(n) = serde_json::Number::from_f64(f) {
      return Value::Number(n);
    }
  }
  Value::String(raw.to_string())
}

fn camel_key(segment: &str) -> String {
  // JSON keys are snake_case (serde default); config paths are given in
  // the original's PascalCase (`Motion.FeedbackDelay`). Translate once.
  let mut out = String::new();
  for (i, ch) in segment.chars().enumerate() {
    if ch.is_uppercase() && i > 0 {
      out.push('_');
    }
    out.extend(ch.to_lowercase());
  }
  out
}

fn set_dotted(root: &mut Value, path: &str, value: Value) -> Option<()> {
  let mut segments: Vec<&str> = path.split('.').collect();
  let last = segments.pop()?;
  let mut cur = root;
  for seg in segments {
    let key = camel_key(seg);
    cur = cur.as_object_mut()?.entry(key).or_insert_with(|| Value::Object(Default::default()));
  }
  let key = camel_key(last);
  cur.as_object_mut()?.insert(key, value);
  Some(())
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn default_document_has_expected_speed() {
    let doc = Document::default();
    assert_eq!(doc.speed, 1.0);
    assert!(!doc.multiprocess);
  }

  #[test]
  fn override_sets_nested_field() {
    let mut doc = Document::default();
    doc.apply_override("Motion.FeedbackDelay=42").unwrap();
    assert_eq!(doc.motion.feedback_delay, 42);
  }

  #[test]
  fn override_sets_top_level_bool() {
    let mut doc = Document::default();
    doc.apply_override("Multiprocess=true").unwrap();
    assert!(doc.multiprocess);
  }

  #[test]
  fn malformed_override_is_rejected() {
    let mut doc = Document::default();
    assert!(doc.apply_override("NoEqualsSign").is_err());
  }
}
