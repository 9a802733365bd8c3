//! External script table
//!
//! The dialog state machine's transition table and scripted reply
//! templates live in a YAML resource outside the binary so operators can
//! tune wording without a redeploy (§4.6 "full table is an external
//! resource consulted at runtime"). A [`notify`] watcher reloads the table
//! in place when the file changes.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use serde::Deserialize;
use tracing::{error, info, warn};

use crate::types::{Intent, Stage};

/// One row of the scripted transition table.
#[derive(Debug, Clone, Deserialize)]
pub struct ScriptRule {
    pub stage: Stage,
    pub intent: Intent,
    /// Minimum repeat count this rule applies from; `0` matches any.
    #[serde(default)]
    pub min_repeat: u32,
    pub next_stage: Stage,
    pub reply_template: String,
}

#[derive(Debug, Clone, Deserialize)]
struct ScriptFile {
    rules: Vec<ScriptRule>,
    #[serde(default)]
    fallback_reply: Option<String>,
}

/// Default reply used both as the file's fallback and as the in-process
/// default if no script file is configured at all.
const DEFAULT_FALLBACK_REPLY: &str = "Извините, не могли бы вы повторить?";

/// Thread-safe, hot-reloadable script table. Holds a `RwLock` snapshot of
/// the parsed rules; readers never block a concurrent reload.
pub struct ScriptTable {
    inner: Arc<RwLock<ScriptFile>>,
    _watcher: Option<RecommendedWatcher>,
}

impl ScriptTable {
    /// Load once from `path` with no file-watching (used by tests and by
    /// callers that don't want the `notify` dependency active).
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let file = Self::read_file(path)?;
        Ok(Self {
            inner: Arc::new(RwLock::new(file)),
            _watcher: None,
        })
    }

    /// Load from `path` and keep watching it for changes, reloading the
    /// table in place on every write event.
    pub fn watch(path: impl Into<PathBuf>) -> std::io::Result<Self> {
        let path = path.into();
        let file = Self::read_file(&path)?;
        let inner = Arc::new(RwLock::new(file));
        let watched = inner.clone();
        let watch_path = path.clone();

        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) if event.kind.is_modify() => match Self::read_file(&watch_path) {
                    Ok(reloaded) => {
                        *watched.write().unwrap() = reloaded;
                        info!(path = %watch_path.display(), "script table reloaded");
                    }
                    Err(e) => warn!(error = %e, "failed to reload script table, keeping previous version"),
                },
                Ok(_) => {}
                Err(e) => error!(error = %e, "script table watcher error"),
            }
        })
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        watcher
            .watch(&path, RecursiveMode::NonRecursive)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

        Ok(Self {
            inner,
            _watcher: Some(watcher),
        })
    }

    /// An empty, in-memory-only table — used when no script file is
    /// configured; every lookup falls through to the caller's default.
    pub fn empty() -> Self {
        Self {
            inner: Arc::new(RwLock::new(ScriptFile {
                rules: Vec::new(),
                fallback_reply: None,
            })),
            _watcher: None,
        }
    }

    fn read_file(path: &Path) -> std::io::Result<ScriptFile> {
        let contents = std::fs::read_to_string(path)?;
        serde_yaml::from_str(&contents).map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }

    /// Find the best matching rule for `(stage, intent, repeat)`: highest
    /// `min_repeat` not exceeding `repeat` wins, so a more specific
    /// "repeat ≥ 2" rule takes priority over a catch-all "repeat ≥ 0" rule.
    pub fn lookup(&self, stage: Stage, intent: Intent, repeat: u32) -> Option<ScriptRule> {
        let file = self.inner.read().unwrap();
        file.rules
            .iter()
            .filter(|r| r.stage == stage && r.intent == intent && r.min_repeat <= repeat)
            .max_by_key(|r| r.min_repeat)
            .cloned()
    }

    pub fn fallback_reply(&self) -> String {
        self.inner
            .read()
            .unwrap()
            .fallback_reply
            .clone()
            .unwrap_or_else(|| DEFAULT_FALLBACK_REPLY.to_string())
    }
}

/// Template placeholder substitution (§4.6 Personalization):
/// `{clientName}`, `{company}`, `{amount}`, `{contract}`, `{partialAmount}`.
pub fn render_template(template: &str, values: &HashMap<&str, String>) -> String {
    let mut out = template.to_string();
    for (key, value) in values {
        out = out.replace(&format!("{{{key}}}"), value);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_yaml() -> &'static str {
        r#"
rules:
  - stage: listening
    intent: positive
    next_stage: payment_discussion
    reply_template: "Отлично, {clientName}!"
  - stage: negotiation
    intent: negative
    min_repeat: 1
    next_stage: escalation
    reply_template: "Повторный отказ зафиксирован."
fallback_reply: "Повторите, пожалуйста."
"#
    }

    #[test]
    fn lookup_prefers_more_specific_repeat_threshold() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("script.yaml");
        std::fs::write(&path, sample_yaml()).unwrap();
        let table = ScriptTable::load(&path).unwrap();

        let rule = table.lookup(Stage::Negotiation, Intent::Negative, 2).unwrap();
        assert_eq!(rule.next_stage, Stage::Escalation);

        assert!(table.lookup(Stage::Negotiation, Intent::Negative, 0).is_none());
    }

    #[test]
    fn render_template_substitutes_placeholders() {
        let mut values = HashMap::new();
        values.insert("clientName", "Иван".to_string());
        let rendered = render_template("Здравствуйте, {clientName}!", &values);
        assert_eq!(rendered, "Здравствуйте, Иван!");
    }

    #[test]
    fn empty_table_uses_default_fallback() {
        let table = ScriptTable::empty();
        assert_eq!(table.fallback_reply(), DEFAULT_FALLBACK_REPLY);
        assert!(table.lookup(Stage::Start, Intent::Positive, 0).is_none());
    }
}
