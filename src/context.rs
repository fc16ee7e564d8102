use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

const SUMMARY_EXCERPT_CHARS: usize = 2000;
const SELECTOR_FIELDS: [&str; 4] = ["code", "symbol", "ts_code", "selected"];

/// Data currently shown by a dashboard panel. Read-only to the chat core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DataContext {
    #[serde(rename = "type", default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub period: Option<String>,
    #[serde(default)]
    pub summary: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
}

/// Identity of a context; two contexts with equal keys are the same conversation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextKey {
    kind: String,
    name: String,
    period: String,
    selector: Option<String>,
}

impl DataContext {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents =
            fs::read_to_string(path).with_context(|| format!("读取 {} 失败", path.display()))?;
        serde_json::from_str(&contents).with_context(|| format!("解析 {} 失败", path.display()))
    }

    pub fn key(&self) -> ContextKey {
        ContextKey {
            kind: self.kind.clone().unwrap_or_default(),
            name: self.name.clone().unwrap_or_default(),
            period: self.period.clone().unwrap_or_default(),
            selector: self.selector(),
        }
    }

    pub fn display_name(&self) -> &str {
        self.name
            .as_deref()
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .unwrap_or("当前数据")
    }

    pub fn display_kind(&self) -> &str {
        self.kind
            .as_deref()
            .map(str::trim)
            .filter(|kind| !kind.is_empty())
            .unwrap_or("市场数据")
    }

    pub fn period_label(&self) -> Option<&str> {
        self.period
            .as_deref()
            .map(str::trim)
            .filter(|period| !period.is_empty())
    }

    /// Grounding text forwarded to the model. Falls back to a bounded excerpt of `data`.
    pub fn summary_text(&self) -> String {
        if let Some(summary) = self.summary.as_deref().map(str::trim)
            && !summary.is_empty()
        {
            return summary.to_string();
        }
        let Some(data) = &self.data else {
            return String::new();
        };
        let raw = data.to_string();
        let mut excerpt: String = raw.chars().take(SUMMARY_EXCERPT_CHARS).collect();
        if raw.chars().count() > SUMMARY_EXCERPT_CHARS {
            excerpt.push_str("...");
        }
        format!("```json\n{excerpt}\n```")
    }

    fn selector(&self) -> Option<String> {
        let data = self.data.as_ref()?.as_object()?;
        SELECTOR_FIELDS.iter().find_map(|field| match data.get(*field)? {
            Value::String(value) => Some(value.clone()),
            Value::Number(value) => Some(value.to_string()),
            _ => None,
        })
    }
}
