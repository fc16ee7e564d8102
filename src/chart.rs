use std::borrow::Cow;
use std::ops::Range;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Number, Value};

use crate::relaxed_json;

pub const CHART_PLACEHOLDER: &str = "📊 [图表已生成]";
pub const CHART_PENDING_PLACEHOLDER: &str = "📊 [图表生成中…]";

static FENCE_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)```([A-Za-z0-9_+\-]*)[^\n`]*\n(.*?)```").expect("valid fence regex")
});
static OPTION_ASSIGN_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)^\s*(?:(?:const|let|var)\s+)?option\s*=\s*(\{.*\})\s*;?\s*$")
        .expect("valid option regex")
});
static OPEN_FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"```([A-Za-z0-9_+\-]*)").expect("valid open fence regex"));

/// Keys whose string values survive sanitisation.
const STRING_KEYS: &[&str] = &[
    "type",
    "name",
    "text",
    "subtext",
    "left",
    "right",
    "top",
    "bottom",
    "width",
    "height",
    "orient",
    "trigger",
    "position",
    "formatter",
    "align",
    "verticalAlign",
    "color",
    "fontWeight",
    "fontFamily",
    "fontStyle",
    "symbol",
    "stack",
    "id",
    "icon",
    "radius",
    "center",
    "nameLocation",
    "source",
    "dimensions",
    "seriesLayoutBy",
    "coordinateSystem",
    "layout",
    "sort",
    "unit",
    "step",
    "shape",
    "roseType",
    "selectedMode",
    "padding",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    /// `option = {...}` in a javascript/js/echarts or untagged fence.
    OptionLiteral,
    /// JSON object carrying a `"series"` key.
    JsonSeries,
    /// JSON object carrying a `"type"` key.
    JsonTyped,
    /// Detected only; mermaid diagrams are not rendered.
    Mermaid,
    /// Detected only; tables pass through as text.
    Table,
}

#[derive(Debug, Clone)]
pub struct DetectedBlock {
    pub kind: BlockKind,
    pub body: String,
    pub span: Range<usize>,
}

/// Sanitised chart options, guaranteed to carry `series` or `dataset`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ChartSpec(Map<String, Value>);

impl ChartSpec {
    pub fn to_value(&self) -> Value {
        Value::Object(self.0.clone())
    }

    pub fn title(&self) -> Option<&str> {
        let title = self.0.get("title")?;
        let title = match title {
            Value::Array(items) => items.first()?,
            other => other,
        };
        title.get("text")?.as_str()
    }

    pub fn series_types(&self) -> Vec<String> {
        let mut kinds = Vec::new();
        let series = match self.0.get("series") {
            Some(Value::Array(items)) => items.iter().collect::<Vec<_>>(),
            Some(item @ Value::Object(_)) => vec![item],
            _ => Vec::new(),
        };
        for item in series {
            if let Some(kind) = item.get("type").and_then(Value::as_str)
                && !kinds.iter().any(|k| k == kind)
            {
                kinds.push(kind.to_string());
            }
        }
        kinds
    }

    pub fn series_count(&self) -> usize {
        match self.0.get("series") {
            Some(Value::Array(items)) => items.len(),
            Some(Value::Object(_)) => 1,
            _ => 0,
        }
    }

    /// One-line description for text surfaces that cannot draw the chart.
    pub fn brief(&self) -> String {
        let title = self.title().unwrap_or("未命名图表");
        let kinds = self.series_types();
        if kinds.is_empty() {
            format!("{title} · {} 个系列", self.series_count())
        } else {
            format!("{title} · {} 个系列 ({})", self.series_count(), kinds.join("/"))
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChartExtraction {
    pub spec: ChartSpec,
    /// Content with the chart block replaced by [`CHART_PLACEHOLDER`].
    pub content: String,
}

pub fn detect_blocks(text: &str) -> Vec<DetectedBlock> {
    FENCE_RE
        .captures_iter(text)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let tag = caps.get(1).map(|m| m.as_str()).unwrap_or("");
            let body = caps.get(2).map(|m| m.as_str()).unwrap_or("");
            let kind = classify(tag, body)?;
            Some(DetectedBlock {
                kind,
                body: body.to_string(),
                span: whole.range(),
            })
        })
        .collect()
}

fn classify(tag: &str, body: &str) -> Option<BlockKind> {
    let tag = tag.to_ascii_lowercase();
    match tag.as_str() {
        "mermaid" => return Some(BlockKind::Mermaid),
        "table" | "csv" => return Some(BlockKind::Table),
        _ => {}
    }
    if matches!(tag.as_str(), "" | "javascript" | "js" | "echarts")
        && OPTION_ASSIGN_RE.is_match(body)
    {
        return Some(BlockKind::OptionLiteral);
    }
    if matches!(tag.as_str(), "" | "json" | "echarts") {
        let trimmed = body.trim();
        if trimmed.starts_with('{') && trimmed.ends_with('}') {
            if trimmed.contains("\"series\"") {
                return Some(BlockKind::JsonSeries);
            }
            if trimmed.contains("\"type\"") {
                return Some(BlockKind::JsonTyped);
            }
        }
    }
    None
}

/// Finds the first chart block that parses and sanitises, in priority order.
pub fn extract_chart(content: &str) -> Option<ChartExtraction> {
    let blocks = detect_blocks(content);
    for kind in [BlockKind::OptionLiteral, BlockKind::JsonSeries, BlockKind::JsonTyped] {
        for block in blocks.iter().filter(|block| block.kind == kind) {
            let Some(candidate) = parse_candidate(block) else {
                continue;
            };
            let Some(spec) = sanitize_chart(&candidate) else {
                tracing::debug!(?kind, "chart candidate rejected: no series or dataset");
                continue;
            };
            let mut replaced = String::with_capacity(content.len());
            replaced.push_str(&content[..block.span.start]);
            replaced.push_str(CHART_PLACEHOLDER);
            replaced.push_str(&content[block.span.end..]);
            tracing::debug!(?kind, series = spec.series_count(), "chart extracted");
            return Some(ChartExtraction {
                spec,
                content: replaced,
            });
        }
    }
    for block in &blocks {
        if matches!(block.kind, BlockKind::Mermaid | BlockKind::Table) {
            tracing::debug!(kind = ?block.kind, "non-chart block left as text");
        }
    }
    None
}

fn parse_candidate(block: &DetectedBlock) -> Option<Value> {
    match block.kind {
        BlockKind::OptionLiteral => {
            let literal = OPTION_ASSIGN_RE.captures(&block.body)?.get(1)?.as_str();
            match relaxed_json::parse(literal) {
                Ok(value) => Some(value),
                Err(err) => {
                    tracing::debug!(%err, "option literal did not parse");
                    None
                }
            }
        }
        BlockKind::JsonSeries | BlockKind::JsonTyped => {
            let body = block.body.trim();
            serde_json::from_str(body)
                .ok()
                .or_else(|| relaxed_json::parse(body).ok())
        }
        BlockKind::Mermaid | BlockKind::Table => None,
    }
}

/// Deep-cleans a candidate: keeps objects, arrays, numbers, booleans and
/// allow-listed strings; other strings become numbers when they parse.
pub fn sanitize_chart(candidate: &Value) -> Option<ChartSpec> {
    let Some(Value::Object(map)) = sanitize_value(None, candidate) else {
        return None;
    };
    if !(map.contains_key("series") || map.contains_key("dataset")) {
        return None;
    }
    Some(ChartSpec(map))
}

fn sanitize_value(key: Option<&str>, value: &Value) -> Option<Value> {
    match value {
        Value::Object(map) => {
            let mut clean = Map::new();
            for (child_key, child) in map {
                if let Some(child) = sanitize_value(Some(child_key), child) {
                    clean.insert(child_key.clone(), child);
                }
            }
            Some(Value::Object(clean))
        }
        // Array slots are positional; a dropped element leaves a gap instead.
        Value::Array(items) => Some(Value::Array(
            items
                .iter()
                .map(|item| sanitize_value(key, item).unwrap_or_else(|| array_gap(key)))
                .collect(),
        )),
        Value::Number(_) | Value::Bool(_) => Some(value.clone()),
        Value::Null => None,
        Value::String(text) => {
            if key.is_some_and(string_allowed) {
                Some(value.clone())
            } else {
                coerce_number(text)
            }
        }
    }
}

fn array_gap(key: Option<&str>) -> Value {
    if key == Some("data") {
        Value::String("-".to_string())
    } else {
        Value::Null
    }
}

fn string_allowed(key: &str) -> bool {
    key == "data"
        || key.ends_with("Color")
        || key.ends_with("Style")
        || key.ends_with("Format")
        || STRING_KEYS.contains(&key)
}

fn coerce_number(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(int) = trimmed.parse::<i64>() {
        return Some(Value::Number(Number::from(int)));
    }
    let float = trimmed.parse::<f64>().ok().filter(|f| f.is_finite())?;
    Number::from_f64(float).map(Value::Number)
}

/// Display-only masking while a turn streams: chart fences, complete or still
/// open at the end of the text, become [`CHART_PENDING_PLACEHOLDER`].
pub fn mask_streaming_charts(text: &str) -> Cow<'_, str> {
    if !text.contains("```") {
        return Cow::Borrowed(text);
    }
    let mut out = String::with_capacity(text.len());
    let mut last = 0;
    let mut changed = false;
    for caps in FENCE_RE.captures_iter(text) {
        let Some(whole) = caps.get(0) else {
            continue;
        };
        let tag = caps.get(1).map(|m| m.as_str()).unwrap_or("");
        let body = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        if matches!(
            classify(tag, body),
            Some(BlockKind::OptionLiteral | BlockKind::JsonSeries | BlockKind::JsonTyped)
        ) {
            out.push_str(&text[last..whole.start()]);
            out.push_str(CHART_PENDING_PLACEHOLDER);
            last = whole.end();
            changed = true;
        }
    }
    let tail_start = FENCE_RE
        .find_iter(text)
        .last()
        .map(|m| m.end())
        .unwrap_or(0)
        .max(last);
    let tail = &text[tail_start..];
    if let Some(open) = OPEN_FENCE_RE.captures(tail)
        && let Some(fence) = open.get(0)
    {
        let tag = open.get(1).map(|m| m.as_str().to_ascii_lowercase()).unwrap_or_default();
        let rest = &tail[fence.end()..];
        let chart_like = matches!(tag.as_str(), "echarts" | "json")
            || (matches!(tag.as_str(), "" | "javascript" | "js") && rest.contains("option"));
        if chart_like {
            out.push_str(&text[last..tail_start + fence.start()]);
            out.push_str(CHART_PENDING_PLACEHOLDER);
            return Cow::Owned(out);
        }
    }
    if !changed {
        return Cow::Borrowed(text);
    }
    out.push_str(&text[last..]);
    Cow::Owned(out)
}
