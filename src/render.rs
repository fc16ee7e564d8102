use std::borrow::Cow;
use std::collections::HashMap;

use once_cell::sync::Lazy;
use pulldown_cmark::{Event, Options, Parser, html};
use regex::Regex;

use crate::chart::mask_streaming_charts;
use crate::conversation::{Conversation, Role, TurnKind};

pub const THINKING_HEADER: &str = "💭 思考过程";
pub const THINKING_PENDING_HEADER: &str = "💭 思考中…";

static THINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<think>(.*?)</think>").expect("think block pattern"));
static OPEN_THINK_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)<think>(.*)\z").expect("open think pattern"));

/// A piece of assistant content, either ordinary Markdown or reasoning text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment<'a> {
    Markdown(&'a str),
    Thinking { text: &'a str, complete: bool },
}

/// Splits content on `<think>` blocks. An unclosed trailing block is only
/// recognised while the turn is still streaming.
pub fn split_segments(content: &str, streaming: bool) -> Vec<Segment<'_>> {
    let mut segments = Vec::new();
    let mut last = 0;
    for captures in THINK_RE.captures_iter(content) {
        let (Some(whole), Some(inner)) = (captures.get(0), captures.get(1)) else {
            continue;
        };
        push_markdown(&mut segments, &content[last..whole.start()]);
        segments.push(Segment::Thinking {
            text: inner.as_str(),
            complete: true,
        });
        last = whole.end();
    }
    let tail = &content[last..];
    if streaming
        && let Some(captures) = OPEN_THINK_RE.captures(tail)
        && let (Some(whole), Some(inner)) = (captures.get(0), captures.get(1))
    {
        push_markdown(&mut segments, &tail[..whole.start()]);
        segments.push(Segment::Thinking {
            text: inner.as_str(),
            complete: false,
        });
        return segments;
    }
    push_markdown(&mut segments, tail);
    segments
}

fn push_markdown<'a>(segments: &mut Vec<Segment<'a>>, text: &'a str) {
    if !text.trim().is_empty() {
        segments.push(Segment::Markdown(text));
    }
}

pub fn markdown_to_html(text: &str) -> String {
    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    options.insert(Options::ENABLE_STRIKETHROUGH);
    // Raw HTML in model output is shown as text, never passed through.
    let parser = Parser::new_ext(text, options).map(|event| match event {
        Event::Html(raw) | Event::InlineHtml(raw) => Event::Text(raw),
        other => other,
    });
    let mut out = String::new();
    html::push_html(&mut out, parser);
    out
}

fn escape_text(text: &str) -> String {
    let mut out = String::new();
    html::push_html(&mut out, std::iter::once(Event::Text(text.into())));
    out
}

/// Renders assistant content to HTML, memoising completed thinking blocks by
/// their trimmed text. The cache lives as long as the conversation it serves.
#[derive(Debug, Default)]
pub struct ThinkingRenderer {
    cache: HashMap<String, String>,
}

impl ThinkingRenderer {
    pub fn new() -> Self {
        ThinkingRenderer::default()
    }

    #[cfg(test)]
    pub fn cached_blocks(&self) -> usize {
        self.cache.len()
    }

    pub fn clear(&mut self) {
        self.cache.clear();
    }

    pub fn render_content(&mut self, content: &str, streaming: bool) -> String {
        let display: Cow<'_, str> = if streaming {
            mask_streaming_charts(content)
        } else {
            Cow::Borrowed(content)
        };
        let mut out = String::new();
        for segment in split_segments(&display, streaming) {
            match segment {
                Segment::Markdown(text) => out.push_str(&markdown_to_html(text)),
                Segment::Thinking {
                    text,
                    complete: true,
                } => out.push_str(self.thinking_block(text)),
                Segment::Thinking {
                    text,
                    complete: false,
                } => out.push_str(&thinking_html(THINKING_PENDING_HEADER, text, true)),
            }
        }
        out
    }

    fn thinking_block(&mut self, text: &str) -> &str {
        let key = text.trim().to_string();
        self.cache
            .entry(key)
            .or_insert_with_key(|key| thinking_html(THINKING_HEADER, key, false))
            .as_str()
    }
}

fn thinking_html(header: &str, text: &str, pending: bool) -> String {
    let class = if pending { "thinking pending" } else { "thinking" };
    format!(
        "<details class=\"{class}\"{open}><summary>{header}</summary>\n<div class=\"thinking-body\">{body}</div></details>\n",
        open = if pending { " open" } else { "" },
        body = markdown_to_html(text.trim()),
    )
}

const EXPORT_STYLE: &str = "body{font-family:sans-serif;max-width:860px;margin:2em auto;line-height:1.6}\
.turn{border-radius:8px;padding:.6em 1em;margin:.8em 0}\
.user{background:#eef5ff}.assistant{background:#f6f6f6}.notice{background:#fff8e1}.diagnostic{background:#fdecea}\
.thinking{color:#666;border-left:3px solid #ccc;padding-left:.8em}\
.meta{font-size:.8em;color:#999}";

/// Renders the whole conversation as a standalone HTML page. Chart options are
/// embedded as JSON for a charting script to pick up.
pub fn export_html(conversation: &Conversation, renderer: &mut ThinkingRenderer, title: &str) -> String {
    let mut page = String::new();
    page.push_str("<!DOCTYPE html>\n<html lang=\"zh-CN\">\n<head>\n<meta charset=\"utf-8\">\n");
    page.push_str(&format!("<title>{}</title>\n", escape_text(title).trim_end()));
    page.push_str(&format!("<style>{EXPORT_STYLE}</style>\n</head>\n<body>\n"));
    page.push_str(&format!("<h1>{}</h1>\n", escape_text(title).trim_end()));
    for turn in conversation.turns() {
        let class = match (turn.role(), turn.kind()) {
            (Role::User, _) => "user",
            (_, TurnKind::Notice) => "assistant notice",
            (_, TurnKind::Diagnostic) => "assistant diagnostic",
            (Role::Assistant, TurnKind::Message) => "assistant",
        };
        page.push_str(&format!("<section class=\"turn {class}\">\n"));
        page.push_str(&format!(
            "<div class=\"meta\">{} · {}</div>\n",
            turn.role().label(),
            turn.timestamp().format("%Y-%m-%d %H:%M:%S")
        ));
        match turn.role() {
            Role::User => {
                page.push_str("<p>");
                page.push_str(&escape_text(turn.content()));
                page.push_str("</p>\n");
            }
            Role::Assistant => {
                page.push_str(&renderer.render_content(turn.content(), turn.is_streaming()));
            }
        }
        if let Some(chart) = turn.chart() {
            let option = chart.to_value().to_string().replace("</", "<\\/");
            page.push_str(&format!(
                "<figure class=\"chart\"><figcaption>{}</figcaption>\n<script type=\"application/json\" class=\"echarts-option\">{option}</script></figure>\n",
                escape_text(&chart.brief()).trim_end()
            ));
        }
        page.push_str("</section>\n");
    }
    page.push_str("</body>\n</html>\n");
    page
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chart::{CHART_PENDING_PLACEHOLDER, extract_chart};
    use crate::conversation::FinishKind;

    #[test]
    fn rendering_is_idempotent_and_memoised() {
        let content = "<think>\n先看均线\n</think>\n\n**结论**：偏多";
        let mut renderer = ThinkingRenderer::new();
        let first = renderer.render_content(content, false);
        let second = renderer.render_content(content, false);
        assert_eq!(first, second);
        assert_eq!(renderer.cached_blocks(), 1);
        assert!(first.contains(THINKING_HEADER));
        assert!(first.contains("<strong>结论</strong>"));
    }

    #[test]
    fn raw_html_in_answers_is_escaped() {
        let html = markdown_to_html("<script>alert(1)</script>\n\n行情 <img src=x onerror=alert(1)> 上涨");
        assert!(!html.contains("<script>"));
        assert!(!html.contains("<img"));
        assert!(html.contains("&lt;script&gt;"));
        assert!(html.contains("&lt;img"));
    }

    #[test]
    fn cache_key_ignores_surrounding_whitespace() {
        let mut renderer = ThinkingRenderer::new();
        let a = renderer.render_content("<think>abc</think>", false);
        let b = renderer.render_content("<THINK>\n  abc \n</Think>", false);
        assert_eq!(a, b);
        assert_eq!(renderer.cached_blocks(), 1);
        renderer.clear();
        assert_eq!(renderer.cached_blocks(), 0);
    }

    #[test]
    fn unclosed_block_only_while_streaming() {
        let content = "前言<think>还在想";
        let segments = split_segments(content, true);
        assert_eq!(
            segments,
            vec![
                Segment::Markdown("前言"),
                Segment::Thinking {
                    text: "还在想",
                    complete: false
                }
            ]
        );
        let mut renderer = ThinkingRenderer::new();
        let html = renderer.render_content(content, true);
        assert!(html.contains(THINKING_PENDING_HEADER));
        assert_eq!(renderer.cached_blocks(), 0);
        assert_eq!(split_segments(content, false), vec![Segment::Markdown(content)]);
    }

    #[test]
    fn multiple_blocks_keep_order() {
        let content = "<think>a</think>x<think>b</think>y";
        let segments = split_segments(content, false);
        assert_eq!(segments.len(), 4);
        assert_eq!(segments[2], Segment::Thinking { text: "b", complete: true });
        assert_eq!(segments[3], Segment::Markdown("y"));
    }

    #[test]
    fn streaming_render_masks_open_chart_fence() {
        let mut renderer = ThinkingRenderer::new();
        let html = renderer.render_content("看图\n```echarts\noption = { series: [", true);
        assert!(html.contains(CHART_PENDING_PLACEHOLDER));
        assert!(!html.contains("option ="));
    }

    #[test]
    fn export_embeds_chart_and_escapes_user_text() {
        let mut conversation = Conversation::new();
        let id = conversation.begin_exchange("<b>画个图</b>").unwrap();
        conversation.append_delta(
            id,
            "<think>ok</think>\n```json\n{\"title\":{\"text\":\"</script>\"},\"series\":[{\"type\":\"bar\",\"data\":[1]}]}\n```",
        );
        conversation.finalize(id, FinishKind::Completed);
        let extraction = extract_chart(conversation.get(id).unwrap().content()).unwrap();
        conversation.apply_chart(id, extraction);

        let mut renderer = ThinkingRenderer::new();
        let page = export_html(&conversation, &mut renderer, "上证指数");
        assert!(page.contains("&lt;b&gt;画个图&lt;/b&gt;"));
        assert!(page.contains("class=\"echarts-option\""));
        assert!(page.contains("<\\/script>"));
        assert!(page.contains(THINKING_HEADER));
        assert!(page.contains("<title>上证指数</title>"));
    }
}
