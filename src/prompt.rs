use serde::Serialize;

use crate::context::DataContext;
use crate::conversation::{ChatTurn, Role};

const HISTORY_CONTENT_CHARS: usize = 1000;
const OPENAI_CHAT_SUFFIX: &str = "/v1/chat/completions";
const OLLAMA_GENERATE_SUFFIX: &str = "/api/generate";

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptMessage {
    pub role: String,
    pub content: String,
}

impl PromptMessage {
    fn new(role: &str, content: impl Into<String>) -> Self {
        PromptMessage {
            role: role.to_string(),
            content: content.into(),
        }
    }
}

pub fn build_system_prompt(context: &DataContext) -> String {
    let mut prompt = String::new();
    prompt.push_str("你是一名专业的金融市场分析助手，帮助用户解读看板上正在展示的行情数据。\n");
    prompt.push_str("回答请使用中文，结论先行，分点说明依据，并提示潜在风险。不要编造数据中没有的数字。\n\n");

    prompt.push_str("## 当前数据\n");
    prompt.push_str(&format!("- 类型: {}\n", context.display_kind()));
    prompt.push_str(&format!("- 名称: {}\n", context.display_name()));
    if let Some(period) = context.period_label() {
        prompt.push_str(&format!("- 周期: {period}\n"));
    }
    let summary = context.summary_text();
    if !summary.is_empty() {
        prompt.push_str("\n## 数据摘要\n");
        prompt.push_str(&summary);
        prompt.push('\n');
    }

    prompt.push_str("\n## 图表输出\n");
    prompt.push_str("如果用图表能更清楚地说明问题，请输出一个 ECharts 配置，格式如下：\n");
    prompt.push_str("```echarts\noption = {\n  title: { text: '标题' },\n  xAxis: { type: 'category', data: [...] },\n  yAxis: { type: 'value' },\n  series: [{ type: 'line', data: [...] }]\n};\n```\n");
    prompt.push_str("配置中只能使用字面量，不要包含函数或变量引用；每次回答最多输出一个图表。\n");
    prompt
}

/// Prefixes the question with the name and type of the data being discussed.
pub fn contextual_question(context: &DataContext, question: &str) -> String {
    format!(
        "【当前数据：{}（{}）】\n{}",
        context.display_name(),
        context.display_kind(),
        question.trim()
    )
}

/// System prompt, then at most `history_limit` prior turns, then the new question.
pub fn compose_messages(
    context: &DataContext,
    history: &[&ChatTurn],
    history_limit: usize,
    question: &str,
) -> Vec<PromptMessage> {
    let skip = history.len().saturating_sub(history_limit);
    let mut messages = Vec::with_capacity(history.len() - skip + 2);
    messages.push(PromptMessage::new("system", build_system_prompt(context)));
    for turn in &history[skip..] {
        messages.push(PromptMessage::new(
            turn.role().as_str(),
            truncate_chars(turn.content(), HISTORY_CONTENT_CHARS),
        ));
    }
    messages.push(PromptMessage::new(
        Role::User.as_str(),
        contextual_question(context, question),
    ));
    messages
}

/// Single prompt string for Ollama's generate endpoint.
pub fn flatten_for_ollama(messages: &[PromptMessage]) -> String {
    let system = messages
        .iter()
        .filter(|message| message.role == "system")
        .map(|message| message.content.as_str())
        .collect::<Vec<_>>()
        .join("\n");
    let dialogue = messages
        .iter()
        .filter(|message| message.role != "system")
        .map(|message| format!("{}: {}", role_label(&message.role), message.content))
        .collect::<Vec<_>>()
        .join("\n");
    if system.is_empty() {
        dialogue
    } else {
        format!("{system}\n\n{dialogue}")
    }
}

pub fn rewrite_ollama_endpoint(endpoint: &str) -> String {
    match endpoint.strip_suffix(OPENAI_CHAT_SUFFIX) {
        Some(base) => format!("{base}{OLLAMA_GENERATE_SUFFIX}"),
        None => endpoint.to_string(),
    }
}

fn role_label(role: &str) -> &str {
    match role {
        "user" => Role::User.label(),
        "assistant" => Role::Assistant.label(),
        other => other,
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &text[..cut]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::{Conversation, FinishKind};

    fn context() -> DataContext {
        DataContext {
            kind: Some("指数".to_string()),
            name: Some("上证指数".to_string()),
            period: Some("日线".to_string()),
            summary: Some("收盘 3050.12，涨 0.8%".to_string()),
            data: None,
        }
    }

    fn conversation_with(rounds: usize, answer: &str) -> Conversation {
        let mut conversation = Conversation::new();
        for idx in 0..rounds {
            let id = conversation.begin_exchange(&format!("q{idx}")).unwrap();
            conversation.append_delta(id, answer);
            conversation.finalize(id, FinishKind::Completed);
        }
        conversation
    }

    #[test]
    fn system_prompt_names_context_and_chart_format() {
        let prompt = build_system_prompt(&context());
        assert!(prompt.contains("上证指数"));
        assert!(prompt.contains("日线"));
        assert!(prompt.contains("收盘 3050.12"));
        assert!(prompt.contains("```echarts"));
    }

    #[test]
    fn messages_keep_only_recent_history() {
        let conversation = conversation_with(6, "a");
        let history = conversation.history(usize::MAX);
        let messages = compose_messages(&context(), &history, 5, "后市怎么看？");
        assert_eq!(messages.len(), 1 + 5 + 1);
        assert_eq!(messages[0].role, "system");
        assert_eq!(messages[1].role, "assistant");
        let last = messages.last().unwrap();
        assert_eq!(last.role, "user");
        assert_eq!(last.content, "【当前数据：上证指数（指数）】\n后市怎么看？");
    }

    #[test]
    fn long_history_entries_are_truncated() {
        let long = "涨".repeat(1500);
        let conversation = conversation_with(1, &long);
        let history = conversation.history(8);
        let messages = compose_messages(&context(), &history, 8, "q");
        let answer = &messages[2].content;
        assert_eq!(answer.chars().count(), HISTORY_CONTENT_CHARS + 3);
        assert!(answer.ends_with("..."));
        assert_eq!(messages[1].content, "q0");
    }

    #[test]
    fn ollama_prompt_puts_system_first() {
        let messages = vec![
            PromptMessage::new("system", "SYS"),
            PromptMessage::new("user", "hi"),
            PromptMessage::new("assistant", "hello"),
            PromptMessage::new("user", "why?"),
        ];
        assert_eq!(
            flatten_for_ollama(&messages),
            "SYS\n\nUser: hi\nAssistant: hello\nUser: why?"
        );
    }

    #[test]
    fn ollama_endpoint_rewrite() {
        assert_eq!(
            rewrite_ollama_endpoint("http://localhost:11434/v1/chat/completions"),
            "http://localhost:11434/api/generate"
        );
        assert_eq!(
            rewrite_ollama_endpoint("http://localhost:11434/api/generate"),
            "http://localhost:11434/api/generate"
        );
    }
}
