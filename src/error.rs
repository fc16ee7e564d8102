use thiserror::Error;

/// Reasons a send or regenerate request is refused before any turn is created.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendRejection {
    #[error("AI 分析功能未启用，请在设置中开启")]
    Disabled,
    #[error("AI 正在回复中，请稍候或先停止输出")]
    Busy,
    #[error("请输入问题内容")]
    Blank,
    #[error("AI 配置不完整: {0}")]
    Misconfigured(String),
    #[error("没有可以重新生成的回答")]
    NothingToRegenerate,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error("配置错误: {0}")]
    Config(String),
    #[error("网络请求失败: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("无法解析 AI 响应: {0}")]
    InvalidResponse(String),
    #[error("输出已取消")]
    Cancelled,
}

impl ChatError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, ChatError::Cancelled)
    }

    pub fn kind_label(&self) -> &'static str {
        match self {
            ChatError::Config(_) => "config",
            ChatError::Transport(_) => "transport",
            ChatError::HttpStatus { .. } => "http_status",
            ChatError::InvalidResponse(_) => "invalid_response",
            ChatError::Cancelled => "cancelled",
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ChatError::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Text of the assistant turn appended after a failed request.
    pub fn diagnostic_message(&self) -> String {
        match self {
            ChatError::Config(message) => {
                format!("❌ AI 配置错误: {message}\n\n请在设置中填写 API 地址后重试。")
            }
            ChatError::Transport(err) => format!(
                "❌ 无法连接到 AI 服务: {err}\n\n请检查:\n\
                 1. 网络连接是否正常\n\
                 2. API 地址是否正确、服务是否已启动（本地模型请确认 Ollama/LM Studio 正在运行）\n\
                 3. 代理或跨域（CORS）设置是否拦截了请求"
            ),
            ChatError::HttpStatus { status, body } => http_guidance(*status, body),
            ChatError::InvalidResponse(detail) => {
                format!("❌ AI 返回了无法解析的响应: {detail}\n\n请确认 API 地址指向兼容的聊天接口。")
            }
            ChatError::Cancelled => String::new(),
        }
    }
}

fn http_guidance(status: u16, body: &str) -> String {
    let detail = body.trim();
    let detail_line = if detail.is_empty() {
        String::new()
    } else {
        format!("\n\n服务返回: {}", truncate_detail(detail, 500))
    };
    match status {
        401 => format!(
            "❌ 认证失败 (401): API Key 无效或缺失。\n\n请在设置中检查 API Key 是否正确、是否已过期，以及是否与所选服务商匹配。{detail_line}"
        ),
        400 => format!(
            "❌ 请求格式错误 (400): 服务无法接受当前请求。\n\n请检查模型名称、max_tokens、temperature 等参数是否被该服务支持。{detail_line}"
        ),
        404 => format!(
            "❌ 接口不存在 (404): API 地址或模型配置可能有误。\n\n请确认 API 地址路径（例如 /v1/chat/completions）和模型名称是否正确，本地模型是否已下载。{detail_line}"
        ),
        other => format!("❌ API 请求失败 (状态码 {other}){detail_line}"),
    }
}

fn truncate_detail(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let mut truncated: String = text.chars().take(max_chars).collect();
    truncated.push_str("...");
    truncated
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unauthorized_guidance_mentions_api_key() {
        let err = ChatError::HttpStatus {
            status: 401,
            body: "invalid api key".to_string(),
        };
        let message = err.diagnostic_message();
        assert!(message.contains("API Key"));
        assert!(message.contains("invalid api key"));
    }

    #[test]
    fn not_found_guidance_mentions_endpoint_and_model() {
        let err = ChatError::HttpStatus {
            status: 404,
            body: String::new(),
        };
        let message = err.diagnostic_message();
        assert!(message.contains("API 地址"));
        assert!(message.contains("模型"));
        assert!(!message.contains("服务返回"));
    }

    #[test]
    fn unknown_status_uses_generic_message_with_body() {
        let err = ChatError::HttpStatus {
            status: 503,
            body: "overloaded".to_string(),
        };
        let message = err.diagnostic_message();
        assert!(message.contains("API 请求失败"));
        assert!(message.contains("503"));
        assert!(message.contains("overloaded"));
    }

    #[test]
    fn long_bodies_are_truncated() {
        let body = "x".repeat(2_000);
        let message = http_guidance(500, &body);
        assert!(message.ends_with("..."));
        assert!(message.len() < 700);
    }
}
