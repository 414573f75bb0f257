use std::path::{Path, PathBuf};
use switchboard_core::types::ChatMessage;
use switchboard_core::{Workspace, PERSONA_FILES};
use tracing::debug;

const DEFAULT_PERSONA: &str = "You are a helpful assistant reachable through several chat platforms. \
Answer concisely and use the available tools when they help.";

/// Fast token estimate without a tokenizer.
/// ASCII words count roughly 1.3 tokens, every non-ASCII char counts one.
pub(crate) fn estimate_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let mut tokens: usize = 0;
    let mut ascii_word_chars: usize = 0;
    for ch in text.chars() {
        if ch.is_ascii() {
            if ch.is_ascii_whitespace() || ch.is_ascii_punctuation() {
                if ascii_word_chars > 0 {
                    tokens += 1 + ascii_word_chars / 4;
                    ascii_word_chars = 0;
                }
                tokens += 1;
            } else {
                ascii_word_chars += 1;
            }
        } else {
            if ascii_word_chars > 0 {
                tokens += 1 + ascii_word_chars / 4;
                ascii_word_chars = 0;
            }
            tokens += 1;
        }
    }
    if ascii_word_chars > 0 {
        tokens += 1 + ascii_word_chars / 4;
    }
    tokens + 4
}

pub(crate) fn estimate_message_tokens(msg: &ChatMessage) -> usize {
    let content_tokens = match &msg.content {
        serde_json::Value::String(s) => estimate_tokens(s),
        serde_json::Value::Array(parts) => parts
            .iter()
            .map(|p| {
                if let Some(text) = p.get("text").and_then(|t| t.as_str()) {
                    estimate_tokens(text)
                } else if p.get("image_url").is_some() {
                    200
                } else {
                    10
                }
            })
            .sum(),
        _ => 0,
    };
    let tool_call_tokens = msg.tool_calls.as_ref().map_or(0, |calls| {
        calls
            .iter()
            .map(|tc| estimate_tokens(&tc.name) + estimate_tokens(&tc.arguments.to_string()) + 10)
            .sum()
    });
    content_tokens + tool_call_tokens + 4
}

/// Composes the message list for one LLM call: persona block, tool summary,
/// trimmed history, new user turn.
pub struct ContextBuilder {
    workspace: Workspace,
    extra_prompt_paths: Vec<PathBuf>,
    max_context_tokens: usize,
}

impl ContextBuilder {
    pub fn new(workspace: Workspace, extra_prompt_paths: &[String], max_context_tokens: usize) -> Self {
        let extra_prompt_paths = extra_prompt_paths
            .iter()
            .map(|p| {
                let path = Path::new(p);
                if path.is_absolute() {
                    path.to_path_buf()
                } else {
                    workspace.root().join(path)
                }
            })
            .collect();
        Self {
            workspace,
            extra_prompt_paths,
            max_context_tokens,
        }
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    /// Re-reads the persona files on every call so an identity activation
    /// takes effect on the next turn.
    pub fn build_system_prompt(&self, skills: &[(String, String)], channel: &str) -> String {
        let mut prompt = String::new();

        for name in PERSONA_FILES {
            if let Some(content) = load_file_if_exists(self.workspace.persona_file(name)) {
                prompt.push_str(content.trim_end());
                prompt.push_str("\n\n");
            }
        }
        for path in &self.extra_prompt_paths {
            if let Some(content) = load_file_if_exists(path) {
                prompt.push_str(content.trim_end());
                prompt.push_str("\n\n");
            }
        }
        if prompt.is_empty() {
            prompt.push_str(DEFAULT_PERSONA);
            prompt.push_str("\n\n");
        }

        if !skills.is_empty() {
            prompt.push_str("## Tools\n");
            for (name, description) in skills {
                if description.is_empty() {
                    prompt.push_str(&format!("- {}\n", name));
                } else {
                    prompt.push_str(&format!("- {}: {}\n", name, description));
                }
            }
            prompt.push('\n');
        }

        prompt.push_str("## Current Context\n");
        prompt.push_str(&format!(
            "Time: {}\n",
            chrono::Local::now().format("%Y-%m-%d %H:%M:%S %Z")
        ));
        if !channel.is_empty() {
            prompt.push_str(&format!("Channel: {}\n", channel));
        }

        prompt
    }

    pub fn build_messages(
        &self,
        history: &[ChatMessage],
        user_content: &str,
        skills: &[(String, String)],
        channel: &str,
    ) -> Vec<ChatMessage> {
        let system = ChatMessage::system(&self.build_system_prompt(skills, channel));
        let user = ChatMessage::user(user_content);

        let fixed = estimate_message_tokens(&system) + estimate_message_tokens(&user);
        let budget = self.max_context_tokens.saturating_sub(fixed);
        let kept = trim_history(history, budget);
        if kept.len() < history.len() {
            debug!(
                dropped = history.len() - kept.len(),
                kept = kept.len(),
                "Trimmed history to fit context budget"
            );
        }

        let mut messages = Vec::with_capacity(kept.len() + 2);
        messages.push(system);
        messages.extend_from_slice(kept);
        messages.push(user);
        messages
    }
}

/// Newest suffix of `history` that fits `budget`, cut on round boundaries.
///
/// A round starts at a user turn and carries the assistant and tool turns
/// that answered it, so a tool result is never separated from the call that
/// produced it.
pub(crate) fn trim_history(history: &[ChatMessage], budget: usize) -> &[ChatMessage] {
    let mut round_starts: Vec<usize> = history
        .iter()
        .enumerate()
        .filter(|(_, m)| m.role == "user")
        .map(|(i, _)| i)
        .collect();
    if round_starts.first() != Some(&0) {
        round_starts.insert(0, 0);
    }

    let mut start = history.len();
    let mut used = 0usize;
    for &round_start in round_starts.iter().rev() {
        let cost: usize = history[round_start..start].iter().map(estimate_message_tokens).sum();
        if used + cost > budget {
            break;
        }
        used += cost;
        start = round_start;
    }

    // Leading orphans (tool/assistant before the first kept user turn).
    while start < history.len() && history[start].role != "user" {
        start += 1;
    }
    &history[start..]
}

fn load_file_if_exists<P: AsRef<Path>>(path: P) -> Option<String> {
    std::fs::read_to_string(path).ok().filter(|s| !s.trim().is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::types::ToolCallRequest;
    use tempfile::TempDir;

    fn round(user: &str, reply: &str) -> Vec<ChatMessage> {
        vec![ChatMessage::user(user), ChatMessage::assistant(reply)]
    }

    #[test]
    fn test_estimate_tokens() {
        assert_eq!(estimate_tokens(""), 0);
        assert!(estimate_tokens("hello world") > 4);
        assert!(estimate_tokens("你好世界") >= 8);
    }

    #[test]
    fn test_trim_keeps_everything_under_budget() {
        let history: Vec<_> = [round("a", "b"), round("c", "d")].concat();
        assert_eq!(trim_history(&history, 10_000).len(), 4);
    }

    #[test]
    fn test_trim_drops_oldest_rounds() {
        let long = "word ".repeat(200);
        let history: Vec<_> = [round(&long, &long), round("recent", "reply")].concat();
        let kept = trim_history(&history, 50);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].text(), "recent");
    }

    #[test]
    fn test_trim_never_splits_tool_round() {
        let call = ToolCallRequest {
            id: "c1".into(),
            name: "add".into(),
            arguments: serde_json::json!({"a": 2, "b": 3}),
        };
        let mut history = round(&"old ".repeat(300), "ok");
        history.push(ChatMessage::user("what is 2+3"));
        history.push(ChatMessage::assistant_with_tool_calls("", vec![call]));
        history.push(ChatMessage::tool_result("c1", "add", "5"));
        history.push(ChatMessage::assistant("5"));

        let kept = trim_history(&history, 120);
        assert_eq!(kept[0].role, "user");
        assert_eq!(kept.len(), 4);

        let none = trim_history(&history, 1);
        assert!(none.is_empty());
    }

    #[test]
    fn test_system_prompt_reads_persona_files_each_call() {
        let tmp = TempDir::new().unwrap();
        let ws = Workspace::new(tmp.path());
        let builder = ContextBuilder::new(ws.clone(), &[], 4000);

        let prompt = builder.build_system_prompt(&[], "telegram");
        assert!(prompt.contains("helpful assistant"));
        assert!(prompt.contains("Channel: telegram"));

        std::fs::write(ws.persona_file("IDENTITY.md"), "I am Max, a car salesman.").unwrap();
        let prompt = builder.build_system_prompt(&[("echo".into(), "Echo text".into())], "");
        assert!(prompt.contains("I am Max"));
        assert!(!prompt.contains("helpful assistant"));
        assert!(prompt.contains("- echo: Echo text"));
    }

    #[test]
    fn test_build_messages_order_and_budget() {
        let tmp = TempDir::new().unwrap();
        let builder = ContextBuilder::new(Workspace::new(tmp.path()), &[], 300);
        let history: Vec<_> = [round(&"old ".repeat(400), "x"), round("prev", "answer")].concat();

        let msgs = builder.build_messages(&history, "new question", &[], "discord");
        assert_eq!(msgs.first().unwrap().role, "system");
        assert_eq!(msgs.last().unwrap().text(), "new question");
        assert_eq!(msgs.len(), 4);
        assert_eq!(msgs[1].text(), "prev");
    }
}
