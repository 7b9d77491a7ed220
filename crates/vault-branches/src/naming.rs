use async_trait::async_trait;
use serde_json::Value;

const MAX_WORDS: usize = 5;
const MAX_CHARS: usize = 40;

/// Suggests a display name for a freshly created branch.
#[async_trait]
pub trait BranchNamer: Send + Sync {
    /// `history` is the filtered history visible from the new branch.
    async fn suggest(&self, history: &[Value]) -> anyhow::Result<Option<String>>;
}

/// Names a branch after the last user message it inherits.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeuristicNamer;

#[async_trait]
impl BranchNamer for HeuristicNamer {
    async fn suggest(&self, history: &[Value]) -> anyhow::Result<Option<String>> {
        let last_user = history
            .iter()
            .rev()
            .find(|m| m.get("role").and_then(Value::as_str) == Some("user"))
            .and_then(|m| m.get("content").and_then(Value::as_str));

        Ok(last_user.and_then(summarize))
    }
}

fn summarize(text: &str) -> Option<String> {
    let mut name = String::new();
    for word in text.split_whitespace().take(MAX_WORDS) {
        let word: String = word
            .chars()
            .filter(|c| c.is_alphanumeric() || *c == '-' || *c == '\'')
            .collect();
        if word.is_empty() {
            continue;
        }
        if name.len() + word.len() + 1 > MAX_CHARS {
            break;
        }
        if !name.is_empty() {
            name.push(' ');
        }
        name.push_str(&word);
    }

    if name.is_empty() {
        return None;
    }
    let mut chars = name.chars();
    chars
        .next()
        .map(|first| first.to_uppercase().collect::<String>() + chars.as_str())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn uses_last_user_message() {
        let history = vec![
            json!({"role": "user", "content": "tell me about rust"}),
            json!({"role": "assistant", "content": "sure"}),
            json!({"role": "user", "content": "how do lifetimes work in practice, really?"}),
            json!({"role": "assistant", "content": "..."}),
        ];
        let name = HeuristicNamer.suggest(&history).await.unwrap();
        assert_eq!(name.as_deref(), Some("How do lifetimes work in"));
    }

    #[tokio::test]
    async fn no_user_message_means_no_name() {
        let history = vec![json!({"role": "assistant", "content": "hello"})];
        assert!(HeuristicNamer.suggest(&history).await.unwrap().is_none());
        assert!(HeuristicNamer.suggest(&[]).await.unwrap().is_none());
    }

    #[test]
    fn summarize_caps_length() {
        let long = "supercalifragilistic expialidocious antidisestablishmentarianism words";
        let name = summarize(long).unwrap();
        assert!(name.len() <= MAX_CHARS);
        assert_eq!(name, "Supercalifragilistic expialidocious");
    }
}
