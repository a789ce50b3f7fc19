//! Chat: answer the latest user question from retrieved context.
//!
//! Only the most recent `role == "user"` message is used; earlier turns are
//! ignored for retrieval and prompting. Retrieved records are packed into the
//! context in relevance order until the character budget is reached. If no
//! context survives, the fixed refusal is returned without calling the model.

use anyhow::Result;

use crate::completion::{self, CompletionClient, REFUSAL_MESSAGE};
use crate::config::Config;
use crate::models::{ChatMessage, ChatReply};
use crate::search::{SearchHit, SearchService};

const CONTEXT_SEPARATOR: &str = "\n\n";

/// Content of the last message with role `user`, or `""` when there is none.
pub fn latest_user_question(messages: &[ChatMessage]) -> &str {
    messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.as_str())
        .unwrap_or("")
}

/// Join hit contents with blank lines while the total stays within `max_chars`
/// characters.
///
/// Hits are taken in order and packing stops at the first one that does not
/// fit. A first hit larger than the whole budget is cut at a character boundary.
pub fn budget_context(hits: &[SearchHit], max_chars: usize) -> String {
    let mut context = String::new();
    let mut used = 0;

    for (idx, hit) in hits.iter().enumerate() {
        let len = hit.content.chars().count();
        if idx == 0 {
            if len > max_chars {
                return hit.content.chars().take(max_chars).collect();
            }
            context.push_str(&hit.content);
            used = len;
            continue;
        }

        let sep = CONTEXT_SEPARATOR.len();
        if used + sep + len > max_chars {
            tracing::debug!(kept = idx, dropped = hits.len() - idx, "context budget reached");
            break;
        }
        context.push_str(CONTEXT_SEPARATOR);
        context.push_str(&hit.content);
        used += sep + len;
    }

    context
}

/// Retrieval and prompt limits for one chat request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatSettings {
    pub top_k: usize,
    pub max_context_chars: usize,
}

impl From<&Config> for ChatSettings {
    fn from(config: &Config) -> Self {
        Self {
            top_k: config.search.top_k,
            max_context_chars: config.completion.max_context_chars,
        }
    }
}

/// Answer the latest user message in `messages`.
pub async fn answer(
    search: &dyn SearchService,
    completion: &dyn CompletionClient,
    messages: &[ChatMessage],
    settings: ChatSettings,
) -> Result<ChatReply> {
    let question = latest_user_question(messages);
    let hits = search.search(question, settings.top_k).await?;
    let context = budget_context(&hits, settings.max_context_chars);

    if context.trim().is_empty() {
        tracing::info!(hits = hits.len(), "no context retrieved, refusing");
        return Ok(ChatReply {
            response: REFUSAL_MESSAGE.to_string(),
        });
    }

    tracing::info!(
        hits = hits.len(),
        context_chars = context.chars().count(),
        "answering from retrieved context"
    );
    let response = completion::answer(completion, question, &context).await?;
    Ok(ChatReply { response })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IndexerRun;
    use async_trait::async_trait;
    use std::sync::Mutex;

    #[test]
    fn latest_user_message_wins() {
        let messages = vec![
            ChatMessage::new("user", "first"),
            ChatMessage::new("assistant", "reply"),
            ChatMessage::new("user", "second"),
            ChatMessage::new("assistant", "reply 2"),
        ];
        assert_eq!(latest_user_question(&messages), "second");
        assert_eq!(latest_user_question(&[]), "");
        assert_eq!(
            latest_user_question(&[ChatMessage::new("system", "x")]),
            ""
        );
    }

    #[test]
    fn budget_keeps_whole_hits_in_order() {
        let hits = vec![
            SearchHit::new("aaaa"),
            SearchHit::new("bbbb"),
            SearchHit::new("cccc"),
        ];
        assert_eq!(budget_context(&hits, 100), "aaaa\n\nbbbb\n\ncccc");
        assert_eq!(budget_context(&hits, 10), "aaaa\n\nbbbb");
        assert_eq!(budget_context(&hits, 9), "aaaa");
    }

    #[test]
    fn oversized_first_hit_is_cut_on_char_boundary() {
        let hits = vec![SearchHit::new("ééééé"), SearchHit::new("x")];
        assert_eq!(budget_context(&hits, 3), "ééé");
    }

    #[test]
    fn no_hits_no_context() {
        assert_eq!(budget_context(&[], 10), "");
    }

    struct FixedSearch(Vec<SearchHit>);

    #[async_trait]
    impl SearchService for FixedSearch {
        async fn search(&self, _query: &str, top_k: usize) -> Result<Vec<SearchHit>> {
            Ok(self.0.iter().take(top_k).cloned().collect())
        }

        async fn run_indexer(&self) -> IndexerRun {
            IndexerRun::triggered()
        }
    }

    #[derive(Default)]
    struct RecordingCompletion {
        prompts: Mutex<Vec<Vec<ChatMessage>>>,
    }

    #[async_trait]
    impl CompletionClient for RecordingCompletion {
        async fn complete(&self, messages: &[ChatMessage]) -> Result<String> {
            self.prompts.lock().unwrap().push(messages.to_vec());
            Ok("<p>Managers approve leave.</p>".to_string())
        }
    }

    const SETTINGS: ChatSettings = ChatSettings {
        top_k: 5,
        max_context_chars: 1000,
    };

    #[tokio::test]
    async fn empty_context_refuses_without_model_call() {
        let search = FixedSearch(vec![]);
        let completion = RecordingCompletion::default();
        let reply = answer(
            &search,
            &completion,
            &[ChatMessage::new("user", "Who approves leave?")],
            SETTINGS,
        )
        .await
        .unwrap();
        assert_eq!(reply.response, REFUSAL_MESSAGE);
        assert!(completion.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn whitespace_context_refuses() {
        let search = FixedSearch(vec![SearchHit::new("  \n ")]);
        let completion = RecordingCompletion::default();
        let reply = answer(&search, &completion, &[ChatMessage::new("user", "q")], SETTINGS)
            .await
            .unwrap();
        assert_eq!(reply.response, REFUSAL_MESSAGE);
        assert!(completion.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn answers_from_context() {
        let search = FixedSearch(vec![SearchHit::new("Leave is approved by managers.")]);
        let completion = RecordingCompletion::default();
        let reply = answer(
            &search,
            &completion,
            &[
                ChatMessage::new("user", "old question"),
                ChatMessage::new("user", "Who approves leave?"),
            ],
            SETTINGS,
        )
        .await
        .unwrap();
        assert_eq!(reply.response, "Managers approve leave.");

        let prompts = completion.prompts.lock().unwrap();
        assert_eq!(prompts.len(), 1);
        assert_eq!(
            prompts[0][1].content,
            "Context:\nLeave is approved by managers.\n\nQuestion: Who approves leave?"
        );
    }
}
