//! Offline heuristic backend for hosts without a remote model.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use crate::inference::{
    DEFAULT_STREAM_CAPACITY, InferenceClient, InferenceFuture, InferenceSender, InferenceStream,
};
use crate::models::{Task, TaskId, TaskType};

pub const DEFAULT_SUMMARY_LENGTH: usize = 280;

const STOP_WORDS: &[&str] = &[
    "the", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by",
];

#[derive(Clone, Debug, Default)]
pub struct LocalInferenceClient {
    chunk_delay: Duration,
}

impl LocalInferenceClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pause between emitted chunks, mostly useful to make progress observable.
    pub fn with_chunk_delay(mut self, chunk_delay: Duration) -> Self {
        self.chunk_delay = chunk_delay;
        self
    }
}

impl InferenceClient for LocalInferenceClient {
    fn open_stream<'a>(&'a self, task: &'a Task) -> InferenceFuture<'a, InferenceStream> {
        let task = task.clone();
        let chunk_delay = self.chunk_delay;
        Box::pin(async move {
            let (sender, stream) = InferenceStream::channel(DEFAULT_STREAM_CAPACITY);
            tokio::spawn(async move {
                produce(task, sender, chunk_delay).await;
            });
            Ok(stream)
        })
    }

    fn cancel(&self, task_id: TaskId) -> InferenceFuture<'_, ()> {
        // producers stop on their own once the subscription is dropped
        tracing::debug!(task_id = task_id.0, "local inference cancel requested");
        Box::pin(async { Ok(()) })
    }
}

async fn produce(task: Task, sender: InferenceSender, chunk_delay: Duration) {
    match task.task_type {
        TaskType::PageSummary => {
            let Some(content) = string_parameter(&task, "content") else {
                sender.fail("missing 'content' parameter").await;
                return;
            };
            let max_length = task
                .parameters
                .get("max_length")
                .and_then(|value| value.as_u64())
                .and_then(|value| usize::try_from(value).ok())
                .unwrap_or(DEFAULT_SUMMARY_LENGTH);

            let sentences = split_sentences(&content);
            let step = 1.0 / sentences.len().max(1) as f64;
            let mut summary = String::new();
            let mut current_length = 0;
            for sentence in sentences {
                if current_length + sentence.len() > max_length {
                    break;
                }
                if !summary.is_empty() {
                    summary.push_str(". ");
                }
                summary.push_str(sentence);
                current_length += sentence.len() + 2;

                if !emit_chunk(&sender, step, chunk_delay).await {
                    return;
                }
            }
            sender.complete(summary).await;
        }
        TaskType::DataExtraction => {
            let Some(content) = string_parameter(&task, "content") else {
                sender.fail("missing 'content' parameter").await;
                return;
            };
            if !emit_chunk(&sender, 0.5, chunk_delay).await {
                return;
            }
            let keywords = extract_keywords(&content);
            match serde_json::to_string(&keywords) {
                Ok(encoded) => sender.complete(encoded).await,
                Err(error) => sender.fail(format!("failed to encode keywords: {error}")).await,
            };
        }
        TaskType::FormFilling => {
            let fields = field_names(&task);
            if fields.is_empty() {
                sender.fail("missing 'fields' parameter").await;
                return;
            }
            let step = 1.0 / fields.len() as f64;
            let mut suggestions = BTreeMap::new();
            for field in fields {
                if let Some(value) = suggest_field(&field) {
                    suggestions.insert(field, value);
                }
                if !emit_chunk(&sender, step, chunk_delay).await {
                    return;
                }
            }
            match serde_json::to_string(&suggestions) {
                Ok(encoded) => sender.complete(encoded).await,
                Err(error) => sender.fail(format!("failed to encode suggestions: {error}")).await,
            };
        }
        TaskType::Translation => {
            let source = string_parameter(&task, "content")
                .map(|content| detect_language(&content))
                .unwrap_or("unknown");
            sender
                .fail(format!(
                    "offline translation is unavailable (detected source language: {source})"
                ))
                .await;
        }
        TaskType::WebSearch | TaskType::Custom => {
            sender
                .fail(format!(
                    "task type '{}' requires a remote inference backend",
                    task.task_type
                ))
                .await;
        }
    }
}

async fn emit_chunk(sender: &InferenceSender, delta: f64, chunk_delay: Duration) -> bool {
    if sender.is_closed() || !sender.progress(delta, None).await {
        return false;
    }
    if chunk_delay.is_zero() {
        tokio::task::yield_now().await;
    } else {
        tokio::time::sleep(chunk_delay).await;
    }
    true
}

fn string_parameter(task: &Task, key: &str) -> Option<String> {
    task.parameters
        .get(key)
        .and_then(|value| value.as_str())
        .filter(|value| !value.trim().is_empty())
        .map(str::to_string)
}

fn field_names(task: &Task) -> Vec<String> {
    match task.parameters.get("fields") {
        Some(serde_json::Value::Object(map)) => map.keys().cloned().collect(),
        Some(serde_json::Value::Array(items)) => items
            .iter()
            .filter_map(|item| item.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    }
}

fn split_sentences(content: &str) -> Vec<&str> {
    content
        .split(['.', '!', '?'])
        .map(str::trim)
        .filter(|sentence| !sentence.is_empty())
        .collect()
}

fn suggest_field(field: &str) -> Option<String> {
    let lower = field.to_lowercase();
    let value = if lower.contains("email") || lower.contains("e-mail") {
        "user@example.com"
    } else if lower.contains("name") {
        if lower.contains("first") {
            "John"
        } else if lower.contains("last") {
            "Doe"
        } else {
            "John Doe"
        }
    } else if lower.contains("phone") || lower.contains("tel") {
        "+1-555-123-4567"
    } else if lower.contains("address") {
        "123 Main St"
    } else if lower.contains("city") {
        "New York"
    } else if lower.contains("zip") || lower.contains("postal") {
        "10001"
    } else {
        return None;
    };
    Some(value.to_string())
}

fn extract_keywords(content: &str) -> Vec<String> {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for word in content.split_whitespace() {
        let word = word
            .trim_matches(|ch: char| !ch.is_alphanumeric())
            .to_lowercase();
        if word.chars().count() > 3 && !STOP_WORDS.contains(&word.as_str()) {
            *counts.entry(word).or_insert(0) += 1;
        }
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    ranked.into_iter().take(10).map(|(word, _)| word).collect()
}

fn detect_language(content: &str) -> &'static str {
    const ENGLISH: &[&str] = &["the", "and", "or", "but", "in", "on", "at", "to", "for", "of"];
    const SPANISH: &[&str] = &["el", "la", "y", "o", "pero", "en", "de", "para", "con", "por"];
    const FRENCH: &[&str] = &["le", "la", "et", "ou", "mais", "dans", "de", "pour", "avec", "par"];

    let words: Vec<String> = content
        .split_whitespace()
        .map(|word| {
            word.trim_matches(|ch: char| !ch.is_alphanumeric())
                .to_lowercase()
        })
        .collect();
    let score = |vocabulary: &[&str]| {
        words
            .iter()
            .filter(|word| vocabulary.contains(&word.as_str()))
            .count()
    };

    let (english, spanish, french) = (score(ENGLISH), score(SPANISH), score(FRENCH));
    if english >= spanish && english >= french {
        "en"
    } else if spanish >= french {
        "es"
    } else {
        "fr"
    }
}

#[cfg(test)]
mod tests {
    use std::time::SystemTime;

    use serde_json::json;

    use super::*;
    use crate::inference::InferenceEvent;
    use crate::models::TaskParameters;

    fn task(task_type: TaskType, parameters: serde_json::Value) -> Task {
        let parameters: TaskParameters = serde_json::from_value(parameters).unwrap();
        Task::new(TaskId(1), task_type, "local", parameters, SystemTime::now())
    }

    async fn drain(task: &Task) -> Vec<InferenceEvent> {
        let client = LocalInferenceClient::new();
        let mut stream = client.open_stream(task).await.unwrap();
        let mut events = Vec::new();
        while let Some(event) = stream.next().await {
            events.push(event);
        }
        events
    }

    #[tokio::test]
    async fn summary_respects_max_length() {
        let task = task(
            TaskType::PageSummary,
            json!({
                "content": "This is the first sentence. This is the second sentence. This is the third sentence.",
                "max_length": 60
            }),
        );
        let events = drain(&task).await;

        let Some(InferenceEvent::Completed { result }) = events.last() else {
            panic!("expected completion, got {events:?}");
        };
        assert_eq!(result, "This is the first sentence. This is the second sentence");
        assert_eq!(events.len(), 3);
    }

    #[tokio::test]
    async fn form_filling_suggests_known_fields_only() {
        let task = task(
            TaskType::FormFilling,
            json!({ "fields": ["first_name", "Email", "favourite_colour"] }),
        );
        let events = drain(&task).await;

        let Some(InferenceEvent::Completed { result }) = events.last() else {
            panic!("expected completion, got {events:?}");
        };
        let suggestions: BTreeMap<String, String> = serde_json::from_str(result).unwrap();
        assert_eq!(suggestions.get("first_name").map(String::as_str), Some("John"));
        assert_eq!(
            suggestions.get("Email").map(String::as_str),
            Some("user@example.com")
        );
        assert!(!suggestions.contains_key("favourite_colour"));
    }

    #[tokio::test]
    async fn custom_tasks_need_a_remote_backend() {
        let events = drain(&task(TaskType::Custom, json!({}))).await;
        assert!(matches!(
            events.as_slice(),
            [InferenceEvent::Failed { message }] if message.contains("remote inference backend")
        ));
    }

    #[test]
    fn keywords_are_ranked_by_frequency() {
        let keywords =
            extract_keywords("Rust rust RUST borrow borrow checker the and with lifetimes.");
        assert_eq!(keywords[0], "rust");
        assert_eq!(keywords[1], "borrow");
        assert!(keywords.contains(&"lifetimes".to_string()));
        assert!(!keywords.contains(&"with".to_string()));
    }

    #[test]
    fn language_detection_prefers_dominant_stop_words() {
        assert_eq!(detect_language("the cat and the dog went to the park"), "en");
        assert_eq!(detect_language("el perro y el gato con la pelota para por"), "es");
        assert_eq!(detect_language("le chat et le chien dans avec pour"), "fr");
    }
}
