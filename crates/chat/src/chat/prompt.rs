use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Inputs at this length or beyond are no longer treated as prompt searches.
pub const SEARCH_TEXT_LIMIT: usize = 30;
pub const SEARCH_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Prompt {
    pub title: String,
    pub content: String,
}

impl Prompt {
    pub fn new(title: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            content: content.into(),
        }
    }
}

/// Searchable collection of canned prompts.
pub struct PromptStore {
    prompts: Vec<Prompt>,
}

impl PromptStore {
    pub fn new(prompts: Vec<Prompt>) -> Self {
        Self { prompts }
    }

    pub fn search(&self, query: &str) -> Vec<Prompt> {
        let needle = query.to_lowercase();
        self.prompts
            .iter()
            .filter(|prompt| {
                prompt.title.to_lowercase().contains(&needle)
                    || prompt.content.to_lowercase().contains(&needle)
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.prompts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.prompts.is_empty()
    }
}

/// Extracts the prompt-search query from raw composer input.
///
/// A search is only a slash command longer than one character and short
/// enough to plausibly be a prompt name; everything else clears the hints.
pub fn autocomplete_query(input: &str) -> Option<&str> {
    let trimmed_len = input.trim().chars().count();
    if trimmed_len == 0 || trimmed_len >= SEARCH_TEXT_LIMIT {
        return None;
    }
    if !input.starts_with('/') || input.chars().count() <= 1 {
        return None;
    }
    Some(&input[1..])
}

/// Runs at most one pending task, delayed; a new call supersedes the previous
/// pending one instead of queueing behind it.
pub struct Debouncer {
    delay: Duration,
    pending: Mutex<Option<JoinHandle<()>>>,
}

impl Debouncer {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            pending: Mutex::new(None),
        }
    }

    pub fn call<F>(&self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let delay = self.delay;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            task.await;
        });

        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pending.replace(handle) {
            previous.abort();
        }
    }

    pub fn cancel(&self) {
        let mut pending = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(previous) = pending.take() {
            previous.abort();
        }
    }
}

impl Drop for Debouncer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Debounced prompt search wired to a watch channel of current hints.
pub struct PromptHinter {
    store: Arc<PromptStore>,
    debouncer: Debouncer,
    hints: Arc<watch::Sender<Vec<Prompt>>>,
}

impl PromptHinter {
    pub fn new(store: Arc<PromptStore>) -> Self {
        let (hints, _) = watch::channel(Vec::new());
        Self {
            store,
            debouncer: Debouncer::new(SEARCH_DEBOUNCE),
            hints: Arc::new(hints),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<Vec<Prompt>> {
        self.hints.subscribe()
    }

    pub fn on_input(&self, input: &str) {
        match autocomplete_query(input) {
            Some(query) => {
                let store = Arc::clone(&self.store);
                let hints = Arc::clone(&self.hints);
                let query = query.to_string();
                self.debouncer.call(async move {
                    let results = store.search(&query);
                    let _ = hints.send(results);
                });
            }
            None => {
                // Stale searches must not resurface hints the caller cleared.
                self.debouncer.cancel();
                let _ = self.hints.send(Vec::new());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_store() -> Arc<PromptStore> {
        Arc::new(PromptStore::new(vec![
            Prompt::new("Greeting", "Say hello in a friendly tone"),
            Prompt::new("Summarize", "Summarize the following text"),
            Prompt::new("Translate", "Translate the following text into French"),
        ]))
    }

    #[test]
    fn autocomplete_query_requires_a_slash_command() {
        assert_eq!(autocomplete_query("/greet"), Some("greet"));
        assert_eq!(autocomplete_query("greet"), None);
        assert_eq!(autocomplete_query("/"), None);
        assert_eq!(autocomplete_query(""), None);
        assert_eq!(autocomplete_query("   "), None);
    }

    #[test]
    fn autocomplete_query_ignores_long_inputs() {
        let long = format!("/{}", "x".repeat(SEARCH_TEXT_LIMIT));
        assert_eq!(autocomplete_query(&long), None);

        let short_enough = format!("/{}", "x".repeat(SEARCH_TEXT_LIMIT - 2));
        assert!(autocomplete_query(&short_enough).is_some());
    }

    #[test]
    fn search_matches_title_and_content_case_insensitively() {
        let store = sample_store();
        assert_eq!(store.search("GREET").len(), 1);
        assert_eq!(store.search("the").len(), 2);
        assert!(store.search("nothing-here").is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn hinter_publishes_results_after_the_debounce_delay() {
        let hinter = PromptHinter::new(sample_store());
        let mut hints = hinter.subscribe();

        hinter.on_input("/greet");
        hints.changed().await.unwrap();
        assert_eq!(hints.borrow().len(), 1);
        assert_eq!(hints.borrow()[0].title, "Greeting");
    }

    #[tokio::test(start_paused = true)]
    async fn newer_input_supersedes_a_pending_search() {
        let hinter = PromptHinter::new(sample_store());
        let mut hints = hinter.subscribe();

        hinter.on_input("/summ");
        hinter.on_input("/translate");
        hints.changed().await.unwrap();

        assert_eq!(hints.borrow().len(), 1);
        assert_eq!(hints.borrow()[0].title, "Translate");
    }

    #[tokio::test(start_paused = true)]
    async fn empty_input_clears_hints_and_cancels_pending_search() {
        let hinter = PromptHinter::new(sample_store());
        let mut hints = hinter.subscribe();

        hinter.on_input("/greet");
        hints.changed().await.unwrap();
        assert_eq!(hints.borrow().len(), 1);

        hinter.on_input("/summ");
        hinter.on_input("");
        hints.changed().await.unwrap();
        assert!(hints.borrow().is_empty());

        // The superseded search never lands.
        tokio::time::sleep(SEARCH_DEBOUNCE * 4).await;
        assert!(hints.borrow().is_empty());
    }
}
