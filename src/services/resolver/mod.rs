// Book resolution: OCR candidates -> one upstream call -> book records

pub mod extract;
pub mod prompt;
pub mod providers;

use crate::core::errors::ResolutionError;
use crate::core::types::{BookRecord, OcrCandidateSet};
use crate::middleware::KeyStats;
use providers::CompletionProvider;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

pub use providers::build_provider;

/// Resolves a request's candidate sets into books with a single upstream call
#[derive(Clone)]
pub struct BookResolver {
    provider: Arc<dyn CompletionProvider>,
}

impl BookResolver {
    pub fn new(provider: Arc<dyn CompletionProvider>) -> Self {
        Self { provider }
    }

    pub fn provider_name(&self) -> &'static str {
        self.provider.name()
    }

    pub async fn key_stats(&self) -> Vec<KeyStats> {
        self.provider.key_stats().await
    }

    /// Build the batch prompt, call upstream once, parse the answer
    #[instrument(skip_all, fields(provider = self.provider.name(), spines = candidate_sets.len()))]
    pub async fn resolve(
        &self,
        candidate_sets: &[OcrCandidateSet],
    ) -> Result<Vec<BookRecord>, ResolutionError> {
        let prompt = prompt::build_prompt(candidate_sets);
        debug!("Prompt is {} chars", prompt.len());

        let text = self.provider.complete(&prompt).await.map_err(|e| {
            warn!("Resolution call failed ({}): {}", e.kind(), e);
            e
        })?;

        let books = extract::parse_books(&text)?;
        info!("Resolved {} book(s)", books.len());
        Ok(books)
    }
}
