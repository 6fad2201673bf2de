//! Token accounting for prompts.
//!
//! A [`TokenizerLease`] is acquired once per request for the request's
//! model. The pipeline only uses it to log prompt sizes and warn when a
//! prompt plus the completion budget will not fit the model's context
//! window; nothing is ever truncated. Dropping the lease hands the tokenizer
//! back to its provider, so release happens exactly once on every path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{anyhow, Context, Result};
use tiktoken_rs::CoreBPE;

pub trait Tokenizer: Send + Sync {
    fn count_tokens(&self, text: &str) -> usize;

    /// Context window of the model, in tokens.
    fn context_size(&self) -> usize;
}

/// Source of per-model tokenizers.
pub trait TokenizerProvider: Send + Sync {
    fn acquire(&self, model: &str) -> Result<Box<dyn Tokenizer>>;

    /// Called once when a lease for `model` is dropped.
    fn release(&self, model: &str);
}

/// A tokenizer held for the duration of one request.
pub struct TokenizerLease {
    provider: Arc<dyn TokenizerProvider>,
    model: String,
    tokenizer: Box<dyn Tokenizer>,
}

impl TokenizerLease {
    pub fn acquire(provider: Arc<dyn TokenizerProvider>, model: &str) -> Result<Self> {
        let tokenizer = provider.acquire(model)?;
        Ok(Self {
            provider,
            model: model.to_string(),
            tokenizer,
        })
    }

    /// Acquires on the blocking pool. Building an encoding takes long enough
    /// to stall an async worker.
    pub async fn load(provider: Arc<dyn TokenizerProvider>, model: &str) -> Result<Self> {
        let model = model.to_string();
        tokio::task::spawn_blocking(move || Self::acquire(provider, &model))
            .await
            .context("tokenizer task failed")?
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn count_tokens(&self, text: &str) -> usize {
        self.tokenizer.count_tokens(text)
    }

    /// Logs the prompt size; warns when the prompt and the completion budget
    /// exceed the context window.
    pub fn check_prompt(&self, label: &str, prompt: &str, max_tokens: u32) -> usize {
        let tokens = self.count_tokens(prompt);
        let window = self.tokenizer.context_size();
        tracing::debug!(model = %self.model, prompt = label, tokens, "prompt size");
        if tokens + max_tokens as usize > window {
            tracing::warn!(
                model = %self.model,
                prompt = label,
                tokens,
                max_tokens,
                window,
                "prompt and completion budget exceed the context window"
            );
        }
        tokens
    }
}

impl Drop for TokenizerLease {
    fn drop(&mut self) {
        self.provider.release(&self.model);
    }
}

struct TiktokenTokenizer {
    bpe: Arc<CoreBPE>,
    context_size: usize,
}

impl Tokenizer for TiktokenTokenizer {
    fn count_tokens(&self, text: &str) -> usize {
        self.bpe.encode_with_special_tokens(text).len()
    }

    fn context_size(&self) -> usize {
        self.context_size
    }
}

/// tiktoken encodings, built once per model and shared.
///
/// Models tiktoken does not know fall back to `cl100k_base`.
#[derive(Default)]
pub struct TiktokenProvider {
    cache: Mutex<HashMap<String, Arc<CoreBPE>>>,
    active: AtomicUsize,
}

impl TiktokenProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of leases currently held.
    pub fn active_leases(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    fn cached(&self, model: &str) -> Result<Option<Arc<CoreBPE>>> {
        let cache = self
            .cache
            .lock()
            .map_err(|_| anyhow!("tokenizer cache lock poisoned"))?;
        Ok(cache.get(model).cloned())
    }

    /// The encoding for `model`. A miss builds it without holding the cache
    /// lock; concurrent misses may build twice and the first insert wins.
    fn encoding(&self, model: &str) -> Result<Arc<CoreBPE>> {
        if let Some(bpe) = self.cached(model)? {
            return Ok(bpe);
        }
        let bpe = match tiktoken_rs::get_bpe_from_model(model) {
            Ok(bpe) => bpe,
            Err(_) => {
                tracing::debug!(model, "no tiktoken encoding for model, using cl100k_base");
                tiktoken_rs::cl100k_base()?
            }
        };
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| anyhow!("tokenizer cache lock poisoned"))?;
        Ok(cache
            .entry(model.to_string())
            .or_insert_with(|| Arc::new(bpe))
            .clone())
    }

    /// Builds the encodings for `models` ahead of the first request.
    pub fn preload(&self, models: &[&str]) -> Result<()> {
        for model in models {
            self.encoding(model)?;
        }
        Ok(())
    }

    /// Number of cached encodings.
    pub fn cached_models(&self) -> usize {
        self.cache.lock().map(|c| c.len()).unwrap_or(0)
    }
}

impl TokenizerProvider for TiktokenProvider {
    fn acquire(&self, model: &str) -> Result<Box<dyn Tokenizer>> {
        let bpe = self.encoding(model)?;
        self.active.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(TiktokenTokenizer {
            bpe,
            context_size: tiktoken_rs::model::get_context_size(model),
        }))
    }

    fn release(&self, _model: &str) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}
