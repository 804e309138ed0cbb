//! Generation collaborator seam
//!
//! The core never talks to a model directly. It asks a [`PatchGenerator`] for
//! patches and fixes, and optionally for goal/logic findings. Futures are
//! boxed so the trait stays object-safe behind `Arc<dyn PatchGenerator>`.

pub mod client;
pub mod prompts;
pub mod schema;

use crate::patch::Patch;
use crate::reflection::ReflectionIssue;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use client::OpenRouterGenerator;

#[derive(Debug, Error)]
pub enum GenerationError {
    #[error("generator unavailable: {0}")]
    Unavailable(String),
    #[error("request failed: {0}")]
    Request(String),
    #[error("rate limited after {retries} retries")]
    RateLimited { retries: u32 },
    #[error("API error {status}: {message}")]
    Api { status: u16, message: String },
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl From<reqwest::Error> for GenerationError {
    fn from(e: reqwest::Error) -> Self {
        GenerationError::Request(e.to_string())
    }
}

/// What a step asks the generator to change in one file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRequest {
    pub file_path: String,
    /// Current content; empty for a file being created
    pub content: String,
    pub change_description: String,
    #[serde(default)]
    pub line_hints: Vec<usize>,
    #[serde(default)]
    pub symbol_hints: Vec<String>,
}

/// A request to correct a patch that reflection rejected
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixRequest {
    pub objective: String,
    pub file_path: String,
    /// Content the patch is applied to
    pub original: String,
    pub patch: Patch,
    pub issues: Vec<ReflectionIssue>,
}

pub trait PatchGenerator: Send + Sync {
    fn generate_patch<'a>(
        &'a self,
        request: &'a PatchRequest,
    ) -> BoxFuture<'a, Result<Patch, GenerationError>>;

    fn generate_fix<'a>(
        &'a self,
        request: &'a FixRequest,
    ) -> BoxFuture<'a, Result<Patch, GenerationError>>;

    /// Compare a diff with the objective it was meant to achieve
    fn check_goal<'a>(
        &'a self,
        _objective: &'a str,
        _file_path: &'a str,
        _diff: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ReflectionIssue>, GenerationError>> {
        Box::pin(async { Ok(Vec::new()) })
    }

    /// Semantic review of a diff
    fn review_logic<'a>(
        &'a self,
        _file_path: &'a str,
        _diff: &'a str,
    ) -> BoxFuture<'a, Result<Vec<ReflectionIssue>, GenerationError>> {
        Box::pin(async { Ok(Vec::new()) })
    }
}

/// Generator for runs without model access. Patch and fix requests fail as
/// unavailable; goal and logic checks report nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineGenerator;

impl PatchGenerator for OfflineGenerator {
    fn generate_patch<'a>(
        &'a self,
        request: &'a PatchRequest,
    ) -> BoxFuture<'a, Result<Patch, GenerationError>> {
        Box::pin(async move {
            Err(GenerationError::Unavailable(format!(
                "no generator configured to edit {}",
                request.file_path
            )))
        })
    }

    fn generate_fix<'a>(
        &'a self,
        request: &'a FixRequest,
    ) -> BoxFuture<'a, Result<Patch, GenerationError>> {
        Box::pin(async move {
            Err(GenerationError::Unavailable(format!(
                "no generator configured to fix {}",
                request.file_path
            )))
        })
    }
}
