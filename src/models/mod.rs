//! Heavyweight model roles and their resource manager.
//!
//! The pipeline talks to models only through two narrow traits:
//!
//! * [`FigureInterpreter`] — `cropped image → (generated text, status)`
//! * [`PageFormatter`] — `(plain text, page image) → (markdown, status)`
//!
//! Concrete models are built by a [`ModelFactory`] from the
//! [`registry::VariantTable`] and kept resident by the [`ModelManager`],
//! which holds at most one instance per [`ModelRole`].
//!
//! A returned [`Generation`] with [`Status::Failed`] means the model ran but
//! hit its token budget; an `Err(ModelCallError)` means it could not be
//! called at all.

pub mod device;
pub mod manager;
pub mod registry;
pub mod vlm;

pub use device::{DeviceReclaimer, TracingReclaimer};
pub use manager::{ModelFactory, ModelHandle, ModelLease, ModelManager};
pub use registry::{Device, ModelRole, Precision, VariantSpec, VariantTable};
pub use vlm::{ProviderSource, VlmModelFactory};

use crate::context::Status;
use async_trait::async_trait;
use image::DynamicImage;
use thiserror::Error;

/// Raw model output plus the model's own verdict on it.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    pub status: Status,
}

impl Generation {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: Status::Success,
        }
    }

    /// Output that reached the token budget and is probably cut off.
    pub fn truncated(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            status: Status::Failed,
        }
    }

    pub fn is_truncated(&self) -> bool {
        self.status == Status::Failed
    }
}

/// A model invocation that never produced output.
#[derive(Debug, Clone, Error)]
#[error("model call failed after {retries} retries: {detail}")]
pub struct ModelCallError {
    pub retries: u32,
    pub detail: String,
}

impl ModelCallError {
    pub fn new(retries: u32, detail: impl Into<String>) -> Self {
        Self {
            retries,
            detail: detail.into(),
        }
    }
}

#[async_trait]
pub trait FigureInterpreter: Send + Sync {
    async fn interpret(&self, figure: &DynamicImage) -> Result<Generation, ModelCallError>;
}

#[async_trait]
pub trait PageFormatter: Send + Sync {
    /// Budget the formatter generates against; used for truncation reports.
    fn max_new_tokens(&self) -> usize;

    async fn format(
        &self,
        plain_text: &str,
        page_image: &DynamicImage,
    ) -> Result<Generation, ModelCallError>;
}
