//! Static `(role, variant)` construction table.
//!
//! Every heavyweight model the pipeline can load is described here by a
//! [`VariantSpec`]: which model, on which device, at which precision, with
//! which adapter. The [`crate::models::ModelManager`] resolves a spec before
//! constructing anything, so an unknown role or variant is rejected up front
//! instead of silently falling back to some default model.

use crate::error::DocParseError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// A logical model responsibility. Each role owns one resident slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelRole {
    /// Turns a cropped figure into type / caption / description / data.
    FigureInterpreter,
    /// Rewrites a page's cleaned text into final markdown, looking at the page image.
    PageFormatter,
}

impl ModelRole {
    pub const ALL: [ModelRole; 2] = [ModelRole::FigureInterpreter, ModelRole::PageFormatter];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModelRole::FigureInterpreter => "figure_interpreter",
            ModelRole::PageFormatter => "page_formatter",
        }
    }
}

impl fmt::Display for ModelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelRole {
    type Err = DocParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "figure_interpreter" | "figure" | "fig2tab" => Ok(ModelRole::FigureInterpreter),
            "page_formatter" | "formatter" => Ok(ModelRole::PageFormatter),
            other => Err(DocParseError::UnknownModelRole(other.to_string())),
        }
    }
}

/// Where a variant is placed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Device {
    Cpu,
    /// A specific accelerator ordinal.
    Cuda(u32),
    /// Let the backend decide.
    #[default]
    Auto,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Cuda(n) => write!(f, "cuda:{n}"),
            Device::Auto => f.write_str("auto"),
        }
    }
}

/// Numeric precision of the loaded weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Precision {
    #[default]
    Bf16,
    Fp16,
    Fp32,
    /// 4-bit quantised weights.
    Int4,
}

/// Construction parameters for one `(role, variant)` pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantSpec {
    pub model_id: String,
    pub device: Device,
    pub precision: Precision,
    /// Fine-tuned adapter (path or served name) layered over `model_id`.
    pub adapter: Option<String>,
    /// Generation budget. Output that reaches it is reported as truncated.
    pub max_new_tokens: usize,
    pub temperature: f32,
}

impl VariantSpec {
    pub fn new(model_id: impl Into<String>, max_new_tokens: usize) -> Self {
        Self {
            model_id: model_id.into(),
            device: Device::Auto,
            precision: Precision::Bf16,
            adapter: None,
            max_new_tokens,
            temperature: 0.1,
        }
    }

    pub fn with_device(mut self, device: Device) -> Self {
        self.device = device;
        self
    }

    pub fn with_precision(mut self, precision: Precision) -> Self {
        self.precision = precision;
        self
    }

    pub fn with_adapter(mut self, adapter: impl Into<String>) -> Self {
        self.adapter = Some(adapter.into());
        self
    }

    pub fn with_temperature(mut self, t: f32) -> Self {
        self.temperature = t.clamp(0.0, 2.0);
        self
    }
}

const BASE_VLM: &str = "qwen2.5vl:7b";

/// Lookup table from `(role, variant)` to [`VariantSpec`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VariantTable {
    entries: BTreeMap<ModelRole, BTreeMap<String, VariantSpec>>,
}

impl Default for VariantTable {
    fn default() -> Self {
        Self::builtin()
    }
}

impl VariantTable {
    /// A table with no variants at all.
    pub fn empty() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// `base`, `ft` and `quantized` for both roles.
    ///
    /// The figure interpreter gets a 1024-token budget; page formatting
    /// needs room for a whole page of markdown and gets 4096.
    pub fn builtin() -> Self {
        let mut table = Self::empty();
        for (role, budget, adapter) in [
            (ModelRole::FigureInterpreter, 1024, "docparse-fig2tab-lora"),
            (ModelRole::PageFormatter, 4096, "docparse-formatter-lora"),
        ] {
            table.insert(
                role,
                "base",
                VariantSpec::new(BASE_VLM, budget).with_device(Device::Cuda(0)),
            );
            table.insert(
                role,
                "ft",
                VariantSpec::new(BASE_VLM, budget)
                    .with_device(Device::Cuda(0))
                    .with_adapter(adapter),
            );
            table.insert(
                role,
                "quantized",
                VariantSpec::new(format!("{BASE_VLM}-q4_K_M"), budget)
                    .with_device(Device::Cuda(0))
                    .with_precision(Precision::Int4),
            );
        }
        table
    }

    /// Add or replace a variant. Returns the previous spec, if any.
    pub fn insert(
        &mut self,
        role: ModelRole,
        variant: impl Into<String>,
        spec: VariantSpec,
    ) -> Option<VariantSpec> {
        self.entries
            .entry(role)
            .or_default()
            .insert(variant.into(), spec)
    }

    /// Resolve a `(role, variant)` pair; unknown pairs are a caller error.
    pub fn resolve(&self, role: ModelRole, variant: &str) -> Result<&VariantSpec, DocParseError> {
        self.entries
            .get(&role)
            .and_then(|variants| variants.get(variant))
            .ok_or_else(|| DocParseError::UnknownModelVariant {
                role: role.to_string(),
                variant: variant.to_string(),
            })
    }

    pub fn variants(&self, role: ModelRole) -> Vec<&str> {
        self.entries
            .get(&role)
            .map(|v| v.keys().map(String::as_str).collect())
            .unwrap_or_default()
    }
}
