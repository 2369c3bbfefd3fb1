use serde::{Deserialize, Serialize};

/// When committed adds reach stable storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Durability {
    /// Flush after every `add`/`add_many` before it returns.
    #[default]
    Sync,
    /// Commits stay atomic but are flushed only by `flush`, `close` or drop.
    Batched,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Dimensionality for a fresh index. Must match the stored value when reopening.
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default)]
    pub durability: Durability,
}

impl IndexConfig {
    pub fn with_dims(mut self, dims: usize) -> Self {
        self.dims = Some(dims);
        self
    }

    pub fn with_durability(mut self, durability: Durability) -> Self {
        self.durability = durability;
        self
    }
}
