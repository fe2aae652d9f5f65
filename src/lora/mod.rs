//! Low-rank adapters: the adapter layer, the registry the backend consults,
//! and the selector that decides which sublayers get one.

mod layer;
mod registry;
mod selector;

pub use layer::LoraLinear;
pub use registry::{AdapterKey, AdapterRegistry, LORA_A, LORA_B};
pub use selector::{LoraLayerSelector, PlannedAdapter};
