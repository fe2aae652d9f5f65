//! Mock implementations for testing without a real diffusion model

mod backend;

pub use backend::{mock_config, write_test_image, MockBackend, MOCK_HIDDEN, MOCK_TOKENS};
