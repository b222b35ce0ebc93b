pub mod tensorzero;

pub use tensorzero::{ContentBlock, LlmClient, LlmConfig, LlmContent, LlmMessage};
