pub mod image;
pub mod llm;
pub mod pdf;
pub mod progress;
pub mod prompts;
pub mod setup;
pub mod stages;
pub mod workflow;
