pub mod gemini;
pub mod provider;
