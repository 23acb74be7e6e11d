//! API translation between the `OpenAI` chat format and Gemini's `generateContent`.
//!
//! The core of the proxy: converts requests, responses, and streamed response
//! bytes between the two API formats. Apart from fetching remote images during
//! request translation, nothing here performs I/O.

pub mod gemini_types;
pub mod openai_types;
pub mod request;
pub mod response;
pub mod scanner;
pub mod streaming;
pub mod tool_index;
