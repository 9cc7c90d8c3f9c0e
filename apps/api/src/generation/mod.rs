// Image generation: the provider contract, the Gemini adapter behind it,
// provider prompt assembly and candidate image storage.
// Only the dispatch loop calls a GenerationClient.

pub mod client;
pub mod gemini;
pub mod handlers;
pub mod images;
pub mod prompts;
