pub mod handlers;
pub mod registry;

pub use registry::GridRegistry;
