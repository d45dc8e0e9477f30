pub mod batcher;
pub mod timeout_flush;
