pub mod memory;
pub mod pg;
pub mod store;
pub mod upsert;
