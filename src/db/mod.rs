pub mod models;
pub mod pg;
pub mod store;

#[cfg(test)]
pub mod mem;
