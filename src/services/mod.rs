pub mod blob_store;
pub mod clock;
pub mod sweeper;
