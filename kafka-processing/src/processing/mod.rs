pub mod backoff;
pub mod context;
pub mod coordinator;
pub mod mode;
pub mod pause;
pub mod router;
pub mod runtime;
pub mod seek;
pub mod virtual_partitions;
