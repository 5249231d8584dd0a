pub mod cache;
pub mod ops;

pub use cache::{RepoCache, WriteInstance};
