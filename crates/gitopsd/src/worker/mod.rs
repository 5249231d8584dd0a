pub mod branch_deleted;
pub mod gitops;
pub mod outcome;
pub mod release_state;

pub use branch_deleted::BranchDeleteWorker;
pub use gitops::GitopsWorker;
pub use release_state::ReleaseStateWorker;
