pub mod delete;
pub mod plan;
pub mod reconcile;
pub mod state;
pub mod status;
