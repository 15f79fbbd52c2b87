pub mod combine;
pub mod common;
pub mod consensus;
pub mod error;
pub mod factorize;
pub mod input;
pub mod k_selection;
pub mod nmf;
pub mod planner;
pub mod prepare;
pub mod run_context;
pub mod simulate;

pub use error::CnmfError;
pub use run_context::RunContext;
