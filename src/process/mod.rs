// Process module - Child launch, reaping and the run supervisor

pub mod spawner;
mod supervisor;

pub use spawner::ChildSupervisor;
pub use supervisor::{compose_exit_code, Supervisor};
