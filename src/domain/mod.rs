pub mod dialogue;
pub mod task;
