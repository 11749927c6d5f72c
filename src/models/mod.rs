pub mod folders;
pub mod job;
pub mod settings;
