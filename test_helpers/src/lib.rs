mod fake_command_runner;
mod fake_storage_engine;

pub use fake_command_runner::FakeCommandRunner;
pub use fake_storage_engine::FakeStorageEngine;
