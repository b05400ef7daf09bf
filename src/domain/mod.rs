pub mod models;
pub mod opcodes;
pub mod settings;
pub mod telemetry;
