// src/utils/mod.rs
pub mod http;
pub mod shell;

pub use http::HttpClient;
pub use shell::{CommandOutput, CommandRunner, SystemCommandRunner};
