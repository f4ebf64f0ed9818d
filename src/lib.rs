pub mod cli;
pub mod client;
pub mod command;
pub mod config;
pub mod connection;
pub mod error;
pub mod protocol;
pub mod schema;

pub use cli::prompt;
pub use client::Client;
pub use command::{Command, CommandError};
pub use config::{ClientConfig, Credentials, Endpoint};
pub use error::ClientError;
pub use protocol::{IteratorKind, SelectOptions, SqlResponse, UpdateOperation};
pub use schema::{AutoKey, Index, Schema, Space};
