//! CLI commands

mod cache;
mod pack;

pub use cache::{
    CleanCommand, InfoCommand, ListCommand, LogCommand, RemoveCommand, StatusCommand,
    WhereCommand,
};
pub use pack::{PackCommand, UnpackCommand};
