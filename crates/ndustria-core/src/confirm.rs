//! Confirmation gate for destructive operations

use console::style;
use dialoguer::Confirm as Prompt;

/// Decides whether a destructive operation may go ahead
pub trait Confirm: Send {
    /// `files` lists what is about to be deleted
    fn confirm(&self, files: &[String]) -> std::io::Result<bool>;
}

/// Ask on the terminal, defaulting to no
#[derive(Debug, Default, Clone, Copy)]
pub struct Interactive;

impl Confirm for Interactive {
    fn confirm(&self, files: &[String]) -> std::io::Result<bool> {
        eprintln!(
            "\n{} About to delete the following files:",
            style("[Caution]").yellow().bold()
        );
        for file in files {
            eprintln!("  {file}");
        }

        Prompt::new()
            .with_prompt("Is this ok?")
            .default(false)
            .interact()
            .map_err(std::io::Error::other)
    }
}

/// Always go ahead
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&self, _files: &[String]) -> std::io::Result<bool> {
        Ok(true)
    }
}

/// Never go ahead
#[derive(Debug, Default, Clone, Copy)]
pub struct AssumeNo;

impl Confirm for AssumeNo {
    fn confirm(&self, _files: &[String]) -> std::io::Result<bool> {
        Ok(false)
    }
}
