use std::io::{self, BufRead, Write};

use anyhow::Result;

/// Yes/no confirmation before destructive operations.
pub trait Confirm {
    fn confirm(&mut self, question: &str) -> Result<bool>;
}

/// Asks on stderr and reads one line from stdin. Anything but `y`/`yes`
/// (including end of input) is a no.
#[derive(Debug, Default)]
pub struct StdinConfirm;

impl Confirm for StdinConfirm {
    fn confirm(&mut self, question: &str) -> Result<bool> {
        let mut stderr = io::stderr();
        write!(stderr, "{} [y/N] ", question)?;
        stderr.flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(is_yes(&line))
    }
}

/// `--force`: every question is answered yes.
#[derive(Debug, Default)]
pub struct AssumeYes;

impl Confirm for AssumeYes {
    fn confirm(&mut self, _question: &str) -> Result<bool> {
        Ok(true)
    }
}

pub fn is_yes(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
