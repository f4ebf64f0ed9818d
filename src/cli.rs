//! CLI utilities for iproto.
//!
//! The utilities present in this module can be used to build an interactive shell on top
//! of a [`Client`](crate::Client).
use std::io::{BufRead, Write};

use crate::command::{Command, CommandError};

/// Prompts the user for one command.
///
/// End of input counts as [`Command::Exit`].
pub fn prompt<R, W>(mut reader: R, mut writer: W) -> Result<Command, CommandError>
where
    R: BufRead,
    W: Write,
{
    let mut s = String::default();
    write!(&mut writer, "> ")?;
    writer.flush()?;

    if reader.read_line(&mut s)? == 0 {
        return Ok(Command::Exit);
    }
    Command::try_from(s.as_str())
}
