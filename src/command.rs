//! Interactive commands understood by `iproto-cli`.
//!
//! This module defines the [`Command`] enum, which encapsulates one line typed at the
//! prompt, and the parser turning such a line into a command. Arguments are whitespace
//! separated; double quotes keep spaces and force a string. Bare arguments become
//! integers, floats, booleans or `nil` when they look like one, strings otherwise.
//!
//! # Overview
//! - `ping`: round trip to the server.
//! - `eval <expression>`: evaluate an expression on the server.
//! - `call <function> [args...]`: call a stored function.
//! - `select <space> [key...]`: select by primary key; no key lists the whole space.
//! - `insert <space> <fields...>`: insert a tuple.
//! - `delete <space> <key...>`: delete by primary key.
//! - `sql <statement>`: run an SQL statement.
//! - `.spaces`, `.reload`, `.exit`: inspect or refresh the schema cache, quit.
//!
//! # Example
//! ```rust
//! use iproto::Command;
//! use rmpv::Value;
//!
//! let cmd: Command = "call echo 1 \"two words\"".try_into().unwrap();
//! assert_eq!(
//!     cmd,
//!     Command::Call {
//!         function: "echo".into(),
//!         args: vec![Value::from(1u64), Value::from("two words")],
//!     }
//! );
//! ```
use std::io;

use rmpv::Value;
use thiserror::Error;

use crate::{
    client::Client,
    error::ClientError,
    protocol::{IteratorKind, SelectOptions},
};

/// List of possible errors that parsing a command can produce.
#[derive(Debug, Error)]
pub enum CommandError {
    #[error("unrecognized command '{0}'")]
    UnrecognizedCommand(String),

    #[error("invalid '{command}' command, {reason}")]
    InvalidCommandArguments { command: String, reason: String },

    #[error("unterminated quote")]
    UnterminatedQuote,

    #[error("no command provided")]
    Empty,

    #[error("failed to access the terminal: {0}")]
    Io(#[from] io::Error),
}

/// One line of user input.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Leave the prompt.
    Exit,
    /// List the cached spaces.
    Spaces,
    /// Reload the schema cache.
    Reload,
    Ping,
    Eval(String),
    Call { function: String, args: Vec<Value> },
    Select { space: String, key: Vec<Value> },
    Insert { space: String, tuple: Vec<Value> },
    Delete { space: String, key: Vec<Value> },
    Sql(String),
}

enum Token {
    Quoted(String),
    Bare(String),
}

impl Token {
    fn text(&self) -> &str {
        match self {
            Token::Quoted(s) | Token::Bare(s) => s,
        }
    }

    fn into_value(self) -> Value {
        match self {
            Token::Quoted(s) => Value::from(s),
            Token::Bare(s) => parse_value(&s),
        }
    }
}

fn parse_value(token: &str) -> Value {
    match token {
        "nil" | "null" => Value::Nil,
        "true" => Value::Boolean(true),
        "false" => Value::Boolean(false),
        s => {
            if let Ok(n) = s.parse::<u64>() {
                return Value::from(n);
            }
            if let Ok(n) = s.parse::<i64>() {
                return Value::from(n);
            }
            match s.parse::<f64>() {
                Ok(f) if s.contains('.') => Value::from(f),
                _ => Value::from(s),
            }
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>, CommandError> {
    let mut tokens = Vec::new();
    let mut chars = input.chars().peekable();

    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '"' {
            chars.next();
            let mut text = String::new();
            loop {
                match chars.next() {
                    Some('"') => break,
                    Some('\\') => match chars.next() {
                        Some(escaped) => text.push(escaped),
                        None => return Err(CommandError::UnterminatedQuote),
                    },
                    Some(c) => text.push(c),
                    None => return Err(CommandError::UnterminatedQuote),
                }
            }
            tokens.push(Token::Quoted(text));
        } else {
            let mut text = String::new();
            while let Some(&c) = chars.peek() {
                if c.is_whitespace() {
                    break;
                }
                text.push(c);
                chars.next();
            }
            tokens.push(Token::Bare(text));
        }
    }

    Ok(tokens)
}

/// Splits `s` after its first word, returning the trimmed remainder.
fn rest_after_word(s: &str) -> &str {
    s.split_once(char::is_whitespace)
        .map_or("", |(_, rest)| rest.trim())
}

fn space_and_values(
    command: &str,
    args: Vec<Token>,
    need_values: bool,
) -> Result<(String, Vec<Value>), CommandError> {
    let mut args = args.into_iter();
    let space = args
        .next()
        .map(|t| t.text().to_string())
        .ok_or_else(|| CommandError::InvalidCommandArguments {
            command: command.to_string(),
            reason: format!("requires a space name. Example: {command} performer 1"),
        })?;
    let values: Vec<Value> = args.map(Token::into_value).collect();
    if need_values && values.is_empty() {
        return Err(CommandError::InvalidCommandArguments {
            command: command.to_string(),
            reason: format!("requires at least one value. Example: {command} {space} 1"),
        });
    }
    Ok((space, values))
}

impl TryFrom<&str> for Command {
    type Error = CommandError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let line = value.trim();
        let word = line.split_whitespace().next().ok_or(CommandError::Empty)?;

        match word.to_lowercase().as_str() {
            ".exit" | ".quit" => Ok(Command::Exit),
            ".spaces" => Ok(Command::Spaces),
            ".reload" => Ok(Command::Reload),
            "ping" => Ok(Command::Ping),
            "eval" | "sql" => {
                let text = rest_after_word(line);
                if text.is_empty() {
                    return Err(CommandError::InvalidCommandArguments {
                        command: word.to_string(),
                        reason: "requires a statement. Example: eval return 1".to_string(),
                    });
                }
                if word.eq_ignore_ascii_case("eval") {
                    Ok(Command::Eval(text.to_string()))
                } else {
                    Ok(Command::Sql(text.to_string()))
                }
            }
            "call" => {
                let mut args = tokenize(rest_after_word(line))?.into_iter();
                let function = args.next().map(|t| t.text().to_string()).ok_or_else(|| {
                    CommandError::InvalidCommandArguments {
                        command: word.to_string(),
                        reason: "requires a function name. Example: call box.info".to_string(),
                    }
                })?;
                Ok(Command::Call {
                    function,
                    args: args.map(Token::into_value).collect(),
                })
            }
            "select" => {
                let args = tokenize(rest_after_word(line))?;
                let (space, key) = space_and_values(word, args, false)?;
                Ok(Command::Select { space, key })
            }
            "insert" => {
                let args = tokenize(rest_after_word(line))?;
                let (space, tuple) = space_and_values(word, args, true)?;
                Ok(Command::Insert { space, tuple })
            }
            "delete" => {
                let args = tokenize(rest_after_word(line))?;
                let (space, key) = space_and_values(word, args, true)?;
                Ok(Command::Delete { space, key })
            }
            _ => Err(CommandError::UnrecognizedCommand(line.to_string())),
        }
    }
}

fn render_rows(rows: &[Value]) -> String {
    if rows.is_empty() {
        return "(no tuples)".to_string();
    }
    rows.iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

impl Command {
    /// Runs the command against `client`, returning text to print, if any.
    pub fn run(&self, client: &Client) -> Result<Option<String>, ClientError> {
        match self {
            Command::Exit => Ok(None),
            Command::Spaces => {
                let spaces = client.schema().spaces();
                let lines: Vec<String> = spaces
                    .iter()
                    .map(|s| format!("{:>6}  {:<24} {:?}", s.id, s.name, s.engine))
                    .collect();
                Ok(Some(lines.join("\n")))
            }
            Command::Reload => {
                client.reload_schema()?;
                Ok(Some(format!("{} spaces", client.schema().len())))
            }
            Command::Ping => {
                client.ping()?;
                Ok(Some("pong".to_string()))
            }
            Command::Eval(expression) => {
                let result: Vec<Value> = client.eval(expression, &())?;
                Ok(Some(render_rows(&result)))
            }
            Command::Call { function, args } => {
                let result: Vec<Value> = client.call(function, args)?;
                Ok(Some(render_rows(&result)))
            }
            Command::Select { space, key } => {
                let space = client.space(space)?;
                let options = if key.is_empty() {
                    SelectOptions::default().iterator(IteratorKind::All)
                } else {
                    SelectOptions::default()
                };
                let rows: Vec<Value> = space.select(key, options)?;
                Ok(Some(render_rows(&rows)))
            }
            Command::Insert { space, tuple } => {
                let rows: Vec<Value> = client.space(space)?.insert(tuple)?;
                Ok(Some(render_rows(&rows)))
            }
            Command::Delete { space, key } => {
                let rows: Vec<Value> = client.space(space)?.delete(key)?;
                Ok(Some(render_rows(&rows)))
            }
            Command::Sql(sql) => {
                let response = client.execute(sql, &())?;
                let mut out = Vec::new();
                if !response.metadata.is_empty() {
                    let names: Vec<&str> =
                        response.metadata.iter().map(|m| m.name.as_str()).collect();
                    out.push(names.join(" | "));
                    out.push(render_rows(&response.rows));
                }
                if let Some(info) = &response.info {
                    out.push(format!("{} rows affected", info.row_count));
                }
                Ok(Some(out.join("\n")))
            }
        }
    }
}
