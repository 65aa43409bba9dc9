//! External command descriptions
//!
//! A [`Command`] is an argv plus a flag telling whether running it changes
//! anything. Executors use the flag to turn mutations into logged no-ops in
//! dry-run mode.

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use std::fmt;

/// Whether a command changes external state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub enum Effect {
    /// Only reads state; always executed
    ReadOnly,
    /// Creates, destroys, renames or receives; skipped in dry-run
    Mutating,
}

/// A program invocation
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Command {
    /// Program name, resolved through `PATH`
    pub program: String,
    /// Arguments, unquoted
    pub args: Vec<String>,
    /// Whether the command mutates state
    pub effect: Effect,
}

impl Command {
    /// A command that only reads state
    pub fn read_only<P: Into<String>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            effect: Effect::ReadOnly,
        }
    }

    /// A command that changes state
    pub fn mutating<P: Into<String>>(program: P) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            effect: Effect::Mutating,
        }
    }

    /// Append one argument
    pub fn arg<A: Into<String>>(mut self, arg: A) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Append several arguments
    pub fn args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Append an argument only when `condition` holds
    pub fn arg_if<A: Into<String>>(self, condition: bool, arg: A) -> Self {
        if condition {
            self.arg(arg)
        } else {
            self
        }
    }

    /// Whether the command changes state
    pub fn is_mutating(&self) -> bool {
        self.effect == Effect::Mutating
    }

    /// Program followed by its arguments
    pub fn argv(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.program.as_str()).chain(self.args.iter().map(String::as_str))
    }

    /// Render as a single POSIX shell command line
    pub fn to_shell(&self) -> String {
        join(self.argv())
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_shell())
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CommandOutput {
    /// Standard output
    pub stdout: String,
    /// Standard error
    pub stderr: String,
    /// Exit status, `None` when killed by a signal
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// Successful output with the given stdout
    pub fn success<S: Into<String>>(stdout: S) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    /// Failed output with the given code and stderr
    pub fn failure<S: Into<String>>(exit_code: i32, stderr: S) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
        }
    }

    /// Whether the command exited with status zero
    pub fn is_success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Non-empty stdout lines
    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.stdout.lines().map(str::trim_end).filter(|l| !l.is_empty())
    }
}

/// Quote one word for a POSIX shell
pub fn quote(word: &str) -> String {
    let safe = !word.is_empty()
        && word.chars().all(|c| {
            c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '@' | ':' | '=' | ',' | '+' | '%')
        });
    if safe {
        word.to_string()
    } else {
        format!("'{}'", word.replace('\'', r"'\''"))
    }
}

/// Quote and join words into one command line
pub fn join<'a, I: IntoIterator<Item = &'a str>>(words: I) -> String {
    words.into_iter().map(quote).collect::<Vec<_>>().join(" ")
}
