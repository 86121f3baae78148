//! Commands written to the debugger's standard input
use std::fmt::Write as _;

use serde::Serialize;
use serde_json::Value;

use crate::error::Error;
use crate::stream::TOKEN_PREFIX;

/// Name of the helper extension library loaded into the debugger.
pub const EXTENSION_NAME: &str = "qtcreatorcdbext";

/// Framing applied to a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    /// Written verbatim, never answered.
    Plain,
    /// Native debugger command bracketed by `.echo` sentinels.
    Builtin,
    /// Function of the extension library answering with a frame.
    Extension,
    /// Dumper script function run through the extension.
    Script,
}

/// A command for the debugger.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Plain(String),
    Builtin(String),
    Extension { function: String, args: String },
    Script { function: String, args: Value },
}

impl Command {
    pub fn plain(text: impl Into<String>) -> Self {
        Self::Plain(text.into())
    }

    pub fn builtin(text: impl Into<String>) -> Self {
        Self::Builtin(text.into())
    }

    pub fn extension(function: impl Into<String>, args: impl Into<String>) -> Self {
        Self::Extension {
            function: function.into(),
            args: args.into(),
        }
    }

    /// A script call; arrays are spread into positional arguments.
    pub fn script(function: impl Into<String>, args: impl Serialize) -> Result<Self, Error> {
        let args = serde_json::to_value(args).map_err(Error::ScriptArguments)?;
        Ok(Self::Script {
            function: function.into(),
            args,
        })
    }

    pub fn kind(&self) -> CommandKind {
        match self {
            Command::Plain(_) => CommandKind::Plain,
            Command::Builtin(_) => CommandKind::Builtin,
            Command::Extension { .. } => CommandKind::Extension,
            Command::Script { .. } => CommandKind::Script,
        }
    }

    /// Whether the command is answered and needs a token.
    pub fn is_correlated(&self) -> bool {
        self.kind() != CommandKind::Plain
    }

    /// Short human readable form used in logs.
    pub fn describe(&self) -> String {
        match self {
            Command::Plain(text) | Command::Builtin(text) => text.clone(),
            Command::Extension { function, args } if args.is_empty() => function.clone(),
            Command::Extension { function, args } => format!("{function} {args}"),
            Command::Script { function, args } => {
                format!("{function}({})", script_arguments(args))
            }
        }
    }

    /// The text written to the debugger, terminated by a newline.
    ///
    /// `token` is ignored for plain commands.
    pub fn encode(&self, token: i64) -> String {
        let mut out = match self {
            Command::Plain(text) => text.clone(),
            Command::Builtin(text) => format!(
                ".echo \"{TOKEN_PREFIX}{token}<\"\n{text}\n.echo \"{TOKEN_PREFIX}{token}>\""
            ),
            Command::Extension { function, args } => {
                let mut s = format!("!{EXTENSION_NAME}.{function} -t {token}");
                if !args.is_empty() {
                    s.push(' ');
                    s.push_str(args);
                }
                s
            }
            Command::Script { function, args } => format!(
                "!{EXTENSION_NAME}.script -t {token} theDumper.{function}({})",
                script_arguments(args)
            ),
        };
        out.push('\n');
        out
    }
}

fn script_arguments(args: &Value) -> String {
    match args {
        Value::Null => String::new(),
        Value::Array(items) => items
            .iter()
            .map(python_literal)
            .collect::<Vec<_>>()
            .join(", "),
        other => python_literal(other),
    }
}

/// Render a JSON value as a Python literal.
pub fn python_literal(value: &Value) -> String {
    let mut out = String::new();
    write_python(&mut out, value);
    out
}

fn write_python(out: &mut String, value: &Value) {
    match value {
        Value::Null => out.push_str("None"),
        Value::Bool(true) => out.push_str("True"),
        Value::Bool(false) => out.push_str("False"),
        Value::Number(n) => {
            let _ = write!(out, "{n}");
        }
        // JSON string escapes are valid Python escapes
        Value::String(s) => out.push_str(&Value::String(s.clone()).to_string()),
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_python(out, item);
            }
            out.push(']');
        }
        Value::Object(map) => {
            out.push('{');
            for (i, (key, item)) in map.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                out.push_str(&Value::String(key.clone()).to_string());
                out.push_str(": ");
                write_python(out, item);
            }
            out.push('}');
        }
    }
}
