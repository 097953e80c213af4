//! Line command protocol engine.
//!
//! An [`Engine`] reads text lines from one input, dispatches each through its
//! [`CommandTable`] and writes any result to its explicit output sink. The same
//! engine type runs in both directions: user → process (console) and
//! process → process (sockets). When the output is a socket, a handler's return
//! value *is* the wire text sent onward.
//!
//! ## Line grammar
//!
//! `[!]name arg1 arg2 ... argN`: the marker is optional, arguments are split
//! on whitespace, and the last declared parameter greedily takes the rest of
//! the line so free text may contain spaces.
//!
//! ## Registration
//!
//! Handlers expose commands by implementing [`CommandHandler`] and adding one
//! entry per command to the table: name, declared parameter names (which fix
//! the arity), and an async closure. Arguments are coerced inside the closure
//! through [`Args::text`] and [`Args::parse`], so coercion failures surface as
//! diagnostics like any other dispatch error.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;

use log::{debug, warn};
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tokio::sync::watch;

use crate::error::CommandError;
use crate::protocol::{timestamp, MARKER};
use crate::sink::LineSink;

/// Outcome of one command: text to write to the engine's output, if any.
pub type CommandResult = Result<Option<String>, CommandError>;

pub type CommandFuture = Pin<Box<dyn Future<Output = CommandResult> + Send>>;

type HandlerFn = dyn Fn(Args) -> CommandFuture + Send + Sync;

/// Successful command producing `text`.
pub fn reply(text: impl Into<String>) -> CommandResult {
    Ok(Some(text.into()))
}

/// Successful command with nothing to write.
pub fn no_reply() -> CommandResult {
    Ok(None)
}

/// An object exposing commands to an engine.
pub trait CommandHandler: Send + Sync + 'static {
    fn register(self: Arc<Self>, table: &mut CommandTable) -> Result<(), CommandError>;
}

/// A line split into marker, command name and the unparsed remainder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedLine<'a> {
    pub marked: bool,
    pub name: &'a str,
    pub rest: &'a str,
}

impl<'a> ParsedLine<'a> {
    /// Returns None for blank lines.
    pub fn parse(line: &'a str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }

        let (marked, body) = match line.strip_prefix(MARKER) {
            Some(body) => (true, body),
            None => (false, line),
        };
        let (name, rest) = body
            .split_once(char::is_whitespace)
            .unwrap_or((body, ""));

        Some(Self {
            marked,
            name,
            rest: rest.trim_start(),
        })
    }
}

/// Splits `rest` into exactly `arity` arguments, the last one greedy.
/// Returns None when there are too few tokens, or when a zero-parameter
/// command is given any.
pub fn tokenize(rest: &str, arity: usize) -> Option<Vec<String>> {
    let mut remaining = rest.trim_start();

    if arity == 0 {
        return remaining.is_empty().then(Vec::new);
    }

    let mut values = Vec::with_capacity(arity);
    for index in 0..arity {
        if remaining.is_empty() {
            return None;
        }

        if index + 1 == arity {
            values.push(remaining.trim_end().to_string());
            break;
        }

        let (token, tail) = remaining
            .split_once(char::is_whitespace)
            .unwrap_or((remaining, ""));
        values.push(token.to_string());
        remaining = tail.trim_start();
    }

    Some(values)
}

/// Positional arguments of one invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Args {
    command: String,
    values: Vec<String>,
}

impl Args {
    pub fn new(command: impl Into<String>, values: Vec<String>) -> Self {
        Self {
            command: command.into(),
            values,
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn text(&self, index: usize) -> Result<&str, CommandError> {
        self.values
            .get(index)
            .map(String::as_str)
            .ok_or_else(|| CommandError::WrongArity {
                command: self.command.clone(),
                expected: index + 1,
                got: self.values.len(),
            })
    }

    /// Coerces argument `index` to `T`.
    pub fn parse<T>(&self, index: usize) -> Result<T, CommandError>
    where
        T: FromStr,
        T::Err: fmt::Display,
    {
        let value = self.text(index)?;
        value
            .parse()
            .map_err(|e: T::Err| CommandError::InvalidArgument {
                command: self.command.clone(),
                index,
                value: value.to_string(),
                reason: e.to_string(),
            })
    }
}

struct Command {
    params: &'static [&'static str],
    handler: Arc<HandlerFn>,
}

/// Command name → bound handler. Names are unique; arity is fixed per name.
#[derive(Default)]
pub struct CommandTable {
    commands: HashMap<String, Command>,
}

impl fmt::Debug for CommandTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandTable")
            .field("commands", &self.names())
            .finish()
    }
}

impl CommandTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add<F, Fut>(
        &mut self,
        name: &str,
        params: &'static [&'static str],
        handler: F,
    ) -> Result<(), CommandError>
    where
        F: Fn(Args) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = CommandResult> + Send + 'static,
    {
        if self.commands.contains_key(name) {
            return Err(CommandError::DuplicateCommand(name.to_string()));
        }

        let handler: Arc<HandlerFn> =
            Arc::new(move |args: Args| -> CommandFuture { Box::pin(handler(args)) });
        self.commands
            .insert(name.to_string(), Command { params, handler });
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.commands.contains_key(name)
    }

    pub fn arity(&self, name: &str) -> Option<usize> {
        self.commands.get(name).map(|command| command.params.len())
    }

    /// `name <param> <param>` for a registered command.
    pub fn usage(&self, name: &str) -> Option<String> {
        self.commands.get(name).map(|command| {
            command
                .params
                .iter()
                .fold(format!("{MARKER}{name}"), |usage, param| {
                    format!("{usage} <{param}>")
                })
        })
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.commands.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Parses and runs one line. Blank lines yield `Ok(None)`.
    pub async fn invoke(&self, line: &str) -> CommandResult {
        match ParsedLine::parse(line) {
            Some(parsed) => self.invoke_parsed(parsed).await,
            None => Ok(None),
        }
    }

    pub async fn invoke_parsed(&self, parsed: ParsedLine<'_>) -> CommandResult {
        let command = self
            .commands
            .get(parsed.name)
            .ok_or_else(|| CommandError::UnknownCommand(parsed.name.to_string()))?;

        let arity = command.params.len();
        let values = tokenize(parsed.rest, arity).ok_or_else(|| CommandError::WrongArity {
            command: parsed.name.to_string(),
            expected: arity,
            got: parsed.rest.split_whitespace().count(),
        })?;

        let handler = Arc::clone(&command.handler);
        handler(Args::new(parsed.name, values)).await
    }
}

/// Why a serve loop stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    EndOfStream,
    Closed,
}

/// Cloneable switch that stops a serve loop from outside.
#[derive(Debug, Clone)]
pub struct CloseHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl Default for CloseHandle {
    fn default() -> Self {
        Self::new()
    }
}

impl CloseHandle {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Returns true if this call performed the close.
    pub fn close(&self) -> bool {
        !self.tx.send_replace(true)
    }

    pub fn is_closed(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Resolves once the handle is closed.
    pub async fn closed(&self) {
        let mut rx = self.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Command dispatcher bound to one output sink.
///
/// A *named* engine behaves like an interactive shell: it echoes each input
/// line with a timestamp and its name, and formats results the same way. An
/// unnamed engine writes results verbatim, which is what a wire relay needs.
pub struct Engine {
    name: Option<String>,
    table: CommandTable,
    output: LineSink,
    passthrough: bool,
    close: CloseHandle,
}

impl fmt::Debug for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("name", &self.name)
            .field("table", &self.table)
            .field("passthrough", &self.passthrough)
            .field("closed", &self.close.is_closed())
            .finish()
    }
}

impl Engine {
    pub fn new(output: LineSink) -> Self {
        Self {
            name: None,
            table: CommandTable::new(),
            output,
            passthrough: false,
            close: CloseHandle::new(),
        }
    }

    /// Turns the engine into a shell that echoes input under `name`.
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Unmarked lines are written to the output unchanged instead of being
    /// dispatched. Marked lines are still commands.
    pub fn with_passthrough(mut self) -> Self {
        self.passthrough = true;
        self
    }

    /// Shares an existing close switch, so whoever owns it can stop `serve`.
    pub fn with_close_handle(mut self, close: CloseHandle) -> Self {
        self.close = close;
        self
    }

    pub fn close_handle(&self) -> CloseHandle {
        self.close.clone()
    }

    pub fn output(&self) -> &LineSink {
        &self.output
    }

    pub fn commands(&self) -> &CommandTable {
        &self.table
    }

    pub fn register<H>(&mut self, handler: Arc<H>) -> Result<(), CommandError>
    where
        H: CommandHandler,
    {
        handler.register(&mut self.table)
    }

    /// Dispatches one line and returns the text to write, turning every
    /// failure into a diagnostic instead of an error.
    pub async fn dispatch(&self, line: &str) -> Option<String> {
        let parsed = ParsedLine::parse(line)?;

        if self.passthrough && !parsed.marked {
            return Some(line.trim().to_string());
        }

        match self.table.invoke_parsed(parsed).await {
            Ok(result) => result,
            Err(e) => {
                debug!("Command {:?} failed: {}", parsed.name, e);
                Some(self.diagnostic(parsed.name, &e))
            }
        }
    }

    fn diagnostic(&self, name: &str, error: &CommandError) -> String {
        match (error, self.table.usage(name)) {
            (CommandError::WrongArity { .. }, Some(usage)) => {
                format!("{error} (usage: {usage})")
            }
            _ => error.to_string(),
        }
    }

    /// Reads lines until end of stream or until the engine is closed.
    ///
    /// A close while blocked on read yields `ServeExit::Closed`, and so does a
    /// read error that happens after a close. Output write failures are logged
    /// and do not stop the loop.
    pub async fn serve<R>(&self, input: R) -> io::Result<ServeExit>
    where
        R: AsyncBufRead + Unpin,
    {
        let mut lines = input.lines();
        let mut closed = self.close.subscribe();

        loop {
            if *closed.borrow_and_update() {
                return Ok(ServeExit::Closed);
            }

            let next = tokio::select! {
                next = lines.next_line() => next,
                _ = closed.changed() => return Ok(ServeExit::Closed),
            };

            let line = match next {
                Ok(Some(line)) => line,
                Ok(None) => return Ok(ServeExit::EndOfStream),
                Err(_) if self.close.is_closed() => return Ok(ServeExit::Closed),
                Err(e) => return Err(e),
            };

            if let Some(name) = &self.name {
                self.emit(&format!("{}\t\t{}> {}", timestamp(), name, line.trim_end()))
                    .await;
            }

            if let Some(result) = self.dispatch(&line).await {
                let rendered = self.render(&result);
                self.emit(&rendered).await;
            }
        }
    }

    /// Stops `serve`. Idempotent.
    pub fn close(&self) {
        if self.close.close() {
            debug!("Engine {:?} closed", self.name);
        }
    }

    async fn emit(&self, text: &str) {
        if let Err(e) = self.output.write_line(text).await {
            warn!("Failed to write engine output: {}", e);
        }
    }

    fn render(&self, text: &str) -> String {
        let Some(name) = &self.name else {
            return text.to_string();
        };

        let now = timestamp();
        let body = text.trim_end_matches(&['\r', '\n'][..]);
        if !body.contains('\n') {
            return format!("{now}\t\t{name}: {body}");
        }

        let mut rendered = format!("{now}\t\t{name}:");
        for line in body.split(&['\r', '\n'][..]).filter(|line| !line.is_empty()) {
            rendered.push('\n');
            rendered.push_str(&format!("{now}\t\t{line}"));
        }
        rendered
    }
}
