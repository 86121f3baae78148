//! Sending commands and matching their replies
//!
//! Every correlated command gets a fresh token. The pending entry is recorded
//! before the command is written so a reply can never arrive for a token we
//! do not know about. When the reply arrives the entry is taken out of the
//! map, which makes running its continuation more than once impossible.

use std::{
    collections::HashMap,
    io::{self, Write},
};

use transport::{Command, CommandKind, ExtensionMessage, GdbMi, MessageKind, gdbmi::Kind};

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("cannot send \"{command}\": debugger not accessible")]
    NotAccessible { command: String },

    #[error("writing command to debugger")]
    Write(#[from] io::Error),
}

/// A command waiting for its reply
#[derive(Debug)]
pub(crate) struct PendingCommand<C> {
    pub(crate) token: i64,
    pub(crate) kind: CommandKind,
    pub(crate) text: String,
    pub(crate) continuation: Option<C>,
}

/// Payload of a successful reply
#[derive(Debug, Clone, PartialEq)]
pub enum ResponseData {
    Structured(GdbMi),
    /// Builtin output, or an extension payload that did not parse
    Text(String),
}

impl ResponseData {
    pub fn text(&self) -> String {
        match self {
            ResponseData::Structured(value) if value.kind() == Kind::Const => {
                value.data().to_string()
            }
            ResponseData::Structured(value) => value.to_string(),
            ResponseData::Text(text) => text.clone(),
        }
    }

    pub fn structured(&self) -> Option<&GdbMi> {
        match self {
            ResponseData::Structured(value) => Some(value),
            ResponseData::Text(_) => None,
        }
    }
}

/// Outcome of a correlated command
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    Done(ResponseData),
    Error(String),
}

impl Response {
    /// Interpret an extension reply frame.
    pub fn from_extension(message: &ExtensionMessage) -> Self {
        match message.kind {
            MessageKind::ErrorReply => {
                let msg = GdbMi::parse(&message.payload)
                    .ok()
                    .and_then(|v| v.str_of("msg").map(str::to_string))
                    .unwrap_or_else(|| message.payload.clone());
                Response::Error(msg)
            }
            MessageKind::Reply | MessageKind::Event => match GdbMi::parse(&message.payload) {
                Ok(value) => Response::Done(ResponseData::Structured(value)),
                Err(e) => {
                    tracing::debug!(error = %e, token = message.token, "reply is not structured");
                    Response::Done(ResponseData::Text(message.payload.clone()))
                }
            },
        }
    }

    pub fn from_builtin(text: String) -> Self {
        Response::Done(ResponseData::Text(text))
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Response::Done(_))
    }

    pub fn data(&self) -> Option<&ResponseData> {
        match self {
            Response::Done(data) => Some(data),
            Response::Error(_) => None,
        }
    }
}

pub(crate) struct CommandDispatcher<W, C> {
    writer: W,
    next_token: i64,
    pending: HashMap<i64, PendingCommand<C>>,
}

impl<W, C> CommandDispatcher<W, C>
where
    W: Write,
{
    pub(crate) fn new(writer: W) -> Self {
        Self {
            writer,
            next_token: 1,
            pending: HashMap::new(),
        }
    }

    /// Write `command`, returning its token if it expects a reply.
    ///
    /// Nothing is written or recorded unless `accessible`.
    #[tracing::instrument(skip(self, continuation), fields(command = %command.describe()))]
    pub(crate) fn submit(
        &mut self,
        accessible: bool,
        command: Command,
        continuation: Option<C>,
    ) -> Result<Option<i64>, DispatchError> {
        if !accessible {
            return Err(DispatchError::NotAccessible {
                command: command.describe(),
            });
        }

        if !command.is_correlated() {
            self.write(&command.encode(0))?;
            return Ok(None);
        }

        let token = self.next_token;
        self.next_token += 1;
        self.pending.insert(
            token,
            PendingCommand {
                token,
                kind: command.kind(),
                text: command.describe(),
                continuation,
            },
        );
        if let Err(e) = self.write(&command.encode(token)) {
            self.pending.remove(&token);
            return Err(e);
        }
        tracing::debug!(token, "command sent");
        Ok(Some(token))
    }

    fn write(&mut self, text: &str) -> Result<(), DispatchError> {
        self.writer.write_all(text.as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    /// Retire the command for `token`.
    pub(crate) fn complete(&mut self, token: i64) -> Option<PendingCommand<C>> {
        self.pending.remove(&token)
    }

    /// Drop every pending command without running continuations.
    pub(crate) fn abandon_all(&mut self) -> usize {
        let count = self.pending.len();
        self.pending.clear();
        count
    }

    pub(crate) fn len(&self) -> usize {
        self.pending.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    struct FailingWriter;

    impl Write for FailingWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "closed"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn written(dispatcher: &CommandDispatcher<Vec<u8>, u32>) -> String {
        String::from_utf8_lossy(&dispatcher.writer).into_owned()
    }

    #[test]
    fn tokens_are_unique_among_in_flight_commands() {
        let mut dispatcher = CommandDispatcher::<_, u32>::new(Vec::new());
        let mut seen = HashSet::new();
        for i in 0..50 {
            let token = dispatcher
                .submit(true, Command::builtin(format!("r{i}")), Some(i))
                .unwrap()
                .unwrap();
            assert!(seen.insert(token));
            if i % 3 == 0 {
                dispatcher.complete(token);
            }
        }
        let next = dispatcher
            .submit(true, Command::extension("pid", ""), None)
            .unwrap()
            .unwrap();
        assert!(!seen.contains(&next));
    }

    #[test]
    fn continuation_is_taken_once() {
        let mut dispatcher = CommandDispatcher::new(Vec::new());
        let token = dispatcher
            .submit(true, Command::extension("stack", ""), Some(7u32))
            .unwrap()
            .unwrap();
        let pending = dispatcher.complete(token).unwrap();
        assert_eq!(pending.continuation, Some(7));
        assert_eq!(pending.kind, CommandKind::Extension);
        assert!(dispatcher.complete(token).is_none());
    }

    #[test]
    fn inaccessible_session_sends_nothing() {
        let mut dispatcher = CommandDispatcher::<_, u32>::new(Vec::new());
        let err = dispatcher
            .submit(false, Command::builtin("k"), Some(1))
            .unwrap_err();
        assert!(matches!(err, DispatchError::NotAccessible { .. }));
        assert!(dispatcher.is_empty());
        assert!(written(&dispatcher).is_empty());
    }

    #[test]
    fn plain_commands_are_not_tracked() {
        let mut dispatcher = CommandDispatcher::<_, u32>::new(Vec::new());
        assert_eq!(dispatcher.submit(true, Command::plain("g"), None).unwrap(), None);
        assert!(dispatcher.is_empty());
        assert_eq!(written(&dispatcher), "g\n");
    }

    #[test]
    fn framing_uses_allocated_token() {
        let mut dispatcher = CommandDispatcher::<_, u32>::new(Vec::new());
        dispatcher.submit(true, Command::builtin("k"), None).unwrap();
        dispatcher
            .submit(true, Command::extension("threads", ""), None)
            .unwrap();
        assert_eq!(
            written(&dispatcher),
            ".echo \"<qtc>1<\"\nk\n.echo \"<qtc>1>\"\n!qtcreatorcdbext.threads -t 2\n"
        );
        assert_eq!(dispatcher.len(), 2);
    }

    #[test]
    fn failed_write_is_not_pending() {
        let mut dispatcher = CommandDispatcher::<_, u32>::new(FailingWriter);
        let err = dispatcher
            .submit(true, Command::builtin("k"), Some(1))
            .unwrap_err();
        assert!(matches!(err, DispatchError::Write(_)));
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn abandoning_reports_count() {
        let mut dispatcher = CommandDispatcher::<_, u32>::new(Vec::new());
        for _ in 0..3 {
            dispatcher.submit(true, Command::builtin("k"), Some(0)).unwrap();
        }
        assert_eq!(dispatcher.abandon_all(), 3);
        assert!(dispatcher.is_empty());
    }

    #[test]
    fn replies_are_interpreted() {
        let reply = ExtensionMessage {
            kind: MessageKind::Reply,
            token: 3,
            service: "pid".to_string(),
            payload: "1234".to_string(),
        };
        let response = Response::from_extension(&reply);
        let data = response.data().unwrap();
        assert_eq!(data.text(), "1234");

        let error = ExtensionMessage {
            kind: MessageKind::ErrorReply,
            payload: "msg=\"no such thread\"".to_string(),
            ..reply.clone()
        };
        assert_eq!(
            Response::from_extension(&error),
            Response::Error("no such thread".to_string())
        );

        let unparseable = ExtensionMessage {
            payload: "{oops".to_string(),
            ..reply
        };
        assert_eq!(
            Response::from_extension(&unparseable),
            Response::Done(ResponseData::Text("{oops".to_string()))
        );
    }
}
