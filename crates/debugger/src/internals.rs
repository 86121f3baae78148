//! The engine: all protocol state of one session, driven from one thread
use std::io::Write;

use config::Settings;
use crossbeam_channel::Sender;
use server::{Server, StartMode};
use transport::{
    Command as CdbCommand, ExtensionMessage, GdbMi, Incoming, MessageKind, Source, StreamEvent,
    StreamParser, UNSOLICITED_TOKEN, command::EXTENSION_NAME, gdbmi::Kind,
};

use crate::{
    breakpoints::{BreakpointTracker, LineCorrector, SyncCommand, SyncPlan},
    commands::{Command, Reload, RunAction},
    dispatcher::{CommandDispatcher, Response, ResponseData},
    exceptions::{EXCEPTION_CPP, WinException},
    source_map::SourceMapper,
    stack::{self, StackOutcome, Wow64State},
    state::{Event, Lifecycle, SessionState, StartParameters},
    stop::{self, StopActions, StopContext},
    types::{BreakpointId, LogChannel, TaskSeverity, VisiblePanels},
};

/// Extension status reported with `session_inaccessible` once the debuggee is gone.
const STATUS_NO_DEBUGGEE: u64 = 7;

/// What to do with the reply of a command
pub(crate) enum Continuation {
    BreakInsert(BreakpointId),
    ListBreakpoints,
    CheckWow64 { stack: GdbMi, step_into: bool },
    Wow64Header { stack: GdbMi, step_into: bool },
    SwitchWow64,
    Threads,
    Stack,
    Modules,
    Registers,
    ThreadSelected,
    Condition { id: BreakpointId, stop: GdbMi },
    Pid,
    /// Output requested through the handle
    Output(oneshot::Sender<eyre::Result<String>>),
}

/// Stops the engine causes itself and resolves without reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SpecialStop {
    SynchronizeBreakpoints,
}

pub(crate) struct Engine<W: Write> {
    dispatcher: CommandDispatcher<W, Continuation>,
    parser: StreamParser,
    state: SessionState,
    publisher: Sender<Event>,
    server: Box<dyn Server>,
    mode: StartMode,
    settings: Settings,
    post_connect_commands: Vec<String>,

    breakpoints: BreakpointTracker,
    mapper: SourceMapper,
    corrector: Option<Box<dyn LineCorrector>>,
    wow64: Wow64State,

    has_debuggee: bool,
    initial_idle_handled: bool,
    setup_done: bool,
    core_stop_reason: Option<GdbMi>,
    special_stop: Option<SpecialStop>,
    interrupt_in_flight: bool,
    inferior_pid: Option<u32>,
    source_step_into: bool,
    operate_by_instruction: bool,
    applied_operate_by_instruction: Option<bool>,
    panels: VisiblePanels,
    /// Code and address of the last exception reported as a task
    last_exception_task: Option<(u32, u64)>,
    /// Incomplete last line of the debugger's standard error
    stderr_pending: Vec<u8>,
    quit_sent: bool,
    finished: bool,
}

impl<W: Write> Engine<W> {
    pub(crate) fn new(
        input: W,
        server: Box<dyn Server>,
        settings: Settings,
        parameters: StartParameters,
        publisher: Sender<Event>,
    ) -> Self {
        let mapper = SourceMapper::new(
            &settings.source_path_mappings,
            &parameters.source_path_mappings,
        );
        Self {
            dispatcher: CommandDispatcher::new(input),
            parser: StreamParser::new(),
            state: SessionState::default(),
            publisher,
            server,
            mode: parameters.mode,
            settings,
            post_connect_commands: parameters.post_connect_commands,
            breakpoints: BreakpointTracker::new(),
            mapper,
            corrector: None,
            wow64: Wow64State::Unknown,
            has_debuggee: true,
            initial_idle_handled: false,
            setup_done: false,
            core_stop_reason: None,
            special_stop: None,
            interrupt_in_flight: false,
            inferior_pid: None,
            source_step_into: false,
            operate_by_instruction: false,
            applied_operate_by_instruction: None,
            panels: VisiblePanels::default(),
            last_exception_task: None,
            stderr_pending: Vec::new(),
            quit_sent: false,
            finished: false,
        }
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished
    }

    #[cfg(test)]
    pub(crate) fn lifecycle(&self) -> Lifecycle {
        self.state.lifecycle
    }

    #[cfg(test)]
    pub(crate) fn pending_commands(&self) -> usize {
        self.dispatcher.len()
    }

    fn emit(&self, event: Event) {
        let _ = self.publisher.send(event);
    }

    fn log(&self, channel: LogChannel, text: impl Into<String>) {
        self.emit(Event::Log {
            channel,
            text: text.into(),
        });
    }

    fn set_lifecycle(&mut self, lifecycle: Lifecycle) {
        if self.state.lifecycle == lifecycle {
            return;
        }
        tracing::debug!(from = ?self.state.lifecycle, to = ?lifecycle, "state change");
        self.state.lifecycle = lifecycle;
        self.emit(Event::StateChanged(lifecycle));
    }

    /// Send a command, publishing it on the input log. Failures are logged
    /// and reported with `None`.
    fn send(&mut self, command: CdbCommand, continuation: Option<Continuation>) -> Option<i64> {
        let description = command.describe();
        match self
            .dispatcher
            .submit(self.state.accessible, command, continuation)
        {
            Ok(token) => {
                self.log(LogChannel::Input, description);
                token
            }
            Err(e) => {
                tracing::warn!(error = %e, "command not sent");
                self.log(LogChannel::Error, e.to_string());
                None
            }
        }
    }

    fn send_plain(&mut self, text: impl Into<String>) -> bool {
        let command = CdbCommand::plain(text);
        let description = command.describe();
        match self.dispatcher.submit(self.state.accessible, command, None) {
            Ok(_) => {
                self.log(LogChannel::Input, description);
                true
            }
            Err(e) => {
                tracing::warn!(error = %e, "command not sent");
                self.log(LogChannel::Error, e.to_string());
                false
            }
        }
    }

    // input from the debugger process

    pub(crate) fn handle_incoming(&mut self, incoming: Incoming) {
        match incoming {
            Incoming::Data(Source::Stdout, bytes) => {
                for event in self.parser.feed(&bytes) {
                    self.handle_stream_event(event);
                }
            }
            Incoming::Data(Source::Stderr, bytes) => {
                self.stderr_pending.extend_from_slice(&bytes);
                while let Some(end) = self.stderr_pending.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = self.stderr_pending.drain(..=end).collect();
                    let text = String::from_utf8_lossy(&line);
                    self.log(LogChannel::Error, text.trim_end_matches(['\r', '\n']));
                }
            }
            Incoming::Closed(Source::Stderr) => {
                tracing::debug!("debugger stderr closed");
                self.flush_stderr();
            }
            Incoming::Closed(Source::Stdout) => self.process_finished(None),
            Incoming::Exited(code) => self.process_finished(code),
        }
    }

    fn flush_stderr(&mut self) {
        if self.stderr_pending.is_empty() {
            return;
        }
        let rest = std::mem::take(&mut self.stderr_pending);
        let text = String::from_utf8_lossy(&rest);
        self.log(LogChannel::Error, text.trim_end_matches('\r'));
    }

    fn handle_stream_event(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Extension(message) => self.handle_extension_message(message),
            StreamEvent::BuiltinResponse { token, text } => {
                self.complete(token, Response::from_builtin(text))
            }
            StreamEvent::VersionBanner { version } => {
                tracing::info!(%version, "debugger version");
                self.log(LogChannel::Output, format!("Using CDB {version}"));
            }
            StreamEvent::ModuleLoad { path, .. } => {
                self.log(LogChannel::Output, format!("ModLoad: {path}"));
            }
            StreamEvent::ExtensionRefused { line } => {
                self.log(LogChannel::Error, line.clone());
                if !self.initial_idle_handled {
                    self.emit(Event::SetupFailed(line));
                    self.kill();
                }
            }
            StreamEvent::Output(line) => self.log(LogChannel::Output, line),
            StreamEvent::Fault(fault) => {
                tracing::error!(%fault, "protocol fault");
                self.log(LogChannel::Error, fault.to_string());
                if let Some(token) = fault.discarded_capture() {
                    self.complete(token, Response::Error(format!("output lost: {fault}")));
                }
            }
        }
    }

    fn handle_extension_message(&mut self, message: ExtensionMessage) {
        if message.kind == MessageKind::Event {
            self.handle_notification(&message.service, &message.payload);
            return;
        }
        if message.token == UNSOLICITED_TOKEN {
            // typed by the user without a token
            self.log(LogChannel::Output, message.payload);
            return;
        }
        let response = Response::from_extension(&message);
        self.complete(message.token, response);
    }

    fn complete(&mut self, token: i64, response: Response) {
        let Some(pending) = self.dispatcher.complete(token) else {
            tracing::warn!(token, "reply for unknown token");
            self.log(
                LogChannel::Warning,
                format!("Reply for unknown command token {token}"),
            );
            return;
        };
        tracing::debug!(token, kind = ?pending.kind, command = %pending.text, "command completed");
        match pending.continuation {
            Some(continuation) => self.run_continuation(continuation, response),
            None => match response {
                Response::Done(data) => {
                    let text = data.text();
                    if !text.is_empty() {
                        self.log(LogChannel::Output, text);
                    }
                }
                Response::Error(msg) => {
                    self.log(LogChannel::Error, format!("{}: {msg}", pending.text))
                }
            },
        }
    }

    #[tracing::instrument(skip(self, payload))]
    fn handle_notification(&mut self, service: &str, payload: &str) {
        match service {
            "debuggee_output" => match decode_debuggee_output(payload) {
                Some(text) => self.log(LogChannel::AppOutput, text),
                None => tracing::warn!(%payload, "undecodable debuggee output"),
            },
            "event" => {
                self.log(LogChannel::Output, payload);
                if payload == "Process exited" {
                    self.inferior_exited();
                }
            }
            "session_accessible" => {
                self.state.accessible = true;
                self.session_accessible();
            }
            "session_inaccessible" => {
                self.state.accessible = false;
                let status = payload.trim().parse::<u64>().unwrap_or(0);
                self.session_inaccessible(status);
            }
            "session_idle" => self.session_idle(payload),
            "exception" => self.report_exception(payload),
            other => {
                tracing::debug!(service = other, "unhandled notification");
                self.log(LogChannel::Output, format!("{other}: {payload}"));
            }
        }
    }

    fn session_accessible(&mut self) {
        if !self.has_debuggee {
            return;
        }
        if self.state.lifecycle == Lifecycle::ShutdownRequested {
            self.shutdown();
        }
    }

    fn session_inaccessible(&mut self, status: u64) {
        if !self.has_debuggee {
            return;
        }
        match self.state.lifecycle {
            Lifecycle::RunRequested if status != STATUS_NO_DEBUGGEE => {
                self.set_lifecycle(Lifecycle::Running)
            }
            Lifecycle::RunRequested | Lifecycle::Running | Lifecycle::Stopped
                if status == STATUS_NO_DEBUGGEE =>
            {
                self.inferior_exited()
            }
            _ => {}
        }
    }

    fn session_idle(&mut self, payload: &str) {
        self.interrupt_in_flight = false;
        if !self.initial_idle_handled {
            self.initial_idle_handled = true;
            if self.mode.is_dump() {
                self.core_stop_reason = Some(GdbMi::parse(payload).unwrap_or_default());
            }
            self.initial_sequence();
            return;
        }
        if !self.has_debuggee {
            return;
        }

        let stop = GdbMi::parse(payload).unwrap_or_else(|e| {
            tracing::error!(error = %e, %payload, "unparseable stop reason");
            GdbMi::default()
        });
        if self.state.lifecycle.is_shutting_down() {
            self.special_stop = None;
            self.process_stop(&stop, false);
            return;
        }

        self.sync_operate_by_instruction();
        // requests that arrived while the debuggee was running
        self.sync_breakpoints();
        let special_stop = self.special_stop.take();
        if special_stop == Some(SpecialStop::SynchronizeBreakpoints)
            && self.state.lifecycle != Lifecycle::StopRequested
        {
            tracing::debug!("breakpoints synchronized in special stop, resuming");
            self.continue_inferior();
            return;
        }
        self.process_stop(&stop, false);
    }

    #[tracing::instrument(skip(self))]
    fn initial_sequence(&mut self) {
        let commands: Vec<String> = self
            .post_connect_commands
            .iter()
            .chain(&self.settings.additional_commands)
            .cloned()
            .collect();
        for command in commands {
            self.send_plain(command);
        }
        // do not search the public symbol table
        self.send_plain(".symopt+0x8000");
        self.send_plain("sxn 0x4000001f");
        self.send_plain("sxn ibp");
        self.send_plain(".asm source_line");
        self.send_plain(format!(
            "!{EXTENSION_NAME}.setparameter maxStringLength={}",
            self.settings.max_string_length
        ));
        for event in self.settings.break_events.clone() {
            self.send_plain(format!("sxe {event}"));
        }
        if self
            .send(CdbCommand::extension("pid", ""), Some(Continuation::Pid))
            .is_none()
        {
            self.emit(Event::SetupFailed("cannot query the process id".to_string()));
            self.kill();
        }
    }

    fn handle_pid(&mut self, response: Response) {
        match response {
            Response::Done(data) => {
                self.inferior_pid = pid_of(&data);
                tracing::debug!(pid = ?self.inferior_pid, "inferior pid");
                self.setup_ok();
            }
            // there is no process behind a dump
            Response::Error(_) if self.mode.is_dump() => self.setup_ok(),
            Response::Error(msg) => {
                let message = format!("Failed to determine inferior pid: {msg}");
                self.log(LogChannel::Error, message.clone());
                self.emit(Event::SetupFailed(message));
                self.shutdown();
            }
        }
    }

    fn setup_ok(&mut self) {
        self.setup_done = true;
        self.emit(Event::SetupOk);
        self.set_lifecycle(Lifecycle::RunRequested);
        self.sync_breakpoints();
        match self.core_stop_reason.take() {
            Some(stop) => self.process_stop(&stop, false),
            None => self.continue_inferior(),
        }
    }

    fn report_exception(&mut self, payload: &str) {
        let record = GdbMi::parse(payload).unwrap_or_default();
        let exception = WinException::from_gdbmi(&record);
        let message = exception.to_string();
        self.log(LogChannel::Status, message.clone());
        if exception.code == EXCEPTION_CPP {
            self.log(LogChannel::AppOutput, format!("{message}\n"));
        }
        if !exception.is_debugger_exception() {
            self.add_exception_task(&exception, message);
        }
    }

    fn add_exception_task(&mut self, exception: &WinException, message: String) {
        let key = (exception.code, exception.address);
        if self.last_exception_task == Some(key) {
            return;
        }
        self.last_exception_task = Some(key);
        let severity = if exception.is_fatal() {
            TaskSeverity::Error
        } else {
            TaskSeverity::Warning
        };
        self.emit(Event::Task { severity, message });
    }

    // stops

    #[tracing::instrument(skip(self, stop))]
    fn process_stop(&mut self, stop: &GdbMi, condition_evaluated: bool) {
        let analysis = stop::examine(
            stop,
            &StopContext {
                lifecycle: self.state.lifecycle,
                breakpoints: &self.breakpoints,
                condition_evaluated,
            },
        );
        let actions = analysis.actions;
        tracing::debug!(?actions, message = %analysis.message, "stop examined");

        if let Some(text) = &analysis.app_message {
            self.log(LogChannel::AppOutput, format!("{text}\n"));
        }
        if actions.contains(StopActions::REPORT_LOG) {
            self.log(LogChannel::Output, analysis.message.clone());
        }
        if actions.contains(StopActions::REPORT_STATUS) {
            self.log(LogChannel::Status, analysis.message.clone());
        }
        if actions.contains(StopActions::REPORT_PARSE_ERROR) {
            self.log(LogChannel::Error, analysis.message.clone());
        }
        if actions.contains(StopActions::SHUTDOWN_IN_PROGRESS) {
            tracing::debug!("shutdown in progress, stop not processed");
            return;
        }

        if let Some(check) = analysis.evaluate {
            self.send(
                CdbCommand::extension("expression", check.expression),
                Some(Continuation::Condition {
                    id: check.id,
                    stop: stop.clone(),
                }),
            );
            return;
        }

        if actions.contains(StopActions::IGNORE_CONTINUE) {
            self.continue_inferior();
            return;
        }

        if actions.contains(StopActions::NOTIFY_STOP) {
            self.set_lifecycle(Lifecycle::Stopped);
            self.emit(Event::Stopped {
                message: analysis.message.clone(),
            });

            let source_step_into = std::mem::take(&mut self.source_step_into);
            let artificial = actions.contains(StopActions::IN_ARTIFICIAL_THREAD);
            if artificial {
                self.log(LogChannel::Output, "Switching to main thread...");
                self.send_plain("~0 s");
                self.reload(Reload::Stack);
            } else {
                let embedded = stop.get("stack");
                if embedded.is_valid() {
                    if let Some(action) = self.handle_stack(embedded, source_step_into) {
                        self.step(action);
                        return;
                    }
                } else if let Some(error) = stop.str_of("stackerror") {
                    self.log(LogChannel::Error, error);
                }
            }

            let threads = stop.get("threads");
            if threads.is_valid() {
                match stack::parse_threads(threads, &mut self.mapper) {
                    Some(mut snapshot) => {
                        if artificial {
                            snapshot.current = Some(0);
                        }
                        self.emit(Event::Threads(snapshot));
                    }
                    None => self.log(LogChannel::Error, "Unable to parse thread list."),
                }
            } else if let Some(error) = stop.str_of("threaderror") {
                self.log(LogChannel::Error, error);
            }

            if self.breakpoints.has_pending() {
                self.list_breakpoints();
            }
            if self.panels.registers {
                self.reload(Reload::Registers);
            }
            if self.panels.modules {
                self.reload(Reload::Modules);
            }
        }

        if let (Some(exception), Some((_, message))) = (&analysis.exception, &analysis.task) {
            self.add_exception_task(exception, message.clone());
        }
        if let Some(text) = analysis.exception_box {
            self.emit(Event::ExceptionBox(text));
        }
    }

    /// Publish a stack, or return the step that must happen instead.
    fn handle_stack(&mut self, data: &GdbMi, source_step_into: bool) -> Option<RunAction> {
        match stack::parse_stack(data, source_step_into, self.wow64, &mut self.mapper) {
            StackOutcome::Frames(snapshot) => {
                self.emit(Event::Stack(snapshot));
                None
            }
            StackOutcome::CheckWow64 => {
                self.log(LogChannel::Output, "Checking for wow64 subsystem...");
                self.send(
                    CdbCommand::builtin("lm m wow64"),
                    Some(Continuation::CheckWow64 {
                        stack: data.clone(),
                        step_into: source_step_into,
                    }),
                );
                None
            }
            StackOutcome::StepInto => {
                self.log(
                    LogChannel::Output,
                    "Step into: Call instruction hit, performing additional step...",
                );
                Some(RunAction::StepIn)
            }
            StackOutcome::StepOut => {
                self.log(
                    LogChannel::Output,
                    "Step into: Hit frame with no source, step out...",
                );
                Some(RunAction::StepOut)
            }
        }
    }

    /// Publish a stack from a reply, stepping on when it asks for that.
    fn publish_stack(&mut self, data: &GdbMi, source_step_into: bool) {
        if let Some(action) = self.handle_stack(data, source_step_into) {
            self.step(action);
        }
    }

    fn run_continuation(&mut self, continuation: Continuation, response: Response) {
        match continuation {
            Continuation::Pid => self.handle_pid(response),
            Continuation::Output(tx) => {
                let result = match response {
                    Response::Done(data) => Ok(data.text()),
                    Response::Error(msg) => Err(eyre::eyre!(msg)),
                };
                let _ = tx.send(result);
            }
            Continuation::Condition { id, stop } => {
                if self.state.lifecycle.is_shutting_down() {
                    tracing::debug!(breakpoint = %id, "shutdown in progress, condition ignored");
                    return;
                }
                let value = match &response {
                    Response::Done(data) => condition_value(data),
                    Response::Error(msg) => {
                        self.log(LogChannel::Error, msg.clone());
                        0
                    }
                };
                if value != 0 {
                    self.log(
                        LogChannel::Output,
                        format!(
                            "Value {value} obtained from evaluating the condition of breakpoint {id}, stopping."
                        ),
                    );
                    self.process_stop(&stop, true);
                } else {
                    self.log(
                        LogChannel::Output,
                        format!(
                            "Value 0 obtained from evaluating the condition of breakpoint {id}, continuing."
                        ),
                    );
                    self.continue_inferior();
                }
            }
            other => match response {
                Response::Done(data) => self.run_data_continuation(other, data),
                Response::Error(msg) => {
                    tracing::warn!(%msg, "command failed");
                    self.log(LogChannel::Error, msg);
                }
            },
        }
    }

    fn run_data_continuation(&mut self, continuation: Continuation, data: ResponseData) {
        let structured = || match &data {
            ResponseData::Structured(value) => Some(value.clone()),
            ResponseData::Text(text) => {
                tracing::error!(%text, "expected a structured reply");
                None
            }
        };
        match continuation {
            Continuation::BreakInsert(id) => {
                let text = data.text();
                for line in text.lines().filter(|l| !l.is_empty()) {
                    self.log(LogChannel::Output, line);
                }
                if !self.breakpoints.apply_insert_reply(id, &text).is_empty() {
                    self.sync_breakpoints();
                }
            }
            Continuation::ListBreakpoints => {
                let Some(listing) = structured() else {
                    return;
                };
                for (id, response) in self.breakpoints.apply_listing(&listing, &self.mapper) {
                    self.emit(Event::Breakpoint { id, response });
                }
            }
            Continuation::CheckWow64 { stack, step_into } => {
                if stack::wow64_module_listed(&data.text()) {
                    self.send(
                        CdbCommand::builtin("k"),
                        Some(Continuation::Wow64Header { stack, step_into }),
                    );
                } else {
                    self.wow64 = Wow64State::NotPresent;
                    self.publish_stack(&stack, step_into);
                }
            }
            Continuation::Wow64Header { stack, step_into } => {
                self.wow64 = stack::wow64_header(&data.text());
                if self.wow64 == Wow64State::Stack64Bit {
                    self.send(
                        CdbCommand::builtin("!wow64exts.sw"),
                        Some(Continuation::SwitchWow64),
                    );
                } else {
                    self.publish_stack(&stack, step_into);
                }
            }
            Continuation::SwitchWow64 => {
                self.wow64 = stack::wow64_switch_reply(&data.text());
                self.reload(Reload::Threads);
                self.reload(Reload::Stack);
            }
            Continuation::Threads => {
                let parsed = structured().and_then(|v| stack::parse_threads(&v, &mut self.mapper));
                match parsed {
                    Some(snapshot) => self.emit(Event::Threads(snapshot)),
                    None => self.log(LogChannel::Error, "Unable to parse thread list."),
                }
            }
            Continuation::Stack => {
                if let Some(value) = structured() {
                    self.publish_stack(&value, false);
                }
            }
            Continuation::Modules => match structured().and_then(|v| stack::parse_modules(&v)) {
                Some(modules) => self.emit(Event::Modules(modules)),
                None => self.log(LogChannel::Error, "Unable to parse module list."),
            },
            Continuation::Registers => {
                match structured().and_then(|v| stack::parse_registers(&v)) {
                    Some(registers) => self.emit(Event::Registers(registers)),
                    None => self.log(LogChannel::Error, "Unable to parse register list."),
                }
            }
            Continuation::ThreadSelected => self.reload(Reload::Stack),
            Continuation::Pid | Continuation::Output(_) | Continuation::Condition { .. } => {
                tracing::error!("continuation dispatched to the wrong handler");
            }
        }
    }

    // breakpoints

    fn sync_breakpoints(&mut self) {
        if !self.setup_done {
            return;
        }
        let corrector = if self.settings.breakpoint_correction {
            self.corrector.as_deref()
        } else {
            None
        };
        let plan = self
            .breakpoints
            .synchronize(self.state.accessible, &self.mapper, corrector);
        match plan {
            SyncPlan::Idle => {}
            SyncPlan::Interrupt => {
                if self.special_stop.is_none() && self.state.lifecycle == Lifecycle::Running {
                    tracing::debug!("interrupting to synchronize breakpoints");
                    self.special_stop = Some(SpecialStop::SynchronizeBreakpoints);
                    if let Err(e) = self.request_interrupt() {
                        self.special_stop = None;
                        self.log(LogChannel::Error, format!("{e:#}"));
                    }
                }
            }
            SyncPlan::Commands(batch) => {
                for id in batch.removed {
                    self.emit(Event::BreakpointRemoved(id));
                }
                for id in batch.pending {
                    self.emit(Event::Breakpoint { id, response: None });
                }
                for command in batch.commands {
                    match command {
                        SyncCommand::Plain(text) => {
                            self.send_plain(text);
                        }
                        SyncCommand::Insert { id, text } => {
                            self.send(
                                CdbCommand::builtin(text),
                                Some(Continuation::BreakInsert(id)),
                            );
                        }
                        SyncCommand::List => self.list_breakpoints(),
                    }
                }
            }
        }
    }

    fn list_breakpoints(&mut self) {
        self.send(
            CdbCommand::extension("breakpoints", "-v"),
            Some(Continuation::ListBreakpoints),
        );
    }

    // execution control

    fn sync_operate_by_instruction(&mut self) {
        let wanted = self.operate_by_instruction;
        if self.applied_operate_by_instruction == Some(wanted) {
            return;
        }
        let (trace, source) = if wanted {
            ("l-t", "l-s")
        } else {
            ("l+t", "l+s")
        };
        if self.send_plain(trace) && self.send_plain(source) {
            self.applied_operate_by_instruction = Some(wanted);
        }
    }

    fn continue_inferior(&mut self) {
        if self.send_plain("g") {
            self.set_lifecycle(Lifecycle::RunRequested);
        }
    }

    /// Resume the debuggee; `false` when nothing could be sent.
    fn step(&mut self, action: RunAction) -> bool {
        self.sync_operate_by_instruction();
        let text = match action {
            RunAction::Continue => "g",
            RunAction::StepOver => "p",
            RunAction::StepIn => {
                if !self.operate_by_instruction {
                    self.source_step_into = true;
                }
                "t"
            }
            RunAction::StepOut => "gu",
        };
        if self.send_plain(text) {
            self.set_lifecycle(Lifecycle::RunRequested);
            true
        } else {
            self.source_step_into = false;
            false
        }
    }

    fn request_interrupt(&mut self) -> eyre::Result<()> {
        if self.interrupt_in_flight {
            tracing::debug!("interrupt already in flight");
            return Ok(());
        }
        let pid = self
            .inferior_pid
            .ok_or_else(|| eyre::eyre!("no process to interrupt"))?;
        self.log(LogChannel::Status, format!("Interrupting process {pid}..."));
        self.interrupt_in_flight = true;
        if let Err(e) = self.server.interrupt(pid) {
            self.interrupt_in_flight = false;
            return Err(e);
        }
        Ok(())
    }

    fn reload(&mut self, what: Reload) {
        let (command, continuation) = match what {
            Reload::Registers => (
                CdbCommand::extension("registers", ""),
                Continuation::Registers,
            ),
            Reload::Modules => (CdbCommand::extension("modules", ""), Continuation::Modules),
            Reload::Threads => (CdbCommand::extension("threads", ""), Continuation::Threads),
            Reload::Stack => (
                CdbCommand::extension("stack", "unlimited"),
                Continuation::Stack,
            ),
        };
        self.send(command, Some(continuation));
    }

    // session end

    fn inferior_exited(&mut self) {
        if !self.has_debuggee {
            return;
        }
        self.has_debuggee = false;
        self.log(LogChannel::Status, "Inferior exited.");
        self.emit(Event::InferiorExited);
        self.shutdown();
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn shutdown(&mut self) {
        if self.finished {
            return;
        }
        self.set_lifecycle(Lifecycle::ShutdownRequested);
        if self.quit_sent {
            return;
        }
        if self.state.accessible && self.dispatcher.is_empty() {
            self.quit_sent = true;
            if self.mode.is_attach() {
                self.send_plain(".detach");
            }
            if self.mode.is_remote() {
                // the server side needs more force
                self.send_plain(format!("!{EXTENSION_NAME}.shutdownex"));
                self.send_plain("qq");
            } else {
                self.send_plain("q");
            }
        } else {
            if !self.dispatcher.is_empty() {
                self.log(
                    LogChannel::Warning,
                    "Commands still pending, killing the debugger.",
                );
            }
            self.kill();
        }
    }

    fn kill(&mut self) {
        match self.server.kill() {
            Ok(()) => self.process_finished(None),
            Err(e) => {
                tracing::warn!(error = %e, "could not kill debugger");
                self.log(LogChannel::Error, format!("{e:#}"));
            }
        }
    }

    #[tracing::instrument(skip(self))]
    pub(crate) fn process_finished(&mut self, code: Option<i32>) {
        if self.finished {
            return;
        }
        self.finished = true;
        self.state.accessible = false;
        self.flush_stderr();

        let abandoned = self.dispatcher.abandon_all();
        if abandoned > 0 {
            tracing::warn!(count = abandoned, "abandoning pending commands");
            self.log(
                LogChannel::Warning,
                format!("{abandoned} pending commands abandoned at debugger exit."),
            );
        }

        if self.state.lifecycle == Lifecycle::SetupRequested && !self.setup_done {
            self.emit(Event::SetupFailed(
                "The debugger exited during setup.".to_string(),
            ));
        } else if self.state.lifecycle != Lifecycle::ShutdownRequested {
            let code = code.map_or_else(|| "unknown".to_string(), |c| c.to_string());
            self.log(
                LogChannel::Error,
                format!("The debugger exited unexpectedly (exit code {code})."),
            );
        }

        self.set_lifecycle(Lifecycle::Finished);
        self.emit(Event::Finished);
    }

    // requests from the handle

    pub(crate) fn handle_command(&mut self, command: Command) {
        tracing::debug!(?command, "handling command");
        match command {
            Command::Execute {
                command,
                response_tx,
            } => {
                if !self.state.accessible {
                    let _ = response_tx.send(Err(eyre::eyre!(
                        "cannot execute \"{}\": debugger not accessible",
                        command.describe()
                    )));
                    return;
                }
                // on failure the reply channel is dropped along with the continuation
                self.send(command, Some(Continuation::Output(response_tx)));
            }
            Command::ExecuteRaw { text, response_tx } => {
                let result = if self.send_plain(text) {
                    Ok(())
                } else {
                    Err(eyre::eyre!("debugger not accessible"))
                };
                let _ = response_tx.send(result);
            }
            Command::AddBreakpoint {
                parameters,
                response_tx,
            } => {
                let id = self.breakpoints.request_insert(parameters);
                self.sync_breakpoints();
                let _ = response_tx.send(Ok(id));
            }
            Command::ChangeBreakpoint {
                id,
                parameters,
                response_tx,
            } => {
                let result = if self.breakpoints.request_change(id, parameters) {
                    self.sync_breakpoints();
                    Ok(())
                } else {
                    Err(eyre::eyre!("unknown breakpoint {id}"))
                };
                let _ = response_tx.send(result);
            }
            Command::RemoveBreakpoint { id, response_tx } => {
                let result = if self.breakpoints.request_remove(id) {
                    if self.breakpoints.state(id).is_none() {
                        self.emit(Event::BreakpointRemoved(id));
                    }
                    self.sync_breakpoints();
                    Ok(())
                } else {
                    Err(eyre::eyre!("unknown breakpoint {id}"))
                };
                let _ = response_tx.send(result);
            }
            Command::Run {
                action,
                response_tx,
            } => {
                let result = if self.mode.is_dump() {
                    Err(eyre::eyre!("a crash dump cannot be resumed"))
                } else if self.step(action) {
                    Ok(())
                } else {
                    Err(eyre::eyre!("debugger not accessible"))
                };
                let _ = response_tx.send(result);
            }
            Command::Interrupt { response_tx } => {
                let result = if self.state.lifecycle == Lifecycle::Running {
                    self.set_lifecycle(Lifecycle::StopRequested);
                    let result = self.request_interrupt();
                    if result.is_err() {
                        self.set_lifecycle(Lifecycle::Running);
                    }
                    result
                } else {
                    Err(eyre::eyre!(
                        "cannot interrupt in state {:?}",
                        self.state.lifecycle
                    ))
                };
                let _ = response_tx.send(result);
            }
            Command::SetOperateByInstruction(on) => {
                self.operate_by_instruction = on;
                if self.state.accessible && self.setup_done {
                    self.sync_operate_by_instruction();
                }
            }
            Command::SetVisiblePanels(panels) => {
                let newly_visible = VisiblePanels {
                    registers: panels.registers && !self.panels.registers,
                    modules: panels.modules && !self.panels.modules,
                };
                self.panels = panels;
                if self.state.lifecycle == Lifecycle::Stopped && self.state.accessible {
                    if newly_visible.registers {
                        self.reload(Reload::Registers);
                    }
                    if newly_visible.modules {
                        self.reload(Reload::Modules);
                    }
                }
            }
            Command::SetLineCorrector(corrector) => self.corrector = corrector,
            Command::Reload { what, response_tx } => {
                let result = if self.state.accessible {
                    self.reload(what);
                    Ok(())
                } else {
                    Err(eyre::eyre!("debugger not accessible"))
                };
                let _ = response_tx.send(result);
            }
            Command::SelectThread { id, response_tx } => {
                let result = self
                    .send(
                        CdbCommand::builtin(format!("~{id} s")),
                        Some(Continuation::ThreadSelected),
                    )
                    .map(|_| ())
                    .ok_or_else(|| eyre::eyre!("debugger not accessible"));
                let _ = response_tx.send(result);
            }
            Command::Shutdown => self.shutdown(),
        }
    }
}

/// Debuggee output arrives hex encoded as UTF-16LE.
fn decode_debuggee_output(payload: &str) -> Option<String> {
    let bytes = hex::decode(payload.trim()).ok()?;
    let units: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|pair| u16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    Some(String::from_utf16_lossy(&units))
}

fn pid_of(data: &ResponseData) -> Option<u32> {
    let text = data.text();
    transport::gdbmi::parse_int(&text).and_then(|pid| u32::try_from(pid).ok())
}

fn condition_value(data: &ResponseData) -> i64 {
    match data {
        ResponseData::Structured(value) if value.kind() == Kind::Const => {
            value.to_int().unwrap_or(0)
        }
        other => transport::gdbmi::parse_int(&other.text()).unwrap_or(0),
    }
}
