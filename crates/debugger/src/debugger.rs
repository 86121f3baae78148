use std::thread::{self, JoinHandle};

use config::Settings;
use crossbeam_channel::{Receiver, Sender, select};
use eyre::WrapErr;
use serde::Serialize;
use server::{CdbServer, Server};
use transport::{Command as CdbCommand, CdbTransport, Incoming, Source, io::spawn_pump};

use crate::{
    breakpoints::LineCorrector,
    commands::{Command, Reload, RunAction},
    internals::Engine,
    state::{Event, StartParameters},
    types::{BreakpointId, BreakpointParameters, VisiblePanels},
};

/// Represents a debugging session
///
/// All protocol state lives on a background thread; this handle sends it
/// requests and hands out the event stream.
pub struct Debugger {
    rx: Receiver<Event>,
    command_tx: Sender<Command>,
    background: Option<JoinHandle<()>>,
}

impl Debugger {
    /// Start `cdb.exe` for `parameters` and drive it.
    ///
    /// Failures to locate or spawn the debugger are returned here; everything
    /// after that is reported through [`Debugger::events`].
    #[tracing::instrument(skip(settings, parameters), fields(mode = ?parameters.mode))]
    pub fn launch(settings: Settings, parameters: StartParameters) -> eyre::Result<Self> {
        let (server, streams) = CdbServer::spawn(
            &settings,
            &parameters.mode,
            &parameters.environment,
            parameters.working_directory.as_deref(),
        )
        .context("starting debugger process")?;

        let (incoming_tx, incoming_rx) = crossbeam_channel::unbounded();
        server.watch_exit(incoming_tx.clone());
        Self::start(
            streams,
            Box::new(server),
            settings,
            parameters,
            incoming_tx,
            incoming_rx,
        )
    }

    /// Drive a debugger reachable through `transport`.
    ///
    /// Used for tests and for debuggers started by other means; `server`
    /// provides interrupting and killing.
    pub fn with_transport<T: CdbTransport>(
        transport: T,
        server: Box<dyn Server>,
        settings: Settings,
        parameters: StartParameters,
    ) -> eyre::Result<Self> {
        let (incoming_tx, incoming_rx) = crossbeam_channel::unbounded();
        Self::start(
            transport,
            server,
            settings,
            parameters,
            incoming_tx,
            incoming_rx,
        )
    }

    fn start<T: CdbTransport>(
        transport: T,
        server: Box<dyn Server>,
        settings: Settings,
        parameters: StartParameters,
        incoming_tx: Sender<Incoming>,
        incoming_rx: Receiver<Incoming>,
    ) -> eyre::Result<Self> {
        let (stdout, stderr, stdin) = transport.split().context("splitting debugger streams")?;
        spawn_pump(Source::Stdout, stdout, incoming_tx.clone());
        spawn_pump(Source::Stderr, stderr, incoming_tx);

        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let (command_tx, command_rx) = crossbeam_channel::unbounded();
        let engine = Engine::new(stdin, server, settings, parameters, event_tx);

        let background = thread::Builder::new()
            .name("cdb-engine".to_string())
            .spawn(move || background_thread_loop(engine, incoming_rx, command_rx))
            .context("spawning engine thread")?;

        Ok(Self {
            rx: event_rx,
            command_tx,
            background: Some(background),
        })
    }

    /// Return a [`crossbeam_channel::Receiver<Event>`] to subscribe to debugging events
    pub fn events(&self) -> Receiver<Event> {
        self.rx.clone()
    }

    /// Add a breakpoint, inserted as soon as the debugger allows
    #[tracing::instrument(skip(self))]
    pub fn add_breakpoint(&self, parameters: BreakpointParameters) -> eyre::Result<BreakpointId> {
        self.request(|response_tx| Command::AddBreakpoint {
            parameters,
            response_tx,
        })
        .context("adding breakpoint")
    }

    #[tracing::instrument(skip(self))]
    pub fn change_breakpoint(
        &self,
        id: BreakpointId,
        parameters: BreakpointParameters,
    ) -> eyre::Result<()> {
        self.request(|response_tx| Command::ChangeBreakpoint {
            id,
            parameters,
            response_tx,
        })
        .context("changing breakpoint")
    }

    #[tracing::instrument(skip(self))]
    pub fn remove_breakpoint(&self, id: BreakpointId) -> eyre::Result<()> {
        self.request(|response_tx| Command::RemoveBreakpoint { id, response_tx })
            .context("removing breakpoint")
    }

    /// Resume execution of the debuggee
    pub fn r#continue(&self) -> eyre::Result<()> {
        self.run(RunAction::Continue)
    }

    /// Step over a statement, or an instruction when operating by instruction
    pub fn step_over(&self) -> eyre::Result<()> {
        self.run(RunAction::StepOver)
    }

    pub fn step_in(&self) -> eyre::Result<()> {
        self.run(RunAction::StepIn)
    }

    pub fn step_out(&self) -> eyre::Result<()> {
        self.run(RunAction::StepOut)
    }

    fn run(&self, action: RunAction) -> eyre::Result<()> {
        self.request(|response_tx| Command::Run {
            action,
            response_tx,
        })
        .with_context(|| format!("sending {action:?}"))
    }

    /// Break into the running debuggee
    pub fn interrupt(&self) -> eyre::Result<()> {
        self.request(|response_tx| Command::Interrupt { response_tx })
            .context("interrupting debuggee")
    }

    /// Run a native debugger command, returning its output
    pub fn execute(&self, text: impl Into<String>) -> eyre::Result<String> {
        self.execute_command(CdbCommand::builtin(text))
    }

    /// Call a function of the extension library, returning its reply
    pub fn execute_extension(
        &self,
        function: impl Into<String>,
        args: impl Into<String>,
    ) -> eyre::Result<String> {
        self.execute_command(CdbCommand::extension(function, args))
    }

    /// Call a dumper script function; arrays are spread into positional
    /// arguments
    pub fn execute_script(
        &self,
        function: impl Into<String>,
        args: impl Serialize,
    ) -> eyre::Result<String> {
        let command =
            CdbCommand::script(function, args).context("serializing script arguments")?;
        self.execute_command(command)
    }

    fn execute_command(&self, command: CdbCommand) -> eyre::Result<String> {
        let description = command.describe();
        self.request(|response_tx| Command::Execute {
            command,
            response_tx,
        })
        .with_context(|| format!("executing {description:?}"))
    }

    /// Write a line to the debugger as is; any output shows up in the log
    pub fn execute_raw(&self, text: impl Into<String>) -> eyre::Result<()> {
        self.request(|response_tx| Command::ExecuteRaw {
            text: text.into(),
            response_tx,
        })
    }

    pub fn set_operate_by_instruction(&self, on: bool) -> eyre::Result<()> {
        self.send(Command::SetOperateByInstruction(on))
    }

    /// Registers and modules are only fetched on stops while visible
    pub fn set_visible_panels(&self, panels: VisiblePanels) -> eyre::Result<()> {
        self.send(Command::SetVisiblePanels(panels))
    }

    pub fn set_line_corrector(&self, corrector: Option<Box<dyn LineCorrector>>) -> eyre::Result<()> {
        self.send(Command::SetLineCorrector(corrector))
    }

    pub fn reload_registers(&self) -> eyre::Result<()> {
        self.reload(Reload::Registers)
    }

    pub fn reload_modules(&self) -> eyre::Result<()> {
        self.reload(Reload::Modules)
    }

    pub fn reload_threads(&self) -> eyre::Result<()> {
        self.reload(Reload::Threads)
    }

    pub fn reload_stack(&self) -> eyre::Result<()> {
        self.reload(Reload::Stack)
    }

    fn reload(&self, what: Reload) -> eyre::Result<()> {
        self.request(|response_tx| Command::Reload { what, response_tx })
            .with_context(|| format!("reloading {what:?}"))
    }

    /// Make `id` the current thread; a fresh stack follows as an event
    pub fn select_thread(&self, id: u32) -> eyre::Result<()> {
        self.request(|response_tx| Command::SelectThread { id, response_tx })
            .with_context(|| format!("selecting thread {id}"))
    }

    /// End the session. [`Event::Finished`] follows.
    pub fn shutdown(&self) -> eyre::Result<()> {
        self.send(Command::Shutdown)
    }

    /// Pause the calling thread until an event matching `pred` arrives
    pub fn wait_for_event<F>(&self, pred: F) -> eyre::Result<Event>
    where
        F: Fn(&Event) -> bool,
    {
        loop {
            let event = self
                .rx
                .recv()
                .map_err(|_| eyre::eyre!("event channel closed"))?;
            if pred(&event) {
                tracing::debug!(?event, "received expected event");
                return Ok(event);
            }
            tracing::trace!(?event, "non-matching event");
        }
    }

    fn send(&self, command: Command) -> eyre::Result<()> {
        self.command_tx
            .send(command)
            .map_err(|_| eyre::eyre!("command channel closed"))
    }

    /// Send a command and wait for its result
    fn request<T>(
        &self,
        build: impl FnOnce(oneshot::Sender<eyre::Result<T>>) -> Command,
    ) -> eyre::Result<T> {
        let (response_tx, response_rx) = oneshot::channel();
        self.send(build(response_tx))?;
        response_rx
            .recv()
            .map_err(|_| eyre::eyre!("response channel closed"))?
    }
}

impl Drop for Debugger {
    fn drop(&mut self) {
        tracing::debug!("dropping debugger");
        if let Err(e) = self.shutdown() {
            tracing::debug!(error = %e, "engine already stopped");
        }
        // the engine finishes once the debugger has gone
        if let Some(background) = self.background.take() {
            if background.is_finished() {
                let _ = background.join();
            }
        }
    }
}

fn background_thread_loop<W: std::io::Write>(
    mut engine: Engine<W>,
    incoming_rx: Receiver<Incoming>,
    command_rx: Receiver<Command>,
) {
    let mut command_rx = command_rx;
    while !engine.is_finished() {
        select! {
            recv(incoming_rx) -> msg => match msg {
                Ok(incoming) => engine.handle_incoming(incoming),
                Err(_) => {
                    tracing::debug!("all debugger streams gone");
                    engine.process_finished(None);
                }
            },
            recv(command_rx) -> msg => match msg {
                Ok(command) => engine.handle_command(command),
                Err(_) => {
                    tracing::debug!("debugger handle dropped, shutting down");
                    engine.shutdown();
                    command_rx = crossbeam_channel::never();
                }
            },
        }
    }
    tracing::debug!("background thread terminated");
}
