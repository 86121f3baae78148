use std::{
    collections::VecDeque,
    io::IsTerminal,
    sync::{Arc, Mutex},
    thread,
    time::Duration,
};

use debugger::{
    BreakpointId, BreakpointParameters, Debugger, Event, Lifecycle, LogChannel, Settings,
    StartParameters,
};
use server::Server;
use tracing_subscriber::EnvFilter;
use transport::{InMemoryPeer, InMemoryTransport};

#[ctor::ctor]
fn init() {
    let in_ci = std::env::var("CI")
        .map(|val| val == "true")
        .unwrap_or(false);

    if std::io::stderr().is_terminal() || in_ci {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .json()
            .try_init();
    }

    let _ = color_eyre::install();
}

const TIMEOUT: Duration = Duration::from_secs(10);

/// Records interrupts instead of signalling a process
#[derive(Clone, Default)]
struct FakeServer {
    interrupts: Arc<Mutex<Vec<u32>>>,
}

impl Server for FakeServer {
    fn interrupt(&mut self, inferior_pid: u32) -> eyre::Result<()> {
        self.interrupts
            .lock()
            .map_err(|_| eyre::eyre!("poisoned"))?
            .push(inferior_pid);
        Ok(())
    }

    fn kill(&mut self) -> eyre::Result<()> {
        Ok(())
    }
}

/// Plays the part of `cdb.exe` on the other end of the transport
struct ScriptedCdb {
    peer: InMemoryPeer,
    input: VecDeque<String>,
}

impl ScriptedCdb {
    /// Read commands sent by the engine up to and including the first line
    /// matching `pred`
    fn read_until<F>(&mut self, pred: F) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        let mut lines = Vec::new();
        loop {
            while let Some(line) = self.input.pop_front() {
                let done = pred(&line);
                lines.push(line);
                if done {
                    return lines;
                }
            }
            let chunk = self
                .peer
                .recv_input(TIMEOUT)
                .unwrap_or_else(|| panic!("engine stopped writing, got {lines:?}"));
            self.input.extend(chunk.lines().map(str::to_string));
        }
    }

    fn send(&mut self, line: &str) {
        self.peer.send_line(line).unwrap();
    }

    fn notify(&mut self, service: &str, payload: &str) {
        self.send(&format!("<qtcreatorcdbext>|E|-1|0|{service}|{payload}"));
    }

    fn reply(&mut self, token: i64, service: &str, payload: &str) {
        self.send(&format!("<qtcreatorcdbext>|R|{token}|0|{service}|{payload}"));
    }

    /// Answer the builtin command `command` with `output`
    fn answer_builtin(&mut self, command: &str, output: &[&str]) {
        let lines = self.read_until(|l| l == command);
        let token = builtin_token(&lines);
        self.send(&format!("<qtc>{token}<"));
        for line in output {
            self.send(line);
        }
        self.send(&format!("<qtc>{token}>"));
    }

    /// End of file on the debugger's standard output
    fn close_stdout(&mut self) {
        let (_, detached) = InMemoryTransport::pair();
        drop(std::mem::replace(&mut self.peer.stdout, detached.stdout));
    }
}

/// Test harness that wraps a debugger and manages event buffering
struct EngineTestHarness {
    debugger: Debugger,
    cdb: ScriptedCdb,
    server: FakeServer,
    event_rx: crossbeam_channel::Receiver<Event>,
    event_buffer: VecDeque<Event>,
}

impl EngineTestHarness {
    fn new() -> Self {
        let (transport, peer) = InMemoryTransport::pair();
        let server = FakeServer::default();
        let debugger = Debugger::with_transport(
            transport,
            Box::new(server.clone()),
            Settings::default(),
            StartParameters::launch(r"C:\app\app.exe", Vec::new()),
        )
        .unwrap();
        let event_rx = debugger.events();
        Self {
            debugger,
            cdb: ScriptedCdb {
                peer,
                input: VecDeque::new(),
            },
            server,
            event_rx,
            event_buffer: VecDeque::new(),
        }
    }

    /// Wait for an event matching the predicate, buffering non-matching events
    #[tracing::instrument(skip(self, pred))]
    fn wait_for_event<F>(&mut self, message: &str, pred: F) -> Event
    where
        F: Fn(&Event) -> bool,
    {
        tracing::debug!("waiting for {message} event");
        if let Some(pos) = self.event_buffer.iter().position(&pred) {
            return self.event_buffer.remove(pos).unwrap();
        }
        for _ in 0..200 {
            let evt = match self.event_rx.recv_timeout(TIMEOUT) {
                Ok(evt) => evt,
                Err(e) => panic!("no {message} event: {e}"),
            };
            if pred(&evt) {
                tracing::debug!(event = ?evt, "received expected event");
                return evt;
            }
            tracing::trace!(event = ?evt, "non-matching event, buffering for later");
            self.event_buffer.push_back(evt);
        }
        panic!("did not receive {message} event after 200 events");
    }

    fn has_event<F>(&self, pred: F) -> bool
    where
        F: Fn(&Event) -> bool,
    {
        self.event_buffer.iter().any(pred)
    }

    /// Bring the session up to the running debuggee
    fn start(&mut self) -> Vec<String> {
        self.cdb.notify("session_accessible", "0");
        self.cdb.notify("session_idle", "");
        let lines = self.cdb.read_until(|l| l.starts_with("!qtcreatorcdbext.pid"));
        assert!(lines.contains(&".symopt+0x8000".to_string()));
        self.cdb
            .reply(extension_token(lines.last().unwrap()), "pid", "4242");
        self.wait_for_event("setup", |e| matches!(e, Event::SetupOk));
        self.cdb.read_until(|l| l == "g")
    }
}

fn extension_token(line: &str) -> i64 {
    line.split_whitespace().nth(2).unwrap().parse().unwrap()
}

/// Token of the last `.echo "<qtc>N<"` line
fn builtin_token(lines: &[String]) -> i64 {
    let line = lines
        .iter()
        .rev()
        .find(|l| l.starts_with(".echo \"<qtc>") && l.ends_with("<\""))
        .unwrap();
    line.trim_start_matches(".echo \"<qtc>")
        .trim_end_matches("<\"")
        .parse()
        .unwrap()
}

#[test]
fn stops_at_breakpoint() {
    let mut harness = EngineTestHarness::new();
    let id = harness
        .debugger
        .add_breakpoint(BreakpointParameters::function("main"))
        .unwrap();
    assert_eq!(id, BreakpointId::new(1));

    let lines = harness.start();
    assert!(lines.contains(&"bu100100 main".to_string()));
    let insert = builtin_token(&lines);
    let list = lines
        .iter()
        .find(|l| l.starts_with("!qtcreatorcdbext.breakpoints"))
        .map(|l| extension_token(l))
        .unwrap();

    harness.cdb.send(&format!("<qtc>{insert}<"));
    harness.cdb.send(&format!("<qtc>{insert}>"));
    harness.cdb.reply(
        list,
        "breakpoints",
        r#"[{id="100100",enabled="true",deferred="false",module="app",expression="app!main",address="0x401000"}]"#,
    );
    let resolved = harness.wait_for_event("resolved breakpoint", |e| {
        matches!(e, Event::Breakpoint { response: Some(_), .. })
    });
    let Event::Breakpoint {
        id: resolved_id,
        response: Some(response),
    } = resolved
    else {
        unreachable!()
    };
    assert_eq!(resolved_id, id);
    assert_eq!(response.address, Some(0x401000));

    harness.cdb.notify("session_inaccessible", "0");
    harness.wait_for_event("running", |e| {
        matches!(e, Event::StateChanged(Lifecycle::Running))
    });

    harness.cdb.notify("session_accessible", "0");
    harness.cdb.notify(
        "session_idle",
        r#"{reason="breakpoint",breakpointId="100100",threadId="0",stack=[{function="app!main",address="0x401000"},{function="app!start",address="0x402000"}]}"#,
    );
    harness.wait_for_event("stop", |e| {
        e == &Event::Stopped {
            message: "Stopped at breakpoint 1 in thread 0.".to_string(),
        }
    });

    // the first stack waits for the wow64 check
    harness.cdb.answer_builtin("lm m wow64", &["start             end                 module name"]);
    let stack = harness.wait_for_event("stack", |e| matches!(e, Event::Stack(_)));
    let Event::Stack(stack) = stack else {
        unreachable!()
    };
    assert_eq!(stack.frames.len(), 2);
    assert_eq!(stack.frames[0].function, "app!main");
    assert_eq!(stack.current, 0);
}

#[test]
fn execute_returns_builtin_output() {
    let mut harness = EngineTestHarness::new();
    harness.start();

    let output = thread::scope(|s| {
        let debugger = &harness.debugger;
        let request = s.spawn(move || debugger.execute("r eax"));
        harness.cdb.answer_builtin("r eax", &["0:000> eax=00000001"]);
        request.join().unwrap()
    });
    assert_eq!(output.unwrap(), "eax=00000001");
}

#[test]
fn debuggee_output_is_decoded() {
    let mut harness = EngineTestHarness::new();
    harness.start();

    // "hello\n" as UTF-16LE
    harness.cdb.notify("debuggee_output", "680065006c006c006f000a00");
    harness.wait_for_event("debuggee output", |e| {
        e == &Event::Log {
            channel: LogChannel::AppOutput,
            text: "hello\n".to_string(),
        }
    });
}

#[test]
fn interrupt_stops_in_main_thread() {
    let mut harness = EngineTestHarness::new();
    harness.start();
    harness.cdb.notify("session_inaccessible", "0");
    harness.wait_for_event("running", |e| {
        matches!(e, Event::StateChanged(Lifecycle::Running))
    });

    harness.debugger.interrupt().unwrap();
    assert_eq!(*harness.server.interrupts.lock().unwrap(), vec![4242]);
    // a second request while the first is in flight is refused
    assert!(harness.debugger.interrupt().is_err());

    harness.cdb.notify("session_accessible", "0");
    harness.cdb.notify(
        "session_idle",
        r#"{reason="exception",exceptionCode="0x80000003",exceptionFunction="ntdll!DbgBreakPoint",threadId="3"}"#,
    );
    harness.wait_for_event("interrupt stop", |e| {
        e == &Event::Stopped {
            message: "Interrupted.".to_string(),
        }
    });
    let lines = harness.cdb.read_until(|l| l.starts_with("!qtcreatorcdbext.stack"));
    assert!(lines.contains(&"~0 s".to_string()));
}

#[test]
fn inferior_exit_ends_session() {
    let mut harness = EngineTestHarness::new();
    harness.start();
    harness.cdb.notify("session_inaccessible", "0");
    harness.cdb.notify("session_accessible", "0");
    harness.cdb.notify("event", "Process exited");
    harness.wait_for_event("inferior exit", |e| matches!(e, Event::InferiorExited));

    // accessible and nothing pending: asked to quit
    harness.cdb.read_until(|l| l == "q");
    harness.cdb.close_stdout();
    harness.wait_for_event("finished", |e| matches!(e, Event::Finished));
    assert!(!harness.has_event(|e| matches!(
        e,
        Event::Log {
            channel: LogChannel::Error,
            ..
        }
    )));
}

#[test]
fn debugger_exit_abandons_pending_commands() {
    let mut harness = EngineTestHarness::new();
    harness.start();

    let result = thread::scope(|s| {
        let debugger = &harness.debugger;
        let request = s.spawn(move || debugger.execute("k"));
        harness.cdb.read_until(|l| l == "k");
        harness.cdb.close_stdout();
        request.join().unwrap()
    });
    assert!(result.is_err());

    harness.wait_for_event("finished", |e| matches!(e, Event::Finished));
    assert!(harness.has_event(|e| matches!(
        e,
        Event::Log { channel: LogChannel::Warning, text } if text.contains("pending commands abandoned")
    )));
    assert!(harness.has_event(|e| matches!(
        e,
        Event::Log { channel: LogChannel::Error, text } if text.contains("exited unexpectedly")
    )));
}

#[test]
fn script_call_returns_reply() {
    let mut harness = EngineTestHarness::new();
    harness.start();

    let output = thread::scope(|s| {
        let debugger = &harness.debugger;
        let request = s.spawn(move || debugger.execute_script("evaluate", ("local.x", 3)));
        let lines = harness
            .cdb
            .read_until(|l| l.starts_with("!qtcreatorcdbext.script"));
        let line = lines.last().unwrap();
        assert!(line.ends_with(r#"theDumper.evaluate("local.x", 3)"#));
        harness.cdb.reply(extension_token(line), "script", "3");
        request.join().unwrap()
    });
    assert_eq!(output.unwrap(), "3");
}
