use std::{io::Write, path::PathBuf, sync::Mutex, thread::JoinHandle};

use clap::Parser;
use color_eyre::eyre::{self, Context};
use crossbeam_channel::Receiver;
use debugger::{
    BreakpointId, BreakpointParameters, Debugger, Event, LogChannel, StackSnapshot,
    StartParameters, TaskSeverity, VisiblePanels,
};
use tracing_subscriber::filter::EnvFilter;

struct App {
    debugger: Debugger,
    debugger_events: Receiver<Event>,
    input_rx: Receiver<String>,
    verbose: bool,

    #[allow(dead_code)]
    input_thread: JoinHandle<()>,
}

impl App {
    fn new(debugger: Debugger, verbose: bool) -> Self {
        let debugger_events = debugger.events();

        // handle input
        let (input_tx, input_rx) = crossbeam_channel::unbounded();
        let input_thread = std::thread::spawn(move || {
            let mut buffer = String::new();
            loop {
                match std::io::stdin().read_line(&mut buffer) {
                    Ok(0) => {
                        let _ = input_tx.send("q".to_string());
                        return;
                    }
                    Ok(_) => {
                        if input_tx.send(buffer.trim().to_owned()).is_err() {
                            return;
                        }
                        buffer.clear();
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "reading from stdin");
                        return;
                    }
                }
            }
        });

        Self {
            debugger,
            debugger_events,
            input_thread,
            input_rx,
            verbose,
        }
    }

    fn loop_step(&mut self) -> eyre::Result<ShouldQuit> {
        crossbeam_channel::select! {
            recv(self.input_rx) -> input => match input {
                Ok(input) => self.handle_input(&input).context("handling command"),
                Err(_) => Ok(ShouldQuit::True),
            },
            recv(self.debugger_events) -> event => match event {
                Ok(event) => self.handle_debugger_event(event).context("handling debugger event"),
                Err(_) => Ok(ShouldQuit::True),
            },
        }
    }

    fn prompt(&self) -> eyre::Result<()> {
        print!("> ");
        std::io::stdout().flush()?;
        Ok(())
    }

    #[tracing::instrument(skip(self))]
    fn handle_debugger_event(&mut self, event: Event) -> eyre::Result<ShouldQuit> {
        match event {
            Event::Log { channel, text } => match channel {
                LogChannel::Input | LogChannel::Output if !self.verbose => {}
                LogChannel::Input => println!("<- {text}"),
                LogChannel::AppOutput => print!("{text}"),
                LogChannel::Error => eprintln!("error: {text}"),
                LogChannel::Warning => eprintln!("warning: {text}"),
                LogChannel::Output | LogChannel::Status => println!("{text}"),
            },
            Event::SetupOk => println!("debugger ready"),
            Event::SetupFailed(message) => {
                eprintln!("could not start debugging: {message}");
            }
            Event::StateChanged(lifecycle) => tracing::debug!(?lifecycle, "state changed"),
            Event::Stopped { message } => {
                println!("{message}");
                self.prompt()?;
            }
            Event::Stack(stack) => print_stack(&stack),
            Event::Threads(snapshot) => {
                for thread in snapshot.threads {
                    let marker = if Some(thread.id) == snapshot.current {
                        '*'
                    } else {
                        ' '
                    };
                    println!(
                        "{marker}{:>3} {} {}",
                        thread.id,
                        thread.target_id,
                        thread.function.as_deref().unwrap_or("??")
                    );
                }
            }
            Event::Modules(modules) => {
                for module in modules {
                    let start = module.start.map(|a| format!("{a:#x}")).unwrap_or_default();
                    let deferred = if module.deferred { " (deferred)" } else { "" };
                    println!("{start:>18} {}{deferred}", module.name);
                }
            }
            Event::Registers(registers) => {
                for register in registers {
                    println!("{:>8} = {}", register.name, register.value);
                }
            }
            Event::Breakpoint { id, response } => match response {
                Some(response) => println!(
                    "breakpoint {id} resolved at {}",
                    response
                        .address
                        .map(|a| format!("{a:#x}"))
                        .unwrap_or_else(|| "??".to_string())
                ),
                None => println!("breakpoint {id} pending"),
            },
            Event::BreakpointRemoved(id) => println!("breakpoint {id} removed"),
            Event::ExceptionBox(text) => println!("*** {text}"),
            Event::Task { severity, message } => {
                let label = match severity {
                    TaskSeverity::Error => "error",
                    TaskSeverity::Warning => "warning",
                };
                eprintln!("{label}: {message}");
            }
            Event::InferiorExited => println!("program exited"),
            Event::Finished => {
                println!("debugger finished");
                return Ok(ShouldQuit::True);
            }
        }
        Ok(ShouldQuit::False)
    }

    fn handle_input(&mut self, input: &str) -> eyre::Result<ShouldQuit> {
        let (command, rest) = match input.split_once(' ') {
            Some((command, rest)) => (command, rest.trim()),
            None => (input, ""),
        };
        match command {
            "q" => {
                self.debugger.shutdown().context("shutting down")?;
            }
            "c" => self.debugger.r#continue().context("resuming execution")?,
            "n" => self.debugger.step_over().context("stepping over")?,
            "s" => self.debugger.step_in().context("stepping in")?,
            "o" => self.debugger.step_out().context("stepping out")?,
            "i" => self.debugger.interrupt().context("interrupting")?,
            "bt" => self.debugger.reload_stack()?,
            "threads" => self.debugger.reload_threads()?,
            "modules" => self.debugger.reload_modules()?,
            "regs" => self.debugger.reload_registers()?,
            "panels" => {
                let panels = VisiblePanels {
                    registers: rest.contains("regs"),
                    modules: rest.contains("modules"),
                };
                self.debugger.set_visible_panels(panels)?;
            }
            "asm" => self
                .debugger
                .set_operate_by_instruction(rest != "off")
                .context("switching stepping mode")?,
            "t" => {
                let id = rest.parse().context("thread id")?;
                self.debugger.select_thread(id)?;
            }
            "b" => {
                let id = self
                    .debugger
                    .add_breakpoint(parse_breakpoint(rest)?)
                    .context("adding breakpoint")?;
                println!("breakpoint {id} requested");
            }
            "d" => {
                let id = parse_breakpoint_id(rest)?;
                self.debugger.remove_breakpoint(id)?;
            }
            "x" => match self.debugger.execute(rest) {
                Ok(output) => println!("{output}"),
                Err(e) => eprintln!("{e:#}"),
            },
            "ext" => {
                let (function, args) = rest.split_once(' ').unwrap_or((rest, ""));
                match self.debugger.execute_extension(function, args) {
                    Ok(output) => println!("{output}"),
                    Err(e) => eprintln!("{e:#}"),
                }
            }
            "raw" => self.debugger.execute_raw(rest)?,
            "" => {}
            other => println!("Unhandled command: '{other}'"),
        }
        self.prompt()?;
        Ok(ShouldQuit::False)
    }
}

fn print_stack(stack: &StackSnapshot) {
    for frame in &stack.frames {
        let marker = if frame.index == stack.current { '*' } else { ' ' };
        let location = match (&frame.file, frame.line) {
            (Some(file), Some(line)) => format!(" at {file}:{line}"),
            _ => String::new(),
        };
        println!("{marker}{:>3} {}{location}", frame.index, frame.function);
    }
    if stack.incomplete {
        println!("    ...");
    }
}

/// `file:line`, or a function optionally qualified as `module!function`
fn parse_breakpoint(text: &str) -> eyre::Result<BreakpointParameters> {
    eyre::ensure!(!text.is_empty(), "missing breakpoint location");
    if let Some((file, line)) = text.rsplit_once(':') {
        if let Ok(line) = line.parse() {
            return Ok(BreakpointParameters::file_line(file, line));
        }
    }
    if let Some(address) = text.strip_prefix("0x") {
        let address = u64::from_str_radix(address, 16).context("parsing address")?;
        return Ok(BreakpointParameters::address(address));
    }
    Ok(BreakpointParameters::function(text))
}

/// `3` or `3.1`
fn parse_breakpoint_id(text: &str) -> eyre::Result<BreakpointId> {
    let id = match text.split_once('.') {
        Some((major, minor)) => BreakpointId::new(major.parse()?).sub(minor.parse()?),
        None => BreakpointId::new(text.parse()?),
    };
    Ok(id)
}

#[derive(Debug, Parser)]
struct Args {
    /// Program to launch, followed by its arguments
    program: Option<PathBuf>,

    #[clap(trailing_var_arg = true)]
    arguments: Vec<String>,

    /// Attach to a running process
    #[clap(long, conflicts_with_all = ["program", "dump", "remote"])]
    pid: Option<u32>,

    /// Open a crash dump
    #[clap(long, conflicts_with_all = ["program", "remote"])]
    dump: Option<PathBuf>,

    /// Connect to a debugger server, e.g. `tcp:server=host,port=1234`
    #[clap(long, conflicts_with = "program")]
    remote: Option<String>,

    /// Settings file instead of the default location
    #[clap(long)]
    settings: Option<PathBuf>,

    #[clap(short, long)]
    breakpoints: Vec<String>,

    /// Show commands and raw debugger output
    #[clap(short, long)]
    verbose: bool,

    #[clap(long, default_value = "log.log")]
    log_file: PathBuf,
}

impl Args {
    fn start_parameters(&self) -> eyre::Result<StartParameters> {
        if let Some(pid) = self.pid {
            return Ok(StartParameters::attach(pid));
        }
        if let Some(dump) = &self.dump {
            return Ok(StartParameters::dump(dump));
        }
        if let Some(remote) = &self.remote {
            return Ok(StartParameters::remote(remote));
        }
        match &self.program {
            Some(program) => Ok(StartParameters::launch(program, self.arguments.clone())),
            None => eyre::bail!("nothing to debug: give a program, --pid, --dump or --remote"),
        }
    }
}

fn main() -> eyre::Result<()> {
    color_eyre::install().context("installing color_eyre")?;
    let args = Args::parse();

    let log_file = std::fs::File::create(&args.log_file).context("creating log file")?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(Mutex::new(log_file))
        .init();

    let settings = match &args.settings {
        Some(path) => config::load_from(path),
        None => config::load(),
    }
    .context("loading settings")?;
    let parameters = args.start_parameters()?;

    let debugger = Debugger::launch(settings, parameters).context("creating debugger")?;
    for location in &args.breakpoints {
        tracing::debug!(%location, "adding breakpoint");
        debugger
            .add_breakpoint(parse_breakpoint(location)?)
            .context("adding breakpoint")?;
    }

    let mut app = App::new(debugger, args.verbose);
    tracing::debug!("debugger set up");
    loop {
        match app.loop_step() {
            Ok(ShouldQuit::True) => break,
            Ok(ShouldQuit::False) => {}
            Err(e) => eprintln!("{e:#}"),
        }
    }

    Ok(())
}

enum ShouldQuit {
    True,
    False,
}
