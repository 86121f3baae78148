//! Building stack, thread, module and register snapshots from replies
use transport::GdbMi;

use crate::{
    source_map::SourceMapper,
    types::{ModuleRecord, RegisterRecord, StackFrame, StackSnapshot, ThreadRecord, ThreadSnapshot},
};

/// Whether the debuggee is a 32 bit process on a 64 bit system, and which
/// stack the debugger currently shows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Wow64State {
    #[default]
    Unknown,
    NotPresent,
    Stack32Bit,
    Stack64Bit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum StackOutcome {
    /// Find out about WOW64 before the stack can be trusted
    CheckWow64,
    /// A step into stopped on an incremental linking thunk; step again
    StepInto,
    /// A step into ended up without source; step out again
    StepOut,
    Frames(StackSnapshot),
}

/// Frames of a stack listing; an entry without fields marks truncation.
pub(crate) fn parse_frames(data: &GdbMi) -> (Vec<StackFrame>, bool) {
    let mut frames = Vec::with_capacity(data.len());
    for (index, entry) in data.iter().enumerate() {
        if entry.is_empty() {
            return (frames, true);
        }
        let file = entry.str_of("fullname").map(str::to_string);
        let line = file.as_ref().and_then(|_| {
            entry
                .get("line")
                .to_int()
                .and_then(|l| u32::try_from(l).ok())
        });
        let function = entry
            .str_of("function")
            .filter(|f| !f.is_empty())
            .or_else(|| entry.str_of("func"))
            .unwrap_or_default()
            .to_string();
        frames.push(StackFrame {
            index,
            address: entry.get("address").to_address(),
            function,
            module: entry
                .str_of("from")
                .filter(|m| !m.is_empty())
                .map(str::to_string),
            file,
            line,
            usable: false,
        });
    }
    (frames, false)
}

/// Turn a stack listing into a snapshot, unless something has to happen
/// first.
pub(crate) fn parse_stack(
    data: &GdbMi,
    source_step_into: bool,
    wow64: Wow64State,
    mapper: &mut SourceMapper,
) -> StackOutcome {
    let (mut frames, incomplete) = parse_frames(data);
    let mut current = None;
    for (i, frame) in frames.iter_mut().enumerate() {
        if wow64 == Wow64State::Unknown {
            tracing::debug!("checking for wow64 subsystem");
            return StackOutcome::CheckWow64;
        }
        let Some(file) = frame.file.as_deref() else {
            if i == 0 && source_step_into {
                // best effort: thunks of incremental linking are named ILT+<n>
                if frame.function.contains("ILT+") {
                    tracing::debug!("step into hit a call thunk, stepping again");
                    return StackOutcome::StepInto;
                }
                tracing::debug!("step into hit a frame without source, stepping out");
                return StackOutcome::StepOut;
            }
            continue;
        };
        let normalized = mapper.normalize(file);
        frame.file = Some(normalized.path);
        frame.usable = normalized.usable;
        if current.is_none() && frame.usable {
            current = Some(i);
        }
    }
    StackOutcome::Frames(StackSnapshot {
        frames,
        incomplete,
        current: current.unwrap_or(0),
    })
}

/// `lm m wow64` output lists the module when present.
pub(crate) fn wow64_module_listed(text: &str) -> bool {
    text.contains("wow64")
}

/// Bitness of the stack the debugger shows, from the header of `k` output.
pub(crate) fn wow64_header(text: &str) -> Wow64State {
    for line in text.lines().map(str::trim_start) {
        if line.starts_with("ChildEBP") {
            return Wow64State::Stack32Bit;
        }
        if line.starts_with("Child-SP") {
            return Wow64State::Stack64Bit;
        }
    }
    Wow64State::NotPresent
}

/// Reply of `!wow64exts.sw`.
pub(crate) fn wow64_switch_reply(text: &str) -> Wow64State {
    match text.trim() {
        "Switched to 32bit mode" => Wow64State::Stack32Bit,
        "Switched to 64bit mode" => Wow64State::Stack64Bit,
        _ => Wow64State::NotPresent,
    }
}

pub(crate) fn parse_threads(data: &GdbMi, mapper: &mut SourceMapper) -> Option<ThreadSnapshot> {
    let list = data.get("threads");
    if !list.is_valid() {
        tracing::error!(%data, "thread reply without threads");
        return None;
    }
    let mut threads = Vec::with_capacity(list.len());
    for item in list {
        let Some(id) = item.get("id").to_int().and_then(|i| u32::try_from(i).ok()) else {
            tracing::error!(%item, "thread without id");
            return None;
        };
        // frame details are nested or inline depending on the reporter
        let frame = if item.get("frame").is_valid() {
            item.get("frame")
        } else {
            item
        };
        let text = |node: &GdbMi, name: &str| {
            node.str_of(name)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        threads.push(ThreadRecord {
            id,
            target_id: item.str_of("target-id").unwrap_or_default().to_string(),
            name: text(item, "name"),
            state: text(item, "state"),
            function: text(frame, "func").or_else(|| text(frame, "function")),
            file: text(frame, "fullname").map(|f| mapper.normalize(&f).path),
            line: frame
                .get("line")
                .to_int()
                .and_then(|l| u32::try_from(l).ok()),
            module: text(frame, "from"),
            address: frame
                .get("address")
                .to_address()
                .or_else(|| frame.get("addr").to_address()),
        });
    }
    let current = data
        .get("current-thread-id")
        .to_int()
        .and_then(|i| u32::try_from(i).ok());
    Some(ThreadSnapshot { threads, current })
}

pub(crate) fn parse_modules(data: &GdbMi) -> Option<Vec<ModuleRecord>> {
    let mut modules = Vec::with_capacity(data.len());
    for item in data {
        let Some(name) = item.str_of("name") else {
            tracing::error!(%item, "module without name");
            return None;
        };
        modules.push(ModuleRecord {
            name: name.to_string(),
            image: item.str_of("image").unwrap_or_default().to_string(),
            start: item.get("start").to_address(),
            end: item.get("end").to_address(),
            deferred: item.get("deferred").is_valid(),
        });
    }
    Some(modules)
}

pub(crate) fn parse_registers(data: &GdbMi) -> Option<Vec<RegisterRecord>> {
    let mut registers = Vec::with_capacity(data.len());
    for item in data {
        let Some(name) = item.str_of("name") else {
            tracing::error!(%item, "register without name");
            return None;
        };
        registers.push(RegisterRecord {
            name: name.to_string(),
            value: item.str_of("value").unwrap_or_default().to_string(),
            description: item.str_of("description").unwrap_or_default().to_string(),
            kind: item.str_of("type").unwrap_or_default().to_string(),
            size: item
                .get("size")
                .to_int()
                .and_then(|s| u32::try_from(s).ok()),
        });
    }
    Some(registers)
}
