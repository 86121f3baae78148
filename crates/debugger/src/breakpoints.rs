//! Keeping the debugger's breakpoints in line with what the user asked for
//!
//! Requests only change the tracker's records. [`BreakpointTracker::synchronize`]
//! then turns every outstanding request into debugger commands, and the
//! replies to those commands are fed back with
//! [`BreakpointTracker::apply_insert_reply`] and
//! [`BreakpointTracker::apply_listing`].
use std::collections::BTreeMap;
use std::fmt::Write as _;

use transport::{GdbMi, gdbmi::parse_address};

use crate::{
    source_map::SourceMapper,
    types::{BreakpointId, BreakpointLocation, BreakpointParameters, BreakpointResponse},
};

const MATCHED_PREFIX: &str = "Matched: ";

/// Moves a file/line breakpoint to a line with code
pub trait LineCorrector: Send {
    fn correct_line(&self, file: &str, line: u32) -> Option<u32>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BreakpointState {
    InsertRequested,
    /// Sent, waiting to be resolved
    Pending,
    Resolved(BreakpointResponse),
    ChangeRequested {
        previous: BreakpointParameters,
        response: Option<BreakpointResponse>,
    },
    RemoveRequested,
}

impl BreakpointState {
    fn is_requested(&self) -> bool {
        matches!(
            self,
            BreakpointState::InsertRequested
                | BreakpointState::ChangeRequested { .. }
                | BreakpointState::RemoveRequested
        )
    }

    pub fn response(&self) -> Option<&BreakpointResponse> {
        match self {
            BreakpointState::Resolved(response) => Some(response),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
struct BreakpointRecord {
    parameters: BreakpointParameters,
    state: BreakpointState,
    /// Function an ambiguous sub-breakpoint matched
    matched: Option<String>,
}

/// A single debugger command of a synchronization batch
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SyncCommand {
    /// Fire and forget
    Plain(String),
    /// Insertion whose reply may list ambiguous matches
    Insert { id: BreakpointId, text: String },
    /// Re-list all breakpoints to pick up resolved locations
    List,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub(crate) struct SyncBatch {
    pub(crate) commands: Vec<SyncCommand>,
    /// Sent to the debugger and now pending
    pub(crate) pending: Vec<BreakpointId>,
    pub(crate) removed: Vec<BreakpointId>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum SyncPlan {
    /// Nothing to do
    Idle,
    /// The debugger must be interrupted before it accepts commands
    Interrupt,
    Commands(SyncBatch),
}

#[derive(Debug, Default)]
pub struct BreakpointTracker {
    records: BTreeMap<BreakpointId, BreakpointRecord>,
    next_major: u32,
}

impl BreakpointTracker {
    pub fn new() -> Self {
        Self {
            records: BTreeMap::new(),
            next_major: 1,
        }
    }

    pub fn request_insert(&mut self, parameters: BreakpointParameters) -> BreakpointId {
        let id = BreakpointId::new(self.next_major.max(1));
        self.next_major = id.major + 1;
        tracing::debug!(breakpoint = %id, ?parameters, "insert requested");
        self.records.insert(
            id,
            BreakpointRecord {
                parameters,
                state: BreakpointState::InsertRequested,
                matched: None,
            },
        );
        id
    }

    /// Returns `false` for unknown ids.
    pub fn request_change(&mut self, id: BreakpointId, parameters: BreakpointParameters) -> bool {
        let Some(record) = self.records.get_mut(&id) else {
            return false;
        };
        tracing::debug!(breakpoint = %id, ?parameters, "change requested");
        let previous = std::mem::replace(&mut record.parameters, parameters);
        record.state = match std::mem::replace(&mut record.state, BreakpointState::Pending) {
            BreakpointState::InsertRequested => BreakpointState::InsertRequested,
            BreakpointState::RemoveRequested => BreakpointState::RemoveRequested,
            BreakpointState::ChangeRequested { previous, response } => {
                BreakpointState::ChangeRequested { previous, response }
            }
            BreakpointState::Resolved(response) => BreakpointState::ChangeRequested {
                previous,
                response: Some(response),
            },
            BreakpointState::Pending => BreakpointState::ChangeRequested {
                previous,
                response: None,
            },
        };
        true
    }

    /// Returns `false` for unknown ids.
    pub fn request_remove(&mut self, id: BreakpointId) -> bool {
        let Some(record) = self.records.get_mut(&id) else {
            return false;
        };
        tracing::debug!(breakpoint = %id, "remove requested");
        if record.state == BreakpointState::InsertRequested {
            // never sent
            self.drop_with_subs(id);
        } else {
            record.state = BreakpointState::RemoveRequested;
        }
        true
    }

    pub fn parameters(&self, id: BreakpointId) -> Option<&BreakpointParameters> {
        self.records.get(&id).map(|r| &r.parameters)
    }

    pub fn state(&self, id: BreakpointId) -> Option<&BreakpointState> {
        self.records.get(&id).map(|r| &r.state)
    }

    /// All breakpoints, sub-breakpoints following their parent.
    pub fn iter(
        &self,
    ) -> impl Iterator<Item = (BreakpointId, &BreakpointParameters, &BreakpointState)> {
        self.records
            .iter()
            .map(|(id, r)| (*id, &r.parameters, &r.state))
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Breakpoint for a debugger side id.
    pub fn lookup_wire(&self, wire: i64) -> Option<(BreakpointId, &BreakpointParameters)> {
        let id = BreakpointId::from_wire(wire)?;
        self.records.get(&id).map(|r| (id, &r.parameters))
    }

    /// Some breakpoint was sent but is not resolved yet.
    pub fn has_pending(&self) -> bool {
        self.records
            .values()
            .any(|r| r.state == BreakpointState::Pending)
    }

    pub fn needs_sync(&self) -> bool {
        self.records.values().any(|r| r.state.is_requested())
    }

    /// Commands bringing the debugger in line with the requested breakpoints.
    ///
    /// Calling this again without new requests yields [`SyncPlan::Idle`].
    #[tracing::instrument(skip_all)]
    pub(crate) fn synchronize(
        &mut self,
        accessible: bool,
        mapper: &SourceMapper,
        corrector: Option<&dyn LineCorrector>,
    ) -> SyncPlan {
        if !self.needs_sync() {
            return SyncPlan::Idle;
        }
        if !accessible {
            return SyncPlan::Interrupt;
        }

        let mut batch = SyncBatch::default();
        let mut list = false;
        let requested: Vec<BreakpointId> = self
            .records
            .iter()
            .filter(|(_, r)| r.state.is_requested())
            .map(|(id, _)| *id)
            .collect();

        for id in requested {
            // may have been dropped together with its parent
            let Some(record) = self.records.get(&id) else {
                continue;
            };
            let Some(wire) = id.to_wire() else {
                tracing::warn!(breakpoint = %id, "breakpoint id cannot be sent to the debugger");
                self.records.remove(&id);
                batch.removed.push(id);
                continue;
            };

            match record.state.clone() {
                BreakpointState::InsertRequested => {
                    let parameters = record.parameters.clone();
                    self.insert_commands(id, wire, &parameters, mapper, corrector, &mut batch);
                    list = true;
                }
                BreakpointState::ChangeRequested { previous, response } => {
                    let parameters = record.parameters.clone();
                    if previous.differs_only_in_enabled(&parameters) {
                        let verb = if parameters.enabled { "be" } else { "bd" };
                        batch.commands.push(SyncCommand::Plain(format!("{verb} {wire}")));
                        let state = match response {
                            Some(mut response) => {
                                response.enabled = parameters.enabled;
                                BreakpointState::Resolved(response)
                            }
                            None => BreakpointState::Pending,
                        };
                        self.set_state(id, state);
                        for sub in self.subs_of(id) {
                            if let Some(sub_wire) = sub.to_wire() {
                                batch
                                    .commands
                                    .push(SyncCommand::Plain(format!("{verb} {sub_wire}")));
                            }
                        }
                    } else {
                        batch.commands.push(SyncCommand::Plain(clear_command(wire)));
                        for sub in self.subs_of(id) {
                            self.records.remove(&sub);
                            batch.removed.push(sub);
                        }
                        self.insert_commands(id, wire, &parameters, mapper, corrector, &mut batch);
                    }
                    list = true;
                }
                BreakpointState::RemoveRequested => {
                    batch.commands.push(SyncCommand::Plain(clear_command(wire)));
                    batch.removed.extend(self.drop_with_subs(id));
                }
                BreakpointState::Pending | BreakpointState::Resolved(_) => {}
            }
        }

        if list {
            batch.commands.push(SyncCommand::List);
        }
        SyncPlan::Commands(batch)
    }

    fn insert_commands(
        &mut self,
        id: BreakpointId,
        wire: u32,
        parameters: &BreakpointParameters,
        mapper: &SourceMapper,
        corrector: Option<&dyn LineCorrector>,
        batch: &mut SyncBatch,
    ) {
        let corrected = correct(parameters, corrector);
        let text = add_breakpoint_command(corrected.as_ref().unwrap_or(parameters), wire, mapper);
        batch.commands.push(SyncCommand::Insert { id, text });
        if !parameters.enabled {
            batch.commands.push(SyncCommand::Plain(format!("bd {wire}")));
        }
        self.set_state(id, BreakpointState::Pending);
        batch.pending.push(id);
    }

    fn set_state(&mut self, id: BreakpointId, state: BreakpointState) {
        if let Some(record) = self.records.get_mut(&id) {
            record.state = state;
        }
    }

    fn subs_of(&self, id: BreakpointId) -> Vec<BreakpointId> {
        self.records
            .range(id.sub(1)..BreakpointId::new(id.major + 1))
            .map(|(sub, _)| *sub)
            .collect()
    }

    fn drop_with_subs(&mut self, id: BreakpointId) -> Vec<BreakpointId> {
        let mut dropped = self.subs_of(id);
        for sub in &dropped {
            self.records.remove(sub);
        }
        if self.records.remove(&id).is_some() {
            dropped.insert(0, id);
        }
        dropped
    }

    /// Handle the output of an insertion, creating one sub-breakpoint per
    /// ambiguous match. Returns the new sub-breakpoints.
    pub(crate) fn apply_insert_reply(&mut self, id: BreakpointId, text: &str) -> Vec<BreakpointId> {
        let Some(parent) = self.records.get(&id) else {
            tracing::debug!(breakpoint = %id, "insert reply for removed breakpoint");
            return Vec::new();
        };
        let parent_parameters = parent.parameters.clone();

        let matches: Vec<(String, u64)> = text.lines().filter_map(parse_matched_line).collect();
        if matches.is_empty() {
            return Vec::new();
        }
        tracing::debug!(breakpoint = %id, count = matches.len(), "ambiguous breakpoint");

        let first_free = self
            .subs_of(id)
            .last()
            .map(|sub| sub.minor + 1)
            .unwrap_or(1);
        let mut created = Vec::new();
        for (minor, (function, address)) in (first_free..).zip(matches) {
            if minor >= BreakpointId::MINOR_RANGE {
                tracing::warn!(breakpoint = %id, "too many ambiguous matches, ignoring the rest");
                break;
            }
            let sub = id.sub(minor);
            let parameters = BreakpointParameters {
                location: BreakpointLocation::Address(address),
                ..parent_parameters.clone()
            };
            self.records.insert(
                sub,
                BreakpointRecord {
                    parameters,
                    state: BreakpointState::InsertRequested,
                    matched: Some(function),
                },
            );
            created.push(sub);
        }
        created
    }

    /// Back-fill breakpoint details from a `breakpoints` listing.
    ///
    /// Returns the breakpoints whose state changed. Deferred entries stay
    /// pending.
    pub(crate) fn apply_listing(
        &mut self,
        listing: &GdbMi,
        mapper: &SourceMapper,
    ) -> Vec<(BreakpointId, Option<BreakpointResponse>)> {
        let mut updates = Vec::new();
        for entry in listing {
            let Some(id) = entry.get("id").to_int().and_then(BreakpointId::from_wire) else {
                tracing::debug!(%entry, "listing entry without known id");
                continue;
            };
            let Some(record) = self.records.get_mut(&id) else {
                continue;
            };
            if !matches!(
                record.state,
                BreakpointState::Pending | BreakpointState::Resolved(_)
            ) {
                continue;
            }
            if entry.get("deferred").to_bool() == Some(true) {
                record.state = BreakpointState::Pending;
                updates.push((id, None));
                continue;
            }

            let response = BreakpointResponse {
                enabled: entry.get("enabled").to_bool().unwrap_or(true),
                address: entry.get("address").to_address(),
                module: entry.str_of("module").map(str::to_string),
                file: entry.str_of("srcfile").map(|f| mapper.map_to_source(f)),
                line: entry
                    .get("srcline")
                    .to_int()
                    .and_then(|l| u32::try_from(l).ok()),
                function: entry
                    .str_of("expression")
                    .map(str::to_string)
                    .or_else(|| record.matched.clone()),
                ignore_count: entry
                    .get("passcount")
                    .to_int()
                    .filter(|c| *c > 1)
                    .and_then(|c| u32::try_from(c - 1).ok()),
                thread: entry
                    .get("thread")
                    .to_int()
                    .and_then(|t| u32::try_from(t).ok()),
            };
            record.state = BreakpointState::Resolved(response.clone());
            updates.push((id, Some(response)));
        }
        updates
    }
}

fn correct(
    parameters: &BreakpointParameters,
    corrector: Option<&dyn LineCorrector>,
) -> Option<BreakpointParameters> {
    let (Some(corrector), BreakpointLocation::FileLine { file, line }) =
        (corrector, &parameters.location)
    else {
        return None;
    };
    match corrector.correct_line(file, *line) {
        Some(corrected) if corrected != *line => {
            tracing::debug!(%file, line, corrected, "breakpoint line corrected");
            Some(BreakpointParameters {
                location: BreakpointLocation::FileLine {
                    file: file.clone(),
                    line: corrected,
                },
                ..parameters.clone()
            })
        }
        Some(_) => None,
        None => {
            tracing::warn!(%file, line, "breakpoint line correction failed, using original line");
            None
        }
    }
}

/// `bc` for a breakpoint and every id reserved for its sub-breakpoints.
fn clear_command(wire: u32) -> String {
    format!("bc {wire}-{}", wire + BreakpointId::MINOR_RANGE - 1)
}

/// `bu`/`ba` command setting a breakpoint with debugger id `wire`.
pub(crate) fn add_breakpoint_command(
    parameters: &BreakpointParameters,
    wire: u32,
    mapper: &SourceMapper,
) -> String {
    let mut out = String::new();
    if let Some(thread) = parameters.thread {
        let _ = write!(out, "~{thread} ");
    }
    let verb = match parameters.location {
        BreakpointLocation::Watch { .. } => "ba",
        _ => "bu",
    };
    let _ = write!(out, "{verb}{wire} ");
    if parameters.one_shot {
        out.push_str("/1 ");
    }
    match &parameters.location {
        BreakpointLocation::FileLine { file, line } => {
            let native = file.replace('/', "\\");
            let _ = write!(out, "`{}:{line}`", mapper.map_to_debugger(&native));
        }
        BreakpointLocation::Function { module, function } => {
            if let Some(module) = module {
                let _ = write!(out, "{module}!");
            }
            out.push_str(function);
        }
        BreakpointLocation::Address(address) => {
            let _ = write!(out, "0x{address:x}");
        }
        BreakpointLocation::Watch { address, size } => {
            let _ = write!(out, "r{} 0x{address:x}", (*size).max(1));
        }
        BreakpointLocation::Throw => out.push_str("MSVCRT!CxxThrowException"),
        BreakpointLocation::Catch => out.push_str("MSVCRT!__CxxCallCatchBlock"),
        BreakpointLocation::Main => out.push_str("main"),
    }
    if parameters.ignore_count > 0 {
        let _ = write!(out, " 0n{}", parameters.ignore_count + 1);
    }
    out
}

/// `Matched: module!function+0xN (address)`
fn parse_matched_line(line: &str) -> Option<(String, u64)> {
    let rest = line.trim().strip_prefix(MATCHED_PREFIX)?;
    let open = rest.rfind('(')?;
    let close = open + rest[open..].find(')')?;
    let address = parse_address(&rest[open + 1..close])?;
    let function = rest[..open].trim().to_string();
    Some((function, address))
}
