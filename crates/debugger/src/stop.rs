//! Deciding what to do about a stop notification
use bitflags::bitflags;
use transport::GdbMi;

use crate::{
    breakpoints::BreakpointTracker,
    exceptions::{
        EXCEPTION_CTRL_C, EXCEPTION_SET_THREAD_NAME, EXCEPTION_WX86_BREAKPOINT, WinException,
    },
    state::Lifecycle,
    types::{BreakpointId, TaskSeverity},
};

bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct StopActions: u32 {
        const REPORT_LOG = 0x1;
        const REPORT_STATUS = 0x2;
        const REPORT_PARSE_ERROR = 0x4;
        const SHOW_EXCEPTION_BOX = 0x8;
        const NOTIFY_STOP = 0x10;
        const IGNORE_CONTINUE = 0x20;
        /// The stop happened in a thread injected by the debugger
        const IN_ARTIFICIAL_THREAD = 0x40;
        const SHUTDOWN_IN_PROGRESS = 0x80;
    }
}

/// Function the debugger breaks in when interrupting from a console.
const DEBUG_BREAK_FUNCTION: &str = "ntdll!DbgBreakPoint";

pub(crate) struct StopContext<'a> {
    pub(crate) lifecycle: Lifecycle,
    pub(crate) breakpoints: &'a BreakpointTracker,
    /// The condition of the breakpoint hit has already been found true
    pub(crate) condition_evaluated: bool,
}

/// A breakpoint condition to evaluate before deciding whether to stop
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ConditionCheck {
    pub(crate) id: BreakpointId,
    pub(crate) expression: String,
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StopAnalysis {
    pub(crate) actions: StopActions,
    pub(crate) message: String,
    pub(crate) exception_box: Option<String>,
    pub(crate) task: Option<(TaskSeverity, String)>,
    /// Breakpoint message to echo to the application output
    pub(crate) app_message: Option<String>,
    pub(crate) evaluate: Option<ConditionCheck>,
    pub(crate) exception: Option<WinException>,
}

impl StopAnalysis {
    fn new(actions: StopActions, message: impl Into<String>) -> Self {
        Self {
            actions,
            message: message.into(),
            exception_box: None,
            task: None,
            app_message: None,
            evaluate: None,
            exception: None,
        }
    }
}

#[tracing::instrument(skip_all, fields(lifecycle = ?context.lifecycle))]
pub(crate) fn examine(stop: &GdbMi, context: &StopContext<'_>) -> StopAnalysis {
    // nothing may resume or inspect the target once it is going away
    if context.lifecycle.is_shutting_down() {
        let reason = stop.str_of("reason").unwrap_or("unknown");
        return StopAnalysis::new(
            StopActions::SHUTDOWN_IN_PROGRESS | StopActions::REPORT_LOG,
            format!("Ignored stop notification during shutdown ({reason})."),
        );
    }

    let Some(reason) = stop.str_of("reason").filter(|r| !r.is_empty()) else {
        return StopAnalysis::new(
            StopActions::REPORT_PARSE_ERROR | StopActions::NOTIFY_STOP,
            "Malformed stop response received.",
        );
    };

    // further notifications arrive for function calls made while stopped
    if context.lifecycle == Lifecycle::Stopped {
        return StopAnalysis::new(
            StopActions::REPORT_LOG,
            format!("Ignored stop notification from function call ({reason})."),
        );
    }

    let thread = stop.get("threadId").to_int().unwrap_or(-1);
    match reason {
        "breakpoint" => examine_breakpoint(stop, thread, context),
        "exception" => examine_exception(stop, thread),
        other => StopAnalysis::new(
            StopActions::REPORT_STATUS | StopActions::NOTIFY_STOP,
            format!("Stopped: \"{other}\""),
        ),
    }
}

fn examine_breakpoint(
    stop: &GdbMi,
    thread: i64,
    context: &StopContext<'_>,
) -> StopAnalysis {
    let wire = stop.get("breakpointId").to_int().unwrap_or(-1);
    let Some((id, parameters)) = context.breakpoints.lookup_wire(wire) else {
        tracing::debug!(wire, "stop at unknown breakpoint");
        return StopAnalysis::new(
            StopActions::REPORT_STATUS | StopActions::NOTIFY_STOP,
            format!("Stopped at breakpoint {wire} in thread {thread}."),
        );
    };

    let app_message = parameters.message.clone().filter(|m| !m.is_empty());
    if parameters.tracepoint {
        let mut analysis = StopAnalysis::new(
            StopActions::REPORT_LOG | StopActions::IGNORE_CONTINUE,
            format!("Trace point {id} in thread {thread} triggered."),
        );
        analysis.app_message = app_message;
        return analysis;
    }

    let pending_condition = parameters
        .condition
        .as_deref()
        .filter(|c| !c.is_empty() && !context.condition_evaluated);
    if let Some(condition) = pending_condition {
        let expression = if condition.contains(' ') {
            format!("\"{condition}\"")
        } else {
            condition.to_string()
        };
        let mut analysis = StopAnalysis::new(
            StopActions::REPORT_LOG,
            format!("Evaluating condition \"{condition}\" of breakpoint {id}."),
        );
        analysis.evaluate = Some(ConditionCheck { id, expression });
        return analysis;
    }

    let mut analysis = StopAnalysis::new(
        StopActions::REPORT_STATUS | StopActions::NOTIFY_STOP,
        format!("Stopped at breakpoint {id} in thread {thread}."),
    );
    analysis.app_message = app_message;
    analysis
}

fn examine_exception(stop: &GdbMi, thread: i64) -> StopAnalysis {
    let exception = WinException::from_gdbmi(stop);
    let description = exception.to_string();

    let mut analysis = if matches!(
        exception.code,
        EXCEPTION_WX86_BREAKPOINT | EXCEPTION_SET_THREAD_NAME
    ) {
        StopAnalysis::new(
            StopActions::REPORT_LOG | StopActions::IGNORE_CONTINUE,
            description,
        )
    } else if exception.code == EXCEPTION_CTRL_C {
        StopAnalysis::new(
            StopActions::REPORT_STATUS
                | StopActions::NOTIFY_STOP
                | StopActions::IN_ARTIFICIAL_THREAD,
            "Interrupted.",
        )
    } else if exception.is_debugger_exception() {
        let mut actions = StopActions::REPORT_STATUS | StopActions::NOTIFY_STOP;
        if exception.function.as_deref() == Some(DEBUG_BREAK_FUNCTION) {
            actions |= StopActions::IN_ARTIFICIAL_THREAD;
        }
        StopAnalysis::new(actions, "Interrupted.")
    } else {
        let severity = if exception.is_fatal() {
            TaskSeverity::Error
        } else {
            TaskSeverity::Warning
        };
        let mut analysis = StopAnalysis::new(
            StopActions::SHOW_EXCEPTION_BOX
                | StopActions::REPORT_STATUS
                | StopActions::NOTIFY_STOP,
            description.clone(),
        );
        analysis.exception_box = Some(format!(
            "Stopped in thread {thread} by: {}.",
            exception.describe()
        ));
        analysis.task = Some((severity, description));
        analysis
    };
    analysis.exception = Some(exception);
    analysis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::BreakpointParameters;

    fn stop(text: &str) -> GdbMi {
        GdbMi::parse(text).unwrap()
    }

    fn examine_with(
        text: &str,
        lifecycle: Lifecycle,
        breakpoints: &BreakpointTracker,
        condition_evaluated: bool,
    ) -> StopAnalysis {
        examine(
            &stop(text),
            &StopContext {
                lifecycle,
                breakpoints,
                condition_evaluated,
            },
        )
    }

    fn running(text: &str) -> StopAnalysis {
        examine_with(text, Lifecycle::Running, &BreakpointTracker::new(), false)
    }

    #[test]
    fn missing_reason_is_a_parse_error_that_still_stops() {
        let analysis = running(r#"{threadId="1"}"#);
        assert_eq!(
            analysis.actions,
            StopActions::REPORT_PARSE_ERROR | StopActions::NOTIFY_STOP
        );
        assert_eq!(analysis.message, "Malformed stop response received.");
    }

    #[test]
    fn duplicate_stop_is_only_logged() {
        let analysis = examine_with(
            r#"{reason="breakpoint",breakpointId="100100"}"#,
            Lifecycle::Stopped,
            &BreakpointTracker::new(),
            false,
        );
        assert_eq!(analysis.actions, StopActions::REPORT_LOG);
    }

    #[test]
    fn shutdown_is_flagged() {
        let analysis = examine_with(
            r#"{reason="signal"}"#,
            Lifecycle::ShutdownRequested,
            &BreakpointTracker::new(),
            false,
        );
        assert_eq!(
            analysis.actions,
            StopActions::SHUTDOWN_IN_PROGRESS | StopActions::REPORT_LOG
        );
    }

    #[test]
    fn stops_during_shutdown_are_only_reported() {
        let mut tracker = BreakpointTracker::new();
        let mut params = BreakpointParameters::file_line("main.cpp", 4);
        params.tracepoint = true;
        params.condition = Some("i > 3".to_string());
        tracker.request_insert(params);
        for stop in [
            r#"{reason="breakpoint",breakpointId="100100",threadId="2"}"#,
            r#"{reason="exception",exceptionCode="0x406d1388",threadId="2"}"#,
            r#"{reason="exception",exceptionCode="0xc0000005",threadId="2"}"#,
        ] {
            let analysis = examine_with(stop, Lifecycle::ShutdownRequested, &tracker, false);
            assert_eq!(
                analysis.actions,
                StopActions::SHUTDOWN_IN_PROGRESS | StopActions::REPORT_LOG
            );
            assert!(analysis.evaluate.is_none());
            assert!(analysis.task.is_none());
            assert!(analysis.exception_box.is_none());
        }
    }

    #[test]
    fn plain_breakpoint_stops() {
        let mut tracker = BreakpointTracker::new();
        let id = tracker.request_insert(BreakpointParameters::file_line("main.cpp", 4));
        let analysis = examine_with(
            r#"{reason="breakpoint",breakpointId="100100",threadId="2"}"#,
            Lifecycle::Running,
            &tracker,
            false,
        );
        assert_eq!(id.to_wire(), Some(100_100));
        assert_eq!(
            analysis.actions,
            StopActions::REPORT_STATUS | StopActions::NOTIFY_STOP
        );
        assert_eq!(analysis.message, "Stopped at breakpoint 1 in thread 2.");
    }

    #[test]
    fn trace_point_wins_over_condition() {
        let mut tracker = BreakpointTracker::new();
        let mut params = BreakpointParameters::file_line("main.cpp", 4);
        params.tracepoint = true;
        params.condition = Some("i > 3".to_string());
        params.message = Some("hit".to_string());
        tracker.request_insert(params);
        let analysis = examine_with(
            r#"{reason="breakpoint",breakpointId="100100",threadId="2"}"#,
            Lifecycle::Running,
            &tracker,
            false,
        );
        assert_eq!(
            analysis.actions,
            StopActions::REPORT_LOG | StopActions::IGNORE_CONTINUE
        );
        assert_eq!(analysis.evaluate, None);
        assert_eq!(analysis.app_message.as_deref(), Some("hit"));
    }

    #[test]
    fn condition_is_evaluated_first() {
        let mut tracker = BreakpointTracker::new();
        let mut params = BreakpointParameters::file_line("main.cpp", 4);
        params.condition = Some("i > 3".to_string());
        let id = tracker.request_insert(params);
        let text = r#"{reason="breakpoint",breakpointId="100100",threadId="2"}"#;

        let analysis = examine_with(text, Lifecycle::Running, &tracker, false);
        assert_eq!(analysis.actions, StopActions::REPORT_LOG);
        assert_eq!(
            analysis.evaluate,
            Some(ConditionCheck {
                id,
                expression: "\"i > 3\"".to_string()
            })
        );

        let analysis = examine_with(text, Lifecycle::Running, &tracker, true);
        assert!(analysis.actions.contains(StopActions::NOTIFY_STOP));
        assert_eq!(analysis.evaluate, None);
    }

    #[test]
    fn ignored_exceptions_continue() {
        for code in ["0x4000001f", "0x406d1388"] {
            let analysis = running(&format!(
                r#"{{reason="exception",exceptionCode="{code}"}}"#
            ));
            assert_eq!(
                analysis.actions,
                StopActions::REPORT_LOG | StopActions::IGNORE_CONTINUE
            );
        }
    }

    #[test]
    fn ctrl_c_stops_in_artificial_thread() {
        let analysis = running(r#"{reason="exception",exceptionCode="0x40010005"}"#);
        assert!(analysis.actions.contains(StopActions::IN_ARTIFICIAL_THREAD));
        assert!(analysis.actions.contains(StopActions::NOTIFY_STOP));
        assert_eq!(analysis.message, "Interrupted.");
    }

    #[test]
    fn debug_break_is_artificial() {
        let analysis = running(
            r#"{reason="exception",exceptionCode="0x80000003",exceptionFunction="ntdll!DbgBreakPoint"}"#,
        );
        assert_eq!(
            analysis.actions,
            StopActions::REPORT_STATUS | StopActions::NOTIFY_STOP | StopActions::IN_ARTIFICIAL_THREAD
        );

        let analysis = running(r#"{reason="exception",exceptionCode="0x80000004"}"#);
        assert!(!analysis.actions.contains(StopActions::IN_ARTIFICIAL_THREAD));
    }

    #[test]
    fn crash_shows_box_and_task() {
        let analysis = running(
            r#"{reason="exception",threadId="5",exceptionCode="0xc0000005",exceptionAddress="0x10",exceptionInformation0="0",exceptionInformation1="0x0"}"#,
        );
        assert!(analysis.actions.contains(StopActions::SHOW_EXCEPTION_BOX));
        assert_eq!(
            analysis.exception_box.as_deref(),
            Some("Stopped in thread 5 by: read access violation at: 0x0.")
        );
        assert!(matches!(analysis.task, Some((TaskSeverity::Error, _))));

        let analysis = running(r#"{reason="exception",exceptionCode="0xe06d7363"}"#);
        assert!(matches!(analysis.task, Some((TaskSeverity::Warning, _))));
    }

    #[test]
    fn other_reasons_stop() {
        let analysis = running(r#"{reason="step"}"#);
        assert_eq!(analysis.message, "Stopped: \"step\"");
        assert!(analysis.actions.contains(StopActions::NOTIFY_STOP));
    }
}
