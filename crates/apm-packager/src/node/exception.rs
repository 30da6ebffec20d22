// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use crate::constants::AGENT_FRAME_MARKER;
use crate::node::TrackerType;
use serde::Serialize;

/// One captured stack frame.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StackFrame {
    pub file: String,
    pub line: u32,
    pub function: String,
}

/// Renders frames as `function(file:line)`, dropping the agent's own frames.
pub fn format_stack_trace(frames: &[StackFrame]) -> Vec<String> {
    frames
        .iter()
        .filter(|frame| !frame.file.contains(AGENT_FRAME_MARKER))
        .map(|frame| format!("{}({}:{})", frame.function, frame.file, frame.line))
        .collect()
}

/// An exception caught (and possibly swallowed) while a node was running.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExceptionNode {
    /// Epoch seconds.
    pub exception_time: i64,
    pub class_name: String,
    pub message: String,
    pub stack_trace: Vec<StackFrame>,
    pub tracker_type: TrackerType,
}

/// Exception as embedded in a rendered trace node's params.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExceptionDetail {
    pub message: String,
    pub class: String,
    pub stacktrace: Vec<String>,
}

impl From<&ExceptionNode> for ExceptionDetail {
    fn from(exception: &ExceptionNode) -> Self {
        ExceptionDetail {
            message: exception.message.clone(),
            class: exception.class_name.clone(),
            stacktrace: format_stack_trace(&exception.stack_trace),
        }
    }
}

pub(crate) fn exception_details<'a>(
    exceptions: impl IntoIterator<Item = &'a ExceptionNode>,
) -> Option<Vec<ExceptionDetail>> {
    let details: Vec<ExceptionDetail> = exceptions.into_iter().map(ExceptionDetail::from).collect();
    if details.is_empty() {
        None
    } else {
        Some(details)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_stack_trace_skips_agent_frames() {
        let frames = vec![
            StackFrame {
                file: "app/views.rs".to_string(),
                line: 12,
                function: "index".to_string(),
            },
            StackFrame {
                file: "vendor/apm_packager/hooks.rs".to_string(),
                line: 40,
                function: "wrapper".to_string(),
            },
            StackFrame {
                file: "app/db.rs".to_string(),
                line: 7,
                function: "query".to_string(),
            },
        ];

        assert_eq!(
            format_stack_trace(&frames),
            vec!["index(app/views.rs:12)", "query(app/db.rs:7)"]
        );
    }

    #[test]
    fn test_no_exceptions_render_to_none() {
        assert_eq!(exception_details(&Vec::<ExceptionNode>::new()), None);
        assert_eq!(exception_details(None::<&ExceptionNode>), None);
    }
}
