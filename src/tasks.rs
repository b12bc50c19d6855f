//! Bridge to the external task runtime.
//!
//! The orchestration core does not run tasks; it forwards approvals and
//! lifecycle controls, merges the runtime's event stream into the session
//! loop, and recognizes a handful of spoken shortcuts ("approve task",
//! "pause task", …) so hands-free users can steer tasks without the
//! assistant in the loop.

use crate::error::Result;
use crate::messages::{OutboundMessage, TaskSummary};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// A task lifecycle event from the runtime.
#[derive(Debug, Clone)]
pub enum TaskLifecycleEvent {
    Started {
        task_id: String,
        title: String,
    },
    Step {
        task_id: String,
        step_id: String,
        description: String,
        needs_approval: bool,
    },
    Completed {
        task_id: String,
        detail: String,
    },
    Failed {
        task_id: String,
        detail: String,
    },
    Paused {
        task_id: String,
    },
    Resumed {
        task_id: String,
    },
    Cancelled {
        task_id: String,
    },
}

impl TaskLifecycleEvent {
    /// Wire representation for the client.
    pub fn into_outbound(self) -> OutboundMessage {
        match self {
            Self::Started { task_id, title } => OutboundMessage::TaskStarted { task_id, title },
            Self::Step {
                task_id,
                step_id,
                description,
                needs_approval,
            } => OutboundMessage::TaskStep {
                task_id,
                step_id,
                description,
                needs_approval,
            },
            Self::Completed { task_id, detail } => {
                OutboundMessage::TaskCompleted { task_id, detail }
            }
            Self::Failed { task_id, detail } => OutboundMessage::TaskFailed { task_id, detail },
            Self::Paused { task_id } => OutboundMessage::TaskPaused { task_id },
            Self::Resumed { task_id } => OutboundMessage::TaskResumed { task_id },
            Self::Cancelled { task_id } => OutboundMessage::TaskCancelled { task_id },
        }
    }
}

/// Narrow async surface of the external task runtime.
#[async_trait]
pub trait TaskRuntime: Send + Sync {
    /// Approve or deny the pending step of a task. An empty `task_id`
    /// targets the most recent task awaiting approval.
    async fn respond_to_step(&self, session_id: &str, task_id: &str, approved: bool)
        -> Result<()>;

    async fn cancel(&self, session_id: &str, task_id: &str) -> Result<()>;
    async fn pause(&self, session_id: &str, task_id: &str) -> Result<()>;
    async fn resume(&self, session_id: &str, task_id: &str) -> Result<()>;

    /// Subscribe to lifecycle events for a session.
    async fn subscribe(&self, session_id: &str) -> Result<mpsc::Receiver<TaskLifecycleEvent>>;

    /// Current task list, emitted as a snapshot on connect.
    async fn snapshot(&self, session_id: &str) -> Result<Vec<TaskSummary>>;
}

/// A spoken task control recognized in committed text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskVoiceCommand {
    Approve,
    Deny,
    Cancel,
    Pause,
    Resume,
}

/// Recognize spoken task shortcuts like "approve task" or "pause the task".
///
/// Matching is deliberately narrow: the verb must lead the utterance and
/// the word "task" must follow within a few words, so ordinary sentences
/// that merely mention tasks do not trigger controls.
pub fn parse_task_voice_command(text: &str) -> Option<TaskVoiceCommand> {
    let lowered = text.trim().to_lowercase();
    let words: Vec<&str> = lowered
        .split_whitespace()
        .map(|w| w.trim_matches(|c: char| !c.is_alphanumeric()))
        .filter(|w| !w.is_empty())
        .collect();
    if words.len() < 2 || words.len() > 5 {
        return None;
    }

    let command = match words[0] {
        "approve" => TaskVoiceCommand::Approve,
        "deny" | "reject" => TaskVoiceCommand::Deny,
        "cancel" => TaskVoiceCommand::Cancel,
        "pause" => TaskVoiceCommand::Pause,
        "resume" | "continue" => TaskVoiceCommand::Resume,
        _ => return None,
    };
    let mentions_task = words[1..]
        .iter()
        .any(|w| *w == "task" || *w == "tasks" || *w == "step");
    mentions_task.then_some(command)
}

pub mod testing {
    //! In-process task runtime used by the integration suites.

    use super::*;
    use std::sync::Mutex;

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum RecordedControl {
        Respond { approved: bool },
        Cancel,
        Pause,
        Resume,
    }

    /// Records controls and exposes an injectable event channel.
    #[derive(Default)]
    pub struct MockTaskRuntime {
        controls: Mutex<Vec<RecordedControl>>,
        event_tx: Mutex<Option<mpsc::Sender<TaskLifecycleEvent>>>,
        snapshot: Mutex<Vec<TaskSummary>>,
    }

    impl MockTaskRuntime {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_snapshot(tasks: Vec<TaskSummary>) -> Self {
            Self {
                snapshot: Mutex::new(tasks),
                ..Self::default()
            }
        }

        pub fn controls(&self) -> Vec<RecordedControl> {
            self.controls.lock().unwrap_or_else(|e| e.into_inner()).clone()
        }

        /// Inject a lifecycle event into the subscribed session.
        pub async fn emit(&self, event: TaskLifecycleEvent) {
            let tx = {
                let guard = self.event_tx.lock().unwrap_or_else(|e| e.into_inner());
                guard.clone()
            };
            if let Some(tx) = tx {
                let _ = tx.send(event).await;
            }
        }

        fn record(&self, control: RecordedControl) {
            let mut controls = self.controls.lock().unwrap_or_else(|e| e.into_inner());
            controls.push(control);
        }
    }

    #[async_trait]
    impl TaskRuntime for MockTaskRuntime {
        async fn respond_to_step(
            &self,
            _session_id: &str,
            _task_id: &str,
            approved: bool,
        ) -> Result<()> {
            self.record(RecordedControl::Respond { approved });
            Ok(())
        }

        async fn cancel(&self, _session_id: &str, _task_id: &str) -> Result<()> {
            self.record(RecordedControl::Cancel);
            Ok(())
        }

        async fn pause(&self, _session_id: &str, _task_id: &str) -> Result<()> {
            self.record(RecordedControl::Pause);
            Ok(())
        }

        async fn resume(&self, _session_id: &str, _task_id: &str) -> Result<()> {
            self.record(RecordedControl::Resume);
            Ok(())
        }

        async fn subscribe(
            &self,
            _session_id: &str,
        ) -> Result<mpsc::Receiver<TaskLifecycleEvent>> {
            let (tx, rx) = mpsc::channel(16);
            let mut guard = self.event_tx.lock().unwrap_or_else(|e| e.into_inner());
            *guard = Some(tx);
            Ok(rx)
        }

        async fn snapshot(&self, _session_id: &str) -> Result<Vec<TaskSummary>> {
            Ok(self.snapshot.lock().unwrap_or_else(|e| e.into_inner()).clone())
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use super::*;

    #[test]
    fn voice_commands_parse() {
        assert_eq!(
            parse_task_voice_command("approve task"),
            Some(TaskVoiceCommand::Approve)
        );
        assert_eq!(
            parse_task_voice_command("Deny the task."),
            Some(TaskVoiceCommand::Deny)
        );
        assert_eq!(
            parse_task_voice_command("pause that task"),
            Some(TaskVoiceCommand::Pause)
        );
        assert_eq!(
            parse_task_voice_command("resume the task please"),
            Some(TaskVoiceCommand::Resume)
        );
        assert_eq!(
            parse_task_voice_command("cancel task"),
            Some(TaskVoiceCommand::Cancel)
        );
    }

    #[test]
    fn ordinary_sentences_do_not_trigger() {
        assert!(parse_task_voice_command("approve of my plan").is_none());
        assert!(parse_task_voice_command("what tasks are running").is_none());
        assert!(parse_task_voice_command(
            "cancel the meeting and then create a task for tomorrow about it"
        )
        .is_none());
        assert!(parse_task_voice_command("task").is_none());
    }

    #[test]
    fn lifecycle_events_map_to_outbound() {
        let event = TaskLifecycleEvent::Step {
            task_id: "t1".to_owned(),
            step_id: "s1".to_owned(),
            description: "delete branch".to_owned(),
            needs_approval: true,
        };
        let outbound = event.into_outbound();
        assert_eq!(outbound.kind(), "task_step");
        assert!(outbound.is_critical());
    }
}
