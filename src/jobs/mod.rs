//! 后台任务：运行器、事件与恢复目标

pub mod events;
pub mod runner;

pub use events::Event;
pub use runner::{JobHandle, JobRunner, JobStatus};

use crate::core::AgentError;

/// `THREAD[:TURN]` 形式的恢复目标
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResumeTarget {
    pub thread_id: String,
    pub turn: Option<u32>,
}

impl std::str::FromStr for ResumeTarget {
    type Err = AgentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (thread, turn) = match s.rsplit_once(':') {
            Some((thread, turn)) => {
                let turn = turn.parse::<u32>().map_err(|_| {
                    AgentError::Config(format!("invalid turn in resume target: {s}"))
                })?;
                (thread, Some(turn))
            }
            None => (s, None),
        };
        if thread.is_empty() {
            return Err(AgentError::Config("resume target needs a thread id".to_string()));
        }
        Ok(Self {
            thread_id: thread.to_string(),
            turn,
        })
    }
}
