use crate::layout::*;
use basalt_matrix::SubMatrixLayout;
use std::fmt;

/// Delivery semantics of a collector. The set is closed; every hook that
/// differs between them is a `match` on this enum.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Contract {
    /// Last value per (symbol, record), conflated per agent.
    Ticker,
    /// Every record, buffered per agent.
    Stream,
    /// Time-series records, delivered from each agent's subscription time on.
    History,
}

impl Contract {
    pub fn has_time(self) -> bool {
        self == Contract::History
    }

    pub fn uses_buffer(self) -> bool {
        self != Contract::Ticker
    }

    pub fn uses_queues(self) -> bool {
        self == Contract::Ticker
    }

    pub fn total_layout(self) -> SubMatrixLayout {
        SubMatrixLayout {
            step: if self.has_time() { TOTAL_TIME_STEP } else { TOTAL_STEP },
            obj_step: 0,
            payload_offset: NEXT_AGENT,
        }
    }

    pub fn agent_layout(self, with_attachment: bool) -> SubMatrixLayout {
        let step = match self {
            Contract::Ticker => TICKER_AGENT_STEP,
            Contract::Stream => STREAM_AGENT_STEP,
            Contract::History => HISTORY_AGENT_STEP,
        };
        SubMatrixLayout {
            step,
            obj_step: usize::from(with_attachment),
            payload_offset: PREV_AGENT,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Contract::Ticker => "Ticker",
            Contract::Stream => "Stream",
            Contract::History => "History",
        }
    }
}

impl fmt::Display for Contract {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rows_fit_their_columns() {
        assert!(Contract::Stream.agent_layout(false).step > PREV_AGENT);
        assert!(Contract::Ticker.agent_layout(false).step > UPDATE_QUEUE);
        assert!(Contract::History.agent_layout(false).step > LAST_RECORD + 1);
        assert!(Contract::History.total_layout().step > TIME_TOTAL + 1);
        assert_eq!(Contract::Ticker.total_layout().step, TOTAL_STEP);
    }

    #[test]
    fn attachment_adds_object_column() {
        assert_eq!(Contract::Stream.agent_layout(true).obj_step, 1);
        assert_eq!(Contract::Stream.agent_layout(false).obj_step, 0);
        assert_eq!(Contract::Ticker.total_layout().obj_step, 0);
    }
}
