use std::collections::VecDeque;

use super::StateMachine;
use crate::peer::{CallbackData, CloseCode};

/// Outbound callback queue of a single peer.
///
/// Callbacks drain in enqueue order, all pending items at once. A close code takes priority over
/// pending callbacks and is reported exactly once; after that the queue accepts nothing.
#[derive(Debug, Default)]
pub struct CallbackQueueMachine {
    pending_callbacks: VecDeque<CallbackData>,
    close_code: Option<CloseCode>,
    close_reported: bool,
}

impl CallbackQueueMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending_callbacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending_callbacks.is_empty()
    }

    pub fn close_code(&self) -> Option<CloseCode> {
        self.close_code
    }

    fn enqueue(&mut self, callback: CallbackData) {
        if self.close_code.is_none() {
            self.pending_callbacks.push_back(callback);
        }
    }

    fn close(&mut self, code: CloseCode) {
        // The first close wins, a later eviction must not rewrite the reason.
        if self.close_code.is_none() {
            self.close_code = Some(code);
            self.pending_callbacks.clear();
        }
    }

    fn poll_close(&mut self) -> Option<CloseCode> {
        match self.close_code {
            Some(code) if !self.close_reported => {
                self.close_reported = true;
                Some(code)
            }
            _ => None,
        }
    }

    fn drain(&mut self) -> Option<Vec<CallbackData>> {
        if self.pending_callbacks.is_empty() {
            None
        } else {
            Some(self.pending_callbacks.drain(..).collect())
        }
    }
}

pub enum CallbackInput {
    Enqueue(CallbackData),
    Close(CloseCode),
}

#[derive(Debug)]
pub enum CallbackOutput {
    Closed(CloseCode),
    Batch(Vec<CallbackData>),
}

impl StateMachine for CallbackQueueMachine {
    type Input = CallbackInput;
    type Output = CallbackOutput;

    fn process_input(&mut self, input: Self::Input) {
        match input {
            CallbackInput::Enqueue(callback) => self.enqueue(callback),
            CallbackInput::Close(code) => self.close(code),
        }
    }

    fn poll_output(&mut self) -> Option<Self::Output> {
        if let Some(code) = self.poll_close() {
            return Some(CallbackOutput::Closed(code));
        }

        self.drain().map(CallbackOutput::Batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn callback(method: &str) -> CallbackData {
        CallbackData::new("Ticker", method, vec![method.to_lowercase()])
    }

    #[test]
    fn test_enqueue_and_drain_in_order() {
        let mut machine = CallbackQueueMachine::new();
        assert!(machine.is_empty());

        machine.process_input(CallbackInput::Enqueue(callback("A")));
        machine.process_input(CallbackInput::Enqueue(callback("B")));
        assert_eq!(machine.pending_count(), 2);

        let output = machine.poll_output();
        let Some(CallbackOutput::Batch(batch)) = output else {
            panic!("expected a batch, got {output:?}");
        };
        let names: Vec<_> = batch.iter().map(|c| c.method_name()).collect();
        assert_eq!(names, ["A", "B"]);

        assert!(machine.poll_output().is_none());
        assert!(machine.is_empty());
    }

    #[test]
    fn test_empty_poll_returns_none() {
        let mut machine = CallbackQueueMachine::new();
        assert!(machine.poll_output().is_none());
    }

    #[test]
    fn test_close_takes_priority_and_is_reported_once() {
        let mut machine = CallbackQueueMachine::new();
        machine.process_input(CallbackInput::Enqueue(callback("A")));
        machine.process_input(CallbackInput::Close(CloseCode::EXPIRED));

        assert!(matches!(
            machine.poll_output(),
            Some(CallbackOutput::Closed(CloseCode::EXPIRED))
        ));
        assert!(machine.poll_output().is_none());

        // Nothing is accepted after close.
        machine.process_input(CallbackInput::Enqueue(callback("B")));
        assert!(machine.poll_output().is_none());
    }

    #[test]
    fn test_first_close_code_wins() {
        let mut machine = CallbackQueueMachine::new();
        machine.process_input(CallbackInput::Close(CloseCode::GRACEFUL));
        machine.process_input(CallbackInput::Close(CloseCode::FAULTED));

        assert_eq!(machine.close_code(), Some(CloseCode::GRACEFUL));
    }
}
