//! progressively-updating fragments.
//!
//! a `StreamableUi` is the single writer; any number of `UiValue` handles
//! observe it. the value moves through `Streaming` (any number of updates) and
//! ends in exactly one of `Done` or `Failed`. writes after that are rejected.

use std::sync::Arc;

use tokio::sync::watch;

use crate::{ConversationError, Fragment};

#[derive(Debug, Clone, PartialEq)]
pub enum UiPhase {
    Streaming,
    Done,
    Failed(ConversationError),
}

#[derive(Debug, Clone, PartialEq)]
pub struct UiState {
    pub fragment: Option<Fragment>,
    pub phase: UiPhase,
}

impl UiState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self.phase, UiPhase::Streaming)
    }
}

/// write side of a streamed fragment.
#[derive(Clone)]
pub struct StreamableUi {
    tx: Arc<watch::Sender<UiState>>,
}

impl StreamableUi {
    pub fn new(initial: Option<Fragment>) -> Self {
        let (tx, _) = watch::channel(UiState {
            fragment: initial,
            phase: UiPhase::Streaming,
        });
        Self { tx: Arc::new(tx) }
    }

    pub fn value(&self) -> UiValue {
        UiValue { rx: self.tx.subscribe() }
    }

    pub fn update(&self, fragment: Fragment) -> Result<(), ConversationError> {
        self.transition(Some(fragment), UiPhase::Streaming)
    }

    pub fn done(&self, fragment: Fragment) -> Result<(), ConversationError> {
        self.transition(Some(fragment), UiPhase::Done)
    }

    /// keeps the last fragment visible and marks the value failed.
    pub fn fail(&self, error: ConversationError) -> Result<(), ConversationError> {
        self.transition(None, UiPhase::Failed(error))
    }

    fn transition(&self, fragment: Option<Fragment>, phase: UiPhase) -> Result<(), ConversationError> {
        let mut result = Ok(());
        self.tx.send_if_modified(|state| {
            if state.is_terminal() {
                result = Err(ConversationError::AlreadyDone);
                return false;
            }
            if fragment.is_some() {
                state.fragment = fragment;
            }
            state.phase = phase;
            true
        });
        result
    }
}

/// read side of a streamed fragment. cheap to clone; each clone tracks its own
/// "seen" position.
#[derive(Debug, Clone)]
pub struct UiValue {
    rx: watch::Receiver<UiState>,
}

impl UiValue {
    pub fn current(&self) -> UiState {
        self.rx.borrow().clone()
    }

    pub fn fragment(&self) -> Option<Fragment> {
        self.rx.borrow().fragment.clone()
    }

    pub fn is_done(&self) -> bool {
        matches!(self.rx.borrow().phase, UiPhase::Done)
    }

    /// waits for the next state this handle has not seen yet.
    ///
    /// returns `None` once the writer is gone and nothing new is pending.
    pub async fn changed(&mut self) -> Option<UiState> {
        self.rx.changed().await.ok()?;
        Some(self.rx.borrow_and_update().clone())
    }

    /// resolves with the final fragment once the value is done.
    pub async fn settled(mut self) -> Result<Fragment, ConversationError> {
        loop {
            let state = self.rx.borrow_and_update().clone();
            match state.phase {
                UiPhase::Done => return state.fragment.ok_or(ConversationError::Abandoned),
                UiPhase::Failed(err) => return Err(err),
                UiPhase::Streaming => {
                    if self.rx.changed().await.is_err() {
                        return Err(ConversationError::Abandoned);
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn observers_see_updates_then_done() {
        let ui = StreamableUi::new(Some(Fragment::Spinner));
        let mut value = ui.value();
        assert_eq!(value.fragment(), Some(Fragment::Spinner));

        ui.update(Fragment::Text("hel".into())).unwrap();
        let state = value.changed().await.unwrap();
        assert_eq!(state.fragment, Some(Fragment::Text("hel".into())));
        assert_eq!(state.phase, UiPhase::Streaming);

        ui.done(Fragment::Text("hello".into())).unwrap();
        assert!(value.is_done());
        assert_eq!(value.settled().await, Ok(Fragment::Text("hello".into())));
    }

    #[tokio::test]
    async fn writes_after_done_are_rejected() {
        let ui = StreamableUi::new(None);
        ui.done(Fragment::Notice("ok".into())).unwrap();
        assert_eq!(ui.update(Fragment::Spinner), Err(ConversationError::AlreadyDone));
        assert_eq!(ui.done(Fragment::Spinner), Err(ConversationError::AlreadyDone));
        assert_eq!(ui.value().fragment(), Some(Fragment::Notice("ok".into())));
    }

    #[tokio::test]
    async fn failure_keeps_last_fragment() {
        let ui = StreamableUi::new(Some(Fragment::Spinner));
        let value = ui.value();
        ui.update(Fragment::Text("partial".into())).unwrap();
        ui.fail(ConversationError::Stream("reset".into())).unwrap();

        assert_eq!(value.fragment(), Some(Fragment::Text("partial".into())));
        assert_eq!(
            value.settled().await,
            Err(ConversationError::Stream("reset".into()))
        );
    }

    #[tokio::test]
    async fn dropped_writer_abandons_value() {
        let ui = StreamableUi::new(Some(Fragment::Spinner));
        let value = ui.value();
        drop(ui);
        assert_eq!(value.settled().await, Err(ConversationError::Abandoned));
    }
}
