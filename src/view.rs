//! client-visible mirror of a session's conversation.

use bevy::prelude::*;

use crate::{Fragment, MessageId, PurchaseForm, Role, StockQuote, Trend, UiPhase, UiState, clamp_shares};

#[derive(Debug, Clone, PartialEq)]
pub enum EntryStatus {
    Streaming,
    Done,
    Failed(String),
}

impl From<&UiPhase> for EntryStatus {
    fn from(phase: &UiPhase) -> Self {
        match phase {
            UiPhase::Streaming => EntryStatus::Streaming,
            UiPhase::Done => EntryStatus::Done,
            UiPhase::Failed(err) => EntryStatus::Failed(err.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TranscriptEntry {
    pub id: MessageId,
    pub role: Role,
    pub fragment: Option<Fragment>,
    pub status: EntryStatus,
}

/// rendered entries in completion order, plus how many turns are still
/// waiting on the model.
#[derive(Component, Debug, Default, Clone)]
pub struct Transcript {
    entries: Vec<TranscriptEntry>,
    waiting: usize,
}

impl Transcript {
    pub fn entries(&self) -> &[TranscriptEntry] {
        &self.entries
    }

    pub fn get(&self, id: MessageId) -> Option<&TranscriptEntry> {
        self.entries.iter().find(|e| e.id == id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn waiting(&self) -> usize {
        self.waiting
    }

    pub fn push_user(&mut self, text: impl Into<String>) -> MessageId {
        let id = MessageId::new();
        self.entries.push(TranscriptEntry {
            id,
            role: Role::User,
            fragment: Some(Fragment::UserText(text.into())),
            status: EntryStatus::Done,
        });
        id
    }

    pub(crate) fn begin_wait(&mut self) {
        self.waiting += 1;
    }

    pub(crate) fn end_wait(&mut self) {
        self.waiting = self.waiting.saturating_sub(1);
    }

    /// replaces the entry with `id`, or appends it.
    pub fn upsert(&mut self, id: MessageId, role: Role, state: &UiState) {
        if !self.apply(id, state) {
            self.entries.push(TranscriptEntry {
                id,
                role,
                fragment: state.fragment.clone(),
                status: EntryStatus::from(&state.phase),
            });
        }
    }

    /// applies a streamed state to an existing entry. a state without a
    /// fragment keeps the last one on screen.
    pub fn apply(&mut self, id: MessageId, state: &UiState) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.id == id) else {
            return false;
        };
        if let Some(fragment) = &state.fragment {
            entry.fragment = Some(fragment.clone());
        }
        entry.status = EntryStatus::from(&state.phase);
        true
    }

    /// moves the share slider of a purchase form in place.
    pub fn set_shares(&mut self, id: MessageId, shares: u32) -> Option<PurchaseForm> {
        let entry = self.entries.iter_mut().find(|e| e.id == id)?;
        let Some(Fragment::Purchase(form)) = &mut entry.fragment else {
            return None;
        };
        form.shares = clamp_shares(shares);
        Some(form.clone())
    }

    pub fn latest_purchase_form(&self) -> Option<(MessageId, &PurchaseForm)> {
        self.entries.iter().rev().find_map(|e| match &e.fragment {
            Some(Fragment::Purchase(form)) => Some((e.id, form)),
            _ => None,
        })
    }

    pub fn latest_stocks(&self) -> Option<&[StockQuote]> {
        self.entries.iter().rev().find_map(|e| match &e.fragment {
            Some(Fragment::Stocks(quotes)) => Some(quotes.as_slice()),
            _ => None,
        })
    }

    /// plain-text rendering of the whole conversation.
    pub fn render_text(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            let Some(fragment) = &entry.fragment else { continue };
            let who = match entry.role {
                Role::User => "user",
                Role::Assistant => "assistant",
                Role::System => "system",
            };
            out.push_str(who);
            out.push_str(": ");
            out.push_str(&fragment.render_text());
            if let EntryStatus::Failed(err) = &entry.status {
                out.push_str(" [error: ");
                out.push_str(err);
                out.push(']');
            }
            out.push('\n');
        }
        if self.waiting > 0 {
            out.push_str("assistant: ");
            out.push_str(&Fragment::Spinner.render_text());
            out.push('\n');
        }
        out
    }
}

pub fn trend_color(trend: Trend) -> Color {
    match trend {
        Trend::Up => Color::srgb_u8(22, 163, 74),
        Trend::Down => Color::srgb_u8(220, 38, 38),
    }
}

/// text color for an entry: quotes take their trend color.
pub fn entry_color(entry: &TranscriptEntry) -> Color {
    match (&entry.status, &entry.fragment) {
        (EntryStatus::Failed(_), _) => Color::srgb_u8(220, 38, 38),
        (_, Some(Fragment::Stock(quote))) => trend_color(quote.trend()),
        (_, Some(Fragment::Purchase(_))) => Color::srgb_u8(74, 222, 128),
        (_, Some(f)) if f.is_placeholder() => Color::srgb_u8(161, 161, 170),
        _ if entry.role == Role::User => Color::WHITE,
        _ => Color::srgb_u8(212, 212, 216),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ConversationError;
    use pretty_assertions::assert_eq;

    fn state(fragment: Option<Fragment>, phase: UiPhase) -> UiState {
        UiState { fragment, phase }
    }

    #[test]
    fn upsert_then_apply_updates_in_place() {
        let mut transcript = Transcript::default();
        transcript.push_user("hi");
        let id = MessageId::new();

        transcript.upsert(id, Role::Assistant, &state(Some(Fragment::Text("he".into())), UiPhase::Streaming));
        transcript.apply(id, &state(Some(Fragment::Text("hello".into())), UiPhase::Done));

        assert_eq!(transcript.entries().len(), 2);
        let entry = transcript.get(id).unwrap();
        assert_eq!(entry.fragment, Some(Fragment::Text("hello".into())));
        assert_eq!(entry.status, EntryStatus::Done);
        assert_eq!(transcript.render_text(), "user: hi\nassistant: hello\n");
    }

    #[test]
    fn failure_keeps_fragment_and_reports() {
        let mut transcript = Transcript::default();
        let id = MessageId::new();
        transcript.upsert(id, Role::Assistant, &state(Some(Fragment::Text("half".into())), UiPhase::Streaming));
        transcript.apply(
            id,
            &state(None, UiPhase::Failed(ConversationError::Stream("reset".into()))),
        );
        assert_eq!(
            transcript.render_text(),
            "assistant: half [error: model stream failed: reset]\n"
        );
        assert_eq!(entry_color(transcript.get(id).unwrap()), Color::srgb_u8(220, 38, 38));
    }

    #[test]
    fn waiting_turns_render_a_spinner() {
        let mut transcript = Transcript::default();
        transcript.push_user("What are the trending stocks?");
        transcript.begin_wait();
        assert_eq!(
            transcript.render_text(),
            "user: What are the trending stocks?\nassistant: ...\n"
        );
        transcript.end_wait();
        transcript.end_wait();
        assert_eq!(transcript.waiting(), 0);
    }

    #[test]
    fn share_slider_moves_latest_form() {
        let mut transcript = Transcript::default();
        let id = MessageId::new();
        let form = PurchaseForm::new("MSFT", 300.0, None);
        transcript.upsert(id, Role::Assistant, &state(Some(Fragment::Purchase(form)), UiPhase::Done));

        let moved = transcript.set_shares(id, 2000).unwrap();
        assert_eq!(moved.shares, 1000);
        let (latest, form) = transcript.latest_purchase_form().unwrap();
        assert_eq!(latest, id);
        assert_eq!(form.shares, 1000);

        let user = transcript.push_user("x");
        assert_eq!(transcript.set_shares(user, 20), None);
    }

    #[test]
    fn quotes_are_colored_by_trend() {
        let up = TranscriptEntry {
            id: MessageId::new(),
            role: Role::Assistant,
            fragment: Some(Fragment::Stock(StockQuote::new("AAPL", 180.0, 2.0))),
            status: EntryStatus::Done,
        };
        assert_eq!(entry_color(&up), trend_color(Trend::Up));
        let down = TranscriptEntry {
            fragment: Some(Fragment::Stock(StockQuote::new("MSFT", 300.0, -1.0))),
            ..up
        };
        assert_eq!(entry_color(&down), trend_color(Trend::Down));
    }
}
