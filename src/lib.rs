//! bevy_stockbot: a stock-trading chat assistant as a bevy plugin.
//!
//! - `Stockbot` owns one session: the server-side history, a fifo turn queue
//!   and the tool table (`list_stocks`, `show_stock_price`,
//!   `show_stock_purchase_ui`).
//! - every assistant reply is a fragment that keeps updating after the turn
//!   returns: streamed text grows in place, tool calls go skeleton -> final.
//! - purchases run on a simulated timeline and write one system record into
//!   the history the model reads back.
//! - never blocks the main thread: turns run on a tiny tokio runtime and report
//!   back through a bounded inbox drained once per frame.
//!
//! api docs (types & traits): https://docs.rs/llm
//!   - chat provider:             `llm::chat::ChatProvider`
//!   - streaming:                 `llm::chat::{StreamResponse, StreamChoice, StreamDelta}`
//!   - tools / tool calls:        `llm::builder::FunctionBuilder`, `llm::ToolCall`

use bevy::prelude::*;
use flume::{Receiver, Sender, TryRecvError};
use std::sync::Arc;

mod config;
mod conversation;
mod error;
pub mod format;
mod fragment;
mod history;
pub mod model;
mod stream;
mod tools;
mod view;

pub use config::{DEFAULT_BASE_URL, DEFAULT_MODEL, DEFAULT_TEMPERATURE, Latency, StockbotConfig, normalize_oai_base};
pub use conversation::{
    ClientMessage, EXAMPLE_PROMPTS, MessageId, PurchaseConfirmation, SYSTEM_PROMPT, Stockbot, purchase_record,
    share_change_record,
};
pub use error::ConversationError;
pub use fragment::{
    DEFAULT_SHARES, Fragment, MAX_SHARES, MIN_SHARES, PurchaseForm, PurchaseStage, StockQuote, Trend, clamp_shares,
};
pub use history::{History, Role, ServerMessage};
pub use model::{ChatModel, LlmChatModel, ModelRequest, ModelResponse, Script, ScriptedModel, ToolInvocation};
pub use stream::{StreamableUi, UiPhase, UiState, UiValue};
pub use tools::{Staged, ToolArgs, ToolName, ToolRegistry, ToolSpec};
pub use view::{EntryStatus, Transcript, TranscriptEntry, entry_color, trend_color};

/// re-export the llm types so downstream code can use the same structs/enums.
pub use llm::{
    builder::{FunctionBuilder, LLMBackend, LLMBuilder},
    chat::{ChatMessage, ChatProvider, ChatRole, StreamChoice, StreamDelta, StreamResponse},
    error::LLMError,
    LLMProvider,
    ToolCall,
};

/// we keep a tiny tokio runtime to drive turns, tool timers and purchases.
#[derive(Resource, Clone)]
pub struct TokioRt(pub Arc<tokio::runtime::Runtime>);

impl Default for TokioRt {
    fn default() -> Self {
        info!(target: "bevy_stockbot", "StockbotPlugin: initializing Tokio multi-thread runtime");
        let rt = tokio::runtime::Builder::new_multi_thread()
            .enable_all()
            .build()
            .expect("tokio runtime");
        Self(Arc::new(rt))
    }
}

/// system ordering so uis can run after we emit events
#[derive(SystemSet, Debug, Hash, PartialEq, Eq, Clone)]
pub enum StockbotSet {
    /// fragment/purchase/error events are emitted here (in `Update`)
    Drain,
}

/// attach this to an entity that holds one conversation.
#[derive(Component, Clone)]
#[require(Transcript)]
pub struct StockSession {
    pub bot: Stockbot,
}

impl StockSession {
    pub fn new(bot: Stockbot) -> Self {
        Self { bot }
    }
}

/// insert this component to run a turn for the session entity.
#[derive(Component, Clone, Debug)]
pub struct PromptRequest {
    pub text: String,
}

/// insert this component to confirm a purchase for the session entity.
#[derive(Component, Clone, Debug)]
pub struct PurchaseRequest {
    pub symbol: String,
    pub price: f64,
    pub shares: u32,
    /// the purchase form entry the progress replaces, if any
    pub form: Option<MessageId>,
}

/// helper to enqueue a user prompt on a session entity.
pub fn send_user_text(commands: &mut Commands, target: Entity, text: impl Into<String>) {
    let text = text.into();
    info!(target: "bevy_stockbot", "send_user_text -> '{}' (len={})", text, text.len());
    commands.entity(target).insert(PromptRequest { text });
}

/// helper to enqueue a purchase of `form` on a session entity.
pub fn request_purchase(commands: &mut Commands, target: Entity, form: &PurchaseForm, form_id: Option<MessageId>) {
    info!(target: "bevy_stockbot", "request_purchase -> {} x {} @ {}", form.shares, form.symbol, form.price);
    commands.entity(target).insert(PurchaseRequest {
        symbol: form.symbol.clone(),
        price: form.price,
        shares: form.shares,
        form: form_id,
    });
}

/// events emitted by the plugin while turns and purchases progress.
#[derive(Event, Debug)]
pub struct TurnStarted {
    pub entity: Entity,
}
#[derive(Event, Debug, Clone)]
pub struct FragmentEvt {
    pub entity: Entity,
    pub id: MessageId,
    /// latest fragment; `None` while a message has nothing to show yet.
    pub fragment: Option<Fragment>,
    pub done: bool,
}
#[derive(Event, Debug)]
pub struct PurchaseSettled {
    pub entity: Entity,
    pub symbol: String,
    pub shares: u32,
}
#[derive(Event, Debug)]
pub struct ChatErrorEvt {
    pub entity: Entity,
    pub error: String,
}

/// cross-thread inbox for streaming; producers send, main thread drains.
/// bounded to avoid unbounded growth when the frame stalls briefly.
#[derive(Resource, Clone)]
struct StreamInbox {
    tx: Sender<StreamMsg>,
    rx: Receiver<StreamMsg>,
}

impl Default for StreamInbox {
    fn default() -> Self {
        let (tx, rx) = flume::bounded(2048);
        Self { tx, rx }
    }
}

#[derive(Debug)]
enum StreamMsg {
    /// first state of a message; `answers_turn` settles a waiting prompt.
    Begin { entity: Entity, id: MessageId, role: Role, state: UiState, answers_turn: bool },
    Update { entity: Entity, id: MessageId, state: UiState },
    Purchased { entity: Entity, symbol: String, shares: u32 },
    Err { entity: Entity, error: String, answers_turn: bool },
}

/// send to inbox (ignore full/disconnected)
fn push_inbox(tx: &Sender<StreamMsg>, msg: StreamMsg) {
    let _ = tx.send(msg);
}

/// relays every state after `first` until the value settles.
async fn forward(tx: &Sender<StreamMsg>, entity: Entity, id: MessageId, mut value: UiValue, first: &UiState) {
    if first.is_terminal() {
        return;
    }
    while let Some(state) = value.changed().await {
        let terminal = state.is_terminal();
        push_inbox(tx, StreamMsg::Update { entity, id, state });
        if terminal {
            return;
        }
    }
    warn!(target: "bevy_stockbot", "fragment {} abandoned before settling", id);
    let state = UiState { fragment: None, phase: UiPhase::Failed(ConversationError::Abandoned) };
    push_inbox(tx, StreamMsg::Update { entity, id, state });
}

/// bevy plugin: wires systems, events, resources.
/// inserts a tiny tokio runtime resource unless the app already has one.
pub struct StockbotPlugin;

impl Plugin for StockbotPlugin {
    fn build(&self, app: &mut App) {
        info!(target: "bevy_stockbot", "StockbotPlugin: build()");
        app.init_resource::<StreamInbox>()
            .add_event::<TurnStarted>()
            .add_event::<FragmentEvt>()
            .add_event::<PurchaseSettled>()
            .add_event::<ChatErrorEvt>()
            // write + read events in the same schedule (Update)
            .configure_sets(Update, StockbotSet::Drain)
            .add_systems(Update, drain_stream_inbox.in_set(StockbotSet::Drain))
            // spawn requests in Update; work continues on tokio
            .add_systems(Update, (spawn_prompt_requests, spawn_purchase_requests).before(StockbotSet::Drain));

        if app.world().get_resource::<TokioRt>().is_none() {
            app.insert_resource(TokioRt::default());
        }
    }
}

/// starts one turn per pending prompt.
fn spawn_prompt_requests(
    mut commands: Commands,
    inbox: Res<StreamInbox>,
    rt: Res<TokioRt>,
    mut q: Query<(Entity, &StockSession, &PromptRequest, &mut Transcript)>,
    mut ev_start: EventWriter<TurnStarted>,
) {
    for (e, session, req, mut transcript) in q.iter_mut() {
        info!(target: "bevy_stockbot", "spawn_prompt_requests: entity={:?} len={}", e, req.text.len());

        // one-shot marker removal
        commands.entity(e).remove::<PromptRequest>();
        transcript.push_user(req.text.clone());
        transcript.begin_wait();
        ev_start.write(TurnStarted { entity: e });

        let bot = session.bot.clone();
        let tx = inbox.tx.clone();
        let text = req.text.clone();
        rt.0.spawn(async move {
            match bot.continue_conversation(text).await {
                Ok(ClientMessage { id, role, display }) => {
                    let state = display.current();
                    push_inbox(&tx, StreamMsg::Begin { entity: e, id, role, state: state.clone(), answers_turn: true });
                    forward(&tx, e, id, display, &state).await;
                }
                Err(err) => {
                    error!(target: "bevy_stockbot", "turn error: {}", err);
                    push_inbox(&tx, StreamMsg::Err { entity: e, error: err.to_string(), answers_turn: true });
                }
            }
        });
    }
}

/// starts one simulated purchase per pending request.
fn spawn_purchase_requests(
    mut commands: Commands,
    inbox: Res<StreamInbox>,
    rt: Res<TokioRt>,
    q: Query<(Entity, &StockSession, &PurchaseRequest)>,
) {
    for (e, session, req) in q.iter() {
        info!(target: "bevy_stockbot", "spawn_purchase_requests: entity={:?} {} x {}", e, req.shares, req.symbol);
        commands.entity(e).remove::<PurchaseRequest>();

        let bot = session.bot.clone();
        let tx = inbox.tx.clone();
        let req = req.clone();
        rt.0.spawn(async move {
            let confirmation = match bot.confirm_purchase(req.symbol.clone(), req.price, req.shares).await {
                Ok(confirmation) => confirmation,
                Err(err) => {
                    error!(target: "bevy_stockbot", "purchase error: {}", err);
                    push_inbox(&tx, StreamMsg::Err { entity: e, error: err.to_string(), answers_turn: false });
                    return;
                }
            };
            let PurchaseConfirmation { purchasing_ui, new_message, task } = confirmation;

            let purchasing_id = req.form.unwrap_or_default();
            let purchasing = purchasing_ui.current();
            push_inbox(&tx, StreamMsg::Begin {
                entity: e,
                id: purchasing_id,
                role: Role::Assistant,
                state: purchasing.clone(),
                answers_turn: false,
            });
            let notice = new_message.display.current();
            push_inbox(&tx, StreamMsg::Begin {
                entity: e,
                id: new_message.id,
                role: new_message.role,
                state: notice.clone(),
                answers_turn: false,
            });

            futures_lite::future::zip(
                forward(&tx, e, purchasing_id, purchasing_ui, &purchasing),
                forward(&tx, e, new_message.id, new_message.display, &notice),
            )
            .await;

            match task.await.map_err(|_| ConversationError::Abandoned).and_then(|r| r) {
                Ok(()) => push_inbox(&tx, StreamMsg::Purchased { entity: e, symbol: req.symbol, shares: req.shares }),
                Err(err) => push_inbox(&tx, StreamMsg::Err { entity: e, error: err.to_string(), answers_turn: false }),
            }
        });
    }
}

/// drains the inbox into each session's transcript and emits user-facing events.
fn drain_stream_inbox(
    inbox: Res<StreamInbox>,
    mut q: Query<&mut Transcript>,
    mut ev_frag: EventWriter<FragmentEvt>,
    mut ev_purchase: EventWriter<PurchaseSettled>,
    mut ev_err: EventWriter<ChatErrorEvt>,
) {
    // drain up to a cap per frame to avoid long frames on bursty streams
    const MAX_PER_FRAME: usize = 512;
    let mut drained = Vec::with_capacity(64);
    for _ in 0..MAX_PER_FRAME {
        match inbox.rx.try_recv() {
            Ok(m) => drained.push(m),
            Err(TryRecvError::Empty) => break,
            Err(TryRecvError::Disconnected) => break,
        }
    }
    if drained.is_empty() {
        return;
    }

    for msg in drained {
        match msg {
            StreamMsg::Begin { entity, id, role, state, answers_turn } => {
                if let Ok(mut transcript) = q.get_mut(entity) {
                    if answers_turn {
                        transcript.end_wait();
                    }
                    transcript.upsert(id, role, &state);
                }
                emit_state(entity, id, state, &mut ev_frag, &mut ev_err);
            }
            StreamMsg::Update { entity, id, state } => {
                if let Ok(mut transcript) = q.get_mut(entity)
                    && !transcript.apply(id, &state)
                {
                    debug!(target: "bevy_stockbot", "update for unknown message {}", id);
                }
                emit_state(entity, id, state, &mut ev_frag, &mut ev_err);
            }
            StreamMsg::Purchased { entity, symbol, shares } => {
                ev_purchase.write(PurchaseSettled { entity, symbol, shares });
            }
            StreamMsg::Err { entity, error, answers_turn } => {
                if answers_turn && let Ok(mut transcript) = q.get_mut(entity) {
                    transcript.end_wait();
                }
                ev_err.write(ChatErrorEvt { entity, error });
            }
        }
    }
}

fn emit_state(
    entity: Entity,
    id: MessageId,
    state: UiState,
    ev_frag: &mut EventWriter<FragmentEvt>,
    ev_err: &mut EventWriter<ChatErrorEvt>,
) {
    let done = state.is_terminal();
    if let UiPhase::Failed(err) = &state.phase {
        ev_err.write(ChatErrorEvt { entity, error: err.to_string() });
    }
    ev_frag.write(FragmentEvt { entity, id, fragment: state.fragment, done });
}

#[cfg(test)]
mod tests {
    use super::*;
    use bevy::app::AppExit;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::time::Duration;

    fn scripted_bot(scripts: Vec<Script>) -> Stockbot {
        let config = StockbotConfig::default().with_latency(Latency::instant());
        Stockbot::new(Arc::new(ScriptedModel::new(scripts)), &config)
    }

    fn app_with_session(scripts: Vec<Script>) -> (App, Entity) {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_event::<AppExit>();
        app.add_plugins(StockbotPlugin);
        let e = app.world_mut().spawn(StockSession::new(scripted_bot(scripts))).id();
        (app, e)
    }

    /// ticks the app until `done` holds or the attempts run out.
    fn run_until(app: &mut App, e: Entity, done: impl Fn(&Transcript) -> bool) -> bool {
        for _ in 0..500 {
            app.update();
            if app.world().entity(e).get::<Transcript>().is_some_and(&done) {
                return true;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        false
    }

    #[test]
    fn attach_request_via_send_user_text() {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_event::<AppExit>();

        let e = app.world_mut().spawn(StockSession::new(scripted_bot(Vec::new()))).id();
        assert!(app.world().entity(e).get::<Transcript>().is_some());

        {
            let mut commands = app.world_mut().commands();
            super::send_user_text(&mut commands, e, "hello world");
        }
        app.world_mut().flush();

        let req = app.world().entity(e).get::<PromptRequest>().expect("PromptRequest exists");
        assert_eq!(req.text, "hello world");
    }

    #[test]
    fn drain_applies_states_and_emits_events() {
        let mut app = App::new();
        app.add_plugins(MinimalPlugins);
        app.add_event::<FragmentEvt>();
        app.add_event::<PurchaseSettled>();
        app.add_event::<ChatErrorEvt>();
        app.insert_resource(StreamInbox::default());
        app.add_systems(Update, super::drain_stream_inbox);

        let e = app.world_mut().spawn(Transcript::default()).id();
        {
            let mut entity = app.world_mut().entity_mut(e);
            entity.get_mut::<Transcript>().unwrap().begin_wait();
        }
        let id = MessageId::new();

        {
            let tx = app.world().resource::<StreamInbox>().tx.clone();
            let state = |text: &str, phase| UiState { fragment: Some(Fragment::Text(text.into())), phase };
            tx.send(StreamMsg::Begin {
                entity: e,
                id,
                role: Role::Assistant,
                state: state("hi", UiPhase::Streaming),
                answers_turn: true,
            })
            .unwrap();
            tx.send(StreamMsg::Update { entity: e, id, state: state("hi there", UiPhase::Done) }).unwrap();
        }

        app.update();

        let transcript = app.world().entity(e).get::<Transcript>().unwrap();
        assert_eq!(transcript.waiting(), 0);
        let entry = transcript.get(id).unwrap();
        assert_eq!(entry.fragment, Some(Fragment::Text("hi there".into())));
        assert_eq!(entry.status, EntryStatus::Done);

        {
            let mut ev = app.world_mut().resource_mut::<Events<FragmentEvt>>();
            let frags: Vec<_> = ev.drain().collect();
            assert_eq!(frags.len(), 2);
            assert!(!frags[0].done);
            assert!(frags[1].done);
        }
        {
            let mut ev = app.world_mut().resource_mut::<Events<ChatErrorEvt>>();
            let errs: Vec<_> = ev.drain().collect();
            assert!(errs.is_empty(), "no errors expected");
        }
    }

    #[test]
    fn prompt_streams_into_transcript() {
        let (mut app, e) = app_with_session(vec![Script::text(["Hello", ", trader"])]);
        {
            let mut commands = app.world_mut().commands();
            send_user_text(&mut commands, e, "hi");
        }
        app.world_mut().flush();

        let settled = run_until(&mut app, e, |t| {
            t.waiting() == 0 && t.entries().len() == 2 && t.entries()[1].status == EntryStatus::Done
        });
        assert!(settled, "turn never settled");

        let transcript = app.world().entity(e).get::<Transcript>().unwrap();
        assert_eq!(transcript.render_text(), "user: hi\nassistant: Hello, trader\n");
        assert!(app.world().entity(e).get::<PromptRequest>().is_none());
    }

    #[test]
    fn tool_turn_ends_on_final_fragment() {
        let stocks = json!({ "stocks": [
            { "symbol": "AAPL", "price": 180.25, "delta": 2.5 },
            { "symbol": "MSFT", "price": 300.0, "delta": -1.0 },
        ]});
        let (mut app, e) = app_with_session(vec![Script::tool("list_stocks", stocks)]);
        {
            let mut commands = app.world_mut().commands();
            send_user_text(&mut commands, e, "What are the trending stocks?");
        }
        app.world_mut().flush();

        let settled = run_until(&mut app, e, |t| t.latest_stocks().is_some());
        assert!(settled, "stocks never arrived");

        let transcript = app.world().entity(e).get::<Transcript>().unwrap();
        let symbols: Vec<_> = transcript.latest_stocks().unwrap().iter().map(|q| q.symbol.as_str()).collect();
        assert_eq!(symbols, vec!["AAPL", "MSFT"]);
        assert_eq!(transcript.entries()[1].status, EntryStatus::Done);
    }

    #[test]
    fn failed_turn_reports_and_stops_waiting() {
        let (mut app, e) = app_with_session(vec![Script::Fail("quota".into())]);
        {
            let mut commands = app.world_mut().commands();
            send_user_text(&mut commands, e, "hi");
        }
        app.world_mut().flush();

        let settled = run_until(&mut app, e, |t| !t.is_empty() && t.waiting() == 0);
        assert!(settled, "turn never settled");
        let transcript = app.world().entity(e).get::<Transcript>().unwrap();
        assert_eq!(transcript.render_text(), "user: hi\n");
    }

    #[test]
    fn purchase_replaces_form_and_adds_notice() {
        let (mut app, e) = app_with_session(Vec::new());
        let form = PurchaseForm::new("AAPL", 180.0, None);
        let form_id = MessageId::new();
        {
            let mut entity = app.world_mut().entity_mut(e);
            let mut transcript = entity.get_mut::<Transcript>().unwrap();
            let state = UiState { fragment: Some(Fragment::Purchase(form.clone())), phase: UiPhase::Done };
            transcript.upsert(form_id, Role::Assistant, &state);
        }
        {
            let mut commands = app.world_mut().commands();
            request_purchase(&mut commands, e, &form, Some(form_id));
        }
        app.world_mut().flush();

        let settled = run_until(&mut app, e, |t| {
            t.entries().len() == 2 && t.entries().iter().all(|entry| entry.status == EntryStatus::Done)
        });
        assert!(settled, "purchase never settled");

        let transcript = app.world().entity(e).get::<Transcript>().unwrap();
        assert_eq!(
            transcript.render_text(),
            "assistant: You have successfully purchased 10 $AAPL. Total cost: $1,800.00\n\
             assistant: You have purchased 10 shares of AAPL at $180. Total cost = $1,800.00.\n"
        );
        let bot = app.world().entity(e).get::<StockSession>().unwrap().bot.clone();
        assert_eq!(
            bot.history(),
            vec![ServerMessage::system("[User has purchased 10 shares of AAPL at 180. Total cost = 1800]")]
        );
    }
}
