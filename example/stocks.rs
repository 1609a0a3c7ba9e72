//! bevy + bevy_stockbot demo.
//! - with OPENAI_API_KEY set, turns go to an openai-compatible backend.
//! - without a key, an offline model replays canned tool calls so every
//!   fragment (stocks, price card, purchase form, purchase flow) can be seen.
//!
//! keys:
//!   type + enter    send a prompt
//!   f1..f3          send an example prompt
//!   f4              preview the first quote of the latest stock list
//!   up / down       move the share slider of the latest purchase form
//!   f5              purchase with the latest form

use async_trait::async_trait;
use bevy::input::keyboard::{KeyCode, KeyboardInput};
use bevy::prelude::*;
use bevy_stockbot::{
    ChatErrorEvt, ChatModel, ConversationError, EXAMPLE_PROMPTS, Fragment, ModelRequest, ModelResponse,
    PurchaseSettled, Role, Script, ScriptedModel, StockSession, Stockbot, StockbotConfig, StockbotPlugin, Transcript,
    TurnStarted, entry_color, request_purchase, send_user_text, trend_color,
};
use serde_json::json;
use std::sync::Arc;

// ---------------------- offline model ----------------------

const OFFLINE_QUOTES: [(&str, f64, f64); 4] = [
    ("DOGE", 0.12, 0.004),
    ("AAPL", 180.25, 2.5),
    ("MSFT", 300.0, -1.2),
    ("GOOG", 140.5, 0.8),
];

/// picks a canned answer from the latest user line.
struct OfflineModel(ScriptedModel);

#[async_trait]
impl ChatModel for OfflineModel {
    async fn respond(&self, request: ModelRequest) -> Result<ModelResponse, ConversationError> {
        let last = request.messages.last().map(|m| m.content.clone()).unwrap_or_default();
        self.0.push(offline_script(&last));
        self.0.respond(request).await
    }
}

fn offline_script(prompt: &str) -> Script {
    let lower = prompt.to_lowercase();
    let upper = prompt.to_uppercase();
    let quote = OFFLINE_QUOTES
        .iter()
        .find(|(symbol, ..)| upper.contains(symbol))
        .copied()
        .unwrap_or(OFFLINE_QUOTES[1]);
    let (symbol, price, delta) = quote;

    if lower.contains("trending") {
        let stocks: Vec<_> = OFFLINE_QUOTES
            .iter()
            .take(3)
            .map(|(symbol, price, delta)| json!({ "symbol": symbol, "price": price, "delta": delta }))
            .collect();
        Script::tool("list_stocks", json!({ "stocks": stocks }))
    } else if lower.contains("buy") || lower.contains("purchase") {
        let shares = prompt.split_whitespace().find_map(|w| w.parse::<u32>().ok());
        let mut args = json!({ "symbol": symbol, "price": price });
        if let Some(shares) = shares {
            args["numberOfShares"] = json!(shares);
        }
        Script::tool("show_stock_purchase_ui", args)
    } else if lower.contains("price") {
        Script::tool("show_stock_price", json!({ "symbol": symbol, "price": price, "delta": delta }))
    } else {
        Script::text(["I'm a demo ", "and can only show ", "stock prices and purchases."])
    }
}

// ---------------------- ui tags ----------------------

#[derive(Component)]
struct LogRoot;
#[derive(Component)]
struct PromptText;
#[derive(Component)]
struct StatusText;

#[derive(Resource)]
struct Session(Entity);

#[derive(Resource, Default)]
struct PromptBuf(String);

// ---------------------- main ----------------------

fn main() {
    let config = StockbotConfig::from_env();

    App::new()
        .insert_resource(ClearColor(Color::srgb_u8(18, 18, 20)))
        .insert_resource(config)
        .insert_resource(PromptBuf::default())
        .add_plugins(DefaultPlugins)
        .add_plugins(StockbotPlugin)
        .add_systems(Startup, setup)
        .add_systems(Update, (handle_text_input, handle_shortcuts, refresh_prompt_text))
        // event readers should run after bevy_stockbot emits events
        .add_systems(
            Update,
            (render_transcript, on_status).after(bevy_stockbot::StockbotSet::Drain),
        )
        .run();
}

fn build_bot(config: &StockbotConfig) -> Stockbot {
    if config.has_api_key() {
        info!(target: "stocks", "using provider base='{}' model='{}'", config.base_url, config.model);
        match Stockbot::from_config(config) {
            Ok(bot) => return bot,
            Err(err) => error!(target: "stocks", "provider setup failed, running offline: {err}"),
        }
    } else {
        info!(target: "stocks", "OPENAI_API_KEY not set, running offline");
    }
    Stockbot::new(Arc::new(OfflineModel(ScriptedModel::default())), config)
}

// ---------------------- setup ui ----------------------

fn setup(mut commands: Commands, config: Res<StockbotConfig>) {
    commands.spawn(Camera2d::default());

    let session = commands.spawn(StockSession::new(build_bot(&config))).id();
    commands.insert_resource(Session(session));

    let style_14 = TextFont { font_size: 14.0, ..default() };

    commands
        .spawn((
            Node {
                width: Val::Percent(100.0),
                height: Val::Percent(100.0),
                flex_direction: FlexDirection::Column,
                row_gap: Val::Px(8.0),
                padding: UiRect::all(Val::Px(12.0)),
                ..default()
            },
            BackgroundColor(Color::NONE),
        ))
        .with_children(|p| {
            p.spawn((
                Text::new(key_help()),
                style_14.clone(),
                TextColor(Color::srgb_u8(161, 161, 170)),
                StatusText,
            ));
            p.spawn((
                Node {
                    width: Val::Percent(100.0),
                    flex_grow: 1.0,
                    flex_direction: FlexDirection::Column,
                    row_gap: Val::Px(4.0),
                    padding: UiRect::axes(Val::Px(8.0), Val::Px(12.0)),
                    ..default()
                },
                BackgroundColor(Color::srgb(0.10, 0.10, 0.12)),
                LogRoot,
            ));
            p.spawn((Text::new("> "), style_14, TextColor(Color::WHITE), PromptText));
        });
}

fn key_help() -> String {
    let mut help = String::from("enter: send | up/down: shares | f4: preview first quote | f5: purchase\n");
    for (i, prompt) in EXAMPLE_PROMPTS.iter().enumerate() {
        help.push_str(&format!("f{}: {}\n", i + 1, prompt));
    }
    help
}

// ---------------------- input ----------------------

fn handle_text_input(
    mut commands: Commands,
    mut ev_kbd: EventReader<KeyboardInput>,
    keys: Res<ButtonInput<KeyCode>>,
    mut prompt: ResMut<PromptBuf>,
    session: Res<Session>,
) {
    for ev in ev_kbd.read() {
        if ev.state.is_pressed()
            && let Some(txt) = &ev.text
        {
            let s = txt.replace('\r', "").replace('\n', "");
            prompt.0.push_str(&s);
        }
    }
    if keys.just_pressed(KeyCode::Backspace) {
        prompt.0.pop();
    }
    if keys.just_pressed(KeyCode::Enter) && !prompt.0.trim().is_empty() {
        let msg = std::mem::take(&mut prompt.0);
        send_user_text(&mut commands, session.0, msg);
    }
}

fn handle_shortcuts(
    mut commands: Commands,
    keys: Res<ButtonInput<KeyCode>>,
    session: Res<Session>,
    mut q: Query<(&StockSession, &mut Transcript)>,
) {
    let Ok((stock_session, mut transcript)) = q.get_mut(session.0) else {
        return;
    };

    for (key, prompt) in [KeyCode::F1, KeyCode::F2, KeyCode::F3].into_iter().zip(EXAMPLE_PROMPTS) {
        if keys.just_pressed(key) {
            send_user_text(&mut commands, session.0, prompt);
        }
    }

    if keys.just_pressed(KeyCode::F4)
        && let Some(quote) = transcript.latest_stocks().and_then(|quotes| quotes.first())
    {
        send_user_text(&mut commands, session.0, quote.preview_prompt());
    }

    let step = if keys.just_pressed(KeyCode::ArrowUp) {
        Some(10i64)
    } else if keys.just_pressed(KeyCode::ArrowDown) {
        Some(-10)
    } else {
        None
    };
    if let Some(step) = step
        && let Some((id, form)) = transcript.latest_purchase_form()
    {
        let shares = (i64::from(form.shares) + step).clamp(0, i64::from(u32::MAX)) as u32;
        if let Some(form) = transcript.set_shares(id, shares) {
            stock_session.bot.adjust_shares(&form.symbol, form.shares);
        }
    }

    if keys.just_pressed(KeyCode::F5)
        && let Some((id, form)) = transcript.latest_purchase_form()
    {
        let form = form.clone();
        request_purchase(&mut commands, session.0, &form, Some(id));
    }
}

// ---------------------- rendering ----------------------

fn refresh_prompt_text(prompt: Res<PromptBuf>, mut q: Query<&mut Text, With<PromptText>>) {
    if !prompt.is_changed() {
        return;
    }
    for mut text in &mut q {
        text.0 = format!("> {}", prompt.0);
    }
}

fn render_transcript(
    mut commands: Commands,
    q_transcript: Query<&Transcript, Changed<Transcript>>,
    q_root: Query<Entity, With<LogRoot>>,
    session: Res<Session>,
) {
    let Ok(transcript) = q_transcript.get(session.0) else {
        return;
    };
    let Ok(root) = q_root.single() else {
        return;
    };

    let style = TextFont { font_size: 16.0, ..default() };
    commands.entity(root).despawn_related::<Children>();
    commands.entity(root).with_children(|log| {
        for entry in transcript.entries() {
            let Some(fragment) = &entry.fragment else { continue };
            match fragment {
                // one colored row per quote
                Fragment::Stocks(quotes) => {
                    for quote in quotes {
                        let line = Fragment::Stock(quote.clone()).render_text();
                        log.spawn((Text::new(line), style.clone(), TextColor(trend_color(quote.trend()))));
                    }
                }
                _ => {
                    let text = transcript_line(entry.role, &fragment.render_text());
                    log.spawn((Text::new(text), style.clone(), TextColor(entry_color(entry))));
                }
            }
        }
        if transcript.waiting() > 0 {
            let spinner = Fragment::Spinner.render_text();
            log.spawn((Text::new(spinner), style.clone(), TextColor(Color::srgb_u8(161, 161, 170))));
        }
    });
}

fn transcript_line(role: Role, text: &str) -> String {
    match role {
        Role::User => format!("> {text}"),
        _ => text.to_string(),
    }
}

fn on_status(
    mut ev_start: EventReader<TurnStarted>,
    mut ev_purchase: EventReader<PurchaseSettled>,
    mut ev_err: EventReader<ChatErrorEvt>,
    mut q: Query<&mut Text, With<StatusText>>,
) {
    let mut status = None;
    for _ in ev_start.read() {
        status = Some("thinking...".to_string());
    }
    for ev in ev_purchase.read() {
        info!(target: "stocks", "purchase settled: {} x {}", ev.shares, ev.symbol);
        status = Some(format!("purchased {} {}", ev.shares, ev.symbol));
    }
    for ev in ev_err.read() {
        error!(target: "stocks", "error: {}", ev.error);
        status = Some(format!("error: {}", ev.error));
    }
    if let Some(status) = status {
        for mut text in &mut q {
            text.0 = format!("{}{}", key_help(), status);
        }
    }
}
