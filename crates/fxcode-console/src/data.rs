//! Game and server state shared by the console, game view and resource
//! monitor panels.
//!
//! Each field has a getter and a change subscription. Output and message
//! lists are bounded so an open workbench does not grow without limit.

use crate::history::BoundedHistoryBuffer;
use crate::output::OutputBuffer;
use crate::signal::{Signal, SubscriptionId};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::fmt;
use tracing::debug;

pub const DEFAULT_OUTPUT_BYTES: usize = 1024 * 1024;
pub const DEFAULT_MESSAGE_LIMIT: usize = 2000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StructuredMessage {
    pub channel: String,
    pub message: String,
}

/// Lifecycle of the game client as reported by the SDK shell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
#[repr(u8)]
pub enum GameState {
    #[default]
    NotRunning = 0,
    Ready = 1,
    Loading = 2,
    Connected = 3,
    Unloading = 4,
}

impl From<GameState> for u8 {
    fn from(s: GameState) -> u8 {
        s as u8
    }
}

impl TryFrom<u8> for GameState {
    type Error = String;
    fn try_from(v: u8) -> Result<Self, String> {
        match v {
            0 => Ok(Self::NotRunning),
            1 => Ok(Self::Ready),
            2 => Ok(Self::Loading),
            3 => Ok(Self::Connected),
            4 => Ok(Self::Unloading),
            other => Err(format!("unknown game state {other}")),
        }
    }
}

impl fmt::Display for GameState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            GameState::NotRunning => "not running",
            GameState::Ready => "ready",
            GameState::Loading => "loading",
            GameState::Connected => "connected",
            GameState::Unloading => "unloading",
        };
        f.write_str(s)
    }
}

/// One resource-monitor row. On the wire it is the tuple
/// `[name, avgTickMs, avgFrameFraction, memory, streaming]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    from = "(String, f64, f64, f64, f64)",
    into = "(String, f64, f64, f64, f64)"
)]
pub struct ResourceSample {
    pub name: String,
    pub avg_tick_ms: f64,
    pub avg_frame_fraction: f64,
    pub memory: f64,
    pub streaming: f64,
}

impl From<(String, f64, f64, f64, f64)> for ResourceSample {
    fn from((name, avg_tick_ms, avg_frame_fraction, memory, streaming): (String, f64, f64, f64, f64)) -> Self {
        Self {
            name,
            avg_tick_ms,
            avg_frame_fraction,
            memory,
            streaming,
        }
    }
}

impl From<ResourceSample> for (String, f64, f64, f64, f64) {
    fn from(s: ResourceSample) -> Self {
        (s.name, s.avg_tick_ms, s.avg_frame_fraction, s.memory, s.streaming)
    }
}

#[derive(Debug, Deserialize)]
struct DataEntry {
    key: String,
    value: Value,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum DataUpdate {
    Many(Vec<DataEntry>),
    One(DataEntry),
}

/// Which change stream a [`Subscription`] belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Topic {
    ClientResources,
    ServerResources,
    ServerOutput,
    ServerMessage,
    ClearServerOutputs,
    GameMessage,
    ClearGameOutput,
    FxcodeActive,
    GameState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subscription {
    pub topic: Topic,
    pub id: SubscriptionId,
}

pub struct GameDataService {
    data: Map<String, Value>,
    client_resources: Vec<ResourceSample>,
    server_resources: Vec<ResourceSample>,
    server_output: OutputBuffer,
    server_messages: BoundedHistoryBuffer<StructuredMessage>,
    game_messages: BoundedHistoryBuffer<StructuredMessage>,
    fxcode_active: bool,
    game_state: GameState,

    client_resources_changed: Signal<Vec<ResourceSample>>,
    server_resources_changed: Signal<Vec<ResourceSample>>,
    server_output_changed: Signal<String>,
    server_message_received: Signal<StructuredMessage>,
    server_outputs_cleared: Signal<()>,
    game_message_received: Signal<StructuredMessage>,
    game_output_cleared: Signal<()>,
    fxcode_active_changed: Signal<bool>,
    game_state_changed: Signal<GameState>,
}

impl Default for GameDataService {
    fn default() -> Self {
        Self::new(DEFAULT_OUTPUT_BYTES, DEFAULT_MESSAGE_LIMIT)
    }
}

impl GameDataService {
    pub fn new(output_bytes: usize, message_limit: usize) -> Self {
        let mut data = Map::new();
        data.insert("player_ped_pos".into(), json!([0, 0, 0]));
        data.insert("player_ped_rot".into(), json!([0, 0, 0]));
        data.insert("player_ped_heading".into(), json!(0));

        Self {
            data,
            client_resources: Vec::new(),
            server_resources: Vec::new(),
            server_output: OutputBuffer::new(output_bytes),
            server_messages: BoundedHistoryBuffer::new(message_limit),
            game_messages: BoundedHistoryBuffer::new(message_limit),
            fxcode_active: false,
            game_state: GameState::NotRunning,
            client_resources_changed: Signal::new(),
            server_resources_changed: Signal::new(),
            server_output_changed: Signal::new(),
            server_message_received: Signal::new(),
            server_outputs_cleared: Signal::new(),
            game_message_received: Signal::new(),
            game_output_cleared: Signal::new(),
            fxcode_active_changed: Signal::new(),
            game_state_changed: Signal::new(),
        }
    }

    // --- key/value data ---

    pub fn data(&self) -> &Map<String, Value> {
        &self.data
    }

    /// Accept `{key, value}` or a list of them.
    pub fn accept_data(&mut self, update: Value) -> Result<(), serde_json::Error> {
        match serde_json::from_value::<DataUpdate>(update)? {
            DataUpdate::Many(entries) => {
                for entry in entries {
                    self.data.insert(entry.key, entry.value);
                }
            }
            DataUpdate::One(entry) => {
                self.data.insert(entry.key, entry.value);
            }
        }
        Ok(())
    }

    // --- resource monitor ---

    pub fn client_resources(&self) -> &[ResourceSample] {
        &self.client_resources
    }

    pub fn set_client_resources(&mut self, samples: Vec<ResourceSample>) {
        self.client_resources_changed.emit(&samples);
        self.client_resources = samples;
    }

    pub fn on_client_resources(
        &mut self,
        cb: impl Fn(&Vec<ResourceSample>) + Send + Sync + 'static,
    ) -> Subscription {
        sub(Topic::ClientResources, self.client_resources_changed.subscribe(cb))
    }

    pub fn server_resources(&self) -> &[ResourceSample] {
        &self.server_resources
    }

    pub fn set_server_resources(&mut self, samples: Vec<ResourceSample>) {
        self.server_resources_changed.emit(&samples);
        self.server_resources = samples;
    }

    pub fn on_server_resources(
        &mut self,
        cb: impl Fn(&Vec<ResourceSample>) + Send + Sync + 'static,
    ) -> Subscription {
        sub(Topic::ServerResources, self.server_resources_changed.subscribe(cb))
    }

    // --- server output ---

    pub fn buffered_server_output(&self) -> String {
        self.server_output.text()
    }

    /// Replace the buffered output wholesale.
    pub fn set_buffered_server_output(&mut self, output: &str) {
        self.server_output.clear();
        self.server_output.write(output.as_bytes());
        self.server_output_changed.emit(&self.server_output.text());
    }

    /// Append a chunk of output; the oldest bytes fall off past the limit.
    pub fn append_server_output(&mut self, chunk: &str) {
        self.server_output.write(chunk.as_bytes());
        self.server_output_changed.emit(&self.server_output.text());
    }

    pub fn on_buffered_server_output(
        &mut self,
        cb: impl Fn(&String) + Send + Sync + 'static,
    ) -> Subscription {
        sub(Topic::ServerOutput, self.server_output_changed.subscribe(cb))
    }

    pub fn structured_server_messages(&self) -> impl Iterator<Item = &StructuredMessage> {
        self.server_messages.iter()
    }

    pub fn receive_structured_server_message(&mut self, message: StructuredMessage) {
        self.server_message_received.emit(&message);
        if let Some(dropped) = self.server_messages.push(message) {
            debug!(channel = %dropped.channel, "server message evicted");
        }
    }

    pub fn on_structured_server_message(
        &mut self,
        cb: impl Fn(&StructuredMessage) + Send + Sync + 'static,
    ) -> Subscription {
        sub(Topic::ServerMessage, self.server_message_received.subscribe(cb))
    }

    pub fn clear_all_server_outputs(&mut self) {
        self.server_output.clear();
        self.server_messages.reset();
        self.server_outputs_cleared.emit(&());
    }

    pub fn on_clear_all_server_outputs(
        &mut self,
        cb: impl Fn(&()) + Send + Sync + 'static,
    ) -> Subscription {
        sub(Topic::ClearServerOutputs, self.server_outputs_cleared.subscribe(cb))
    }

    // --- game output ---

    pub fn structured_game_messages(&self) -> impl Iterator<Item = &StructuredMessage> {
        self.game_messages.iter()
    }

    pub fn receive_structured_game_message(&mut self, message: StructuredMessage) {
        self.game_message_received.emit(&message);
        self.game_messages.push(message);
    }

    pub fn on_structured_game_message(
        &mut self,
        cb: impl Fn(&StructuredMessage) + Send + Sync + 'static,
    ) -> Subscription {
        sub(Topic::GameMessage, self.game_message_received.subscribe(cb))
    }

    pub fn clear_game_output(&mut self) {
        self.game_messages.reset();
        self.game_output_cleared.emit(&());
    }

    pub fn on_clear_game_output(&mut self, cb: impl Fn(&()) + Send + Sync + 'static) -> Subscription {
        sub(Topic::ClearGameOutput, self.game_output_cleared.subscribe(cb))
    }

    // --- lifecycle flags ---

    pub fn fxcode_active(&self) -> bool {
        self.fxcode_active
    }

    pub fn set_fxcode_active(&mut self, active: bool) {
        self.fxcode_active = active;
        self.fxcode_active_changed.emit(&active);
    }

    pub fn on_fxcode_active(&mut self, cb: impl Fn(&bool) + Send + Sync + 'static) -> Subscription {
        sub(Topic::FxcodeActive, self.fxcode_active_changed.subscribe(cb))
    }

    pub fn game_state(&self) -> GameState {
        self.game_state
    }

    pub fn set_game_state(&mut self, state: GameState) {
        self.game_state = state;
        self.game_state_changed.emit(&state);
    }

    pub fn on_game_state(&mut self, cb: impl Fn(&GameState) + Send + Sync + 'static) -> Subscription {
        sub(Topic::GameState, self.game_state_changed.subscribe(cb))
    }

    /// Detach a subscription made through any `on_*` method.
    pub fn unsubscribe(&mut self, subscription: Subscription) -> bool {
        let id = subscription.id;
        match subscription.topic {
            Topic::ClientResources => self.client_resources_changed.unsubscribe(id),
            Topic::ServerResources => self.server_resources_changed.unsubscribe(id),
            Topic::ServerOutput => self.server_output_changed.unsubscribe(id),
            Topic::ServerMessage => self.server_message_received.unsubscribe(id),
            Topic::ClearServerOutputs => self.server_outputs_cleared.unsubscribe(id),
            Topic::GameMessage => self.game_message_received.unsubscribe(id),
            Topic::ClearGameOutput => self.game_output_cleared.unsubscribe(id),
            Topic::FxcodeActive => self.fxcode_active_changed.unsubscribe(id),
            Topic::GameState => self.game_state_changed.unsubscribe(id),
        }
    }
}

fn sub(topic: Topic, id: SubscriptionId) -> Subscription {
    Subscription { topic, id }
}
