//! Per-call orchestration.
//!
//! One `Call` per accepted telephony connection. The call owns both socket
//! halves, every counter, and every timer; a single `select!` loop
//! multiplexes telephony reads, agent reads, the pending agent connect, and
//! a 50 ms tick that evaluates the named deadlines. All writes happen from
//! this one task, which serializes them per socket for free.

use anyhow::{Result, anyhow};
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use bridge_codec::{mulaw_decode, pcm_to_bytes, upsample_8k_to_16k};
use bridge_protocol::AudioFormat;
use bridge_protocol::agent::{self, AgentEvent};
use bridge_protocol::telephony::{MediaFrame, OutboundEvent, StartMeta, TelephonyEvent};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::buffer::UpstreamBuffer;
use crate::config::{Config, Mode};
use crate::connector::{self, AgentSocket, Route};
use crate::pacer::FramePacer;
use crate::turn::TurnTracker;

const TICK: Duration = Duration::from_millis(50);
const NUDGE_DELAYS: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(6),
];
const NUDGE_MESSAGES: [&str; 2] = ["Hello", "Hello?"];
const PROCESSING_NUDGE_DELAY: Duration = Duration::from_millis(250);
const FINAL_MESSAGE: &str = "(Call ended)";
const MAX_WRITE_FAILURES: u32 = 5;

pub type TelephonySocket = WebSocketStream<TcpStream>;
type TelephonySink = SplitSink<TelephonySocket, Message>;
type AgentSink = SplitSink<AgentSocket, Message>;
type AgentStream = SplitStream<AgentSocket>;
type ConnectResult = Result<(AgentSocket, Route)>;

/// Agent session lifecycle. `Open` means the transport is up; `Ready` means
/// metadata arrived (or the optimistic fallback fired). Caller audio may be
/// sent from `Open` on, but the buffered backlog flushes on `Ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentState {
    Init,
    Connecting,
    Open,
    Ready,
    Closed,
    Failed,
}

/// Named, cancellable deadlines; evaluated on the 50 ms tick. `None` means
/// not armed.
#[derive(Debug, Default)]
struct Deadlines {
    silence: Option<Instant>,
    hard_cap: Option<Instant>,
    metadata_fallback: Option<Instant>,
    nudges: [Option<Instant>; 3],
    processing_nudge: Option<Instant>,
}

impl Deadlines {
    /// Check-and-disarm: true exactly once per arming, once due.
    fn due(slot: &mut Option<Instant>, now: Instant) -> bool {
        if slot.is_some_and(|t| t <= now) {
            *slot = None;
            true
        } else {
            false
        }
    }

    fn clear_turn(&mut self) {
        self.silence = None;
        self.hard_cap = None;
    }

    fn clear_nudges(&mut self) {
        self.nudges = [None; 3];
    }
}

/// Why the call is over; decides the telephony close frame.
#[derive(Debug)]
enum EndReason {
    TelephonyClosed,
    Stop,
    AuthRejected,
    ProtocolViolation(String),
    AgentFailed(String),
    AgentClosed(Option<CloseFrame<'static>>),
}

struct CallIo {
    telephony: TelephonySink,
    agent: Option<AgentSink>,
}

enum Input {
    Telephony(Option<Result<Message, WsError>>),
    Agent(Option<Result<Message, WsError>>),
    Connected(ConnectResult),
    Tick,
}

pub struct Call {
    config: Arc<Config>,
    session_id: String,
    upgrade_authorized: bool,
    stream_sid: Option<String>,
    mode: Mode,
    caller_phone: String,
    profile: Option<Value>,
    agent_id: Option<String>,
    agent_state: AgentState,
    route: Option<Route>,
    retried: bool,
    input_format: AudioFormat,
    output_format: AudioFormat,
    turn: TurnTracker,
    turn_start_sent: bool,
    user_activity_sent: bool,
    buffer: UpstreamBuffer,
    pacer: FramePacer,
    deadlines: Deadlines,
    total_inbound: u64,
    write_failures: u32,
    created: Instant,
    end: Option<EndReason>,
}

impl Call {
    pub fn new(config: Arc<Config>, upgrade_authorized: bool) -> Self {
        let packet_frames = config.packet_frames();
        Self {
            config,
            session_id: Uuid::new_v4().to_string(),
            upgrade_authorized,
            stream_sid: None,
            mode: Mode::Discovery,
            caller_phone: String::new(),
            profile: None,
            agent_id: None,
            agent_state: AgentState::Init,
            route: None,
            retried: false,
            input_format: AudioFormat::Ulaw8000,
            output_format: AudioFormat::Ulaw8000,
            turn: TurnTracker::new(),
            turn_start_sent: false,
            user_activity_sent: false,
            buffer: UpstreamBuffer::new(packet_frames),
            pacer: FramePacer::new(),
            deadlines: Deadlines::default(),
            total_inbound: 0,
            write_failures: 0,
            created: Instant::now(),
            end: None,
        }
    }

    pub async fn run(mut self, telephony: TelephonySocket) -> Result<()> {
        info!("call {} accepted", self.session_id);
        let (tel_tx, mut tel_rx) = telephony.split();
        let mut io = CallIo {
            telephony: tel_tx,
            agent: None,
        };
        let mut agent_rx: Option<AgentStream> = None;
        let mut connect_rx: Option<oneshot::Receiver<ConnectResult>> = None;
        let mut connect_task: Option<JoinHandle<()>> = None;
        let mut tick = tokio::time::interval(TICK);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        while self.end.is_none() {
            let input = tokio::select! {
                msg = tel_rx.next() => Input::Telephony(msg),
                msg = next_or_pending(&mut agent_rx) => Input::Agent(msg),
                res = recv_or_pending(&mut connect_rx) => Input::Connected(res),
                _ = tick.tick() => Input::Tick,
            };

            match input {
                Input::Telephony(msg) => match msg {
                    Some(Ok(Message::Text(text))) => {
                        if let Some(agent_id) = self.on_telephony_text(&text, &mut io).await? {
                            let (rx, task) = spawn_connect(self.config.clone(), agent_id, false);
                            connect_rx = Some(rx);
                            connect_task = Some(task);
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        let _ = io.telephony.send(Message::Pong(data)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("call {}: telephony closed", self.session_id);
                        self.end = Some(EndReason::TelephonyClosed);
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("call {}: telephony socket error: {}", self.session_id, e);
                        self.end = Some(EndReason::TelephonyClosed);
                    }
                },
                Input::Agent(msg) => {
                    // Some(frame) here means the agent transport is gone
                    let closed = match msg {
                        Some(Ok(Message::Text(text))) => {
                            self.on_agent_text(&text, &mut io).await?;
                            None
                        }
                        Some(Ok(Message::Ping(data))) => {
                            if let Some(agent) = io.agent.as_mut() {
                                let _ = agent.send(Message::Pong(data)).await;
                            }
                            None
                        }
                        Some(Ok(Message::Close(frame))) => Some(frame),
                        Some(Ok(_)) => None,
                        None => Some(None),
                        Some(Err(e)) => {
                            warn!("call {}: agent socket error: {}", self.session_id, e);
                            Some(None)
                        }
                    };
                    if let Some(frame) = closed {
                        agent_rx = None;
                        io.agent = None;
                        if self.on_agent_closed(frame)
                            && let Some(agent_id) = self.agent_id.clone()
                        {
                            let (rx, task) = spawn_connect(self.config.clone(), agent_id, true);
                            connect_rx = Some(rx);
                            connect_task = Some(task);
                        }
                    }
                }
                Input::Connected(res) => {
                    connect_rx = None;
                    connect_task = None;
                    match res {
                        Ok((ws, route)) => {
                            let (agent_tx, rx) = ws.split();
                            io.agent = Some(agent_tx);
                            agent_rx = Some(rx);
                            self.on_agent_open(route, &mut io).await?;
                        }
                        Err(e) => {
                            error!("call {}: agent connect failed: {e:#}", self.session_id);
                            self.agent_state = AgentState::Failed;
                            self.end = Some(EndReason::AgentFailed(e.to_string()));
                        }
                    }
                }
                Input::Tick => self.on_tick(&mut io).await?,
            }
        }

        if let Some(task) = connect_task.take() {
            task.abort();
        }
        self.cleanup(io).await;
        Ok(())
    }

    /// Close both sides with the codes the end reason mandates. Runs on
    /// every exit path; after it the call holds nothing.
    async fn cleanup(&mut self, mut io: CallIo) {
        let end = self.end.take().unwrap_or(EndReason::TelephonyClosed);
        if let Some(mut agent) = io.agent.take() {
            let _ = agent
                .send(Message::Close(Some(CloseFrame {
                    code: CloseCode::Normal,
                    reason: "".into(),
                })))
                .await;
            let _ = agent.close().await;
        }
        let frame = match &end {
            EndReason::AuthRejected => Some(CloseFrame {
                code: CloseCode::Policy,
                reason: "unauthorized".into(),
            }),
            EndReason::ProtocolViolation(why) => Some(CloseFrame {
                code: CloseCode::Policy,
                reason: why.clone().into(),
            }),
            EndReason::AgentFailed(_) => Some(CloseFrame {
                code: CloseCode::Error,
                reason: "upstream failure".into(),
            }),
            EndReason::AgentClosed(frame) => frame.clone().or(Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            })),
            EndReason::Stop | EndReason::TelephonyClosed => Some(CloseFrame {
                code: CloseCode::Normal,
                reason: "".into(),
            }),
        };
        let _ = io.telephony.send(Message::Close(frame)).await;
        let _ = io.telephony.close().await;
        info!(
            "call {} finished after {:.1?} ({:?}): {} frames in, {} frames out",
            self.session_id,
            self.created.elapsed(),
            end,
            self.total_inbound,
            self.pacer.frames_emitted(),
        );
    }

    // ── telephony side ─────────────────────────────────────────────────

    /// Returns the agent id to connect to when a valid `start` was just
    /// processed.
    async fn on_telephony_text(&mut self, text: &str, io: &mut CallIo) -> Result<Option<String>> {
        let event = match serde_json::from_str::<TelephonyEvent>(text) {
            Ok(event) => event,
            Err(e) => {
                warn!(
                    "call {}: skipping unparseable telephony record: {}",
                    self.session_id, e
                );
                return Ok(None);
            }
        };
        match event {
            TelephonyEvent::Connected { .. } => Ok(None),
            TelephonyEvent::Start { stream_sid, start } => self.on_start(stream_sid, start),
            TelephonyEvent::Media { media } => {
                self.on_caller_media(media, io).await?;
                Ok(None)
            }
            TelephonyEvent::Mark { mark } => {
                debug!(
                    "call {}: mark ack {:?}",
                    self.session_id,
                    mark.and_then(|m| m.name)
                );
                Ok(None)
            }
            TelephonyEvent::Stop => {
                self.on_stop(io).await?;
                Ok(None)
            }
            TelephonyEvent::Unknown => Ok(None),
        }
    }

    fn on_start(&mut self, top_sid: Option<String>, start: StartMeta) -> Result<Option<String>> {
        if self.agent_state != AgentState::Init {
            warn!("call {}: duplicate start event ignored", self.session_id);
            return Ok(None);
        }
        let params = start.custom_parameters;
        if let Some(expected) = &self.config.auth_token
            && !self.upgrade_authorized
            && params.get("token") != Some(expected)
        {
            warn!(
                "call {}: bad or missing token in start event",
                self.session_id
            );
            self.end = Some(EndReason::AuthRejected);
            return Ok(None);
        }
        let Some(stream_sid) = start.stream_sid.or(top_sid) else {
            warn!("call {}: start without streamSid", self.session_id);
            self.end = Some(EndReason::ProtocolViolation("missing streamSid".into()));
            return Ok(None);
        };
        self.stream_sid = Some(stream_sid);
        self.mode = Mode::parse(params.get("mode").map(String::as_str));
        self.caller_phone = params.get("caller_phone").cloned().unwrap_or_default();
        self.profile = params.get("profile_b64").and_then(|b64| {
            let decoded = BASE64
                .decode(b64)
                .ok()
                .and_then(|raw| serde_json::from_slice::<Value>(&raw).ok());
            if decoded.is_none() {
                warn!("call {}: ignoring malformed profile_b64", self.session_id);
            }
            decoded
        });
        let agent_id = params
            .get("agent_id")
            .cloned()
            .unwrap_or_else(|| self.config.agent_for(self.mode).to_string());
        info!(
            "call {}: started, mode {}, agent {}",
            self.session_id,
            self.mode.as_str(),
            agent_id
        );
        self.agent_id = Some(agent_id.clone());
        self.agent_state = AgentState::Connecting;
        Ok(Some(agent_id))
    }

    async fn on_caller_media(&mut self, media: MediaFrame, io: &mut CallIo) -> Result<()> {
        if media.track.as_deref().is_some_and(|t| t != "inbound") {
            return Ok(());
        }
        if self.stream_sid.is_none() {
            debug!("call {}: media before start, dropping", self.session_id);
            return Ok(());
        }
        let ulaw = match BASE64.decode(&media.payload) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("call {}: bad media payload base64: {}", self.session_id, e);
                return Ok(());
            }
        };
        self.total_inbound += 1;
        self.buffer.push(&ulaw);

        let now = Instant::now();
        let agent_open = self.agent_is_open();
        if self.turn.is_speaking() {
            self.deadlines.silence = Some(now + self.config.silence);
        } else if self.turn.may_enter(now, agent_open) {
            self.turn.enter();
            self.deadlines.silence = Some(now + self.config.silence);
            self.deadlines.hard_cap = Some(now + self.config.utterance_max);
            if agent_open {
                self.turn_start_sent = true;
                self.send_agent(io, agent::user_audio_start()).await?;
            }
            debug!("call {}: turn started", self.session_id);
        } else if agent_open && self.turn.agent_holds_floor(now) && !self.user_activity_sent {
            // caller speaking over the agent
            self.user_activity_sent = true;
            self.send_agent(io, agent::user_activity()).await?;
        }

        if agent_open && self.buffer.has_full_packet() {
            self.flush_upstream(io, false).await?;
        }
        Ok(())
    }

    async fn on_stop(&mut self, io: &mut CallIo) -> Result<()> {
        info!("call {}: telephony stop", self.session_id);
        if self.agent_is_open() {
            self.end_turn(io, "stop", false).await?;
            self.flush_upstream(io, true).await?;
            self.send_agent(io, agent::user_message(FINAL_MESSAGE)).await?;
        }
        self.end = Some(EndReason::Stop);
        Ok(())
    }

    // ── agent side ─────────────────────────────────────────────────────

    async fn on_agent_open(&mut self, route: Route, io: &mut CallIo) -> Result<()> {
        self.agent_state = AgentState::Open;
        self.route = Some(route);
        let now = Instant::now();
        self.deadlines.metadata_fallback = Some(now + self.config.metadata_fallback);
        for (slot, delay) in self.deadlines.nudges.iter_mut().zip(NUDGE_DELAYS) {
            *slot = Some(now + delay);
        }
        let record = agent::initiation(self.dynamic_variables());
        self.send_agent(io, record).await?;
        info!(
            "call {}: agent session open via {:?}",
            self.session_id, route
        );
        Ok(())
    }

    fn dynamic_variables(&self) -> Value {
        let mut vars = json!({
            "caller_phone": self.caller_phone,
            "mode": self.mode.as_str(),
            "session_id": self.session_id,
            "timestamp": chrono::Utc::now().to_rfc3339(),
        });
        if let Some(profile) = &self.profile {
            vars["profile"] = profile.clone();
        }
        vars
    }

    async fn on_agent_text(&mut self, text: &str, io: &mut CallIo) -> Result<()> {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "call {}: skipping unparseable agent record: {}",
                    self.session_id, e
                );
                return Ok(());
            }
        };
        match AgentEvent::classify(&value) {
            AgentEvent::Metadata {
                input_format,
                output_format,
            } => {
                if let Some(format) = input_format {
                    self.input_format = format;
                }
                if let Some(format) = output_format {
                    self.output_format = format;
                }
                info!(
                    "call {}: agent metadata, in {} out {}",
                    self.session_id,
                    self.input_format.label(),
                    self.output_format.label()
                );
                self.set_ready(io).await?;
            }
            AgentEvent::Audio { payload_b64 } => self.on_agent_audio(&payload_b64, io).await?,
            AgentEvent::Ping { event_id } => {
                self.send_agent(io, agent::pong(event_id.as_ref())).await?;
            }
            AgentEvent::Interruption => {
                info!(
                    "call {}: agent interruption, clearing playout",
                    self.session_id
                );
                if let Some(sid) = self.stream_sid.clone() {
                    self.send_telephony(io, OutboundEvent::clear(&sid)).await?;
                }
            }
            AgentEvent::UserTranscript { text } => {
                debug!("call {}: user transcript {:?}", self.session_id, text);
            }
            AgentEvent::AgentResponse { text } => {
                debug!("call {}: agent response {:?}", self.session_id, text);
            }
            AgentEvent::Error { message } => {
                error!("call {}: agent error: {}", self.session_id, message);
                self.agent_state = AgentState::Failed;
                self.end = Some(EndReason::AgentFailed(message));
            }
            AgentEvent::Other { kind } => {
                debug!("call {}: ignoring agent record {:?}", self.session_id, kind);
            }
        }
        Ok(())
    }

    async fn on_agent_audio(&mut self, payload_b64: &str, io: &mut CallIo) -> Result<()> {
        let payload = match BASE64.decode(payload_b64) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("call {}: bad agent audio base64: {}", self.session_id, e);
                return Ok(());
            }
        };
        if self.turn.note_agent_output(Instant::now()) {
            // the agent took the floor; the open turn dies without an end marker
            self.deadlines.clear_turn();
            self.turn_start_sent = false;
            self.user_activity_sent = false;
            debug!("call {}: agent audio reset open turn", self.session_id);
        }
        self.deadlines.clear_nudges();
        self.deadlines.processing_nudge = None;

        let Some(sid) = self.stream_sid.clone() else {
            return Ok(());
        };
        let before = self.pacer.frames_emitted();
        let records = self.pacer.push(&payload, self.output_format, &sid);
        for record in records {
            self.send_telephony(io, record).await?;
        }
        let n = self.config.log_every;
        if n > 0 && self.pacer.frames_emitted() / n != before / n {
            debug!(
                "call {}: {} outbound frames",
                self.session_id,
                self.pacer.frames_emitted()
            );
        }
        Ok(())
    }

    /// Pre-`ready` deaths of a signed-URL transport earn one direct retry;
    /// everything else ends the call, mirroring the agent's close frame to
    /// the telephony side. Returns whether to retry.
    fn on_agent_closed(&mut self, frame: Option<CloseFrame<'static>>) -> bool {
        if self.end.is_some() {
            return false;
        }
        let non_normal = frame.as_ref().is_none_or(|f| f.code != CloseCode::Normal);
        if self.agent_state == AgentState::Open
            && non_normal
            && self.route == Some(Route::SignedUrl)
            && !self.retried
        {
            warn!(
                "call {}: agent transport died before ready, retrying direct",
                self.session_id
            );
            self.retried = true;
            self.agent_state = AgentState::Connecting;
            self.deadlines.metadata_fallback = None;
            self.deadlines.clear_nudges();
            return true;
        }
        self.agent_state = if non_normal {
            AgentState::Failed
        } else {
            AgentState::Closed
        };
        info!(
            "call {}: agent socket closed ({:?})",
            self.session_id, frame
        );
        self.end = Some(EndReason::AgentClosed(frame));
        false
    }

    // ── timers ─────────────────────────────────────────────────────────

    async fn on_tick(&mut self, io: &mut CallIo) -> Result<()> {
        let now = Instant::now();
        if Deadlines::due(&mut self.deadlines.metadata_fallback, now) {
            info!(
                "call {}: no agent metadata, assuming μ-law both ways",
                self.session_id
            );
            self.set_ready(io).await?;
        }
        if Deadlines::due(&mut self.deadlines.silence, now) {
            self.end_turn(io, "silence", true).await?;
        }
        if Deadlines::due(&mut self.deadlines.hard_cap, now) {
            self.end_turn(io, "hard cap", true).await?;
        }
        for i in 0..self.deadlines.nudges.len() {
            if Deadlines::due(&mut self.deadlines.nudges[i], now)
                && !self.turn.agent_has_spoken()
                && self.agent_is_open()
            {
                info!(
                    "call {}: agent still silent, nudge {} of {}",
                    self.session_id,
                    i + 1,
                    NUDGE_DELAYS.len()
                );
                let record = match NUDGE_MESSAGES.get(i) {
                    Some(text) => agent::user_message(text),
                    None => agent::conversation_start(),
                };
                self.send_agent(io, record).await?;
            }
        }
        if Deadlines::due(&mut self.deadlines.processing_nudge, now) && self.agent_is_open() {
            // follow-up after a turn end, forcing the agent to commit
            self.send_agent(io, agent::user_message("")).await?;
        }
        if self.agent_is_open() && self.buffer.has_full_packet() {
            self.flush_upstream(io, false).await?;
        }
        Ok(())
    }

    /// Turn exit: flush, close the turn upstream, schedule the commit
    /// nudge. Safe to call with no open turn.
    async fn end_turn(&mut self, io: &mut CallIo, why: &str, schedule_nudge: bool) -> Result<()> {
        if !self.turn.exit() {
            return Ok(());
        }
        self.deadlines.clear_turn();
        self.user_activity_sent = false;
        if self.agent_is_open() {
            self.flush_upstream(io, true).await?;
            if self.turn_start_sent {
                self.send_agent(io, agent::user_audio_end()).await?;
            }
            if schedule_nudge {
                self.deadlines.processing_nudge = Some(Instant::now() + PROCESSING_NUDGE_DELAY);
            }
        }
        self.turn_start_sent = false;
        info!("call {}: turn ended ({})", self.session_id, why);
        Ok(())
    }

    /// `Ready`: formats are settled, release the buffered backlog.
    async fn set_ready(&mut self, io: &mut CallIo) -> Result<()> {
        if self.agent_state != AgentState::Open {
            return Ok(());
        }
        self.agent_state = AgentState::Ready;
        self.deadlines.metadata_fallback = None;
        self.flush_upstream(io, true).await?;
        Ok(())
    }

    fn agent_is_open(&self) -> bool {
        matches!(self.agent_state, AgentState::Open | AgentState::Ready)
    }

    // ── upstream audio ─────────────────────────────────────────────────

    async fn flush_upstream(&mut self, io: &mut CallIo, force: bool) -> Result<()> {
        if !self.agent_is_open() {
            return Ok(());
        }
        let packets = self.buffer.drain(force);
        for packet in packets {
            let b64 = BASE64.encode(self.transcode_upstream(&packet));
            self.send_agent(io, agent::user_audio_chunk(&b64)).await?;
        }
        Ok(())
    }

    fn transcode_upstream(&self, ulaw: &[u8]) -> Vec<u8> {
        match self.input_format {
            AudioFormat::Ulaw8000 => ulaw.to_vec(),
            AudioFormat::Pcm16k => pcm_to_bytes(&upsample_8k_to_16k(&mulaw_decode(ulaw))),
            AudioFormat::Pcm8k => pcm_to_bytes(&mulaw_decode(ulaw)),
        }
    }

    // ── writes ─────────────────────────────────────────────────────────

    /// Telephony writes tolerate transient failures on the audio path: the
    /// frame is dropped, and only a persistent streak ends the call.
    async fn send_telephony(&mut self, io: &mut CallIo, event: OutboundEvent) -> Result<()> {
        let text = serde_json::to_string(&event)?;
        match io.telephony.send(Message::Text(text)).await {
            Ok(()) => self.write_failures = 0,
            Err(e) => {
                self.write_failures += 1;
                warn!(
                    "call {}: telephony write failed ({} in a row): {}",
                    self.session_id, self.write_failures, e
                );
                if self.write_failures >= MAX_WRITE_FAILURES {
                    self.end = Some(EndReason::TelephonyClosed);
                }
            }
        }
        Ok(())
    }

    async fn send_agent(&mut self, io: &mut CallIo, record: String) -> Result<()> {
        let Some(agent) = io.agent.as_mut() else {
            return Ok(());
        };
        if let Err(e) = agent.send(Message::Text(record)).await {
            warn!("call {}: agent write failed: {}", self.session_id, e);
            self.agent_state = AgentState::Failed;
            self.end = Some(EndReason::AgentFailed(e.to_string()));
        }
        Ok(())
    }
}

async fn next_or_pending(stream: &mut Option<AgentStream>) -> Option<Result<Message, WsError>> {
    match stream {
        Some(s) => s.next().await,
        None => std::future::pending().await,
    }
}

async fn recv_or_pending(rx: &mut Option<oneshot::Receiver<ConnectResult>>) -> ConnectResult {
    match rx {
        Some(r) => match r.await {
            Ok(res) => res,
            Err(_) => Err(anyhow!("agent connect task dropped")),
        },
        None => std::future::pending().await,
    }
}

fn spawn_connect(
    config: Arc<Config>,
    agent_id: String,
    direct_only: bool,
) -> (oneshot::Receiver<ConnectResult>, JoinHandle<()>) {
    let (tx, rx) = oneshot::channel();
    let task = tokio::spawn(async move {
        let result = if direct_only {
            connector::connect_direct(&config, &agent_id)
                .await
                .map(|ws| (ws, Route::Direct))
        } else {
            connector::connect(&config, &agent_id).await
        };
        let _ = tx.send(result);
    });
    (rx, task)
}
