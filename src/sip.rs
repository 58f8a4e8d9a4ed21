//! SIP user agent core: REGISTER lifecycle with digest auth, retries and
//! refresh, INVITE/BYE/CANCEL/INFO dialogs in both directions, and the
//! wiring from SDP offer/answer into the RTP engine.
//!
//! The UA is a single logical actor: every handler runs under one mutex,
//! so registration, call and transport state never race.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::auth;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::events::{CallPhase, Event, EventSink, LinkState, LogLevel};
use crate::message::SipMessage;
use crate::rtp::RtpSession;
use crate::sdp;
use crate::transport::{SipTransport, TransportEvent};

const USER_AGENT: &str = "softphone-core/0.1.0";
const ALLOW_METHODS: &str = "INVITE, ACK, BYE, CANCEL, OPTIONS, INFO, NOTIFY";

const REGISTER_EXPIRES: u32 = 300;
const REGISTER_RETRY_SECS: u64 = 5;
const REGISTER_MAX_RETRIES: u32 = 3;
const MIN_REFRESH_SECS: u64 = 60;
const INVITE_TIMEOUT_SECS: u64 = 32;
const UNREGISTER_LINGER_SECS: u64 = 2;
const TERMINATED_SWEEP_SECS: u64 = 5;

fn new_call_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn new_tag() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}

fn new_branch() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("z9hG4bK{}", &hex[..16])
}

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// `tag` parameter of a From/To value, looked up outside any angle
/// brackets.
fn tag_of(value: &str) -> Option<String> {
    let params = match value.rfind('>') {
        Some(end) => &value[end + 1..],
        None => value,
    };
    params
        .split(';')
        .find_map(|p| p.trim().strip_prefix("tag=").map(str::to_string))
}

/// From/To value with its tag parameter removed (other params kept).
fn without_tag(value: &str) -> String {
    let (addr, params) = match value.rfind('>') {
        Some(end) => value.split_at(end + 1),
        None => ("", value),
    };
    let kept: Vec<&str> = params
        .split(';')
        .map(str::trim)
        .filter(|p| !p.is_empty() && !p.starts_with("tag="))
        .collect();
    let mut out = addr.trim().to_string();
    for (i, param) in kept.iter().enumerate() {
        if !out.is_empty() || i > 0 {
            out.push(';');
        }
        out.push_str(param);
    }
    out
}

/// Bare URI inside a name-addr, or the value up to the first parameter.
fn uri_of(value: &str) -> String {
    if let (Some(start), Some(end)) = (value.find('<'), value.find('>')) {
        if start < end {
            return value[start + 1..end].to_string();
        }
    }
    value.split(';').next().unwrap_or(value).trim().to_string()
}

/// Response echoing the transaction headers of a request verbatim.
fn echo_response(msg: &SipMessage, status: u16, reason: &str) -> SipMessage {
    let mut resp = SipMessage::response(status, reason);
    for via in msg.headers.get_all("Via") {
        resp.headers.append("Via", via);
    }
    for name in ["From", "To", "Call-ID", "CSeq"] {
        if let Some(value) = msg.header(name) {
            resp.headers.append(name, value);
        }
    }
    resp
}

fn ensure_to_tag(resp: &mut SipMessage, tag: &str) {
    if let Some(to) = resp.header("To").map(str::to_string) {
        if tag_of(&to).is_none() {
            resp.headers.set("To", format!("{};tag={}", to, tag));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallState {
    Calling,
    Ringing,
    RingingIn,
    Active,
    Terminating,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Outbound,
    Inbound,
}

/// Transaction headers of an inbound INVITE, preserved so every response
/// within the transaction echoes exactly what arrived.
#[derive(Debug, Clone)]
struct IncomingInvite {
    vias: Vec<String>,
    from: String,
    to: String,
    call_id: String,
    cseq: String,
    offer: String,
}

impl IncomingInvite {
    fn response(&self, status: u16, reason: &str) -> SipMessage {
        let mut resp = SipMessage::response(status, reason);
        for via in &self.vias {
            resp.headers.append("Via", via.clone());
        }
        resp.headers.append("From", self.from.clone());
        resp.headers.append("To", self.to.clone());
        resp.headers.append("Call-ID", self.call_id.clone());
        resp.headers.append("CSeq", self.cseq.clone());
        resp
    }
}

/// The single dialog. At most one exists at any time; a second INVITE gets
/// 486 without touching it.
struct Call {
    call_id: String,
    local_tag: String,
    remote_tag: Option<String>,
    /// Name-addr values without tags; tags are appended when building
    /// in-dialog requests.
    local_identity: String,
    remote_identity: String,
    /// Request-URI for in-dialog requests (remote Contact once known).
    remote_target: String,
    direction: Direction,
    state: CallState,
    /// Our own CSeq counter for requests we originate in this dialog.
    cseq: u32,
    invite_branch: String,
    invite_cseq: u32,
    local_sdp: String,
    rtp: Option<Arc<RtpSession>>,
    auth_attempted: bool,
    incoming: Option<IncomingInvite>,
    guard_task: Option<JoinHandle<()>>,
}

struct PendingRegister {
    cseq: u32,
    wire: Vec<u8>,
    attempts: u32,
    unregister: bool,
    timer: JoinHandle<()>,
}

struct Registration {
    call_id: String,
    local_tag: String,
    cseq: u32,
    registered: bool,
    auth_attempted: bool,
    pending: Option<PendingRegister>,
    refresh_task: Option<JoinHandle<()>>,
}

impl Registration {
    fn cancel_timers(&mut self) {
        if let Some(pending) = self.pending.take() {
            pending.timer.abort();
        }
        if let Some(task) = self.refresh_task.take() {
            task.abort();
        }
    }
}

struct Engine {
    config: Config,
    events: EventSink,
    transport: Option<Arc<SipTransport>>,
    local_ip: String,
    registration: Option<Registration>,
    call: Option<Call>,
    stopped: bool,
    dispatch_task: Option<JoinHandle<()>>,
}

impl Engine {
    fn is_registered(&self) -> bool {
        self.registration
            .as_ref()
            .map(|r| r.registered)
            .unwrap_or(false)
    }

    fn local_sip_port(&self) -> u16 {
        self.transport
            .as_ref()
            .map(|t| t.local_addr().port())
            .unwrap_or(0)
    }

    fn via_value(&self, branch: &str) -> String {
        format!(
            "SIP/2.0/{} {}:{};branch={}",
            self.config.transport.via_token(),
            self.local_ip,
            self.local_sip_port(),
            branch
        )
    }

    fn local_contact(&self) -> String {
        format!(
            "<sip:{}@{}:{};transport={}>",
            self.config.extension,
            self.local_ip,
            self.local_sip_port(),
            self.config.transport.uri_param()
        )
    }

    fn build_request(
        &self,
        method: &str,
        uri: &str,
        branch: &str,
        from: String,
        to: String,
        call_id: &str,
        cseq: u32,
    ) -> SipMessage {
        let mut msg = SipMessage::request(method, uri);
        msg.headers.append("Via", self.via_value(branch));
        msg.headers.append("Max-Forwards", "70");
        msg.headers.append("From", from);
        msg.headers.append("To", to);
        msg.headers.append("Call-ID", call_id);
        msg.headers.append("CSeq", format!("{} {}", cseq, method));
        msg.headers.append("Allow", ALLOW_METHODS);
        msg.headers.append("User-Agent", USER_AGENT);
        msg
    }

    fn build_register(
        &self,
        call_id: &str,
        local_tag: &str,
        cseq: u32,
        expires: u32,
        authorization: Option<&str>,
    ) -> SipMessage {
        let identity = self.config.identity();
        let mut msg = self.build_request(
            "REGISTER",
            &self.config.registrar_uri(),
            &new_branch(),
            format!("{};tag={}", identity, local_tag),
            identity,
            call_id,
            cseq,
        );
        msg.headers.append("Contact", self.local_contact());
        msg.headers.append("Expires", expires.to_string());
        if let Some(value) = authorization {
            msg.headers.append("Authorization", value);
        }
        msg
    }

    async fn send_sip(&mut self, msg: &SipMessage) -> Result<()> {
        let transport = self
            .transport
            .clone()
            .ok_or_else(|| Error::Transport("not connected".to_string()))?;
        let wire = msg.to_bytes();
        self.events.log(LogLevel::Sip, format!(">> {}", msg.summary()));
        tracing::debug!("[SIP] sending:\n{}", String::from_utf8_lossy(&wire));
        transport.send(&wire).await
    }

    async fn terminate_call(&mut self, reason: &str) {
        if let Some(mut call) = self.call.take() {
            if let Some(task) = call.guard_task.take() {
                task.abort();
            }
            if let Some(rtp) = call.rtp.take() {
                rtp.close().await;
            }
            self.events.call_state(CallPhase::Idle, reason);
            self.events
                .log(LogLevel::Call, format!("[SIP] call ended: {}", reason));
        }
    }

    fn clear_registration(&mut self) {
        if let Some(mut registration) = self.registration.take() {
            registration.cancel_timers();
        }
    }

    async fn close_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.close().await;
        }
        if let Some(task) = self.dispatch_task.take() {
            task.abort();
        }
    }
}

/// The softphone core. Cheap to clone via the handle inside; all methods
/// are fire-and-forget from the shell's point of view: failures surface on
/// the event channel, never as a panic or an `Err`.
pub struct Softphone {
    engine: Arc<Mutex<Engine>>,
}

impl Softphone {
    pub fn new(config: Config) -> (Softphone, mpsc::UnboundedReceiver<Event>) {
        let (events, rx) = EventSink::channel();
        let engine = Engine {
            config,
            events,
            transport: None,
            local_ip: "127.0.0.1".to_string(),
            registration: None,
            call: None,
            stopped: false,
            dispatch_task: None,
        };
        (
            Softphone {
                engine: Arc::new(Mutex::new(engine)),
            },
            rx,
        )
    }

    /// Swap in new account settings. Takes effect on the next `register()`.
    pub async fn configure(&self, config: Config) {
        let mut engine = self.engine.lock().await;
        if engine.stopped {
            return;
        }
        engine.events.log(
            LogLevel::Info,
            format!(
                "[SIP] account configured: {} over {}",
                config.aor(),
                config.transport.via_token()
            ),
        );
        engine.config = config;
    }

    /// Resolve the registrar, open the transport and send the initial
    /// REGISTER. Progress and outcome arrive on the event channel.
    pub async fn register(&self) {
        let mut engine = self.engine.lock().await;
        if engine.stopped {
            return;
        }
        if let Err(err) = register_flow(&mut engine, &self.engine).await {
            engine
                .events
                .log(LogLevel::Error, format!("[SIP] register failed: {}", err));
            engine
                .events
                .status(LinkState::Disconnected, err.to_string());
        }
    }

    /// REGISTER with `Expires: 0`, then tear the transport down two
    /// seconds later no matter what the registrar said.
    pub async fn unregister(&self) {
        let mut engine = self.engine.lock().await;
        if engine.stopped {
            return;
        }
        let ctx = match engine.registration.as_mut() {
            Some(reg) if reg.registered => {
                reg.registered = false;
                reg.auth_attempted = false;
                reg.cseq += 1;
                if let Some(task) = reg.refresh_task.take() {
                    task.abort();
                }
                Some((reg.call_id.clone(), reg.local_tag.clone(), reg.cseq))
            }
            _ => None,
        };
        if let Some((call_id, local_tag, cseq)) = ctx {
            engine.events.log(LogLevel::Info, "[SIP] unregistering");
            let msg = engine.build_register(&call_id, &local_tag, cseq, 0, None);
            if let Err(err) = send_register(&mut engine, &self.engine, msg, cseq, true).await {
                engine
                    .events
                    .log(LogLevel::Warn, format!("[SIP] unregister send failed: {}", err));
            }
        }
        let handle = self.engine.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(UNREGISTER_LINGER_SECS)).await;
            let mut engine = handle.lock().await;
            if engine.stopped {
                return;
            }
            engine.terminate_call("Disconnected").await;
            engine.clear_registration();
            engine.close_transport().await;
            engine.events.status(LinkState::Disconnected, "Unregistered");
        });
    }

    /// Place a call. `target` is `user@host`, a full SIP URI, or a bare
    /// dial string completed with the configured server.
    pub async fn invite(&self, target: &str) {
        let mut engine = self.engine.lock().await;
        if engine.stopped {
            return;
        }
        if let Err(err) = invite_flow(&mut engine, &self.engine, target).await {
            engine.events.log(
                LogLevel::Error,
                format!("[SIP] call to {} failed: {}", target, err),
            );
        }
    }

    /// Answer the ringing inbound call with a 200 + SDP answer.
    pub async fn answer(&self) {
        let mut engine = self.engine.lock().await;
        if engine.stopped {
            return;
        }
        if let Err(err) = answer_flow(&mut engine).await {
            engine
                .events
                .log(LogLevel::Error, format!("[SIP] answer failed: {}", err));
        }
    }

    /// End whatever is in progress: CANCEL while calling, 486 while
    /// ringing inbound, BYE while active.
    pub async fn hangup(&self) {
        let mut engine = self.engine.lock().await;
        if engine.stopped {
            return;
        }
        if let Err(err) = hangup_flow(&mut engine, &self.engine).await {
            engine
                .events
                .log(LogLevel::Warn, format!("[SIP] hangup: {}", err));
        }
    }

    /// Flip the microphone mute. Muted calls keep their 20 ms cadence with
    /// silence payloads. Returns the new state.
    pub async fn toggle_mute(&self) -> bool {
        let (rtp, events) = {
            let engine = self.engine.lock().await;
            (
                engine.call.as_ref().and_then(|c| c.rtp.clone()),
                engine.events.clone(),
            )
        };
        let Some(rtp) = rtp else {
            return false;
        };
        let muted = rtp.toggle_mute().await;
        events.log(
            LogLevel::Call,
            if muted {
                "[SIP] microphone muted"
            } else {
                "[SIP] microphone unmuted"
            },
        );
        muted
    }

    /// Send one DTMF digit as SIP INFO (application/dtmf-relay).
    pub async fn send_dtmf(&self, digit: char) {
        let mut engine = self.engine.lock().await;
        if engine.stopped {
            return;
        }
        if !"0123456789*#ABCD".contains(digit) {
            engine
                .events
                .log(LogLevel::Warn, format!("[SIP] invalid DTMF digit '{}'", digit));
            return;
        }
        let ctx = match engine.call.as_mut() {
            Some(call) if call.state == CallState::Active => {
                call.cseq += 1;
                let to = match &call.remote_tag {
                    Some(tag) => format!("{};tag={}", call.remote_identity, tag),
                    None => call.remote_identity.clone(),
                };
                Some((
                    call.remote_target.clone(),
                    format!("{};tag={}", call.local_identity, call.local_tag),
                    to,
                    call.call_id.clone(),
                    call.cseq,
                ))
            }
            _ => None,
        };
        let Some((target, from, to, call_id, cseq)) = ctx else {
            engine
                .events
                .log(LogLevel::Warn, "[SIP] DTMF ignored, no active call");
            return;
        };
        let mut msg = engine.build_request("INFO", &target, &new_branch(), from, to, &call_id, cseq);
        msg.headers.append("Content-Type", "application/dtmf-relay");
        msg.body = format!("Signal={}\r\nDuration=160\r\n", digit).into_bytes();
        if let Err(err) = engine.send_sip(&msg).await {
            engine
                .events
                .log(LogLevel::Warn, format!("[SIP] DTMF send failed: {}", err));
        } else {
            engine
                .events
                .log(LogLevel::Call, format!("[SIP] sent DTMF '{}'", digit));
        }
    }

    /// Queue one 20 ms microphone frame (16-bit LE PCM) for the active
    /// call. Other frame sizes are tolerated, one block per tick.
    pub async fn feed_mic_audio(&self, pcm: &[u8]) {
        let rtp = {
            let engine = self.engine.lock().await;
            engine
                .call
                .as_ref()
                .filter(|c| c.state == CallState::Active)
                .and_then(|c| c.rtp.clone())
        };
        if let Some(rtp) = rtp {
            rtp.feed_mic(pcm).await;
        }
    }

    /// Shut everything down. Idempotent; no event is delivered after this
    /// returns.
    pub async fn stop(&self) {
        let mut engine = self.engine.lock().await;
        if engine.stopped {
            return;
        }
        engine.stopped = true;
        engine.terminate_call("Stopped").await;
        engine.clear_registration();
        engine.close_transport().await;
        engine.events.status(LinkState::Disconnected, "Stopped");
        engine.events.close();
    }
}

/// Local IPv4 the OS would use to reach the server, found by "connecting"
/// a throwaway datagram socket.
fn local_ip_for(server: SocketAddr) -> String {
    match std::net::UdpSocket::bind("0.0.0.0:0") {
        Ok(socket) => match socket.connect(server) {
            Ok(_) => socket
                .local_addr()
                .map(|addr| addr.ip().to_string())
                .unwrap_or_else(|_| "127.0.0.1".to_string()),
            Err(_) => "127.0.0.1".to_string(),
        },
        Err(_) => "127.0.0.1".to_string(),
    }
}

async fn register_flow(engine: &mut Engine, handle: &Arc<Mutex<Engine>>) -> Result<()> {
    engine.clear_registration();

    let server = engine.config.server.clone();
    let port = engine.config.effective_port();
    engine
        .events
        .status(LinkState::Connecting, format!("Connecting to {}", server));

    let server_addr = tokio::net::lookup_host((server.as_str(), port))
        .await
        .map_err(|err| Error::Transport(format!("DNS lookup failed for {}: {}", server, err)))?
        .find(|addr| addr.is_ipv4())
        .ok_or_else(|| Error::Transport(format!("no IPv4 address for {}", server)))?;
    engine.local_ip = local_ip_for(server_addr);

    if engine.transport.is_none() {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(
            SipTransport::connect(engine.config.transport, server_addr, &server, tx).await?,
        );
        engine.events.log(
            LogLevel::Info,
            format!(
                "[SIP] {} transport up, local {}:{}",
                engine.config.transport.via_token(),
                engine.local_ip,
                transport.local_addr().port()
            ),
        );
        engine.transport = Some(transport);
        engine.dispatch_task = Some(tokio::spawn(dispatch_loop(handle.clone(), rx)));
    }

    let registration = Registration {
        call_id: new_call_id(),
        local_tag: new_tag(),
        cseq: 1,
        registered: false,
        auth_attempted: false,
        pending: None,
        refresh_task: None,
    };
    let call_id = registration.call_id.clone();
    let local_tag = registration.local_tag.clone();
    engine.registration = Some(registration);

    engine.events.log(
        LogLevel::Info,
        format!("[SIP] registering {} at {}", engine.config.aor(), server_addr),
    );
    let msg = engine.build_register(&call_id, &local_tag, 1, REGISTER_EXPIRES, None);
    send_register(engine, handle, msg, 1, false).await
}

/// Send a REGISTER and arm the 5 s retransmission timer for it.
async fn send_register(
    engine: &mut Engine,
    handle: &Arc<Mutex<Engine>>,
    msg: SipMessage,
    cseq: u32,
    unregister: bool,
) -> Result<()> {
    let wire = msg.to_bytes();
    engine.send_sip(&msg).await?;
    if let Some(reg) = engine.registration.as_mut() {
        if let Some(old) = reg.pending.take() {
            old.timer.abort();
        }
        reg.pending = Some(PendingRegister {
            cseq,
            wire,
            attempts: 0,
            unregister,
            timer: spawn_register_timer(handle.clone(), cseq),
        });
    }
    Ok(())
}

fn spawn_register_timer(handle: Arc<Mutex<Engine>>, cseq: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::time::sleep(Duration::from_secs(REGISTER_RETRY_SECS)).await;
            let mut engine = handle.lock().await;
            if engine.stopped {
                break;
            }
            enum TimerStep {
                Resend(Vec<u8>, u32),
                GiveUp,
                Done,
            }
            let step = match engine.registration.as_mut() {
                Some(reg) => match reg.pending.as_mut() {
                    Some(pending) if pending.cseq == cseq => {
                        if pending.attempts >= REGISTER_MAX_RETRIES {
                            TimerStep::GiveUp
                        } else {
                            pending.attempts += 1;
                            TimerStep::Resend(pending.wire.clone(), pending.attempts)
                        }
                    }
                    _ => TimerStep::Done,
                },
                None => TimerStep::Done,
            };
            match step {
                TimerStep::Resend(wire, attempt) => {
                    engine.events.log(
                        LogLevel::Warn,
                        format!(
                            "[SIP] no response to REGISTER, retrying ({}/{})",
                            attempt, REGISTER_MAX_RETRIES
                        ),
                    );
                    if let Some(transport) = engine.transport.clone() {
                        if let Err(err) = transport.send(&wire).await {
                            engine
                                .events
                                .log(LogLevel::Error, format!("[SIP] resend failed: {}", err));
                        }
                    }
                }
                TimerStep::GiveUp => {
                    engine.events.log(
                        LogLevel::Error,
                        "[SIP] registrar did not answer, giving up",
                    );
                    engine.events.status(LinkState::Disconnected, "no-response");
                    engine.terminate_call("Transport lost").await;
                    engine.clear_registration();
                    engine.close_transport().await;
                    break;
                }
                TimerStep::Done => break,
            }
        }
    })
}

fn spawn_refresh(handle: Arc<Mutex<Engine>>, granted: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        // 5/6 of what the registrar granted, never more often than once a
        // minute.
        let secs = ((granted as u64) * 5 / 6).max(MIN_REFRESH_SECS);
        tokio::time::sleep(Duration::from_secs(secs)).await;
        let mut engine = handle.lock().await;
        if engine.stopped {
            return;
        }
        let ctx = match engine.registration.as_mut() {
            Some(reg) if reg.registered => {
                reg.cseq += 1;
                // plain refresh; the registrar challenges again if it
                // wants a fresh nonce
                reg.auth_attempted = false;
                Some((reg.call_id.clone(), reg.local_tag.clone(), reg.cseq))
            }
            _ => None,
        };
        let Some((call_id, local_tag, cseq)) = ctx else {
            return;
        };
        engine
            .events
            .log(LogLevel::Info, "[SIP] refreshing registration");
        let msg = engine.build_register(&call_id, &local_tag, cseq, REGISTER_EXPIRES, None);
        if let Err(err) = send_register(&mut engine, &handle, msg, cseq, false).await {
            engine
                .events
                .log(LogLevel::Error, format!("[SIP] refresh failed: {}", err));
        }
    })
}

fn spawn_invite_guard(handle: Arc<Mutex<Engine>>, call_id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(INVITE_TIMEOUT_SECS)).await;
        let mut engine = handle.lock().await;
        if engine.stopped {
            return;
        }
        let stuck = engine
            .call
            .as_ref()
            .map(|c| {
                c.call_id == call_id && matches!(c.state, CallState::Calling | CallState::Ringing)
            })
            .unwrap_or(false);
        if stuck {
            // keep the record in Terminating (as hangup does) so a late
            // final response can still be ACKed; the sweep reaps it
            let (call_id, rtp) = {
                let Some(call) = engine.call.as_mut() else {
                    return;
                };
                call.guard_task = None;
                call.state = CallState::Terminating;
                (call.call_id.clone(), call.rtp.take())
            };
            if let Some(rtp) = rtp {
                rtp.close().await;
            }
            engine
                .events
                .log(LogLevel::Error, "[SIP] no final answer to INVITE, giving up");
            engine.events.call_state(CallPhase::Idle, "Timeout");
            engine
                .events
                .log(LogLevel::Call, "[SIP] call ended: Timeout");
            spawn_call_sweep(handle.clone(), call_id);
        }
    })
}

/// Drop a call record that stayed in Terminating because the peer never
/// answered our CANCEL/BYE.
fn spawn_call_sweep(handle: Arc<Mutex<Engine>>, call_id: String) -> JoinHandle<()> {
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(TERMINATED_SWEEP_SECS)).await;
        let mut engine = handle.lock().await;
        if engine.stopped {
            return;
        }
        let expired = engine
            .call
            .as_ref()
            .map(|c| c.call_id == call_id && c.state == CallState::Terminating)
            .unwrap_or(false);
        if expired {
            if let Some(mut call) = engine.call.take() {
                if let Some(task) = call.guard_task.take() {
                    task.abort();
                }
                if let Some(rtp) = call.rtp.take() {
                    rtp.close().await;
                }
            }
        }
    })
}

async fn invite_flow(engine: &mut Engine, handle: &Arc<Mutex<Engine>>, target: &str) -> Result<()> {
    if engine.transport.is_none() || !engine.is_registered() {
        return Err(Error::Protocol("not registered".to_string()));
    }
    if engine.call.is_some() {
        return Err(Error::Protocol("a call is already in progress".to_string()));
    }

    let target_uri = if target.starts_with("sip:") {
        target.to_string()
    } else if target.contains('@') {
        format!("sip:{}", target)
    } else {
        format!("sip:{}@{}", target, engine.config.server)
    };

    let rtp = Arc::new(RtpSession::bind(engine.events.clone()).await?);
    let local_sdp = sdp::build_offer(
        &engine.config.extension,
        now_secs(),
        &engine.local_ip,
        rtp.local_port(),
    );

    let call_id = new_call_id();
    let local_tag = new_tag();
    let branch = new_branch();
    let identity = engine.config.identity();

    let mut msg = engine.build_request(
        "INVITE",
        &target_uri,
        &branch,
        format!("{};tag={}", identity, local_tag),
        format!("<{}>", target_uri),
        &call_id,
        1,
    );
    msg.headers.append("Contact", engine.local_contact());
    msg.headers.append("Content-Type", "application/sdp");
    msg.body = local_sdp.clone().into_bytes();

    engine.call = Some(Call {
        call_id: call_id.clone(),
        local_tag,
        remote_tag: None,
        local_identity: identity,
        remote_identity: format!("<{}>", target_uri),
        remote_target: target_uri.clone(),
        direction: Direction::Outbound,
        state: CallState::Calling,
        cseq: 1,
        invite_branch: branch,
        invite_cseq: 1,
        local_sdp,
        rtp: Some(rtp),
        auth_attempted: false,
        incoming: None,
        guard_task: Some(spawn_invite_guard(handle.clone(), call_id)),
    });

    if let Err(err) = engine.send_sip(&msg).await {
        // roll back the call this flow just created
        engine.terminate_call(&err.to_string()).await;
        return Err(err);
    }
    engine
        .events
        .log(LogLevel::Call, format!("[SIP] calling {}", target_uri));
    engine.events.call_state(CallPhase::Calling, target_uri);
    Ok(())
}

async fn answer_flow(engine: &mut Engine) -> Result<()> {
    let (incoming, local_tag, caller) = {
        let Some(call) = engine.call.as_ref() else {
            return Err(Error::Protocol("no incoming call".to_string()));
        };
        if call.direction != Direction::Inbound || call.state != CallState::RingingIn {
            return Err(Error::Protocol("no ringing incoming call".to_string()));
        }
        let incoming = call
            .incoming
            .clone()
            .ok_or_else(|| Error::Protocol("incoming call lost its offer".to_string()))?;
        (incoming, call.local_tag.clone(), uri_of(&call.remote_identity))
    };

    let offer = sdp::parse(&incoming.offer)?;
    let (ip, port, _) = offer.audio_endpoint()?;
    let payload_type = sdp::answer_payload_type(&offer);
    let remote: SocketAddr = format!("{}:{}", ip, port)
        .parse()
        .map_err(|_| Error::Media(format!("unusable media address {}:{}", ip, port)))?;

    let rtp = Arc::new(RtpSession::bind(engine.events.clone()).await?);
    let answer = sdp::build_answer(
        &engine.config.extension,
        now_secs(),
        &engine.local_ip,
        rtp.local_port(),
        &offer,
    );

    let mut ok = incoming.response(200, "OK");
    ensure_to_tag(&mut ok, &local_tag);
    ok.headers.append("Contact", engine.local_contact());
    ok.headers.append("Allow", ALLOW_METHODS);
    ok.headers.append("Content-Type", "application/sdp");
    ok.body = answer.clone().into_bytes();
    engine.send_sip(&ok).await?;

    rtp.start(remote, payload_type).await;
    if let Some(call) = engine.call.as_mut() {
        call.rtp = Some(rtp);
        call.local_sdp = answer;
        call.state = CallState::Active;
    }
    engine
        .events
        .log(LogLevel::Call, format!("[SIP] call with {} answered", caller));
    engine.events.call_state(CallPhase::Active, caller);
    Ok(())
}

async fn hangup_flow(engine: &mut Engine, handle: &Arc<Mutex<Engine>>) -> Result<()> {
    let state = engine
        .call
        .as_ref()
        .map(|c| c.state)
        .ok_or_else(|| Error::Protocol("no call to hang up".to_string()))?;
    match state {
        CallState::Calling | CallState::Ringing => {
            let (target, branch, invite_cseq, from, to, call_id) = {
                let Some(call) = engine.call.as_mut() else {
                    return Ok(());
                };
                if let Some(task) = call.guard_task.take() {
                    task.abort();
                }
                call.state = CallState::Terminating;
                (
                    call.remote_target.clone(),
                    call.invite_branch.clone(),
                    call.invite_cseq,
                    format!("{};tag={}", call.local_identity, call.local_tag),
                    call.remote_identity.clone(),
                    call.call_id.clone(),
                )
            };
            if let Some(rtp) = engine.call.as_mut().and_then(|c| c.rtp.take()) {
                rtp.close().await;
            }
            // CANCEL rides the INVITE's branch and CSeq number
            let mut msg = SipMessage::request("CANCEL", &target);
            msg.headers.append("Via", engine.via_value(&branch));
            msg.headers.append("Max-Forwards", "70");
            msg.headers.append("From", from);
            msg.headers.append("To", to);
            msg.headers.append("Call-ID", call_id.clone());
            msg.headers.append("CSeq", format!("{} CANCEL", invite_cseq));
            msg.headers.append("Allow", ALLOW_METHODS);
            msg.headers.append("User-Agent", USER_AGENT);
            engine.send_sip(&msg).await?;
            engine.events.call_state(CallPhase::Idle, "Cancelled");
            engine.events.log(LogLevel::Call, "[SIP] call cancelled");
            spawn_call_sweep(handle.clone(), call_id);
        }
        CallState::RingingIn => {
            let (incoming, local_tag) = {
                let Some(call) = engine.call.as_ref() else {
                    return Ok(());
                };
                (call.incoming.clone(), call.local_tag.clone())
            };
            if let Some(incoming) = incoming {
                let mut busy = incoming.response(486, "Busy Here");
                ensure_to_tag(&mut busy, &local_tag);
                engine.send_sip(&busy).await?;
            }
            engine.terminate_call("Declined").await;
        }
        CallState::Active => {
            let (target, from, to, call_id, cseq) = {
                let Some(call) = engine.call.as_mut() else {
                    return Ok(());
                };
                if let Some(task) = call.guard_task.take() {
                    task.abort();
                }
                call.state = CallState::Terminating;
                call.cseq += 1;
                let to = match &call.remote_tag {
                    Some(tag) => format!("{};tag={}", call.remote_identity, tag),
                    None => call.remote_identity.clone(),
                };
                (
                    call.remote_target.clone(),
                    format!("{};tag={}", call.local_identity, call.local_tag),
                    to,
                    call.call_id.clone(),
                    call.cseq,
                )
            };
            // stop media before signaling so no audio trails the hangup
            if let Some(rtp) = engine.call.as_mut().and_then(|c| c.rtp.take()) {
                rtp.close().await;
            }
            let msg = engine.build_request("BYE", &target, &new_branch(), from, to, &call_id, cseq);
            // best effort, single attempt
            engine.send_sip(&msg).await?;
            engine.events.call_state(CallPhase::Idle, "Call ended");
            engine.events.log(LogLevel::Call, "[SIP] hangup, BYE sent");
            spawn_call_sweep(handle.clone(), call_id);
        }
        CallState::Terminating => {}
    }
    Ok(())
}

async fn dispatch_loop(
    handle: Arc<Mutex<Engine>>,
    mut rx: mpsc::UnboundedReceiver<TransportEvent>,
) {
    while let Some(event) = rx.recv().await {
        let mut engine = handle.lock().await;
        if engine.stopped {
            break;
        }
        match event {
            TransportEvent::Message { data, source } => {
                handle_message(&mut engine, &handle, data, source).await;
            }
            TransportEvent::Closed { reason } => {
                engine
                    .events
                    .log(LogLevel::Error, format!("[SIP] transport lost: {}", reason));
                engine.terminate_call("Transport lost").await;
                engine.clear_registration();
                engine.close_transport().await;
                engine.events.status(LinkState::Disconnected, reason);
                break;
            }
        }
    }
}

async fn handle_message(
    engine: &mut Engine,
    handle: &Arc<Mutex<Engine>>,
    data: Vec<u8>,
    source: SocketAddr,
) {
    let msg = match SipMessage::parse(&data) {
        Ok(msg) => msg,
        Err(err) => {
            engine.events.log(
                LogLevel::Warn,
                format!("[SIP] dropping unparseable message from {}: {}", source, err),
            );
            return;
        }
    };
    engine
        .events
        .log(LogLevel::Sip, format!("<< {}", msg.summary()));
    tracing::debug!("[SIP] received from {}:\n{}", source, msg.raw);

    if msg.is_request() {
        handle_request(engine, msg).await;
    } else {
        handle_response(engine, handle, msg).await;
    }
}

async fn handle_response(engine: &mut Engine, handle: &Arc<Mutex<Engine>>, msg: SipMessage) {
    let Some((_, method)) = msg.cseq() else {
        engine
            .events
            .log(LogLevel::Warn, "[SIP] response without CSeq dropped");
        return;
    };
    let call_id = msg.call_id().unwrap_or("").to_string();

    let for_registration = engine
        .registration
        .as_ref()
        .map(|r| r.call_id == call_id)
        .unwrap_or(false);
    if method == "REGISTER" && for_registration {
        handle_register_response(engine, handle, msg).await;
        return;
    }

    let for_call = engine
        .call
        .as_ref()
        .map(|c| c.call_id == call_id)
        .unwrap_or(false);
    if !for_call {
        tracing::debug!("[SIP] response for unknown dialog {} ignored", call_id);
        return;
    }
    match method.as_str() {
        "INVITE" => handle_invite_response(engine, msg).await,
        "BYE" => {
            // dialog is down once the BYE is answered, whatever the status
            if engine
                .call
                .as_ref()
                .map(|c| c.state == CallState::Terminating)
                .unwrap_or(false)
            {
                if let Some(mut call) = engine.call.take() {
                    if let Some(task) = call.guard_task.take() {
                        task.abort();
                    }
                    if let Some(rtp) = call.rtp.take() {
                        rtp.close().await;
                    }
                }
            }
        }
        "CANCEL" | "INFO" => {
            tracing::debug!("[SIP] {} answered with {:?}", method, msg.status());
        }
        _ => {}
    }
}

async fn handle_register_response(
    engine: &mut Engine,
    handle: &Arc<Mutex<Engine>>,
    msg: SipMessage,
) {
    let status = msg.status().unwrap_or(0);

    // This response settles the outstanding transaction; stop its timer.
    let pending = {
        let Some(reg) = engine.registration.as_mut() else {
            return;
        };
        match reg.pending.take() {
            Some(pending) => {
                pending.timer.abort();
                pending
            }
            None => {
                tracing::debug!("[SIP] stale REGISTER response ignored");
                return;
            }
        }
    };

    match status {
        200..=299 => {
            if pending.unregister {
                engine.events.log(LogLevel::Info, "[SIP] unregistered");
                return;
            }
            let granted = msg
                .header("Expires")
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(REGISTER_EXPIRES);
            if let Some(reg) = engine.registration.as_mut() {
                reg.registered = true;
                reg.auth_attempted = false;
                if let Some(task) = reg.refresh_task.take() {
                    task.abort();
                }
                reg.refresh_task = Some(spawn_refresh(handle.clone(), granted));
            }
            engine
                .events
                .log(LogLevel::Info, format!("[SIP] registered for {}s", granted));
            engine.events.status(LinkState::Connected, "Registered");
        }
        401 | 407 => {
            let ctx = {
                let Some(reg) = engine.registration.as_mut() else {
                    return;
                };
                if reg.auth_attempted {
                    None
                } else {
                    reg.auth_attempted = true;
                    reg.cseq += 1;
                    Some((reg.call_id.clone(), reg.local_tag.clone(), reg.cseq))
                }
            };
            let Some((call_id, local_tag, cseq)) = ctx else {
                engine.events.log(
                    LogLevel::Error,
                    "[SIP] credentials rejected by registrar",
                );
                engine
                    .events
                    .status(LinkState::Disconnected, "Authentication failed");
                engine.clear_registration();
                return;
            };
            let challenge = msg
                .header("WWW-Authenticate")
                .or_else(|| msg.header("Proxy-Authenticate"))
                .ok_or_else(|| Error::Auth("challenge without authenticate header".to_string()))
                .and_then(auth::parse_challenge);
            let challenge = match challenge {
                Ok(challenge) => challenge,
                Err(err) => {
                    engine
                        .events
                        .log(LogLevel::Error, format!("[SIP] {}", err));
                    engine
                        .events
                        .status(LinkState::Disconnected, "Authentication failed");
                    engine.clear_registration();
                    return;
                }
            };
            engine.events.log(
                LogLevel::Info,
                format!("[SIP] authenticating (realm \"{}\")", challenge.realm),
            );
            let uri = engine.config.registrar_uri();
            let authorization = challenge.authorization(
                &engine.config.extension,
                &engine.config.password,
                "REGISTER",
                &uri,
            );
            let expires = if pending.unregister { 0 } else { REGISTER_EXPIRES };
            let retry =
                engine.build_register(&call_id, &local_tag, cseq, expires, Some(&authorization));
            if let Err(err) =
                send_register(engine, handle, retry, cseq, pending.unregister).await
            {
                engine.events.log(
                    LogLevel::Error,
                    format!("[SIP] authenticated REGISTER failed: {}", err),
                );
                engine.events.status(LinkState::Disconnected, err.to_string());
            }
        }
        _ => {
            let reason = format!("{} {}", status, msg.reason());
            engine
                .events
                .log(LogLevel::Error, format!("[SIP] registration failed: {}", reason));
            engine.events.status(LinkState::Disconnected, reason);
            engine.clear_registration();
        }
    }
}

async fn handle_invite_response(engine: &mut Engine, msg: SipMessage) {
    let status = msg.status().unwrap_or(0);
    let to_tag = msg.header("To").and_then(tag_of);

    enum Step {
        Provisional,
        Establish,
        Reauth,
        Fail,
        LateFinal,
        Ignore,
    }
    let step = {
        let Some(call) = engine.call.as_mut() else {
            return;
        };
        let Some((cseq, _)) = msg.cseq() else {
            return;
        };
        if cseq != call.invite_cseq {
            return; // answer to a superseded INVITE transaction
        }
        // dialog-forming tags come from ringing or success responses only
        if matches!(status, 180..=299) {
            if let Some(tag) = &to_tag {
                if call.remote_tag.is_none() {
                    call.remote_tag = Some(tag.clone());
                }
            }
        }
        match (call.state, status) {
            (CallState::Terminating, 200..) => Step::LateFinal,
            (_, 100..=199) => Step::Provisional,
            (_, 200..=299) => Step::Establish,
            (_, 401) | (_, 407) if !call.auth_attempted => Step::Reauth,
            (_, 300..) => Step::Fail,
            _ => Step::Ignore,
        }
    };

    match step {
        Step::Provisional => {
            if status == 100 {
                engine
                    .events
                    .log(LogLevel::Call, "[SIP] call is being processed");
                return;
            }
            let transitioned = {
                let Some(call) = engine.call.as_mut() else {
                    return;
                };
                if call.state == CallState::Calling {
                    call.state = CallState::Ringing;
                    true
                } else {
                    false
                }
            };
            if transitioned {
                engine
                    .events
                    .log(LogLevel::Call, "[SIP] remote party is ringing");
                engine.events.call_state(CallPhase::Ringing, "Ringing");
            }
        }
        Step::Establish => {
            let (target, from, call_id, invite_cseq, remote_label) = {
                let Some(call) = engine.call.as_mut() else {
                    return;
                };
                call.state = CallState::Active;
                if let Some(task) = call.guard_task.take() {
                    task.abort();
                }
                if let Some(contact) = msg.header("Contact") {
                    call.remote_target = uri_of(contact);
                }
                if let Some(to) = msg.header("To") {
                    call.remote_identity = without_tag(to);
                }
                (
                    call.remote_target.clone(),
                    format!("{};tag={}", call.local_identity, call.local_tag),
                    call.call_id.clone(),
                    call.invite_cseq,
                    uri_of(&call.remote_identity),
                )
            };

            // ACK for a 2xx is its own transaction: fresh branch, the
            // INVITE's CSeq number with method ACK
            let to_header = msg.header("To").unwrap_or("").to_string();
            let mut ack = SipMessage::request("ACK", &target);
            ack.headers.append("Via", engine.via_value(&new_branch()));
            ack.headers.append("Max-Forwards", "70");
            ack.headers.append("From", from);
            ack.headers.append("To", to_header);
            ack.headers.append("Call-ID", call_id);
            ack.headers.append("CSeq", format!("{} ACK", invite_cseq));
            ack.headers.append("Allow", ALLOW_METHODS);
            ack.headers.append("User-Agent", USER_AGENT);
            if let Err(err) = engine.send_sip(&ack).await {
                engine
                    .events
                    .log(LogLevel::Error, format!("[SIP] ACK failed: {}", err));
            }

            // wire the answer's media endpoint into the RTP engine
            let body = String::from_utf8_lossy(&msg.body).into_owned();
            let endpoint = sdp::parse(&body).and_then(|s| s.audio_endpoint());
            match endpoint {
                Ok((ip, port, payload_type)) => {
                    let rtp = engine.call.as_ref().and_then(|c| c.rtp.clone());
                    match (rtp, format!("{}:{}", ip, port).parse::<SocketAddr>()) {
                        (Some(rtp), Ok(addr)) => rtp.start(addr, payload_type).await,
                        (_, Err(_)) => engine.events.log(
                            LogLevel::Error,
                            format!("[SIP] unusable media address {}:{}", ip, port),
                        ),
                        (None, _) => {}
                    }
                }
                Err(err) => {
                    engine
                        .events
                        .log(LogLevel::Warn, format!("[SIP] 200 without usable SDP: {}", err));
                }
            }
            engine.events.log(
                LogLevel::Call,
                format!("[SIP] call established with {}", remote_label),
            );
            engine.events.call_state(CallPhase::Active, remote_label);
        }
        Step::Reauth => {
            send_failure_ack(engine, &msg).await;
            let ctx = {
                let Some(call) = engine.call.as_mut() else {
                    return;
                };
                call.auth_attempted = true;
                call.cseq += 1;
                call.invite_cseq = call.cseq;
                call.invite_branch = new_branch();
                (
                    call.remote_target.clone(),
                    call.invite_branch.clone(),
                    call.invite_cseq,
                    format!("{};tag={}", call.local_identity, call.local_tag),
                    call.remote_identity.clone(),
                    call.call_id.clone(),
                    call.local_sdp.clone(),
                )
            };
            let (target, branch, cseq, from, to, call_id, local_sdp) = ctx;
            let challenge = msg
                .header("WWW-Authenticate")
                .or_else(|| msg.header("Proxy-Authenticate"))
                .ok_or_else(|| Error::Auth("challenge without authenticate header".to_string()))
                .and_then(auth::parse_challenge);
            let challenge = match challenge {
                Ok(challenge) => challenge,
                Err(err) => {
                    engine
                        .events
                        .log(LogLevel::Error, format!("[SIP] {}", err));
                    engine.terminate_call("Authentication failed").await;
                    return;
                }
            };
            let authorization = challenge.authorization(
                &engine.config.extension,
                &engine.config.password,
                "INVITE",
                &target,
            );
            let mut retry =
                engine.build_request("INVITE", &target, &branch, from, to, &call_id, cseq);
            retry.headers.append("Contact", engine.local_contact());
            retry.headers.append("Authorization", authorization);
            retry.headers.append("Content-Type", "application/sdp");
            retry.body = local_sdp.into_bytes();
            engine
                .events
                .log(LogLevel::Info, "[SIP] re-sending INVITE with credentials");
            if let Err(err) = engine.send_sip(&retry).await {
                engine
                    .events
                    .log(LogLevel::Error, format!("[SIP] INVITE retry failed: {}", err));
                engine.terminate_call(&err.to_string()).await;
            }
        }
        Step::Fail => {
            send_failure_ack(engine, &msg).await;
            let reason = format!("{} {}", status, msg.reason());
            engine
                .events
                .log(LogLevel::Call, format!("[SIP] call failed: {}", reason));
            engine.terminate_call(&reason).await;
        }
        Step::LateFinal => {
            // hangup already told the shell the call is gone; just close
            // the transaction out
            if (200..300).contains(&status) {
                let ack = {
                    let Some(call) = engine.call.as_ref() else {
                        return;
                    };
                    let mut ack = SipMessage::request("ACK", &call.remote_target);
                    ack.headers.append("Via", engine.via_value(&new_branch()));
                    ack.headers.append("Max-Forwards", "70");
                    ack.headers
                        .append("From", format!("{};tag={}", call.local_identity, call.local_tag));
                    ack.headers
                        .append("To", msg.header("To").unwrap_or("").to_string());
                    ack.headers.append("Call-ID", call.call_id.clone());
                    ack.headers
                        .append("CSeq", format!("{} ACK", call.invite_cseq));
                    ack.headers.append("Allow", ALLOW_METHODS);
                    ack.headers.append("User-Agent", USER_AGENT);
                    ack
                };
                let _ = engine.send_sip(&ack).await;
                engine
                    .events
                    .log(LogLevel::Warn, "[SIP] answer arrived after hangup, dropped");
            } else {
                send_failure_ack(engine, &msg).await;
            }
            if let Some(mut call) = engine.call.take() {
                if let Some(task) = call.guard_task.take() {
                    task.abort();
                }
                if let Some(rtp) = call.rtp.take() {
                    rtp.close().await;
                }
            }
        }
        Step::Ignore => {}
    }
}

/// ACK for a non-2xx final response: transaction-scoped, it reuses the
/// INVITE's Via branch and CSeq number, with the To tag the response
/// carried.
async fn send_failure_ack(engine: &mut Engine, msg: &SipMessage) {
    let ack = {
        let Some(call) = engine.call.as_ref() else {
            return;
        };
        let mut ack = SipMessage::request("ACK", &call.remote_target);
        ack.headers
            .append("Via", engine.via_value(&call.invite_branch));
        ack.headers.append("Max-Forwards", "70");
        ack.headers
            .append("From", format!("{};tag={}", call.local_identity, call.local_tag));
        ack.headers
            .append("To", msg.header("To").unwrap_or("").to_string());
        ack.headers.append("Call-ID", call.call_id.clone());
        ack.headers
            .append("CSeq", format!("{} ACK", call.invite_cseq));
        ack.headers.append("Allow", ALLOW_METHODS);
        ack.headers.append("User-Agent", USER_AGENT);
        ack
    };
    if let Err(err) = engine.send_sip(&ack).await {
        engine
            .events
            .log(LogLevel::Warn, format!("[SIP] ACK failed: {}", err));
    }
}

async fn handle_request(engine: &mut Engine, msg: SipMessage) {
    match msg.method().unwrap_or("") {
        "INVITE" => handle_invite_request(engine, msg).await,
        "ACK" => {
            tracing::debug!("[SIP] ACK received");
        }
        "CANCEL" => handle_cancel_request(engine, msg).await,
        "BYE" => handle_bye_request(engine, msg).await,
        "INFO" => {
            let in_dialog = engine
                .call
                .as_ref()
                .map(|c| Some(c.call_id.as_str()) == msg.call_id())
                .unwrap_or(false);
            let resp = if in_dialog {
                echo_response(&msg, 200, "OK")
            } else {
                echo_response(&msg, 481, "Call/Transaction Does Not Exist")
            };
            let _ = engine.send_sip(&resp).await;
        }
        "OPTIONS" => {
            // keepalive probe; answer with our capabilities
            let mut resp = echo_response(&msg, 200, "OK");
            ensure_to_tag(&mut resp, &new_tag());
            resp.headers.append("Allow", ALLOW_METHODS);
            let _ = engine.send_sip(&resp).await;
        }
        "NOTIFY" => {
            let _ = engine.send_sip(&echo_response(&msg, 200, "OK")).await;
        }
        other => {
            engine.events.log(
                LogLevel::Warn,
                format!("[SIP] unsupported request {} answered 501", other),
            );
            let mut resp = echo_response(&msg, 501, "Not Implemented");
            ensure_to_tag(&mut resp, &new_tag());
            let _ = engine.send_sip(&resp).await;
        }
    }
}

async fn handle_invite_request(engine: &mut Engine, msg: SipMessage) {
    if engine.call.is_some() {
        // never disturb the call in progress
        let mut busy = echo_response(&msg, 486, "Busy Here");
        ensure_to_tag(&mut busy, &new_tag());
        let _ = engine.send_sip(&busy).await;
        engine
            .events
            .log(LogLevel::Call, "[SIP] INVITE while busy answered 486");
        return;
    }
    let Some(call_id) = msg.call_id().map(str::to_string) else {
        let _ = engine.send_sip(&echo_response(&msg, 400, "Bad Request")).await;
        return;
    };
    let from = msg.header("From").unwrap_or("").to_string();
    let to = msg.header("To").unwrap_or("").to_string();
    let local_tag = new_tag();
    let invite_cseq = msg.cseq().map(|(n, _)| n).unwrap_or(0);
    let incoming = IncomingInvite {
        vias: msg
            .headers
            .get_all("Via")
            .into_iter()
            .map(str::to_string)
            .collect(),
        from: from.clone(),
        to: to.clone(),
        call_id: call_id.clone(),
        cseq: msg.header("CSeq").unwrap_or("").to_string(),
        offer: String::from_utf8_lossy(&msg.body).into_owned(),
    };
    let remote_target = msg
        .header("Contact")
        .map(uri_of)
        .unwrap_or_else(|| uri_of(&from));
    let caller = uri_of(&from);

    engine.call = Some(Call {
        call_id,
        local_tag: local_tag.clone(),
        remote_tag: tag_of(&from),
        local_identity: without_tag(&to),
        remote_identity: without_tag(&from),
        remote_target,
        direction: Direction::Inbound,
        state: CallState::RingingIn,
        cseq: 0,
        invite_branch: String::new(),
        invite_cseq,
        local_sdp: String::new(),
        rtp: None,
        auth_attempted: false,
        incoming: Some(incoming),
        guard_task: None,
    });

    let _ = engine.send_sip(&echo_response(&msg, 100, "Trying")).await;
    let mut ringing = echo_response(&msg, 180, "Ringing");
    ensure_to_tag(&mut ringing, &local_tag);
    let contact = engine.local_contact();
    ringing.headers.append("Contact", contact);
    ringing.headers.append("Allow", ALLOW_METHODS);
    let _ = engine.send_sip(&ringing).await;

    engine
        .events
        .log(LogLevel::Call, format!("[SIP] incoming call from {}", caller));
    engine.events.call_state(CallPhase::RingingIn, caller);
}

async fn handle_cancel_request(engine: &mut Engine, msg: SipMessage) {
    let cancellable = engine
        .call
        .as_ref()
        .map(|c| c.state == CallState::RingingIn && Some(c.call_id.as_str()) == msg.call_id())
        .unwrap_or(false);
    if !cancellable {
        let _ = engine
            .send_sip(&echo_response(&msg, 481, "Call/Transaction Does Not Exist"))
            .await;
        return;
    }
    let _ = engine.send_sip(&echo_response(&msg, 200, "OK")).await;
    let (incoming, local_tag) = {
        let Some(call) = engine.call.as_ref() else {
            return;
        };
        (call.incoming.clone(), call.local_tag.clone())
    };
    if let Some(incoming) = incoming {
        let mut terminated = incoming.response(487, "Request Terminated");
        ensure_to_tag(&mut terminated, &local_tag);
        let _ = engine.send_sip(&terminated).await;
    }
    engine.terminate_call("Cancelled").await;
}

async fn handle_bye_request(engine: &mut Engine, msg: SipMessage) {
    let in_dialog = engine
        .call
        .as_ref()
        .map(|c| Some(c.call_id.as_str()) == msg.call_id())
        .unwrap_or(false);
    if !in_dialog {
        let _ = engine
            .send_sip(&echo_response(&msg, 481, "Call/Transaction Does Not Exist"))
            .await;
        return;
    }
    let _ = engine.send_sip(&echo_response(&msg, 200, "OK")).await;
    engine.terminate_call("Call ended by peer").await;
}
