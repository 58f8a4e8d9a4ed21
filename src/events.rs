use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Log channel used by the shell's console pane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Sip,
    Call,
    Warn,
    Error,
    Debug,
}

/// Registration/transport status as shown in the shell's status bar.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Connecting,
    Connected,
    Disconnected,
}

/// Call lifecycle as shown on the dialpad.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CallPhase {
    Idle,
    Calling,
    Ringing,
    #[serde(rename = "ringing-in")]
    RingingIn,
    Active,
}

/// Everything the core tells the shell. The shell owns the receiving end of
/// an unbounded channel and renders each variant however it likes; the core
/// never calls back into the shell directly.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Event {
    Log { level: LogLevel, message: String },
    Status { state: LinkState, detail: String },
    CallState { state: CallPhase, info: String },
    RemoteAudio { pcm: Vec<u8> },
}

/// Cloneable sender half of the event surface.
///
/// `close()` flips a flag checked before every send, so a closed sink drops
/// events instead of delivering them. `stop()` relies on this: no event is
/// observable after it returns.
#[derive(Debug, Clone)]
pub struct EventSink {
    tx: mpsc::UnboundedSender<Event>,
    closed: Arc<AtomicBool>,
}

impl EventSink {
    pub fn channel() -> (EventSink, mpsc::UnboundedReceiver<Event>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            EventSink {
                tx,
                closed: Arc::new(AtomicBool::new(false)),
            },
            rx,
        )
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn emit(&self, event: Event) {
        if !self.is_closed() {
            let _ = self.tx.send(event);
        }
    }

    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        let message = message.into();
        match level {
            LogLevel::Error => tracing::error!("{}", message),
            LogLevel::Warn => tracing::warn!("{}", message),
            LogLevel::Debug => tracing::debug!("{}", message),
            _ => tracing::info!("{}", message),
        }
        self.emit(Event::Log { level, message });
    }

    pub fn status(&self, state: LinkState, detail: impl Into<String>) {
        self.emit(Event::Status {
            state,
            detail: detail.into(),
        });
    }

    pub fn call_state(&self, state: CallPhase, info: impl Into<String>) {
        self.emit(Event::CallState {
            state,
            info: info.into(),
        });
    }

    pub fn remote_audio(&self, pcm: Vec<u8>) {
        self.emit(Event::RemoteAudio { pcm });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_json_shapes() {
        let event = Event::Status {
            state: LinkState::Connected,
            detail: "Registered".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "status");
        assert_eq!(json["state"], "connected");

        let event = Event::CallState {
            state: CallPhase::RingingIn,
            info: "sip:100@pbx".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "callState");
        assert_eq!(json["state"], "ringing-in");
    }

    #[test]
    fn closed_sink_drops_events() {
        let (sink, mut rx) = EventSink::channel();
        sink.log(LogLevel::Info, "before");
        sink.close();
        sink.log(LogLevel::Info, "after");
        let first = rx.try_recv().unwrap();
        match first {
            Event::Log { message, .. } => assert_eq!(message, "before"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(rx.try_recv().is_err());
    }
}
