use serde::Serialize;
use serde_json::Value;

use crate::sse::{FrameDecoder, RawFrame};
use crate::types::value_to_id;
use crate::Turn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
/// Enumerates supported `RoundMarkerKind` values.
pub enum RoundMarkerKind {
    Start,
    End,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize)]
/// Completion metadata carried by the terminal `done` frame.
pub struct TurnDone {
    pub turn_id: Option<String>,
    pub provider_model: Option<String>,
    pub summary_used_fallback: bool,
    pub balance_after: Option<f64>,
    pub low_balance: bool,
}

impl TurnDone {
    fn from_payload(payload: &Value) -> Option<Self> {
        let object = payload.as_object()?;
        Some(Self {
            turn_id: object.get("turn_id").and_then(value_to_id),
            provider_model: object
                .get("provider_model")
                .and_then(Value::as_str)
                .map(str::to_string),
            summary_used_fallback: object
                .get("summary_used_fallback")
                .and_then(Value::as_bool)
                .unwrap_or(false),
            balance_after: object.get("balance_after").and_then(Value::as_f64),
            low_balance: object
                .get("low_balance")
                .and_then(Value::as_bool)
                .unwrap_or(false),
        })
    }

    /// Metadata equivalent for a turn that completed through the synchronous endpoint.
    pub fn from_turn(turn: &Turn) -> Self {
        Self {
            turn_id: Some(turn.id.clone()),
            provider_model: turn.provider_model.clone(),
            summary_used_fallback: false,
            balance_after: turn.balance_after,
            low_balance: turn.low_balance,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
/// Typed event decoded from one turn-stream frame.
pub enum StreamEvent {
    Chunk {
        delta: String,
    },
    Done(TurnDone),
    RoundMarker {
        kind: RoundMarkerKind,
        round: u64,
    },
    /// Payload without a recognised shape, forwarded verbatim.
    Unknown {
        raw: Value,
    },
}

impl StreamEvent {
    pub fn classify(payload: Value) -> Self {
        let kind = payload
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or_default();

        let classified = match kind {
            "chunk" => payload
                .get("delta")
                .and_then(Value::as_str)
                .map(|delta| StreamEvent::Chunk {
                    delta: delta.to_string(),
                }),
            "done" => TurnDone::from_payload(&payload).map(StreamEvent::Done),
            "round_start" | "round_end" => {
                payload
                    .get("round")
                    .and_then(Value::as_u64)
                    .map(|round| StreamEvent::RoundMarker {
                        kind: if kind == "round_start" {
                            RoundMarkerKind::Start
                        } else {
                            RoundMarkerKind::End
                        },
                        round,
                    })
            }
            _ => None,
        };

        classified.unwrap_or(StreamEvent::Unknown { raw: payload })
    }

    pub fn from_frame(frame: &RawFrame) -> Self {
        Self::classify(frame.payload())
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, StreamEvent::Done(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            StreamEvent::Chunk { .. } => "chunk",
            StreamEvent::Done(_) => "done",
            StreamEvent::RoundMarker { .. } => "round_marker",
            StreamEvent::Unknown { .. } => "unknown",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
/// Per-turn accumulator. Deltas are appended strictly in receipt order.
pub struct TurnAccumulator {
    text: String,
    done: Option<TurnDone>,
    last_round: Option<(RoundMarkerKind, u64)>,
    event_count: usize,
    unknown_count: usize,
}

impl TurnAccumulator {
    pub fn apply(&mut self, event: &StreamEvent) {
        self.event_count += 1;
        match event {
            StreamEvent::Chunk { delta } => self.text.push_str(delta),
            StreamEvent::Done(done) => self.done = Some(done.clone()),
            StreamEvent::RoundMarker { kind, round } => self.last_round = Some((*kind, *round)),
            StreamEvent::Unknown { .. } => self.unknown_count += 1,
        }
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn done(&self) -> Option<&TurnDone> {
        self.done.as_ref()
    }

    pub fn is_done(&self) -> bool {
        self.done.is_some()
    }

    pub fn last_round(&self) -> Option<(RoundMarkerKind, u64)> {
        self.last_round
    }

    pub fn event_count(&self) -> usize {
        self.event_count
    }

    pub fn unknown_count(&self) -> usize {
        self.unknown_count
    }

    pub fn into_parts(self) -> (String, Option<TurnDone>) {
        (self.text, self.done)
    }
}

#[derive(Debug, Default)]
/// Frame decoder plus accumulator for one turn.
///
/// Once a `done` event has been produced, later frames are ignored.
pub struct EventInterpreter {
    decoder: FrameDecoder,
    accumulator: TurnAccumulator,
}

impl EventInterpreter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_bytes(&mut self, chunk: &[u8]) -> Vec<StreamEvent> {
        if self.accumulator.is_done() {
            return Vec::new();
        }
        let frames = self.decoder.push_bytes(chunk);
        self.interpret(frames)
    }

    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.accumulator.is_done() {
            return Vec::new();
        }
        let frames = self.decoder.finish();
        self.interpret(frames)
    }

    pub fn accumulator(&self) -> &TurnAccumulator {
        &self.accumulator
    }

    pub fn is_done(&self) -> bool {
        self.accumulator.is_done()
    }

    pub fn into_accumulator(self) -> TurnAccumulator {
        self.accumulator
    }

    fn interpret(&mut self, frames: Vec<RawFrame>) -> Vec<StreamEvent> {
        let mut events = Vec::with_capacity(frames.len());
        for frame in frames {
            let event = StreamEvent::from_frame(&frame);
            self.accumulator.apply(&event);
            let terminal = event.is_terminal();
            events.push(event);
            if terminal {
                break;
            }
        }
        events
    }
}
