//! Pure handshake state machine of a subscription session
//!
//! The socket loop feeds every decoded (or undecodable) frame through
//! [`HandshakeState::on_frame`] and performs the returned [`Step`]. Only the
//! `Active` state ever yields [`Step::Deliver`].

use super::protocol::{Frame, FrameType};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Disconnected,
    Connecting,
    InitSent,
    Acked,
    Active,
    Terminating,
    Closed,
    Errored,
}

/// What the loop has to do after a frame
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    /// Acknowledged: send the start frame
    SendStart,
    /// Hand the payload to the handler
    Deliver(Value),
    /// Nothing to do (keepalive)
    Ignore,
    /// Protocol error; the state is now `Errored`
    Fail(String),
}

impl HandshakeState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Errored)
    }

    /// Socket opened
    pub fn on_open(self) -> Self {
        match self {
            Self::Disconnected => Self::Connecting,
            other => other,
        }
    }

    /// Init frame written
    pub fn on_init_sent(self) -> Self {
        match self {
            Self::Connecting => Self::InitSent,
            other => other,
        }
    }

    /// Start frame written; payloads flow from here on
    pub fn on_start_sent(self) -> Self {
        match self {
            Self::Acked => Self::Active,
            other => other,
        }
    }

    /// Cancellation requested
    pub fn on_cancel(self) -> Self {
        if self.is_terminal() {
            self
        } else {
            Self::Terminating
        }
    }

    pub fn on_closed(self) -> Self {
        match self {
            Self::Errored => Self::Errored,
            _ => Self::Closed,
        }
    }

    /// Transition on a received frame; `None` stands for a malformed frame
    pub fn on_frame(&mut self, frame: Option<Frame>) -> Step {
        let Some(frame) = frame else {
            return self.fail("malformed frame");
        };

        match (*self, frame.frame_type) {
            (_, FrameType::Ka) if !self.is_terminal() => Step::Ignore,
            (Self::InitSent, FrameType::ConnectionAck) => {
                *self = Self::Acked;
                Step::SendStart
            }
            (Self::Active, FrameType::Data) => match frame.payload {
                Some(payload) => Step::Deliver(payload),
                None => self.fail("data frame without payload"),
            },
            (_, FrameType::Error) => {
                self.fail(&format!("error frame: {}", describe(frame.payload)))
            }
            (_, FrameType::ConnectionError) => {
                self.fail(&format!("connection error: {}", describe(frame.payload)))
            }
            (_, FrameType::Complete) => self.fail("server completed the subscription"),
            (state, other) => self.fail(&format!("unexpected {other:?} frame in state {state:?}")),
        }
    }

    fn fail(&mut self, reason: &str) -> Step {
        *self = Self::Errored;
        Step::Fail(reason.to_string())
    }
}

fn describe(payload: Option<Value>) -> String {
    payload.map_or_else(|| "no details".to_string(), |p| p.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn frame(frame_type: FrameType, payload: Option<Value>) -> Option<Frame> {
        Some(Frame {
            id: None,
            frame_type,
            payload,
        })
    }

    fn active() -> HandshakeState {
        let mut state = HandshakeState::Disconnected.on_open().on_init_sent();
        assert_eq!(state.on_frame(frame(FrameType::ConnectionAck, None)), Step::SendStart);
        state.on_start_sent()
    }

    #[test]
    fn test_happy_path() {
        let mut state = active();
        assert_eq!(state, HandshakeState::Active);

        let step = state.on_frame(frame(FrameType::Data, Some(json!({"data": 1}))));

        assert_eq!(step, Step::Deliver(json!({"data": 1})));
        assert_eq!(state, HandshakeState::Active);
    }

    #[test]
    fn test_keepalive_before_ack_is_ignored() {
        let mut state = HandshakeState::Disconnected.on_open().on_init_sent();

        assert_eq!(state.on_frame(frame(FrameType::Ka, None)), Step::Ignore);
        assert_eq!(state, HandshakeState::InitSent);
    }

    #[test]
    fn test_data_before_ack_fails() {
        let mut state = HandshakeState::Disconnected.on_open().on_init_sent();

        let step = state.on_frame(frame(FrameType::Data, Some(json!({}))));

        assert!(matches!(step, Step::Fail(_)));
        assert_eq!(state, HandshakeState::Errored);
    }

    #[test]
    fn test_second_ack_fails() {
        let mut state = active();

        assert!(matches!(
            state.on_frame(frame(FrameType::ConnectionAck, None)),
            Step::Fail(_)
        ));
    }

    #[test]
    fn test_complete_and_error_frames_fail() {
        for frame_type in [FrameType::Complete, FrameType::Error, FrameType::ConnectionError] {
            let mut state = active();
            assert!(matches!(state.on_frame(frame(frame_type, None)), Step::Fail(_)));
            assert_eq!(state, HandshakeState::Errored);
        }
    }

    #[test]
    fn test_cancel_and_close() {
        assert_eq!(active().on_cancel(), HandshakeState::Terminating);
        assert_eq!(active().on_cancel().on_closed(), HandshakeState::Closed);
        assert_eq!(HandshakeState::Errored.on_cancel(), HandshakeState::Errored);
        assert_eq!(HandshakeState::Errored.on_closed(), HandshakeState::Errored);
    }

    fn any_frame() -> impl Strategy<Value = Option<Frame>> {
        let types = prop_oneof![
            Just(FrameType::ConnectionInit),
            Just(FrameType::ConnectionAck),
            Just(FrameType::Start),
            Just(FrameType::Stop),
            Just(FrameType::Data),
            Just(FrameType::Error),
            Just(FrameType::Complete),
            Just(FrameType::Ka),
            Just(FrameType::ConnectionTerminate),
            Just(FrameType::ConnectionError),
        ];
        prop_oneof![
            1 => Just(None),
            8 => (types, proptest::option::of(any::<i64>())).prop_map(|(frame_type, n)| {
                Some(Frame {
                    id: None,
                    frame_type,
                    payload: n.map(|n| json!({ "n": n })),
                })
            }),
        ]
    }

    proptest! {
        #[test]
        fn prop_nothing_is_delivered_before_start(frames in proptest::collection::vec(any_frame(), 0..20)) {
            let mut state = HandshakeState::Disconnected.on_open().on_init_sent();
            for f in frames {
                let step = state.on_frame(f);
                prop_assert!(!matches!(step, Step::Deliver(_)));
                if step == Step::SendStart {
                    // start never sent in this run, so Acked is as far as it gets
                    prop_assert_eq!(state, HandshakeState::Acked);
                }
            }
        }

        #[test]
        fn prop_errored_is_absorbing(frames in proptest::collection::vec(any_frame(), 0..20)) {
            let mut state = active();
            let mut errored = false;
            for f in frames {
                let step = state.on_frame(f);
                if errored {
                    prop_assert!(matches!(step, Step::Fail(_)));
                }
                if matches!(step, Step::Fail(_)) {
                    errored = true;
                    prop_assert_eq!(state, HandshakeState::Errored);
                }
            }
        }
    }
}
