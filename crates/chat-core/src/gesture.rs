use crate::types::{MessageId, SwipeOffset};

/// Horizontal travel before a pan is recognized as a swipe.
pub const SWIPE_ACTIVATION_PX: f32 = 40.0;
/// Vertical travel that cancels a swipe in favor of list scrolling.
pub const SWIPE_VERTICAL_TOLERANCE_PX: f32 = 10.0;
/// Leftward travel at release that triggers a reply.
pub const SWIPE_REPLY_TRIGGER_PX: f32 = 100.0;
/// Maximum rendered swipe displacement.
pub const SWIPE_MAX_OFFSET_PX: f32 = 150.0;
/// Window after a long-press during which pans are suppressed.
pub const LONG_PRESS_GRACE_MS: u64 = 200;
/// Window during which a long-press still counts as active.
pub const LONG_PRESS_RESET_MS: u64 = 100;

/// Pan recognition state.
#[derive(Debug, Clone, PartialEq, Eq)]
enum PanPhase {
    Idle,
    /// Touched down, horizontal travel below the activation threshold.
    Candidate { message_id: MessageId },
    /// Activated swipe tracking the finger.
    Swiping { message_id: MessageId },
}

/// Outcome of a pan displacement update.
#[derive(Debug, Clone, PartialEq)]
pub enum PanUpdate {
    /// No visible change.
    Ignored,
    /// Vertical travel won; the swipe is abandoned.
    Cancelled,
    /// New clamped offset for the touched message.
    Offset(SwipeOffset),
}

/// Outcome of a pan release.
#[derive(Debug, Clone, PartialEq)]
pub enum PanRelease {
    Ignored,
    /// Offset animates back to rest.
    Reset { message_id: MessageId },
    /// Travel crossed the reply threshold.
    ReplyTriggered { message_id: MessageId },
}

/// Resolves the swipe-to-reply vs long-press-to-react conflict.
///
/// Pure state machine over caller-supplied timestamps; it owns no
/// timers. Only one gesture may hold a message at a time: a long-press
/// suppresses pans inside its grace window, and an active swipe refuses
/// long-presses until it ends.
#[derive(Debug, Default)]
pub struct GestureArbiter {
    phase: PanPhase,
    long_press_at: Option<(MessageId, u64)>,
}

impl Default for PanPhase {
    fn default() -> Self {
        PanPhase::Idle
    }
}

impl GestureArbiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a pan on a message bubble.
    ///
    /// Returns false when the pan is suppressed by a recent long-press.
    pub fn on_pan_start(&mut self, message_id: MessageId, now_ms: u64) -> bool {
        if let Some((pressed, at)) = &self.long_press_at
            && *pressed == message_id
            && now_ms.saturating_sub(*at) < LONG_PRESS_GRACE_MS
        {
            return false;
        }
        self.phase = PanPhase::Candidate { message_id };
        true
    }

    /// Apply a displacement update.
    pub fn on_pan_move(&mut self, dx: f32, dy: f32) -> PanUpdate {
        match self.phase.clone() {
            PanPhase::Idle => PanUpdate::Ignored,
            PanPhase::Candidate { message_id } => {
                if dy.abs() > SWIPE_VERTICAL_TOLERANCE_PX {
                    self.phase = PanPhase::Idle;
                    return PanUpdate::Cancelled;
                }
                if dx <= -SWIPE_ACTIVATION_PX {
                    self.phase = PanPhase::Swiping {
                        message_id: message_id.clone(),
                    };
                    PanUpdate::Offset(SwipeOffset {
                        message_id,
                        offset_px: clamp_offset(dx),
                    })
                } else {
                    PanUpdate::Ignored
                }
            }
            PanPhase::Swiping { message_id } => PanUpdate::Offset(SwipeOffset {
                message_id,
                offset_px: clamp_offset(dx),
            }),
        }
    }

    /// Release the pan with its final horizontal displacement.
    pub fn on_pan_end(&mut self, dx: f32) -> PanRelease {
        let phase = std::mem::take(&mut self.phase);
        match phase {
            PanPhase::Idle | PanPhase::Candidate { .. } => PanRelease::Ignored,
            PanPhase::Swiping { message_id } => {
                if dx <= -SWIPE_REPLY_TRIGGER_PX {
                    PanRelease::ReplyTriggered { message_id }
                } else {
                    PanRelease::Reset { message_id }
                }
            }
        }
    }

    /// Abandon the pan without a release.
    pub fn on_pan_cancel(&mut self) -> PanRelease {
        let phase = std::mem::take(&mut self.phase);
        match phase {
            PanPhase::Idle | PanPhase::Candidate { .. } => PanRelease::Ignored,
            PanPhase::Swiping { message_id } => PanRelease::Reset { message_id },
        }
    }

    /// Record a long-press.
    ///
    /// Returns false while a swipe is active; the reaction prompt must
    /// not open mid-swipe.
    pub fn on_long_press(&mut self, message_id: MessageId, now_ms: u64) -> bool {
        if matches!(self.phase, PanPhase::Swiping { .. }) {
            return false;
        }
        self.long_press_at = Some((message_id, now_ms));
        true
    }

    /// Whether a long-press fired within the last reset window.
    pub fn long_press_active(&self, now_ms: u64) -> bool {
        self.long_press_at
            .as_ref()
            .is_some_and(|(_, at)| now_ms.saturating_sub(*at) < LONG_PRESS_RESET_MS)
    }

    pub fn clear_long_press(&mut self) {
        self.long_press_at = None;
    }

    /// Reset all gesture state.
    pub fn reset(&mut self) {
        self.phase = PanPhase::Idle;
        self.long_press_at = None;
    }
}

fn clamp_offset(dx: f32) -> f32 {
    // Leftward only; rightward travel renders at rest.
    dx.clamp(-SWIPE_MAX_OFFSET_PX, 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(n: i64) -> MessageId {
        MessageId::Server(n)
    }

    #[test]
    fn swipe_activates_then_clamps() {
        let mut arbiter = GestureArbiter::new();
        assert!(arbiter.on_pan_start(id(1), 1_000));

        assert_eq!(arbiter.on_pan_move(-20.0, 2.0), PanUpdate::Ignored);

        match arbiter.on_pan_move(-60.0, 3.0) {
            PanUpdate::Offset(offset) => assert_eq!(offset.offset_px, -60.0),
            other => panic!("unexpected update: {other:?}"),
        }

        match arbiter.on_pan_move(-400.0, 3.0) {
            PanUpdate::Offset(offset) => assert_eq!(offset.offset_px, -SWIPE_MAX_OFFSET_PX),
            other => panic!("unexpected update: {other:?}"),
        }

        // Rightward travel after activation rests at zero.
        match arbiter.on_pan_move(30.0, 0.0) {
            PanUpdate::Offset(offset) => assert_eq!(offset.offset_px, 0.0),
            other => panic!("unexpected update: {other:?}"),
        }
    }

    #[test]
    fn vertical_travel_cancels_the_candidate() {
        let mut arbiter = GestureArbiter::new();
        arbiter.on_pan_start(id(1), 1_000);
        assert_eq!(arbiter.on_pan_move(-30.0, 25.0), PanUpdate::Cancelled);
        assert_eq!(arbiter.on_pan_move(-90.0, 0.0), PanUpdate::Ignored);
    }

    #[test]
    fn release_past_the_threshold_triggers_a_reply() {
        let mut arbiter = GestureArbiter::new();
        arbiter.on_pan_start(id(7), 1_000);
        arbiter.on_pan_move(-80.0, 1.0);
        assert_eq!(
            arbiter.on_pan_end(-120.0),
            PanRelease::ReplyTriggered { message_id: id(7) }
        );
    }

    #[test]
    fn short_release_resets_the_offset() {
        let mut arbiter = GestureArbiter::new();
        arbiter.on_pan_start(id(7), 1_000);
        arbiter.on_pan_move(-80.0, 1.0);
        assert_eq!(
            arbiter.on_pan_end(-60.0),
            PanRelease::Reset { message_id: id(7) }
        );
    }

    #[test]
    fn long_press_grace_suppresses_pans_on_the_same_message() {
        let mut arbiter = GestureArbiter::new();
        assert!(arbiter.on_long_press(id(3), 1_000));
        assert!(!arbiter.on_pan_start(id(3), 1_100));
        // A different message is unaffected.
        assert!(arbiter.on_pan_start(id(4), 1_100));
    }

    #[test]
    fn pans_resume_after_the_grace_window() {
        let mut arbiter = GestureArbiter::new();
        arbiter.on_long_press(id(3), 1_000);
        assert!(arbiter.on_pan_start(id(3), 1_250));
    }

    #[test]
    fn long_press_is_refused_mid_swipe() {
        let mut arbiter = GestureArbiter::new();
        arbiter.on_pan_start(id(5), 1_000);
        arbiter.on_pan_move(-80.0, 1.0);
        assert!(!arbiter.on_long_press(id(5), 1_050));

        arbiter.on_pan_end(-80.0);
        assert!(arbiter.on_long_press(id(5), 1_100));
    }

    #[test]
    fn long_press_activity_decays() {
        let mut arbiter = GestureArbiter::new();
        arbiter.on_long_press(id(3), 1_000);
        assert!(arbiter.long_press_active(1_050));
        assert!(!arbiter.long_press_active(1_150));
    }
}
