//! Thinking-span splitter
//!
//! Generated answers may embed a `<think>...</think>` span. Fragments arrive in
//! arbitrary pieces, so a marker can be split across fragments and the span can
//! stay open over many of them. The splitter keeps the open/closed state and
//! holds back a trailing partial marker until the next fragment decides it.

pub const OPEN_MARKER: &str = "<think>";
pub const CLOSE_MARKER: &str = "</think>";

/// Which accumulator text currently flows into
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SplitState {
    #[default]
    Answering,
    Thinking,
}

impl SplitState {
    fn marker(self) -> &'static str {
        match self {
            SplitState::Answering => OPEN_MARKER,
            SplitState::Thinking => CLOSE_MARKER,
        }
    }

    fn text(self, text: &str) -> Segment {
        match self {
            SplitState::Answering => Segment::Answer(text.to_string()),
            SplitState::Thinking => Segment::Thinking(text.to_string()),
        }
    }
}

/// Output of splitting one fragment, in order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Answer(String),
    Thinking(String),
    OpenThinking,
    CloseThinking,
}

/// Length of the longest suffix of `text` that is a proper prefix of `marker`
fn partial_marker_len(text: &str, marker: &str) -> usize {
    (1..marker.len())
        .rev()
        .find(|&len| text.ends_with(&marker[..len]))
        .unwrap_or(0)
}

/// Pure transition over one fragment.
///
/// `carry` is the partial marker held back from the previous fragment. Returns
/// the next state, the segments produced and the new carry.
pub fn split_fragment(state: SplitState, carry: &str, fragment: &str) -> (SplitState, Vec<Segment>, String) {
    let text = format!("{}{}", carry, fragment);
    let mut rest = text.as_str();
    let mut state = state;
    let mut segments = Vec::new();

    loop {
        let marker = state.marker();

        if let Some(idx) = rest.find(marker) {
            if idx > 0 {
                segments.push(state.text(&rest[..idx]));
            }
            state = match state {
                SplitState::Answering => {
                    segments.push(Segment::OpenThinking);
                    SplitState::Thinking
                }
                SplitState::Thinking => {
                    segments.push(Segment::CloseThinking);
                    SplitState::Answering
                }
            };
            rest = &rest[idx + marker.len()..];
            continue;
        }

        let hold = partial_marker_len(rest, marker);
        let emit = &rest[..rest.len() - hold];
        if !emit.is_empty() {
            segments.push(state.text(emit));
        }
        return (state, segments, rest[rest.len() - hold..].to_string());
    }
}

/// Stateful wrapper over [`split_fragment`]
#[derive(Debug, Clone, Default)]
pub struct ThinkingSplitter {
    state: SplitState,
    carry: String,
}

impl ThinkingSplitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SplitState {
        self.state
    }

    pub fn push(&mut self, fragment: &str) -> Vec<Segment> {
        let (state, segments, carry) = split_fragment(self.state, &self.carry, fragment);
        self.state = state;
        self.carry = carry;
        segments
    }

    /// Release held-back text literally; the stream ended so it was no marker
    pub fn flush(&mut self) -> Option<Segment> {
        if self.carry.is_empty() {
            return None;
        }
        let carry = std::mem::take(&mut self.carry);
        Some(self.state.text(&carry))
    }
}
