use super::thinking::{Segment, ThinkingSplitter};
use crate::error::CaptureError;
use crate::protocol::{Chunk, ChunkType, Payload};
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt;
use tokio::time::Instant;
use tracing::{debug, warn};

/// A retrieved memory cited by the answer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryCitation {
    pub id: String,
    pub text: String,
    pub score: f32,
}

/// Accumulated, display-ready answer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AnswerParseState {
    pub memories: Vec<MemoryCitation>,
    pub thinking_text: String,
    pub is_thinking: bool,
    pub thinking_complete: bool,
    /// Set once, when a thinking span ends
    pub thinking_elapsed_seconds: Option<f64>,
    pub answer_text: String,
    pub is_complete: bool,
}

/// Presentation side of an answer. Created on the first ANSWER chunk.
pub trait AnswerSink: Send {
    fn memory(&mut self, citation: &MemoryCitation);

    fn update(&mut self, state: &AnswerParseState);

    fn complete(&mut self, state: &AnswerParseState);
}

type SinkFactory = Box<dyn FnMut() -> Box<dyn AnswerSink> + Send>;

/// Incremental parser for TRANSCRIPT / MEMORY / ANSWER chunk streams
pub struct AnswerStreamParser {
    state: AnswerParseState,
    transcript: String,
    transcript_complete: bool,
    splitter: ThinkingSplitter,
    thinking_started: Option<Instant>,
    /// Type of the last chunk that carried metadata
    current_type: Option<ChunkType>,
    /// Citations not yet delivered to a sink
    pending_memories: VecDeque<MemoryCitation>,
    sink: Option<Box<dyn AnswerSink>>,
    make_sink: Option<SinkFactory>,
}

impl AnswerStreamParser {
    pub fn new() -> Self {
        Self {
            state: AnswerParseState::default(),
            transcript: String::new(),
            transcript_complete: false,
            splitter: ThinkingSplitter::new(),
            thinking_started: None,
            current_type: None,
            pending_memories: VecDeque::new(),
            sink: None,
            make_sink: None,
        }
    }

    /// Create the sink lazily, when the first ANSWER chunk arrives
    pub fn with_sink_factory<F>(mut self, factory: F) -> Self
    where
        F: FnMut() -> Box<dyn AnswerSink> + Send + 'static,
    {
        self.make_sink = Some(Box::new(factory));
        self
    }

    pub fn state(&self) -> &AnswerParseState {
        &self.state
    }

    pub fn transcript(&self) -> &str {
        &self.transcript
    }

    pub fn transcript_complete(&self) -> bool {
        self.transcript_complete
    }

    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    /// Attach the presentation sink; buffered citations are replayed in order
    pub fn attach_sink(&mut self, mut sink: Box<dyn AnswerSink>) {
        while let Some(citation) = self.pending_memories.pop_front() {
            sink.memory(&citation);
        }
        sink.update(&self.state);
        self.sink = Some(sink);
    }

    fn ensure_sink(&mut self) {
        if self.sink.is_some() {
            return;
        }
        if let Some(factory) = self.make_sink.as_mut() {
            let sink = factory();
            self.attach_sink(sink);
        }
    }

    /// Feed one chunk
    pub fn push(&mut self, chunk: &Chunk) {
        if let Some(chunk_type) = chunk.chunk_type() {
            self.current_type = Some(chunk_type);
        }

        let Some(chunk_type) = self.current_type else {
            debug!("Ignoring untyped chunk before any metadata");
            return;
        };

        let text = match &chunk.payload {
            Payload::Text(text) => Some(text.as_str()),
            Payload::Audio(bytes) => {
                let err = CaptureError::InvalidAudioPayload(format!(
                    "{} audio bytes in a {:?} stream",
                    bytes.len(),
                    chunk_type
                ));
                warn!("Discarding chunk: {}", err);
                None
            }
            Payload::Empty => None,
        };

        match chunk_type {
            ChunkType::Transcript => {
                if let Some(text) = text {
                    self.transcript.push_str(text);
                }
                if chunk.is_final() {
                    self.transcript_complete = true;
                }
            }
            ChunkType::Memory => {
                if let Some(text) = text {
                    let (id, score) = chunk
                        .metadata
                        .as_ref()
                        .map(|m| (m.memory_id.clone(), m.score))
                        .unwrap_or_default();
                    self.push_memory(MemoryCitation {
                        id,
                        text: text.to_string(),
                        score,
                    });
                }
            }
            ChunkType::Answer => {
                if self.state.is_complete {
                    debug!("Ignoring answer chunk after completion");
                    return;
                }
                self.ensure_sink();
                if let Some(text) = text {
                    self.push_answer_text(text);
                }
                if chunk.is_final() {
                    self.mark_complete();
                } else {
                    self.notify();
                }
            }
            ChunkType::Question => {
                debug!("Ignoring echoed question chunk");
            }
        }
    }

    fn push_memory(&mut self, citation: MemoryCitation) {
        self.state.memories.push(citation.clone());
        match self.sink.as_mut() {
            Some(sink) => sink.memory(&citation),
            None => self.pending_memories.push_back(citation),
        }
    }

    fn push_answer_text(&mut self, text: &str) {
        for segment in self.splitter.push(text) {
            self.apply(segment);
        }
    }

    fn apply(&mut self, segment: Segment) {
        match segment {
            Segment::Answer(text) => self.state.answer_text.push_str(&text),
            Segment::Thinking(text) => self.state.thinking_text.push_str(&text),
            Segment::OpenThinking => {
                self.state.is_thinking = true;
                self.state.thinking_complete = false;
                self.thinking_started = Some(Instant::now());
            }
            Segment::CloseThinking => self.end_thinking(),
        }
    }

    fn end_thinking(&mut self) {
        if !self.state.is_thinking {
            return;
        }
        self.state.is_thinking = false;
        self.state.thinking_complete = true;
        if let Some(started) = self.thinking_started.take() {
            let elapsed = started.elapsed().as_secs_f64();
            self.state.thinking_elapsed_seconds =
                Some(self.state.thinking_elapsed_seconds.unwrap_or(0.0) + elapsed);
        }
    }

    fn notify(&mut self) {
        if let Some(sink) = self.sink.as_mut() {
            sink.update(&self.state);
        }
    }

    /// Finish the answer: close any open thinking span and mark complete.
    ///
    /// Used for final chunks and when the transport closes without one. Only
    /// the first call has an effect.
    pub fn mark_complete(&mut self) {
        if self.state.is_complete {
            return;
        }

        if let Some(segment) = self.splitter.flush() {
            self.apply(segment);
        }
        self.end_thinking();
        self.state.is_complete = true;

        self.ensure_sink();
        if let Some(sink) = self.sink.as_mut() {
            sink.complete(&self.state);
        }
    }
}

impl Default for AnswerStreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for AnswerStreamParser {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnswerStreamParser")
            .field("state", &self.state)
            .field("transcript", &self.transcript)
            .field("pending_memories", &self.pending_memories.len())
            .field("has_sink", &self.sink.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChunkMetadata;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Clone, PartialEq)]
    enum SinkEvent {
        Memory(String),
        Update,
        Complete,
    }

    struct RecordingSink(Arc<Mutex<Vec<SinkEvent>>>);

    impl AnswerSink for RecordingSink {
        fn memory(&mut self, citation: &MemoryCitation) {
            self.0.lock().unwrap().push(SinkEvent::Memory(citation.text.clone()));
        }

        fn update(&mut self, _state: &AnswerParseState) {
            self.0.lock().unwrap().push(SinkEvent::Update);
        }

        fn complete(&mut self, _state: &AnswerParseState) {
            self.0.lock().unwrap().push(SinkEvent::Complete);
        }
    }

    fn typed(text: &str, chunk_type: ChunkType) -> Chunk {
        Chunk::text(text).with_metadata(ChunkMetadata::new("s", "m", chunk_type))
    }

    fn answer_final() -> Chunk {
        Chunk::final_marker(ChunkMetadata::new("s", "", ChunkType::Answer))
    }

    #[test]
    fn test_thinking_split_across_chunks() {
        let mut parser = AnswerStreamParser::new();
        parser.push(&typed("abc<thi", ChunkType::Answer));
        assert!(!parser.state().is_thinking);
        parser.push(&Chunk::text("nk>def</thi"));
        assert!(parser.state().is_thinking);
        parser.push(&Chunk::text("nk>ghi"));

        let state = parser.state();
        assert_eq!(state.answer_text, "abcghi");
        assert_eq!(state.thinking_text, "def");
        assert!(!state.is_thinking);
        assert!(state.thinking_complete);
        assert!(state.thinking_elapsed_seconds.is_some());
    }

    #[test]
    fn test_transcript_and_answer_separated() {
        let mut parser = AnswerStreamParser::new();
        parser.push(&typed("what is ", ChunkType::Transcript));
        parser.push(&Chunk::text("rust"));
        parser.push(&Chunk::final_marker(ChunkMetadata::new("s", "", ChunkType::Transcript)));
        parser.push(&typed("A language.", ChunkType::Answer));

        assert_eq!(parser.transcript(), "what is rust");
        assert!(parser.transcript_complete());
        assert_eq!(parser.state().answer_text, "A language.");
        assert!(!parser.state().is_complete, "transcript final does not finish the answer");
    }

    #[test]
    fn test_memories_before_answer_replayed_in_order() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        let mut parser = AnswerStreamParser::new()
            .with_sink_factory(move || Box::new(RecordingSink(sink_events.clone())) as Box<dyn AnswerSink>);

        parser.push(&typed("first", ChunkType::Memory));
        parser.push(&typed("second", ChunkType::Memory));
        parser.push(&typed("third", ChunkType::Memory));
        assert!(!parser.has_sink());
        assert!(events.lock().unwrap().is_empty());

        parser.push(&typed("answer", ChunkType::Answer));
        parser.push(&typed("late", ChunkType::Memory));

        let events = events.lock().unwrap();
        let memories: Vec<&SinkEvent> = events
            .iter()
            .filter(|e| matches!(e, SinkEvent::Memory(_)))
            .collect();
        assert_eq!(
            memories,
            vec![
                &SinkEvent::Memory("first".to_string()),
                &SinkEvent::Memory("second".to_string()),
                &SinkEvent::Memory("third".to_string()),
                &SinkEvent::Memory("late".to_string()),
            ]
        );
        assert_eq!(parser.state().memories.len(), 4);
    }

    #[test]
    fn test_memory_citation_fields() {
        let mut parser = AnswerStreamParser::new();
        let mut metadata = ChunkMetadata::new("s", "mem-7", ChunkType::Memory);
        metadata.score = 0.5;
        parser.push(&Chunk::text("met Ana").with_metadata(metadata));

        assert_eq!(
            parser.state().memories,
            vec![MemoryCitation {
                id: "mem-7".to_string(),
                text: "met Ana".to_string(),
                score: 0.5,
            }]
        );
    }

    #[test]
    fn test_final_chunk_closes_open_thinking_once() {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink_events = events.clone();
        let mut parser = AnswerStreamParser::new()
            .with_sink_factory(move || Box::new(RecordingSink(sink_events.clone())) as Box<dyn AnswerSink>);

        parser.push(&typed("<think>never closed", ChunkType::Answer));
        assert!(parser.state().is_thinking);

        parser.push(&answer_final());
        parser.mark_complete();

        let state = parser.state();
        assert!(state.is_complete);
        assert!(!state.is_thinking);
        assert!(state.thinking_complete);
        assert_eq!(state.thinking_text, "never closed");

        let completes = events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| **e == SinkEvent::Complete)
            .count();
        assert_eq!(completes, 1);
    }

    #[test]
    fn test_mark_complete_without_final_chunk() {
        let mut parser = AnswerStreamParser::new();
        parser.push(&typed("done <thi", ChunkType::Answer));
        parser.mark_complete();

        assert!(parser.state().is_complete);
        assert_eq!(parser.state().answer_text, "done <thi");
        assert_eq!(parser.state().thinking_elapsed_seconds, None);
    }

    #[test]
    fn test_audio_payload_discarded() {
        let mut parser = AnswerStreamParser::new();
        parser.push(&Chunk::audio(vec![1, 2, 3]).with_metadata(ChunkMetadata::new("s", "", ChunkType::Answer)));
        parser.push(&Chunk::text("ok"));
        assert_eq!(parser.state().answer_text, "ok");
    }

    #[tokio::test(start_paused = true)]
    async fn test_thinking_elapsed_time() {
        let mut parser = AnswerStreamParser::new();
        parser.push(&typed("<think>hmm", ChunkType::Answer));
        tokio::time::advance(Duration::from_millis(2500)).await;
        parser.push(&Chunk::text("</think>yes"));

        let elapsed = parser.state().thinking_elapsed_seconds.unwrap();
        assert!((elapsed - 2.5).abs() < 0.01, "elapsed was {}", elapsed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_forced_finalize_measures_thinking() {
        let mut parser = AnswerStreamParser::new();
        parser.push(&typed("<think>", ChunkType::Answer));
        tokio::time::advance(Duration::from_secs(4)).await;
        parser.mark_complete();

        let elapsed = parser.state().thinking_elapsed_seconds.unwrap();
        assert!((elapsed - 4.0).abs() < 0.01, "elapsed was {}", elapsed);
    }
}
