//! Answer stream parsing
//!
//! Reconstructs transcript, memory citations, thinking span and answer text
//! from a stream of partial chunks.

mod parser;
pub mod thinking;

pub use parser::{AnswerParseState, AnswerSink, AnswerStreamParser, MemoryCitation};
pub use thinking::{split_fragment, Segment, SplitState, ThinkingSplitter};
