//! Research data model shared by the engine, the session store and the gateway

mod candidate;
mod events;
mod query;
mod session;

pub use candidate::{CandidateKey, SourceCandidate, SourceType};
pub use events::{CitationRef, Stage, StreamEvent};
pub use query::{Query, Tier};
pub use session::{
    CompletionTrigger, ConversationMessage, MessageRole, ReflectorVerdict, ResearchRound,
    ResearchSession, SessionMetadata, SessionStatus, SourceFailure, StopReason, StoppingDecision,
};
