//! Conversational core: session timing, directives, reply orchestration,
//! proactive follow-ups and the per-user turn controller.

pub mod directives;
pub mod handlers;
pub mod locks;
pub mod orchestrator;
pub mod outbound;
pub mod proactive;
pub mod prompt;
pub mod session;
pub mod transport;
pub mod turn;

#[cfg(test)]
mod testing;

pub use directives::{
    ProactiveDirective, ReplyDirectives, StickerDirective, TrailingLine, is_silence, parse_reply,
};
pub use handlers::ChannelTools;
pub use locks::UserLocks;
pub use orchestrator::{PreludeSink, ReplyOrchestrator, ReplyOutcome};
pub use outbound::{Outbound, Pacing, split_lines};
pub use proactive::{
    AttemptOutcome, ProactiveDispatcher, ProactiveQueue, ProactiveRequest, append_request,
    build_request, effective_delay,
};
pub use session::{TimingOutcome, Zone, apply_timing, humanize_duration};
pub use transport::{
    ChannelMessage, HistorySource, HttpMessagePoster, MessagePoster, RealtimeEmitter, SessionRecord,
    StickerResolver, WebSearcher, format_activity_frequency,
};
pub use turn::{
    Collaborators, InboundMessage, MaintenanceReport, TurnController, TurnOutcome, wants_remember,
};
