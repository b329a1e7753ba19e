pub mod filter;
pub mod markers;

pub use filter::{
    DirectiveFilter, DirectiveKind, DirectiveRequest, DispatchOutcome, FilterConfig,
    FilterEvent, FilterMode, FilterState, RepeatPolicy, StreamEnd,
};
pub use markers::{MarkerKind, MarkerPrefix, MarkerSet};
