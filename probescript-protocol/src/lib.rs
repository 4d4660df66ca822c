//! probescript wire protocol
//!
//! Types shared between generated eBPF programs and the user-space event
//! consumer: the async action tag carried in the leading 64 bits of every
//! perf ring record, the fixed record layouts, the per-format-call argument
//! tables, and the probe-id registry.

pub mod async_event;
pub mod format;
pub mod registry;

pub use async_event::{
    AsyncAction, AsyncEvent, ExitEvent, HelperErrorEvent, JoinEventHeader, MapResetEvent,
    PrintMapEvent, PrintNonMapEventHeader, StrftimeEvent, TimeEvent,
};
pub use format::{ArgKind, ArgType, FormatArg, FormatEntry, FormatTable};
pub use registry::ProbeRegistry;
