//! Async event classes and fixed record layouts.
//!
//! Every user-visible perf ring record starts with a 64-bit `async_id`.
//! Format-call classes (printf/system/cat) reserve a block of 10000 ids each
//! so that the per-call format id can be packed into the same word; all other
//! classes are single values starting at 30000.

use serde::{Deserialize, Serialize};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Class tag carried in the leading 64 bits of a perf ring record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u64)]
pub enum AsyncAction {
    /// printf() records occupy ids 0..=9999
    Printf = 0,
    /// system() records occupy ids 10000..=19999
    System = 10_000,
    /// cat() records occupy ids 20000..=29999
    Cat = 20_000,
    Exit = 30_000,
    Print = 30_001,
    Clear = 30_002,
    Zero = 30_003,
    Time = 30_004,
    Join = 30_005,
    HelperError = 30_006,
    PrintNonMap = 30_007,
    Strftime = 30_008,
}

impl AsyncAction {
    pub fn base(self) -> u64 {
        self as u64
    }
}

/// A decoded `async_id`: the event class plus the per-class id, if any.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AsyncEvent {
    pub action: AsyncAction,
    pub id: u64,
}

impl AsyncEvent {
    /// Decode the leading 64 bits of a perf ring record.
    pub fn decode(async_id: u64) -> Option<Self> {
        let (action, id) = match async_id {
            0..=9_999 => (AsyncAction::Printf, async_id),
            10_000..=19_999 => (AsyncAction::System, async_id - 10_000),
            20_000..=29_999 => (AsyncAction::Cat, async_id - 20_000),
            30_000 => (AsyncAction::Exit, 0),
            30_001 => (AsyncAction::Print, 0),
            30_002 => (AsyncAction::Clear, 0),
            30_003 => (AsyncAction::Zero, 0),
            30_004 => (AsyncAction::Time, 0),
            30_005 => (AsyncAction::Join, 0),
            30_006 => (AsyncAction::HelperError, 0),
            30_007 => (AsyncAction::PrintNonMap, 0),
            30_008 => (AsyncAction::Strftime, 0),
            _ => return None,
        };
        Some(Self { action, id })
    }
}

/// print(@map[, top[, div]]): unused trailing slots are zeroed by the program.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct PrintMapEvent {
    pub action: u64,
    pub map_id: u32,
    pub top: u32,
    pub div: u32,
}

/// clear(@map) / zero(@map).
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct MapResetEvent {
    pub action: u64,
    pub map_id: u32,
}

/// time(fmt): fmt selected from the time format table by id.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct TimeEvent {
    pub action: u64,
    pub time_id: u32,
}

/// strftime(fmt, ns): the format id is packed in place of the class tag.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct StrftimeEvent {
    pub strftime_id: u64,
    pub nsecs: u64,
}

#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct ExitEvent {
    pub action: u64,
}

/// print(scalar): followed by a payload of the declared value size.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct PrintNonMapEventHeader {
    pub action: u64,
    pub print_id: u64,
}

/// Emitted in-kernel when a helper call fails; the program continues with a
/// safe default. `error_id` correlates with a call-site location recorded at
/// emission time.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct HelperErrorEvent {
    pub action: u64,
    pub error_id: u64,
    pub return_value: i32,
}

/// join(argv): followed by exactly `join_argnum` strings of `join_argsize`
/// bytes each.
#[repr(C, packed)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct JoinEventHeader {
    pub action: u64,
    pub join_id: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_classes_decode_with_packed_id() {
        assert_eq!(
            AsyncEvent::decode(0),
            Some(AsyncEvent {
                action: AsyncAction::Printf,
                id: 0
            })
        );
        assert_eq!(
            AsyncEvent::decode(17),
            Some(AsyncEvent {
                action: AsyncAction::Printf,
                id: 17
            })
        );
        assert_eq!(
            AsyncEvent::decode(10_003),
            Some(AsyncEvent {
                action: AsyncAction::System,
                id: 3
            })
        );
        assert_eq!(
            AsyncEvent::decode(20_000),
            Some(AsyncEvent {
                action: AsyncAction::Cat,
                id: 0
            })
        );
    }

    #[test]
    fn test_singleton_classes_decode_exactly() {
        assert_eq!(
            AsyncEvent::decode(30_000).map(|e| e.action),
            Some(AsyncAction::Exit)
        );
        assert_eq!(
            AsyncEvent::decode(30_006).map(|e| e.action),
            Some(AsyncAction::HelperError)
        );
        assert_eq!(
            AsyncEvent::decode(30_008).map(|e| e.action),
            Some(AsyncAction::Strftime)
        );
        assert_eq!(AsyncEvent::decode(40_000), None);
    }

    #[test]
    fn test_record_sizes_match_emitted_layouts() {
        assert_eq!(core::mem::size_of::<PrintMapEvent>(), 20);
        assert_eq!(core::mem::size_of::<MapResetEvent>(), 12);
        assert_eq!(core::mem::size_of::<TimeEvent>(), 12);
        assert_eq!(core::mem::size_of::<StrftimeEvent>(), 16);
        assert_eq!(core::mem::size_of::<ExitEvent>(), 8);
        assert_eq!(core::mem::size_of::<PrintNonMapEventHeader>(), 16);
        assert_eq!(core::mem::size_of::<HelperErrorEvent>(), 20);
        assert_eq!(core::mem::size_of::<JoinEventHeader>(), 16);
    }
}
