//! Result collectors: pluggable stop policies for descending scans.
//!
//! The block engine streams messages newest-first and asks the collector
//! three questions: is this gap tolerable (`push_placeholder`), are you
//! full (`done`), and should this terminal error stand (`error`). The
//! four implementations cover the store's read patterns: a plain count,
//! a per-type count, an exhaustive sweep, and a hole-tolerant wrapper.
//!
//! Collectors are single-threaded; sharing one across concurrent scans
//! is a caller bug.

use std::collections::HashSet;
use std::fmt;

use banter_types::{MessageId, MessagePlaceholder, MessageType, MessageUnboxed};

use crate::errors::StorageError;

// ---------------------------------------------------------------------------
// ResultCollector
// ---------------------------------------------------------------------------

/// Consumes a descending message stream and decides when to stop.
pub trait ResultCollector: fmt::Display {
    /// Consumes a stored message.
    fn push(&mut self, msg: MessageUnboxed);

    /// Asked whether a missing id is tolerable. `true` means the scan
    /// continues; `false` makes the engine fail with a miss for `msg_id`.
    fn push_placeholder(&mut self, msg_id: MessageId) -> bool;

    /// Checked after each push; `true` halts the scan.
    fn done(&self) -> bool;

    /// The collected messages, in push (descending) order.
    fn result(&self) -> Vec<MessageUnboxed>;

    /// Filters a terminal engine error. Returning `None` suppresses it.
    fn error(&self, err: StorageError) -> Option<StorageError>;

    /// Short diagnostic name.
    fn name(&self) -> &'static str;
}

// ---------------------------------------------------------------------------
// SimpleResultCollector
// ---------------------------------------------------------------------------

/// Collects until `target` messages have been gathered. A negative
/// target never fills up and swallows misses: "give me whatever is
/// there, all the way down".
pub struct SimpleResultCollector {
    res: Vec<MessageUnboxed>,
    target: isize,
}

impl SimpleResultCollector {
    /// Creates a collector with the given target count.
    pub fn new(target: isize) -> Self {
        Self {
            res: Vec::new(),
            target,
        }
    }
}

impl ResultCollector for SimpleResultCollector {
    fn push(&mut self, msg: MessageUnboxed) {
        self.res.push(msg);
    }

    fn push_placeholder(&mut self, _msg_id: MessageId) -> bool {
        false
    }

    fn done(&self) -> bool {
        if self.target < 0 {
            return false;
        }
        self.res.len() >= self.target as usize
    }

    fn result(&self) -> Vec<MessageUnboxed> {
        self.res.clone()
    }

    fn error(&self, err: StorageError) -> Option<StorageError> {
        if self.target < 0 && err.is_miss() {
            // No hard target, so running off the end is fine.
            return None;
        }
        Some(err)
    }

    fn name(&self) -> &'static str {
        "simple"
    }
}

impl fmt::Display for SimpleResultCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[ {}: t: {} c: {} ]",
            self.name(),
            self.target,
            self.res.len()
        )
    }
}

// ---------------------------------------------------------------------------
// TypedResultCollector
// ---------------------------------------------------------------------------

/// Collects until `target` messages of the requested types have been
/// gathered. Messages of other types are still pushed into the result;
/// they just do not count. A negative target behaves as in
/// [`SimpleResultCollector`].
pub struct TypedResultCollector {
    res: Vec<MessageUnboxed>,
    target: isize,
    cur: usize,
    types: HashSet<MessageType>,
}

impl TypedResultCollector {
    /// Creates a collector counting only `types`.
    pub fn new(target: isize, types: impl IntoIterator<Item = MessageType>) -> Self {
        Self {
            res: Vec::new(),
            target,
            cur: 0,
            types: types.into_iter().collect(),
        }
    }
}

impl ResultCollector for TypedResultCollector {
    fn push(&mut self, msg: MessageUnboxed) {
        if self.types.contains(&msg.message_type()) {
            self.cur += 1;
        }
        self.res.push(msg);
    }

    fn push_placeholder(&mut self, _msg_id: MessageId) -> bool {
        false
    }

    fn done(&self) -> bool {
        if self.target < 0 {
            return false;
        }
        self.cur >= self.target as usize
    }

    fn result(&self) -> Vec<MessageUnboxed> {
        self.res.clone()
    }

    fn error(&self, err: StorageError) -> Option<StorageError> {
        if self.target < 0 && err.is_miss() {
            return None;
        }
        Some(err)
    }

    fn name(&self) -> &'static str {
        "typed"
    }
}

impl fmt::Display for TypedResultCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[ {}: t: {} c: {} ({} types) ]",
            self.name(),
            self.target,
            self.cur,
            self.types.len()
        )
    }
}

// ---------------------------------------------------------------------------
// InsatiableResultCollector
// ---------------------------------------------------------------------------

/// Never stops and tolerates every gap without recording it. Used for
/// full-history sweeps where the scan must reach the low end of the
/// store no matter what is missing.
#[derive(Default)]
pub struct InsatiableResultCollector {
    res: Vec<MessageUnboxed>,
}

impl InsatiableResultCollector {
    /// Creates the collector.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ResultCollector for InsatiableResultCollector {
    fn push(&mut self, msg: MessageUnboxed) {
        self.res.push(msg);
    }

    fn push_placeholder(&mut self, _msg_id: MessageId) -> bool {
        // Missing messages are a-ok
        true
    }

    fn done(&self) -> bool {
        false
    }

    fn result(&self) -> Vec<MessageUnboxed> {
        self.res.clone()
    }

    fn error(&self, err: StorageError) -> Option<StorageError> {
        Some(err)
    }

    fn name(&self) -> &'static str {
        "inf"
    }
}

impl fmt::Display for InsatiableResultCollector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[ {}: c: {} ]", self.name(), self.res.len())
    }
}

// ---------------------------------------------------------------------------
// HoleyResultCollector
// ---------------------------------------------------------------------------

/// Wraps another collector and converts up to `max_holes` gaps into
/// synthetic placeholder records pushed into it. Beyond the budget the
/// gap becomes a miss again. This is the only path that materializes
/// [`MessageUnboxed::Placeholder`] values.
pub struct HoleyResultCollector<C: ResultCollector> {
    inner: C,
    max_holes: usize,
    holes: usize,
}

impl<C: ResultCollector> HoleyResultCollector<C> {
    /// Wraps `inner`, tolerating at most `max_holes` gaps.
    pub fn new(max_holes: usize, inner: C) -> Self {
        Self {
            inner,
            max_holes,
            holes: 0,
        }
    }

    /// How many placeholders have been emitted.
    pub fn holes(&self) -> usize {
        self.holes
    }
}

impl<C: ResultCollector> ResultCollector for HoleyResultCollector<C> {
    fn push(&mut self, msg: MessageUnboxed) {
        self.inner.push(msg);
    }

    fn push_placeholder(&mut self, msg_id: MessageId) -> bool {
        if self.holes >= self.max_holes {
            return false;
        }
        self.inner.push(MessageUnboxed::Placeholder(MessagePlaceholder {
            message_id: msg_id,
        }));
        self.holes += 1;
        true
    }

    fn done(&self) -> bool {
        self.inner.done()
    }

    fn result(&self) -> Vec<MessageUnboxed> {
        self.inner.result()
    }

    fn error(&self, err: StorageError) -> Option<StorageError> {
        self.inner.error(err)
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

impl<C: ResultCollector> fmt::Display for HoleyResultCollector<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.inner.fmt(f)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
