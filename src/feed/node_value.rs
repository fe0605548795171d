//! Priority-merged scalar slot.
//!
//! Several namespace parsers can provide the same logical field (an item
//! description may come from `<description>`, `<itunes:summary>` or
//! `<media:description>`). Each write carries a priority built from the
//! namespace priority and a per-node priority; the slot keeps the value of
//! the highest-priority write seen so far.

/// Bits reserved for the node-level priority inside a combined priority.
pub const NODE_PRIORITY_BITS: u32 = 16;

/// Combines a namespace priority and a node priority into one value.
///
/// Any write from a higher-priority namespace outranks every write from a
/// lower one, whatever their node priorities.
pub const fn priority(namespace: u32, node: u32) -> u32 {
    (namespace << NODE_PRIORITY_BITS) | (node & ((1 << NODE_PRIORITY_BITS) - 1))
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NodeValue {
    priority: u32,
    value: String,
    set: bool,
}

impl NodeValue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `value` if `priority` is at least the current priority.
    ///
    /// Returns whether the write was accepted.
    pub fn set(&mut self, priority: u32, value: impl Into<String>) -> bool {
        if self.set && priority < self.priority {
            return false;
        }
        self.priority = priority;
        self.value = value.into();
        self.set = true;
        true
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn priority(&self) -> u32 {
        self.priority
    }

    pub fn is_set(&self) -> bool {
        self.set
    }

    /// True when no write happened or the written value is blank.
    pub fn is_empty(&self) -> bool {
        self.value.trim().is_empty()
    }

    pub fn into_value(self) -> String {
        self.value
    }
}
