use std::fmt;
use std::sync::Arc;

use crate::error::EngineError;
use crate::request::Request;

/// The closed set of lifecycle extension points.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookType {
    HeadersStart,
    Header,
    Headers,
    Path,
    Read,
    NewChunk,
    ChunkComplete,
    ChunksComplete,
    RequestFini,
    ConnectionFini,
    Error,
    Hostname,
    Write,
}

pub(crate) const HOOK_SLOTS: usize = 13;

impl HookType {
    pub(crate) fn slot(self) -> usize {
        self as usize
    }
}

/// What a hook hands back to the engine. Anything other than `Ok`
/// stops the protocol state machine: `Pause` suspends the connection
/// until an external resume, `Abort` tears the transaction down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookOutcome {
    Ok,
    Pause,
    Abort,
}

/// Borrowed payload delivered alongside a hook firing. Hooks may read
/// it freely but it never outlives the call.
pub enum HookData<'a> {
    None,
    Header { key: &'a str, value: &'a str },
    Path(&'a str),
    Body(&'a [u8]),
    ChunkLen(u64),
    Hostname(&'a str),
    Error(&'a EngineError),
}

/// A hook is invoked with the live request when one exists (teardown
/// hooks can fire between transactions) and the phase payload. Opaque
/// user arguments from the classic fn-pointer shape are subsumed by
/// closure capture.
pub type HookFn = Arc<dyn Fn(Option<&mut Request>, &HookData<'_>) -> HookOutcome + Send + Sync>;

/// One slot per hook type. Registering a type twice on the same table
/// overwrites the earlier entry.
#[derive(Clone, Default)]
pub struct HookTable {
    slots: [Option<HookFn>; HOOK_SLOTS],
}

impl HookTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, ty: HookType, hook: HookFn) {
        self.slots[ty.slot()] = Some(hook);
    }

    pub fn unset(&mut self, ty: HookType) {
        self.slots[ty.slot()] = None;
    }

    pub fn unset_all(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }

    pub fn get(&self, ty: HookType) -> Option<&HookFn> {
        self.slots[ty.slot()].as_ref()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.iter().all(Option::is_none)
    }
}

impl fmt::Debug for HookTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set: Vec<usize> = self
            .slots
            .iter()
            .enumerate()
            .filter_map(|(idx, slot)| slot.as_ref().map(|_| idx))
            .collect();
        f.debug_struct("HookTable").field("set_slots", &set).finish()
    }
}

/// Scope resolution for a firing: the request-level override wins, then
/// the matched callback's table, then the connection table. The result
/// is cloned out so the caller holds no borrow while invoking it.
pub(crate) fn resolve(
    request_table: Option<&HookTable>,
    callback_table: Option<&HookTable>,
    connection_table: &HookTable,
    ty: HookType,
) -> Option<HookFn> {
    if let Some(hook) = request_table.and_then(|table| table.get(ty)) {
        return Some(hook.clone());
    }
    if let Some(hook) = callback_table.and_then(|table| table.get(ty)) {
        return Some(hook.clone());
    }
    connection_table.get(ty).cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn tagged(tag: usize, hits: Arc<AtomicUsize>) -> HookFn {
        Arc::new(move |_, _| {
            hits.store(tag, Ordering::SeqCst);
            HookOutcome::Ok
        })
    }

    #[test]
    fn reregistering_overwrites() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut table = HookTable::new();
        table.set(HookType::Read, tagged(1, hits.clone()));
        table.set(HookType::Read, tagged(2, hits.clone()));
        let hook = table.get(HookType::Read).expect("hook registered");
        hook(None, &HookData::None);
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn unset_all_clears_every_slot() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut table = HookTable::new();
        table.set(HookType::Read, tagged(1, hits.clone()));
        table.set(HookType::Error, tagged(2, hits));
        table.unset_all();
        assert!(table.is_empty());
    }

    #[test]
    fn resolution_prefers_request_then_callback_then_connection() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut request_table = HookTable::new();
        let mut callback_table = HookTable::new();
        let mut connection_table = HookTable::new();
        request_table.set(HookType::Read, tagged(1, hits.clone()));
        callback_table.set(HookType::Read, tagged(2, hits.clone()));
        connection_table.set(HookType::Read, tagged(3, hits.clone()));

        let hook = resolve(
            Some(&request_table),
            Some(&callback_table),
            &connection_table,
            HookType::Read,
        )
        .expect("resolved");
        hook(None, &HookData::None);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        request_table.unset(HookType::Read);
        let hook = resolve(
            Some(&request_table),
            Some(&callback_table),
            &connection_table,
            HookType::Read,
        )
        .expect("resolved");
        hook(None, &HookData::None);
        assert_eq!(hits.load(Ordering::SeqCst), 2);

        let hook = resolve(Some(&request_table), None, &connection_table, HookType::Read)
            .expect("resolved");
        hook(None, &HookData::None);
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }
}
