use std::sync::{Arc, RwLock};

use crate::hooks::{HookFn, HookTable, HookType};
use crate::request::Request;

/// A routed request handler. Handlers run synchronously on the
/// connection's event loop; long work must go through pause/resume.
pub type Handler = Arc<dyn Fn(&mut Request) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Glob,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackId(pub(crate) u64);

/// One routing entry. Held by exactly one registry; handed out as an
/// `Arc` so route resolution can release the registry lock before the
/// handler runs.
pub struct Callback {
    id: CallbackId,
    kind: MatchKind,
    pattern: String,
    handler: Handler,
    hooks: RwLock<HookTable>,
}

impl Callback {
    pub fn id(&self) -> CallbackId {
        self.id
    }

    pub fn kind(&self) -> MatchKind {
        self.kind
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    pub(crate) fn handler(&self) -> Handler {
        self.handler.clone()
    }

    /// Per-callback hook override; consulted after the request-level
    /// table and before the connection table.
    pub fn set_hook(&self, ty: HookType, hook: HookFn) {
        self.hooks.write().expect("callback hook table poisoned").set(ty, hook);
    }

    pub fn unset_hook(&self, ty: HookType) {
        self.hooks.write().expect("callback hook table poisoned").unset(ty);
    }

    pub fn unset_all_hooks(&self) {
        self.hooks.write().expect("callback hook table poisoned").unset_all();
    }

    pub(crate) fn hooks_guard(&self) -> std::sync::RwLockReadGuard<'_, HookTable> {
        self.hooks.read().expect("callback hook table poisoned")
    }
}

/// Result of routing a path: the winning entry plus the matched
/// sub-range. Bytes outside `match_start..match_end` were consumed by
/// wildcards (or lie past an exact prefix), so a handler registered for
/// `/foo/` recovers `<rest>` from `path[match_end..]` without
/// re-parsing.
pub struct RouteMatch {
    pub callback: Option<Arc<Callback>>,
    pub handler: Handler,
    pub match_start: usize,
    pub match_end: usize,
}

#[derive(Default)]
pub(crate) struct Registry {
    entries: Vec<Arc<Callback>>,
    default_handler: Option<Handler>,
    next_id: u64,
}

impl Registry {
    pub(crate) fn register(
        &mut self,
        pattern: &str,
        kind: MatchKind,
        handler: Handler,
    ) -> Arc<Callback> {
        self.next_id += 1;
        let callback = Arc::new(Callback {
            id: CallbackId(self.next_id),
            kind,
            pattern: pattern.to_string(),
            handler,
            hooks: RwLock::new(HookTable::new()),
        });
        self.entries.push(callback.clone());
        callback
    }

    pub(crate) fn unregister(&mut self, id: CallbackId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|entry| entry.id != id);
        self.entries.len() != before
    }

    pub(crate) fn set_default_handler(&mut self, handler: Option<Handler>) {
        self.default_handler = handler;
    }

    /// Resolution order: exact on the full path, exact on the path
    /// minus its file segment, globs in registration order, then the
    /// default handler.
    pub(crate) fn resolve(&self, full: &str, dir: &str) -> Option<RouteMatch> {
        for entry in &self.entries {
            if entry.kind == MatchKind::Exact && entry.pattern == full {
                return Some(RouteMatch {
                    callback: Some(entry.clone()),
                    handler: entry.handler(),
                    match_start: 0,
                    match_end: full.len(),
                });
            }
        }
        for entry in &self.entries {
            if entry.kind == MatchKind::Exact && entry.pattern == dir {
                return Some(RouteMatch {
                    callback: Some(entry.clone()),
                    handler: entry.handler(),
                    match_start: 0,
                    match_end: dir.len(),
                });
            }
        }
        for entry in &self.entries {
            if entry.kind == MatchKind::Glob {
                if let Some((start, end)) = glob_match(&entry.pattern, full) {
                    return Some(RouteMatch {
                        callback: Some(entry.clone()),
                        handler: entry.handler(),
                        match_start: start,
                        match_end: end,
                    });
                }
            }
        }
        self.default_handler.as_ref().map(|handler| RouteMatch {
            callback: None,
            handler: handler.clone(),
            match_start: 0,
            match_end: full.len(),
        })
    }

}

// Runs of `*` collapse to one, so recursive `**` behaves as `*`.
fn collapse_stars(pattern: &str) -> String {
    let mut out = String::with_capacity(pattern.len());
    let mut last_star = false;
    for ch in pattern.chars() {
        if ch == '*' {
            if !last_star {
                out.push(ch);
            }
            last_star = true;
        } else {
            out.push(ch);
            last_star = false;
        }
    }
    out
}

/// Case-sensitive wildcard match, anchored at both ends unless a `*`
/// sits at that end. Returns the span of `text` covered by the
/// pattern's literal anchors; bytes swallowed by a leading or trailing
/// `*` fall outside the span.
pub(crate) fn glob_match(pattern: &str, text: &str) -> Option<(usize, usize)> {
    let normalized = collapse_stars(pattern);
    if !normalized.contains('*') {
        return (normalized == text).then(|| (0, text.len()));
    }

    let parts: Vec<&str> = normalized.split('*').collect();
    let mut cursor = 0usize;
    let mut start: Option<usize> = None;

    let first = parts[0];
    if !first.is_empty() {
        if !text.starts_with(first) {
            return None;
        }
        cursor = first.len();
        start = Some(0);
    }

    let last = *parts.last().unwrap_or(&"");
    for part in &parts[1..parts.len().saturating_sub(1)] {
        if part.is_empty() {
            continue;
        }
        let found = text[cursor..].find(part)? + cursor;
        if start.is_none() {
            start = Some(found);
        }
        cursor = found + part.len();
    }

    let end = if last.is_empty() {
        cursor
    } else {
        if text.len() < cursor + last.len() || !text.ends_with(last) {
            return None;
        }
        let last_start = text.len() - last.len();
        if last_start < cursor {
            return None;
        }
        if start.is_none() {
            start = Some(last_start);
        }
        text.len()
    };

    Some((start.unwrap_or(cursor), end))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn noop() -> Handler {
        Arc::new(|_req: &mut Request| {})
    }

    #[test]
    fn glob_anchored_both_ends_without_star() {
        assert_eq!(glob_match("/a/b", "/a/b"), Some((0, 4)));
        assert_eq!(glob_match("/a/b", "/a/b/c"), None);
        assert_eq!(glob_match("/A/b", "/a/b"), None);
    }

    #[test]
    fn glob_trailing_star_exposes_suffix() {
        let (start, end) = glob_match("/foo/*", "/foo/bar/baz").expect("match");
        assert_eq!(start, 0);
        assert_eq!(&"/foo/bar/baz"[end..], "bar/baz");
    }

    #[test]
    fn glob_leading_star_exposes_prefix() {
        let (start, end) = glob_match("*.html", "/index.html").expect("match");
        assert_eq!(end, "/index.html".len());
        assert_eq!(&"/index.html"[..start], "/index");
        assert_eq!(glob_match("*.html", "/index.txt"), None);
    }

    #[test]
    fn glob_interior_literals_match_in_order() {
        assert!(glob_match("/a/*/c", "/a/b/c").is_some());
        assert!(glob_match("/a/*/c", "/a/x/y/c").is_some());
        assert_eq!(glob_match("/a/*/c", "/a/b/d"), None);
    }

    #[test]
    fn double_star_collapses_to_single() {
        assert_eq!(
            glob_match("/a/**/c", "/a/b/x/c"),
            glob_match("/a/*/c", "/a/b/x/c")
        );
        assert!(glob_match("/files/**", "/files/a/b/c").is_some());
    }

    #[test]
    fn bare_star_matches_everything() {
        assert!(glob_match("*", "/anything/at/all").is_some());
        assert!(glob_match("**", "/x").is_some());
    }

    #[test]
    fn exact_beats_glob_regardless_of_registration_order() {
        let mut registry = Registry::default();
        let glob = registry.register("/rest/*", MatchKind::Glob, noop());
        let exact = registry.register("/rest/get", MatchKind::Exact, noop());
        let matched = registry.resolve("/rest/get", "/rest/").expect("route");
        assert_eq!(matched.callback.expect("callback").id(), exact.id());
        let _ = glob;
    }

    #[test]
    fn first_registered_glob_wins() {
        let mut registry = Registry::default();
        let first = registry.register("/a/*", MatchKind::Glob, noop());
        let second = registry.register("/a/b*", MatchKind::Glob, noop());
        let matched = registry.resolve("/a/b", "/a/").expect("route");
        assert_eq!(matched.callback.expect("callback").id(), first.id());
        let _ = second;
    }

    #[test]
    fn exact_on_directory_part_recovers_suffix() {
        let mut registry = Registry::default();
        registry.register("/a/b/", MatchKind::Exact, noop());
        let matched = registry.resolve("/a/b/c", "/a/b/").expect("route");
        assert_eq!(&"/a/b/c"[matched.match_end..], "c");
    }

    #[test]
    fn miss_falls_back_to_default_then_none() {
        let mut registry = Registry::default();
        assert!(registry.resolve("/nope", "/").is_none());
        registry.set_default_handler(Some(noop()));
        let matched = registry.resolve("/nope", "/").expect("default");
        assert!(matched.callback.is_none());
    }

    #[test]
    fn unregister_removes_entry() {
        let mut registry = Registry::default();
        let cb = registry.register("/x", MatchKind::Exact, noop());
        assert!(registry.unregister(cb.id()));
        assert!(!registry.unregister(cb.id()));
        assert!(registry.resolve("/x", "/").is_none());
    }
}
