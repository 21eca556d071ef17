use std::sync::{Arc, RwLock, RwLockReadGuard, Weak};
use std::time::Duration;

use log::info;

use crate::error::{EngineError, EngineResult};
use crate::hooks::{HookFn, HookTable, HookType};
use crate::router::{glob_match, CallbackId, Handler, MatchKind, Registry, RouteMatch};
use crate::tls::TlsConfig;

pub type CallbackHandle = Arc<crate::router::Callback>;

/// Engine-level knobs. Mutated only at configuration time; each new
/// connection takes a snapshot.
#[derive(Clone, Default)]
pub struct ServerConfig {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
    pub max_body_size: Option<u64>,
    pub max_keepalive_requests: Option<u32>,
    pub tls: Option<TlsConfig>,
}

#[derive(Clone)]
pub(crate) struct ConfigSnapshot {
    pub(crate) max_body_size: Option<u64>,
    pub(crate) max_keepalive_requests: Option<u32>,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) sni_vhosts: bool,
}

pub(crate) struct ServerInner {
    name: RwLock<String>,
    aliases: RwLock<Vec<String>>,
    registry: RwLock<Registry>,
    hooks: RwLock<HookTable>,
    vhosts: RwLock<Vec<Arc<ServerInner>>>,
    parent: RwLock<Weak<ServerInner>>,
    config: RwLock<ServerConfig>,
}

impl ServerInner {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            name: RwLock::new(String::new()),
            aliases: RwLock::new(Vec::new()),
            registry: RwLock::new(Registry::default()),
            hooks: RwLock::new(HookTable::new()),
            vhosts: RwLock::new(Vec::new()),
            parent: RwLock::new(Weak::new()),
            config: RwLock::new(ServerConfig::default()),
        })
    }

    pub(crate) fn resolve_route(&self, full: &str, dir: &str) -> Option<RouteMatch> {
        self.registry
            .read()
            .expect("registry lock poisoned")
            .resolve(full, dir)
    }

    /// Glob match a host name against each vhost's name and aliases,
    /// case-insensitively, in registration order.
    pub(crate) fn find_vhost(&self, host: &str) -> Option<Arc<ServerInner>> {
        let host = host.to_ascii_lowercase();
        let vhosts = self.vhosts.read().expect("vhost lock poisoned");
        for vhost in vhosts.iter() {
            let name = vhost.name.read().expect("vhost name lock poisoned").clone();
            if glob_match(&name.to_ascii_lowercase(), &host).is_some() {
                return Some(vhost.clone());
            }
            let aliases = vhost.aliases.read().expect("alias lock poisoned");
            for alias in aliases.iter() {
                if glob_match(&alias.to_ascii_lowercase(), &host).is_some() {
                    return Some(vhost.clone());
                }
            }
        }
        None
    }

    pub(crate) fn parent(&self) -> Option<Arc<ServerInner>> {
        self.parent.read().expect("parent lock poisoned").upgrade()
    }

    pub(crate) fn connection_hooks(&self) -> HookTable {
        self.hooks.read().expect("hook lock poisoned").clone()
    }

    pub(crate) fn config_snapshot(&self) -> ConfigSnapshot {
        let config = self.config.read().expect("config lock poisoned");
        ConfigSnapshot {
            max_body_size: config.max_body_size,
            max_keepalive_requests: config.max_keepalive_requests,
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
            sni_vhosts: config
                .tls
                .as_ref()
                .map(|tls| tls.enable_sni)
                .unwrap_or(false),
        }
    }

    pub(crate) fn tls_config(&self) -> Option<TlsConfig> {
        self.config.read().expect("config lock poisoned").tls.clone()
    }

    pub(crate) fn read_config(&self) -> RwLockReadGuard<'_, ServerConfig> {
        self.config.read().expect("config lock poisoned")
    }
}

/// Routing and configuration root. Cheap to clone; all clones share
/// one registry. Registry mutation takes the write lock, routing reads
/// take the read lock only.
#[derive(Clone)]
pub struct Server {
    pub(crate) inner: Arc<ServerInner>,
}

impl Default for Server {
    fn default() -> Self {
        Self::new()
    }
}

impl Server {
    pub fn new() -> Self {
        Self { inner: ServerInner::new() }
    }

    /// Register a handler for an exact path or a glob pattern.
    pub fn register(&self, pattern: &str, kind: MatchKind, handler: Handler) -> CallbackHandle {
        self.inner
            .registry
            .write()
            .expect("registry lock poisoned")
            .register(pattern, kind, handler)
    }

    pub fn unregister(&self, id: CallbackId) -> bool {
        self.inner
            .registry
            .write()
            .expect("registry lock poisoned")
            .unregister(id)
    }

    /// Fallback handler for paths no callback matches.
    pub fn set_default_handler(&self, handler: Option<Handler>) {
        self.inner
            .registry
            .write()
            .expect("registry lock poisoned")
            .set_default_handler(handler);
    }

    /// Connection-scope hook defaults; copied onto each new connection.
    pub fn set_hook(&self, ty: HookType, hook: HookFn) {
        self.inner.hooks.write().expect("hook lock poisoned").set(ty, hook);
    }

    pub fn unset_hook(&self, ty: HookType) {
        self.inner.hooks.write().expect("hook lock poisoned").unset(ty);
    }

    pub fn unset_all_hooks(&self) {
        self.inner.hooks.write().expect("hook lock poisoned").unset_all();
    }

    /// Attach a virtual host selected by `name` (a glob over the Host
    /// header or the TLS SNI name). Vhosts cannot nest.
    pub fn add_vhost(&self, name: &str, vhost: Server) -> EngineResult<()> {
        if self.inner.parent().is_some() {
            return Err(EngineError::Config(
                "virtual hosts cannot own virtual hosts".to_string(),
            ));
        }
        if !vhost
            .inner
            .vhosts
            .read()
            .expect("vhost lock poisoned")
            .is_empty()
        {
            return Err(EngineError::Config(
                "a virtual host cannot own virtual hosts".to_string(),
            ));
        }
        if vhost.inner.parent().is_some() {
            return Err(EngineError::Config(
                "server is already attached as a virtual host".to_string(),
            ));
        }
        *vhost.inner.name.write().expect("vhost name lock poisoned") = name.to_string();
        *vhost.inner.parent.write().expect("parent lock poisoned") =
            Arc::downgrade(&self.inner);
        info!("virtual host registered: {name}");
        self.inner
            .vhosts
            .write()
            .expect("vhost lock poisoned")
            .push(vhost.inner);
        Ok(())
    }

    /// Additional name mapped to this (virtual host) server.
    pub fn add_alias(&self, alias: &str) {
        self.inner
            .aliases
            .write()
            .expect("alias lock poisoned")
            .push(alias.to_string());
    }

    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.inner.config.write().expect("config lock poisoned").read_timeout = timeout;
    }

    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        self.inner.config.write().expect("config lock poisoned").write_timeout = timeout;
    }

    pub fn set_max_body_size(&self, cap: Option<u64>) {
        self.inner.config.write().expect("config lock poisoned").max_body_size = cap;
    }

    pub fn set_max_keepalive_requests(&self, cap: Option<u32>) {
        self.inner
            .config
            .write()
            .expect("config lock poisoned")
            .max_keepalive_requests = cap;
    }

    pub fn set_tls(&self, tls: TlsConfig) {
        self.inner.config.write().expect("config lock poisoned").tls = Some(tls);
    }
}
