//! Embeddable event-driven HTTP/1.x server engine.
//!
//! A [`Server`] holds routing (exact and glob patterns), hooks, and
//! virtual hosts; an [`EventLoop`] drives accepted sockets through the
//! tokenizer and hook pipeline on a single thread; a [`Dispatcher`]
//! fans accepted sockets out to a pool of worker loops. Handlers run
//! synchronously on the owning loop and reply through the
//! `send_reply*` family on [`Request`]; long-running work suspends the
//! connection with [`Request::pause`] and re-enters it from any thread
//! via [`ResumeHandle`].

pub mod dispatch;
pub mod error;
pub mod event_loop;
pub mod hooks;
pub mod keyval;
pub mod reply;
pub mod request;
pub mod router;
pub mod server;
pub mod tls;
pub mod tokenizer;
pub mod uri;

pub use dispatch::{Dispatcher, DispatcherHandle, ThreadInit};
pub use error::{EngineError, EngineResult};
pub use event_loop::{EventLoop, LoopHandle, ResumeHandle};
pub use hooks::{HookData, HookFn, HookOutcome, HookType};
pub use keyval::KeyVal;
pub use reply::reason_phrase;
pub use request::Request;
pub use router::{Callback, CallbackId, Handler, MatchKind};
pub use server::{CallbackHandle, Server, ServerConfig};
pub use tls::{TlsConfig, TlsSessionCache, VerifyMode};
pub use uri::Uri;
