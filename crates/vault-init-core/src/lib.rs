//! Core library for `vault-init`.
//!
//! `vault-init` is a credential-injecting process supervisor: it
//! authenticates to Vault with a bootstrap token, derives a short-lived
//! child token scoped to a declared policy set, fetches configured secret
//! paths, renders them into the environment of a child process, and
//! supervises that child — optionally as PID 1 with zombie reaping —
//! restarting it with a freshly rendered environment whenever a secret
//! version changes. On shutdown the derived token is revoked and the child
//! reaped.
//!
//! The crate is organized around three cooperating pieces: the
//! [`client`] capability interface over the store, the [`watcher`] that
//! publishes environment snapshots, and the [`supervise`] machinery that
//! consumes them. [`init`] wires everything together.

pub mod client;
pub mod config;
pub mod error;
pub mod init;
pub mod renewer;
pub mod secret;
pub mod supervise;
pub mod template;
pub mod watcher;
