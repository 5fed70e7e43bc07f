//! Process wiring for the Phoenix control-plane daemon.
//!
//! Everything that actually implements the kernel lives in the
//! `phx-*` component crates; this crate only assembles them into one
//! running process: load config, open the store, build the
//! `phx-gateway` router, and drive the background loops (task reaper,
//! token-blacklist GC) that no single HTTP request owns.

pub mod background;
pub mod bootstrap;

pub use bootstrap::{build_state, AppContext};
