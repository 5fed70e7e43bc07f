//! HTTP/WebSocket gateway for the experimentation control plane.
//!
//! Binds every orchestration seam — `phx-store`, `phx-queue`, `phx-bus`,
//! `phx-templates`, `phx-control`, `phx-auth` — to an axum [`Router`]:
//! operator/user routes behind bearer-token auth, agent routes behind the
//! lightweight host-id header, and a `/ws` channel onto the event bus.
//!
//! Key modules:
//! - [`router`] — top-level route wiring and middleware stack
//! - [`state`] — shared [`state::AppState`] handed to every handler
//! - [`auth`] — JWT bearer-token middleware
//! - [`api_error`] — maps `PhoenixError` onto HTTP responses
//! - [`routes`] — one module per resource (agents, experiments,
//!   deployments, pipelines, loadsim, auth)
//! - [`ws`] — the `/ws` real-time event channel

pub mod api_error;
pub mod auth;
pub mod router;
pub mod routes;
pub mod state;
pub mod ws;

pub use router::build_router;
pub use state::AppState;
