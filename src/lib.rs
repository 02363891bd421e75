//! Burble streams AI-generated replies into shared chat channels.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core`] owns the per-reply streaming state machine
//!   ([`core::reply::StreamingReplyHandler`]), the per-channel dispatcher that
//!   spawns and tracks handlers ([`core::dispatcher::ReplyDispatcher`]), the
//!   OpenAI-compatible streaming provider client, and static configuration.
//! - [`transport`] defines the chat-side collaborator boundary: message
//!   creation and in-place updates, indicator events, inbound-message and
//!   stop-signal subscriptions.
//! - [`provider`] defines the generative-model boundary: a prompt plus a
//!   cancellation token in, a finite stream of text chunks out.
//! - [`api`] defines the wire payloads used by the provider client.
//!
//! There is no binary: the chat transport is supplied by the embedding
//! program, which constructs a [`core::dispatcher::ReplyDispatcher`] per
//! channel and disposes it when the channel session ends.

pub mod api;
pub mod core;
pub mod logging;
pub mod provider;
pub mod transport;
pub mod utils;
