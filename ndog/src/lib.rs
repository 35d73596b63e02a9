// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
//! Plumbing for a netcat-style relay
//!
//! A [scheme::Scheme] knows how to listen on or connect to one kind of endpoint
//! (`tcp://`, `udp://`, `tls://`). Each remote peer is paired with a
//! [stream::Stream] produced by a [manager::StreamManager], and the two are
//! relayed in both directions until either side finishes.

pub mod fanout;
pub mod manager;
pub mod net;
pub mod runner;
pub mod scheme;
pub mod stream;
pub mod util;
