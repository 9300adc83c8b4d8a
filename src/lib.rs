//! Querygate - Query-Flood Protection for Game Servers
//!
//! This crate implements out-of-band query rate limiting for game servers
//! speaking Quake-derived UDP protocols. Per-source and aggregate ceilings
//! are averaged over a fixed window, tracking memory stays bounded through
//! incremental oldest-first eviction, and a source-diversity explosion (the
//! distributed-flood signature) degrades enforcement to the aggregate
//! ceiling alone instead of exhausting memory. A small relay binary applies
//! the limiter in front of an unmodified server.

pub mod config;
pub mod error;
pub mod ratelimit;
pub mod relay;
