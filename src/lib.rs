//! `ledhub` drives addressable ledstrips over the network.
//!
//! # Structure
//!
//! A portal owns the lighting model: devices, their ports and the ledstrips wired to them. Each
//! device runs a driver which renders frames on its buses. Both ends talk through a
//! [`transmitter::Transmitter`] exchanging length-delimited binary [`api`] messages.
//!
//! * [`portal::PortalService`] connects devices and keeps one [`state::LedstripDisplayState`] per
//!   ledstrip
//! * [`driver::Driver`] applies the wiring it receives and plays animations locally, pulling
//!   frames from the portal when its buffer runs low
//! * [`effects`] computes frames for the built-in effects

#[macro_use]
extern crate tracing;

pub mod animation;
pub mod api;
pub mod color;
pub mod connection;
pub mod driver;
pub mod effects;
pub mod models;
pub mod portal;
pub mod state;
pub mod transmitter;
