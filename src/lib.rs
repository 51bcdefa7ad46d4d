//! # kgpd
//!
//! A game server for two-player Kalah over the Kalah Game Protocol.
//! Software agents connect over TCP, are paired in freeplay or in a
//! structured tournament, play games under a per-move clock, and have
//! their results persisted to SQLite.
//!
//! It provides:
//! - The Kalah rules engine ([`board`])
//! - Per-connection protocol state and parsing ([`session`], [`proto`])
//! - The turn state machine driving one game ([`game`])
//! - Freeplay matchmaking and tournament scheduling ([`matchmaker`],
//!   [`tournament`], with the systems in [`tournament_strategy`])
//! - A single-writer database coordinator ([`db`])
//! - An adapter running agents as subprocesses ([`kgpc`])
//!
//! The [`server`] module wires everything together; the `kgpd` binary is
//! a thin command-line front end over [`server::run`].
//!
//! # Protocol sketch
//!
//! ```text
//! server: kgp 1 0 0
//! client: set name example
//! client: mode freeplay
//! server: 1 state 8 0 0 8 8 8 8 8 8 8 8 8 8 8 8 8 8
//! client: @1 move 3
//! client: @1 yield
//! server: @1 stop
//! ```
//!
//! Boards are sent from the perspective of the player to move; pits are
//! 1-indexed on the wire.

pub mod board;
pub mod bot;
pub mod configuration;
pub mod db;
pub mod game;
pub mod kgpc;
pub mod matchmaker;
pub mod proto;
pub mod server;
pub mod session;
pub mod tournament;
pub mod tournament_strategy;
