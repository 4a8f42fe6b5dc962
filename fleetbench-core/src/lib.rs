//! Fleetbench Core
//!
//! Core types shared by the fleetbench orchestrator, runner and CLI.
//!
//! This crate contains:
//! - Domain types: Runs (benchmark batches) and Tasks (units of work)
//! - DTOs: Request/response bodies of the orchestrator HTTP API

pub mod domain;
pub mod dto;
