#![allow(async_fn_in_trait)]
pub mod catalog;
pub mod classify;
pub mod config;
pub mod destination;
pub mod download_plan;
pub mod error;
pub mod filter;
pub mod logging;
pub mod orchestrator;
pub mod peps;
pub mod product;
pub mod region;
pub mod verify;
