//! Client for building-management controllers.
//!
//! Controllers speak JSON-RPC 2.0 where every call travels URL-encoded in
//! the `m` query parameter of `http://{address}/cgi-bin/mgw.cgi`. Calls
//! other than `GetSessionID` require the session id obtained from it.
//!
//! Requests that cannot be completed do not fail. They yield a failure
//! record (see [`transport::is_failure`]) which callers store like any
//! other response.

mod client;
mod config;
mod inventory;
mod rpc;
pub mod transport;

pub use client::{Controller, ControllerError, ControllerSummary, POINTS_PER_REQUEST};
pub use config::{ControllersConfig, Device, HttpPolicy};
pub use inventory::{Inventory, PointGroup, PointLibrary};
pub use rpc::{Method, RequestId};
