//! BlueZ backend.
//!
//! This module provides the controller primitives and connection policy on
//! top of BlueZ, plus the adapter monitor feeding link changes back in.

pub mod bluez;
pub mod monitor;
