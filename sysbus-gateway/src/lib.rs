//! Register gateway for SysBus heating controllers.
//!
//! SysBus is the Modbus RTU dialect spoken by the base station of the
//! heating system. The gateway owns the bus, mirrors the controller's
//! registers in a persistent store and serves them through an API that
//! never waits on the bus.
//!
//! ```text
//!  API ──► Gateway ──► RegisterStore ◄──► Reconciler ──► BusScheduler ──► codec ──► Transport
//! ```
//!
//! - [`codec`] - frame encoding, CRC and response validation
//! - [`scheduler`] - one transaction at a time, with timeout and retries
//! - [`store`] - SQLite-backed register mirror with pending writes
//! - [`reconciler`] - pushes pending writes, polls the plan, repeats
//! - [`facade`] - get/set operations for API callers
//! - [`http`] - REST routes over the facade
//! - [`sim`] - simulated controller for demo mode and tests

pub mod codec;
pub mod config;
pub mod error;
pub mod facade;
pub mod http;
pub mod reconciler;
pub mod registers;
pub mod scheduler;
pub mod sim;
pub mod store;
pub mod transport;

pub use config::{GatewayConfig, Space};
pub use error::{BusError, DecodeError, GatewayError, StoreError};
pub use facade::Gateway;
pub use reconciler::{CycleReport, Reconciler};
pub use registers::RegisterMap;
pub use scheduler::{BusScheduler, BusSettings};
pub use store::RegisterStore;
