//! beaconhound library: exposure notification beacon ingestion and
//! rotating-identifier linking.
//!
//! Phones broadcasting exposure notification beacons rotate their BLE
//! address and rolling proximity identifier together every 10-20 minutes.
//! This crate follows those rotations: it decodes sniffer traffic into
//! encounters, tracks each identifier as a device, and links a device that
//! went quiet to the one that appeared right after it on the same cadence
//! and at a similar signal strength.
//!
//! The library is organized in three layers:
//! - **Ingestion**: `transport`, `slip`, `packet`, `sniffer`, `filter`,
//!   `capture`, `replay`, `source`. Bytes from a serial sniffer or lines
//!   from a replay log become [`encounter::Encounter`] values.
//! - **Analysis**: `tracker`, `linker`, `pipeline`. Encounters become
//!   per-device read histories and identity links.
//! - **Output**: `dispatch`, `listeners`, `protocol`, `comm`. Events fan
//!   out to listeners that print tables, write logs or stream NDJSON.
//!
//! `config`, `defaults` and `error` are shared by all three.

pub mod capture;
pub mod comm;
pub mod config;
pub mod defaults;
pub mod dispatch;
pub mod encounter;
pub mod error;
pub mod filter;
pub mod linker;
pub mod listeners;
pub mod packet;
pub mod pipeline;
pub mod protocol;
pub mod replay;
pub mod slip;
pub mod sniffer;
pub mod source;
pub mod tracker;
pub mod transport;
