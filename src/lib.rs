//! homie-modbus: a Modbus master/slave simulator published over MQTT
//!
//! The slave side keeps register tables that remote masters read and
//! write; the master side polls remote slaves on a schedule. Both expose
//! their fields as properties of one Homie device, so values can be
//! watched and set from any MQTT client.

pub mod api;
#[doc(hidden)]
pub mod boot;
#[doc(hidden)]
pub mod cli;
#[doc(hidden)]
pub mod core;
pub mod homie;
pub mod protocol;
#[doc(hidden)]
pub mod utils;

pub use api::*;
