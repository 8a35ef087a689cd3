//! A console workshop for the YubiKey EVM signer.
//!
//! [`adapter::Adapter`] turns the device kit's discovery, session and action
//! streams into one [`adapter::WorkshopState`]; [`view::render`] prints it
//! and [`console::Command`] maps stdin lines onto adapter calls.

pub mod adapter;
pub mod config;
pub mod console;
pub mod logging;
pub mod view;
