#![doc = include_str!("../README.md")]

mod error;

pub mod clock;
pub mod edges;
pub mod framing;
pub mod integrity;
pub mod packet;
pub mod pcap;
pub mod waveform;

pub use error::{Error, Result};
