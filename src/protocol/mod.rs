//! Command construction and frame decoding for the probe line protocol.

pub mod codec;
pub mod command;

pub use codec::{
    decode_float_from_decimal_bytes, decode_poll_frame, decode_probe_identity_frame,
    encode_float_as_decimal_bytes, parse_header,
};
pub use command::{normalize_address, registers, Command, BROADCAST_ADDRESS, DEVICE_TYPE_PROBE};
