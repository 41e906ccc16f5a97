//! DMSS wire protocol: packet framing and text command bodies.

pub mod codec;
pub mod text;

pub use codec::{
    IoPolicy, MAX_BODY_LEN, PROLOGUE_SIZE, Packet, Prologue, command, decode_prologue,
    encode_command, receive_exact, receive_packet, send_packet,
};
pub use text::{CONNECTION_ID_CAPACITY, TextCommand, TextResponse};
