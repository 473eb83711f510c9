// Link: the two network paths to the peripheral PC.
// UDP telemetry in (fixed 48-byte records), TCP trial commands out.
pub mod codec;
pub mod command;
pub mod receiver;
