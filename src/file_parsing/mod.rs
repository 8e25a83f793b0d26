pub mod decode_helpers;
pub mod wav;
