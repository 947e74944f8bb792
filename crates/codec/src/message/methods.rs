use num_enum::{IntoPrimitive, TryFromPrimitive};

/// STUN message methods the client produces or recognises.
///
/// Only binding requests are ever sent; both success and error responses
/// must be recognised on the way back.
#[repr(u16)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, TryFromPrimitive, IntoPrimitive)]
pub enum Method {
    BindingRequest = 0x0001,
    BindingResponse = 0x0101,
    BindingError = 0x0111,
}
