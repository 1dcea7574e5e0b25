//! HTTP-style status codes carried in terminal frames and acknowledgements.

pub const OK: u16 = 200;
pub const NO_CONTENT: u16 = 204;
pub const BAD_REQUEST: u16 = 400;
pub const NOT_FOUND: u16 = 404;
pub const REQUEST_TIMEOUT: u16 = 408;
pub const FAILED_DEPENDENCY: u16 = 424;
pub const NOT_IMPLEMENTED: u16 = 501;

/// 2xx.
pub fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

/// 4xx and 5xx.
pub fn is_error(status: u16) -> bool {
    status >= 400
}
