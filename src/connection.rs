//! Portal-side connections to drivers
//!
//! A [`DeviceConnection`] owns the session with one driver. Each wired port of the device gets a
//! [`LedstripConnection`], which addresses its ledstrip by bus number over that shared session.

mod device;
pub use device::*;

mod ledstrip;
pub use ledstrip::*;

mod registry;
pub use registry::*;

#[cfg(test)]
mod tests;
