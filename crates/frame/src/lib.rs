//! Data-model primitives shared by every layer of the sprot stack: the
//! wire [`Frame`] format, its CRC, the [`Address`] type, the global
//! [`Options`] record, and the [`Error`] taxonomy.

pub mod address;
pub mod crc;
pub mod error;
pub mod frame;
pub mod options;

pub use address::Address;
pub use error::Error;
pub use frame::{Frame, FrameType, HEADER_LEN, HOSTNAME_LEN};
pub use options::Options;

/// A mapping of string keys to string values, used for ad-hoc endpoint and
/// option configuration (`{"ip": "127.0.0.1", "port": "26258"}`).
pub type Params = std::collections::HashMap<String, String>;
