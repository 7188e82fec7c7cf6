#![doc = include_str!("../README.md")]
#![cfg_attr(not(feature = "std"), no_std)]

pub mod app;
pub mod binding;
pub mod datalink;
pub mod dispatch;
pub mod network;
pub mod service;
pub mod util;

// Re-export main types without glob imports to avoid conflicts
pub use app::tsm::{TransactionStateMachine, TsmConfig, TsmEvent};
pub use app::Apdu;
pub use binding::AddressBindingCache;
pub use datalink::mstp::{MstpConfig, MstpPort};
pub use datalink::{DataLink, DataLinkAddress, DataLinkType};
pub use dispatch::Dispatcher;
pub use network::Npdu;

#[cfg(feature = "std")]
extern crate std;

#[cfg(not(feature = "std"))]
extern crate alloc;

pub const BACNET_PROTOCOL_VERSION: u8 = 1;
pub const BACNET_MAX_APDU: usize = 1476;
pub const BACNET_MAX_MPDU: usize = 1497;
