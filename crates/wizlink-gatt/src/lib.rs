// wizlink-gatt: transport boundary for a GATT peripheral exposing integer channels

pub mod codec;
pub mod error;
pub mod loopback;
pub mod transport;

pub use codec::{DecodeError, IntWidth, InvalidWidth};
pub use error::Error;
pub use loopback::{LoopbackCentral, LoopbackCharacteristic, LoopbackServer, LoopbackTransport};
pub use transport::{
    AdEvent, AdvertisingConfig, Characteristic, CharacteristicConfig, Connection, ConnectionId,
    ConnectionMap, GattServiceConfig, Property, Server, Service, Transport,
};
