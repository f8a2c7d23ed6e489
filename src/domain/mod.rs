//! The fleet core: device links, per-device exclusion, controllers,
//! status polling, and the event fan-out they publish into.

pub mod controller;
pub mod device_link;
pub mod device_mutex;
pub mod events;
pub mod fleet;
pub mod poller;
pub mod simulator;

pub use controller::DeviceController;
pub use device_link::{DeviceLink, TcpDeviceLink};
pub use device_mutex::{DeviceGuard, DeviceMutex};
pub use events::{EventBus, PlcEvent};
pub use fleet::{FleetManager, FleetOptions, Machine};
pub use simulator::DeviceSimulator;
