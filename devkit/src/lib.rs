/*!
# RepelBridge DevKit - test doubles for the bridge

Library used by the kernel's tests:
- `FakeDevice`: HTTP server emulating a RepelBridge controller
- `Fault`: per-path failure injection (status, raw body, delay)
- `payloads`: firmware-shaped JSON bodies
*/

pub mod fake_device;
pub mod payloads;

pub use fake_device::{BusState, DeviceState, FakeDevice, Fault, RecordedRequest};
