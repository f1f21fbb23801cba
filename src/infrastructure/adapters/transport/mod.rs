//! Transport Adapter - 执行服务 HTTP 传输实现

mod fake_transport;
mod reqwest_transport;

pub use fake_transport::FakeTransport;
pub use reqwest_transport::{ReqwestTransport, ReqwestTransportConfig};
