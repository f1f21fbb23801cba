//! Events Layer - 推送通道实现

mod push_hub;

pub use push_hub::PushHub;
