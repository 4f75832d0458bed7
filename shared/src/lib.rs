pub mod types;
pub mod config;
pub mod utils;
pub mod envelope;
pub mod error;

// 重新导出常用内容，避免与 config crate 同名冲突
pub use self::config::{
    load_config, validate_config, AppConfig, BrokerBackend, BrokerConfig, MqttConfig,
    RelayOptions, ServerConfig, StoreBackend, StoreConfig, TopicConfig,
};
pub use envelope::*;
pub use error::*;
pub use types::*;
pub use utils::*;
