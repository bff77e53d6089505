pub mod consumer;
pub mod destroy;
pub mod producer;
pub mod spawner;
pub mod summoner;

pub use consumer::{Consumer, ConsumerConfig};
pub use destroy::Destroy;
pub use producer::{Producer, ProducerClient, ProducerConfig, SubscribeResult};
pub use spawner::Spawner;
pub use summoner::Summoner;
