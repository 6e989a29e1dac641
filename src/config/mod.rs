pub mod schema;

pub use schema::{
    ChunkMode, DeliveryMode, DmPolicy, LinqAccountConfig, LinqChannelConfig,
};
