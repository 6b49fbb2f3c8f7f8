// Data source engine
// One adapter contract over every supported warehouse and database

pub mod client;
pub mod credentials;
pub mod data_source;
pub mod drivers;
pub mod error;
pub mod introspection;
pub mod normalize;
pub mod pool;
pub mod registry;
pub mod row_limit;
pub mod timeout;
pub mod traits;
pub mod type_mapping;
pub mod types;
pub mod warm_cache;

pub use credentials::Credentials;
pub use data_source::{
    DataSourceConfig, DataSourceManager, DataSourceManagerConfig, QueryOptions, QueryRequest,
    QueryResponse,
};
pub use error::{DataSourceError, EngineResult, ErrorKind};
pub use pool::{ConnectionPool, PoolConfig};
pub use registry::{create_adapter, AdapterFactory, ConnectorRegistry};
pub use row_limit::RowLimitStrategy;
pub use traits::DatabaseAdapter;
pub use types::*;
pub use warm_cache::WarmConnectionCache;
