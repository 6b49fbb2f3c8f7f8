// QoreDB data sources
// Uniform query adapters for relational databases and cloud warehouses

//! Every engine is reached through the same [`DatabaseAdapter`] contract:
//! bounded row counts, per-query timeouts, normalized values and a single
//! classified error type. [`DataSourceManager`] addresses adapters by name.

pub mod engine;
pub mod observability;
pub mod settings;

pub use engine::{
    create_adapter, AdapterFactory, ConnectorRegistry, Credentials, DataSourceConfig,
    DataSourceError, DataSourceManager, DataSourceManagerConfig, DataSourceType, DatabaseAdapter,
    EngineResult, ErrorKind, QueryOptions, QueryRequest, QueryResponse,
};
pub use settings::AdapterSettings;
