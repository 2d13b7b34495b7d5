//! Núcleo compartido de Stratus: firmas entre nodos, RPC, registro de
//! nodos, drivers de almacenamiento, motor de tareas y miniaturas.
//!
//! Los binarios `master` y `slave` sólo montan rutas HTTP sobre lo que hay
//! aquí.

pub mod auth;
pub mod cluster;
pub mod config;
pub mod driver;
pub mod fs;
pub mod logging;
pub mod mq;
pub mod rpc;
pub mod serializer;
pub mod store;
pub mod task;
pub mod thumb;

pub use config::Settings;
pub use serializer::Response;
