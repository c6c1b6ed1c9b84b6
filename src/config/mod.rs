mod engine;
mod server;

pub use engine::EngineConfig;
pub use server::ServerConfig;
