pub mod database;
pub mod reader;
pub mod schema;
