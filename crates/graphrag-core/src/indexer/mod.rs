pub mod feature;
pub mod filesystem;
pub mod manifest;
pub mod master;
pub mod parser;
pub mod pipeline;
pub mod swift;
